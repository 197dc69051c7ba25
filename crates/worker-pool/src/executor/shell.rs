//! Shell command adapter.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ToolError;

/// One shell invocation: `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct ShellRun<'a> {
    pub shell: &'a str,
    pub command: &'a str,
    pub cwd: Option<&'a str>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Run a shell command and capture its output.
///
/// The child is killed when the timeout fires or the future is dropped.
/// A zero exit status yields `{exit_code, stdout, stderr}`, plus `data`
/// when stdout is a JSON document.
pub async fn run(spec: ShellRun<'_>) -> Result<Value, ToolError> {
    let start = Instant::now();

    let mut cmd = Command::new(spec.shell);
    cmd.arg("-c")
        .arg(spec.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let output = match timeout(spec.timeout, cmd.output()).await {
        Ok(result) => result.map_err(|e| ToolError::Process(format!("Failed to run process: {}", e)))?,
        Err(_) => return Err(ToolError::Timeout(spec.timeout.as_millis() as u64)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    tracing::debug!(
        exit_code,
        duration_ms = start.elapsed().as_millis() as u64,
        "Shell command finished"
    );

    if !output.status.success() {
        return Err(ToolError::Exit {
            code: exit_code,
            stderr: stderr.trim().to_string(),
        });
    }

    let mut result = json!({
        "exit_code": exit_code,
        "stdout": stdout,
        "stderr": stderr,
    });
    if let Ok(data) = serde_json::from_str::<Value>(stdout.trim()) {
        result["data"] = data;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> ShellRun<'_> {
        ShellRun {
            shell: "sh",
            command,
            cwd: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let result = run(spec("echo hello")).await.unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hello\n");
        assert!(result.get("data").is_none());
    }

    #[tokio::test]
    async fn test_json_stdout_parsed() {
        let result = run(spec(r#"printf '{"rows": 3}'"#)).await.unwrap();
        assert_eq!(result["data"]["rows"], 3);
    }

    #[tokio::test]
    async fn test_env_and_exit_code() {
        let mut run_spec = spec("echo \"$GREETING\" >&2; exit 3");
        run_spec.env.insert("GREETING".to_string(), "hi there".to_string());
        match run(run_spec).await {
            Err(ToolError::Exit { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "hi there");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut run_spec = spec("sleep 5");
        run_spec.timeout = Duration::from_millis(100);
        assert!(matches!(run(run_spec).await, Err(ToolError::Timeout(100))));
    }
}
