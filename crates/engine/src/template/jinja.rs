//! Jinja2-style template resolution using minijinja.
//!
//! The engine only relies on the contract `resolve(template, context) -> value`.
//! Templates are rendered against a JSON object context; strings without
//! template syntax are returned unchanged.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, UndefinedBehavior, Value};
use serde_json::Map;

use crate::error::{AppError, AppResult};

/// Rendering context: a JSON object keyed by variable name.
pub type Context = Map<String, serde_json::Value>;

/// Template renderer with custom filters.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // `result.ok` on a step without a result must evaluate to false, not fail.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("int", filter_int);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("mapping", test_mapping);

        Self { env }
    }

    /// Render a template string with the given context.
    pub fn render(&self, template: &str, context: &Context) -> AppResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| AppError::Template(format!("Template parse error: {}", e)))?;

        tmpl.render(Value::from_serialize(context))
            .map_err(|e| AppError::Template(format!("Template render error: {}", e)))
    }

    /// Resolve a template to a typed value.
    ///
    /// A template consisting of a single `{{ expr }}` evaluates the expression
    /// directly so lists and mappings keep their structure; anything else is
    /// rendered to text and then interpreted as JSON or a scalar.
    pub fn resolve(&self, template: &str, context: &Context) -> AppResult<serde_json::Value> {
        if let Some(expr) = single_expression(template) {
            return self.evaluate_expression(expr, context);
        }

        let rendered = self.render(template, context)?;
        if !contains_template_syntax(template) {
            return Ok(serde_json::Value::String(rendered));
        }
        Ok(interpret_rendered(rendered))
    }

    /// Render a nested structure (dict or list) recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &Context,
    ) -> AppResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.resolve(s, context),
            serde_json::Value::Object(map) => {
                let mut result = Map::new();
                for (k, v) in map {
                    let rendered_key = self.render(k, context)?;
                    result.insert(rendered_key, self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a bare expression (`workload.items`, `result.ok and x > 1`).
    pub fn evaluate_expression(
        &self,
        expr: &str,
        context: &Context,
    ) -> AppResult<serde_json::Value> {
        let compiled = self
            .env
            .compile_expression(expr.trim())
            .map_err(|e| AppError::Template(format!("Expression parse error: {}", e)))?;
        let value = compiled
            .eval(Value::from_serialize(context))
            .map_err(|e| AppError::Template(format!("Expression error: {}", e)))?;
        Ok(minijinja_to_json(&value))
    }

    /// Evaluate a condition; accepts `expr` or `{{ expr }}`.
    pub fn evaluate_condition(&self, condition: &str, context: &Context) -> AppResult<bool> {
        let trimmed = condition.trim();
        if let Some(expr) = single_expression(trimmed) {
            return Ok(is_truthy(&self.evaluate_expression(expr, context)?));
        }
        if contains_template_syntax(trimmed) {
            let rendered = self.render(trimmed, context)?;
            return Ok(matches!(
                rendered.trim().to_lowercase().as_str(),
                "true" | "1" | "yes"
            ));
        }
        Ok(is_truthy(&self.evaluate_expression(trimmed, context)?))
    }
}

/// Check if a string contains Jinja2 template syntax.
pub fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Return the inner expression of a template that is exactly `{{ expr }}`.
fn single_expression(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

fn interpret_rendered(rendered: String) -> serde_json::Value {
    let trimmed = rendered.trim();
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    if matches!(trimmed, "null" | "None" | "none" | "") {
        return serde_json::Value::Null;
    }
    serde_json::Value::String(rendered)
}

/// Jinja truthiness over JSON values.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Convert minijinja Value back to serde_json::Value.
fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    match value.kind() {
        ValueKind::Bool => serde_json::Value::Bool(value.is_true()),
        ValueKind::Number => {
            if let Some(i) = value.as_i64() {
                serde_json::Value::Number(i.into())
            } else {
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
            }
        }
        ValueKind::String => serde_json::Value::String(value.as_str().unwrap_or_default().to_string()),
        ValueKind::Seq => match value.try_iter() {
            Ok(iter) => serde_json::Value::Array(iter.map(|v| minijinja_to_json(&v)).collect()),
            Err(_) => serde_json::Value::Null,
        },
        ValueKind::Map => {
            let mut map = Map::new();
            if let Ok(iter) = value.try_iter() {
                for key in iter {
                    if let Ok(val) = value.get_item(&key) {
                        map.insert(key.to_string(), minijinja_to_json(&val));
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        _ => serde_json::Value::String(value.to_string()),
    }
}

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("b64decode error: {}", e))
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&minijinja_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let json_val: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("fromjson error: {}", e))
    })?;
    Ok(Value::from_serialize(&json_val))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        format!("int error: cannot convert '{}'", s),
    ))
}

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

fn test_mapping(value: &Value) -> bool {
    value.kind() == ValueKind::Map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_context() -> Context {
        let mut ctx = Context::new();
        ctx.insert("name".to_string(), json!("Alice"));
        ctx.insert("age".to_string(), json!(30));
        ctx.insert("active".to_string(), json!(true));
        ctx.insert("items".to_string(), json!(["apple", "banana", "cherry"]));
        ctx.insert("result".to_string(), json!({"ok": false, "rows": 12}));
        ctx
    }

    #[test]
    fn test_simple_variable() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("Hello, {{ name }}!", &make_context()).unwrap();
        assert_eq!(result, "Hello, Alice!");
    }

    #[test]
    fn test_no_template() {
        let renderer = TemplateRenderer::new();
        let result = renderer.resolve("Plain text", &make_context()).unwrap();
        assert_eq!(result, json!("Plain text"));
    }

    #[test]
    fn test_resolve_keeps_structure() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();
        assert_eq!(
            renderer.resolve("{{ items }}", &ctx).unwrap(),
            json!(["apple", "banana", "cherry"])
        );
        assert_eq!(renderer.resolve("{{ age }}", &ctx).unwrap(), json!(30));
        assert_eq!(renderer.resolve("{{ result.rows + 1 }}", &ctx).unwrap(), json!(13));
    }

    #[test]
    fn test_resolve_mixed_text() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .resolve("{{ name }} is {{ age }}", &make_context())
            .unwrap();
        assert_eq!(result, json!("Alice is 30"));
    }

    #[test]
    fn test_b64encode_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("{{ name | b64encode }}", &make_context()).unwrap();
        assert_eq!(result, "QWxpY2U=");
    }

    #[test]
    fn test_default_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("{{ missing | default('fallback') }}", &make_context())
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_evaluate_condition() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer.evaluate_condition("age > 25", &ctx).unwrap());
        assert!(!renderer.evaluate_condition("age < 25", &ctx).unwrap());
        assert!(renderer.evaluate_condition("{{ active }}", &ctx).unwrap());
        assert!(!renderer.evaluate_condition("result.ok", &ctx).unwrap());
        assert!(renderer.evaluate_condition("not result.ok", &ctx).unwrap());
    }

    #[test]
    fn test_condition_on_missing_path_is_false() {
        let renderer = TemplateRenderer::new();
        let ctx = Context::new();
        assert!(!renderer.evaluate_condition("result.ok", &ctx).unwrap());
        assert!(!renderer.evaluate_condition("{{ a.b.c }}", &ctx).unwrap());
    }

    #[test]
    fn test_render_value_nested() {
        let renderer = TemplateRenderer::new();
        let value = json!({
            "greeting": "Hello, {{ name }}!",
            "info": {"age": "{{ age }}", "fixed": 7}
        });

        let result = renderer.render_value(&value, &make_context()).unwrap();
        assert_eq!(result["greeting"], "Hello, Alice!");
        assert_eq!(result["info"]["age"], json!(30));
        assert_eq!(result["info"]["fixed"], json!(7));
    }

    #[test]
    fn test_template_error() {
        let renderer = TemplateRenderer::new();
        let err = renderer.evaluate_expression("age +", &make_context());
        assert!(err.is_err());
    }
}
