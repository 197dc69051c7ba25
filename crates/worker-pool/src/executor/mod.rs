//! Command execution module.

mod command;
pub mod shell;

pub use command::{CommandExecutor, ARGS_ENV, CREDENTIALS_ENV};
