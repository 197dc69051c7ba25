//! Expression and template resolution.
//!
//! Pure functions of `(template, context)`; no state is kept between calls.

pub mod jinja;

pub use jinja::{contains_template_syntax, is_truthy, Context, TemplateRenderer};
