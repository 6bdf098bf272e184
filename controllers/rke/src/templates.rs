//! Manifest template rendering

use crate::error::EngineError;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

/// Render `template` with `params`
///
/// Undefined variables are errors, so a parameter map that is missing a key
/// fails loudly instead of producing a manifest with empty fields.
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` naming the template on syntax or
/// lookup errors.
pub fn render<S: Serialize>(name: &str, template: &str, params: &S) -> Result<String, EngineError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(name, template)
        .map_err(|e| EngineError::ConfigInvalid(format!("template {name}: {e}")))?;
    let tmpl = env
        .get_template(name)
        .map_err(|e| EngineError::ConfigInvalid(format!("template {name}: {e}")))?;
    tmpl.render(params)
        .map_err(|e| EngineError::ConfigInvalid(format!("template {name}: {e}")))
}
