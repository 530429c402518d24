//! Template rendering for config files and unit files

use crate::error::Result;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Render a template string against a serializable context
///
/// Undefined variables are errors rather than empty strings.
pub fn render<S: Serialize>(template: &str, context: S) -> Result<String> {
    Ok(environment().render_str(template, context)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn test_render_vars() {
        let out = render(
            "version = {{ version }}\n{% for m in mirrors %}mirror = {{ m }}\n{% endfor %}",
            context! { version => 2, mirrors => vec!["a", "b"] },
        )
        .unwrap();
        assert_eq!(out, "version = 2\nmirror = a\nmirror = b\n");
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let err = render("root = {{ data_dir }}", context! {}).unwrap_err();
        assert!(matches!(err, crate::InstallerError::Template(_)));
    }

    #[test]
    fn test_trailing_newline_kept() {
        assert_eq!(render("x\n", context! {}).unwrap(), "x\n");
    }
}
