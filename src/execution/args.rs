//! Building the argv for one job.
//!
//! The command template (e.g. `"bash run.sh"`) is tokenized once with
//! POSIX shell rules; per-job user params are then appended verbatim as
//! argv elements. The spawn side never goes through a shell, so values
//! containing spaces survive untouched.

use thiserror::Error;

/// How user param values are turned into arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgMode {
    /// Values in column order: `v1 v2 v3`. Empty strings are kept as
    /// placeholders.
    #[default]
    Positional,
    /// `--name value` pairs in column order, column names verbatim.
    Named,
}

/// Errors building an argument vector.
#[derive(Debug, Error)]
pub enum ArgError {
    /// The command template could not be tokenized (unbalanced quotes).
    #[error("cannot tokenize command template: {0}")]
    BadTemplate(String),

    /// The command template tokenized to nothing.
    #[error("empty command template")]
    EmptyTemplate,
}

/// Tokenize the command template into the base argv.
///
/// A bare `something.sh` template is run through `bash`, matching what
/// operators expect from array-job wrappers.
pub fn split_template(template: &str) -> Result<Vec<String>, ArgError> {
    let mut argv =
        shell_words::split(template).map_err(|e| ArgError::BadTemplate(e.to_string()))?;
    if argv.is_empty() {
        return Err(ArgError::EmptyTemplate);
    }
    if argv.len() == 1 && argv[0].ends_with(".sh") {
        argv.insert(0, "bash".to_string());
    }
    Ok(argv)
}

/// Append a job's user params to the base argv.
///
/// Params are `(column, value)` in schema column order. A `None` value
/// means the row never had that column set and contributes nothing; an
/// empty string is a deliberate placeholder and is kept.
pub fn build_argv(
    base: &[String],
    mode: ArgMode,
    params: &[(String, Option<String>)],
) -> Vec<String> {
    let mut argv = base.to_vec();
    for (name, value) in params {
        let Some(value) = value else { continue };
        match mode {
            ArgMode::Positional => argv.push(value.clone()),
            ArgMode::Named => {
                argv.push(format!("--{}", name));
                argv.push(value.clone());
            }
        }
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_split_simple_template() {
        assert_eq!(split_template("bash run.sh").unwrap(), vec!["bash", "run.sh"]);
    }

    #[test]
    fn test_split_quoted_template() {
        assert_eq!(
            split_template(r#"python -c "print('hi there')""#).unwrap(),
            vec!["python", "-c", "print('hi there')"]
        );
    }

    #[test]
    fn test_bare_shell_script_gets_bash() {
        assert_eq!(split_template("run.sh").unwrap(), vec!["bash", "run.sh"]);
    }

    #[test]
    fn test_shell_script_with_args_untouched() {
        // Only a single-token template gets the bash treatment.
        assert_eq!(
            split_template("run.sh --fast").unwrap(),
            vec!["run.sh", "--fast"]
        );
    }

    #[test]
    fn test_empty_template_rejected() {
        assert!(matches!(split_template(""), Err(ArgError::EmptyTemplate)));
        assert!(matches!(split_template("  "), Err(ArgError::EmptyTemplate)));
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(matches!(
            split_template(r#"echo "oops"#),
            Err(ArgError::BadTemplate(_))
        ));
    }

    #[test]
    fn test_positional_in_column_order() {
        let base = vec!["echo".to_string()];
        let argv = build_argv(
            &base,
            ArgMode::Positional,
            &params(&[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))]),
        );
        assert_eq!(argv, vec!["echo", "1", "2", "3"]);
    }

    #[test]
    fn test_positional_keeps_empty_placeholder() {
        let base = vec!["echo".to_string()];
        let argv = build_argv(
            &base,
            ArgMode::Positional,
            &params(&[("a", Some("1")), ("b", Some("")), ("c", Some("3"))]),
        );
        assert_eq!(argv, vec!["echo", "1", "", "3"]);
    }

    #[test]
    fn test_positional_skips_missing_values() {
        let base = vec!["echo".to_string()];
        let argv = build_argv(
            &base,
            ArgMode::Positional,
            &params(&[("a", Some("1")), ("b", None)]),
        );
        assert_eq!(argv, vec!["echo", "1"]);
    }

    #[test]
    fn test_named_flattens_pairs() {
        let base = vec!["python".to_string(), "run.py".to_string()];
        let argv = build_argv(
            &base,
            ArgMode::Named,
            &params(&[("alpha", Some("0.5")), ("steps", Some("100"))]),
        );
        assert_eq!(
            argv,
            vec!["python", "run.py", "--alpha", "0.5", "--steps", "100"]
        );
    }

    #[test]
    fn test_named_value_with_spaces_is_one_element() {
        let base = vec!["run".to_string()];
        let argv = build_argv(
            &base,
            ArgMode::Named,
            &params(&[("label", Some("two words"))]),
        );
        assert_eq!(argv, vec!["run", "--label", "two words"]);
    }
}
