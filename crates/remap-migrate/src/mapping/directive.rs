//! Parsing of a single `target_table.target_column: directive` value.

use serde_yaml::Value;

/// A directive as written in a mapping document, before transform resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `null` or `__copy__`.
    Copy,
    /// `__forget__` or `false` as a target value.
    Forget,
    /// `__moved__`.
    Moved,
    /// `__defer__`.
    Defer,
    /// `__fk__ <table>`.
    ForeignKey(String),
    /// `__ref__ <column>`.
    Reference(String),
    /// Anything else: a transform expression.
    Function(String),
}

impl Directive {
    /// Parse a directive value. Errors carry a message without the column pair.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let text = match value {
            Value::Null => return Ok(Directive::Copy),
            Value::Bool(false) => return Ok(Directive::Forget),
            Value::String(text) => text.trim(),
            other => return Err(format!("{:?} is invalid here", other)),
        };

        match text {
            "" | "__copy__" => return Ok(Directive::Copy),
            "__forget__" => return Ok(Directive::Forget),
            "__moved__" => return Ok(Directive::Moved),
            "__defer__" => return Ok(Directive::Defer),
            _ => {}
        }

        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens[0] {
            "__fk__" => single_argument(text, &tokens).map(Directive::ForeignKey),
            "__ref__" => single_argument(text, &tokens).map(Directive::Reference),
            marker if marker.starts_with("__") && marker.ends_with("__") => {
                Err(format!("unknown directive {:?}", marker))
            }
            _ => Ok(Directive::Function(text.to_string())),
        }
    }
}

fn single_argument(text: &str, tokens: &[&str]) -> Result<String, String> {
    if tokens.len() != 2 {
        return Err(format!(
            "{} takes exactly one argument, got {} in {:?}",
            tokens[0],
            tokens.len() - 1,
            text
        ));
    }
    Ok(tokens[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Directive, String> {
        Directive::parse(&serde_yaml::from_str::<Value>(yaml).unwrap())
    }

    #[test]
    fn test_markers() {
        assert_eq!(parse("~").unwrap(), Directive::Copy);
        assert_eq!(parse("__copy__").unwrap(), Directive::Copy);
        assert_eq!(parse("false").unwrap(), Directive::Forget);
        assert_eq!(parse("__forget__").unwrap(), Directive::Forget);
        assert_eq!(parse("__moved__").unwrap(), Directive::Moved);
        assert_eq!(parse("__defer__").unwrap(), Directive::Defer);
        assert_eq!(
            parse("__fk__ res_partner").unwrap(),
            Directive::ForeignKey("res_partner".into())
        );
        assert_eq!(parse("__ref__ model").unwrap(), Directive::Reference("model".into()));
        assert_eq!(
            parse("map a=b").unwrap(),
            Directive::Function("map a=b".into())
        );
    }

    #[test]
    fn test_wrong_argument_count() {
        let err = parse("__fk__").unwrap_err();
        assert!(err.contains("takes exactly one argument, got 0"));
        let err = parse("__ref__ model res_id").unwrap_err();
        assert!(err.contains("got 2"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse("12").is_err());
        assert!(parse("[a, b]").is_err());
        assert!(parse("__bogus__").unwrap_err().contains("unknown directive"));
    }
}
