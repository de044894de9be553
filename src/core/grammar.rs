//! Directive grammar: recognizes the four bracketed directive forms.
//!
//! Directives are textual tokens of the form `<<DIRECTIVE:ARG[:ARG[:ARG]]>>`.
//! Directive names are case-insensitive and normalized to lowercase:
//!
//! - `env:NAME`: environment substitution, embeddable in string scalars
//! - `inherit:SYMBOL`: merge a document node referenced by dotted path
//! - `index:SYMBOL:ATTRIBUTE:N`: enumerate a context sequence from offset N
//! - `forall:SYMBOL[:ATTRIBUTE]`: broadcast a literal over a context sequence

use super::error::SpecError;
use regex::Regex;
use std::sync::LazyLock;

/// A parsed directive token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Env {
        name: String,
    },
    Inherit {
        symbol: String,
    },
    Index {
        symbol: String,
        attribute: String,
        start: usize,
    },
    Forall {
        symbol: String,
        attribute: Option<String>,
    },
}

/// Dotted path: letters/digits/underscore/dot, must start with a letter.
static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.]*$").unwrap());

/// Environment variable name: letters/digits/underscore, starts with a letter.
static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Any bracketed token embedded in a string scalar.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<<[^<>]*>>").unwrap());

/// True when a mapping key is wrapped exactly by `<<` and `>>`.
pub fn is_directive_key(key: &str) -> bool {
    key.len() > 4 && key.starts_with("<<") && key.ends_with(">>")
}

/// Parse a full `<<...>>` token into a [`Directive`].
pub fn parse_token(token: &str) -> Result<Directive, SpecError> {
    let inner = token
        .strip_prefix("<<")
        .and_then(|t| t.strip_suffix(">>"))
        .ok_or_else(|| grammar_error(token, "not wrapped by << and >>"))?;
    parse_body(token, inner)
}

fn parse_body(token: &str, body: &str) -> Result<Directive, SpecError> {
    let mut parts = body.split(':');
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    match name.as_str() {
        "env" => {
            let &[name] = args.as_slice() else {
                return Err(grammar_error(token, "env takes exactly one argument"));
            };
            if !ENV_NAME_RE.is_match(name) {
                return Err(grammar_error(token, "invalid environment variable name"));
            }
            Ok(Directive::Env {
                name: name.to_string(),
            })
        }
        "inherit" => {
            let &[symbol] = args.as_slice() else {
                return Err(grammar_error(token, "inherit takes exactly one argument"));
            };
            Ok(Directive::Inherit {
                symbol: checked_symbol(token, symbol)?,
            })
        }
        "index" => {
            let &[symbol, attribute, start] = args.as_slice() else {
                return Err(grammar_error(token, "index takes symbol:attribute:N"));
            };
            let start: usize = start
                .parse()
                .map_err(|_| grammar_error(token, "index offset must be a non-negative integer"))?;
            Ok(Directive::Index {
                symbol: checked_symbol(token, symbol)?,
                attribute: checked_symbol(token, attribute)?,
                start,
            })
        }
        "forall" => match args.as_slice() {
            &[symbol] => Ok(Directive::Forall {
                symbol: checked_symbol(token, symbol)?,
                attribute: None,
            }),
            &[symbol, attribute] => Ok(Directive::Forall {
                symbol: checked_symbol(token, symbol)?,
                attribute: Some(checked_symbol(token, attribute)?),
            }),
            _ => Err(grammar_error(token, "forall takes symbol[:attribute]")),
        },
        _ => Err(SpecError::UnknownDirective(token.to_string())),
    }
}

fn checked_symbol(token: &str, symbol: &str) -> Result<String, SpecError> {
    if SYMBOL_RE.is_match(symbol) {
        Ok(symbol.to_string())
    } else {
        Err(grammar_error(token, "invalid symbol"))
    }
}

fn grammar_error(token: &str, reason: &str) -> SpecError {
    SpecError::Grammar {
        token: token.to_string(),
        reason: reason.to_string(),
    }
}

/// Find every `<<...>>` token embedded in a string scalar, with its byte range.
pub fn embedded_tokens(s: &str) -> Vec<(std::ops::Range<usize>, &str)> {
    TOKEN_RE
        .find_iter(s)
        .map(|m| (m.range(), m.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_token() {
        let d = parse_token("<<env:OS_PROJECT_NAME>>").unwrap();
        assert_eq!(
            d,
            Directive::Env {
                name: "OS_PROJECT_NAME".to_string()
            }
        );
    }

    #[test]
    fn test_directive_name_case_insensitive() {
        for token in ["<<ENV:HOME>>", "<<Env:HOME>>", "<<eNv:HOME>>"] {
            assert_eq!(
                parse_token(token).unwrap(),
                Directive::Env {
                    name: "HOME".to_string()
                }
            );
        }
    }

    #[test]
    fn test_inherit_token() {
        let d = parse_token("<<inherit:defaults.provider.east>>").unwrap();
        assert_eq!(
            d,
            Directive::Inherit {
                symbol: "defaults.provider.east".to_string()
            }
        );
    }

    #[test]
    fn test_index_token() {
        let d = parse_token("<<index:machines:name:42>>").unwrap();
        assert_eq!(
            d,
            Directive::Index {
                symbol: "machines".to_string(),
                attribute: "name".to_string(),
                start: 42,
            }
        );
    }

    #[test]
    fn test_forall_with_and_without_attribute() {
        assert_eq!(
            parse_token("<<forall:machines:name>>").unwrap(),
            Directive::Forall {
                symbol: "machines".to_string(),
                attribute: Some("name".to_string()),
            }
        );
        assert_eq!(
            parse_token("<<forall:machines>>").unwrap(),
            Directive::Forall {
                symbol: "machines".to_string(),
                attribute: None,
            }
        );
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse_token("<<frobnicate:x>>").unwrap_err();
        assert!(matches!(err, SpecError::UnknownDirective(_)));
    }

    #[test]
    fn test_malformed_tokens() {
        for token in [
            "<<env>>",
            "<<env:>>",
            "<<env:1BAD>>",
            "<<env:A:B>>",
            "<<inherit:.leading>>",
            "<<index:machines:name>>",
            "<<index:machines:name:-1>>",
            "<<index:machines:name:x>>",
            "<<forall:9sym>>",
            "<<forall:a:b:c>>",
        ] {
            let err = parse_token(token).unwrap_err();
            assert!(matches!(err, SpecError::Grammar { .. }), "token {}", token);
        }
    }

    #[test]
    fn test_is_directive_key() {
        assert!(is_directive_key("<<inherit:defaults>>"));
        assert!(!is_directive_key("inherit:defaults"));
        assert!(!is_directive_key("<<>>"));
        assert!(!is_directive_key("a<<env:X>>b"));
    }

    #[test]
    fn test_embedded_tokens() {
        let found = embedded_tokens("<<env:A>>-net-<<env:B>>");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, "<<env:A>>");
        assert_eq!(found[1].1, "<<env:B>>");
        assert!(embedded_tokens("no tokens here").is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn env_name() -> impl Strategy<Value = String> {
            "[A-Za-z][A-Za-z0-9_]{0,20}"
        }

        fn symbol() -> impl Strategy<Value = String> {
            "[A-Za-z][A-Za-z0-9_.]{0,20}"
        }

        proptest! {
            #[test]
            fn env_roundtrip(name in env_name(), case in "(env|ENV|Env|eNV)") {
                let token = format!("<<{}:{}>>", case, name);
                prop_assert_eq!(parse_token(&token).unwrap(), Directive::Env { name });
            }

            #[test]
            fn index_roundtrip(sym in symbol(), attr in symbol(), n in 0usize..10_000) {
                let token = format!("<<index:{}:{}:{}>>", sym, attr, n);
                let parsed = parse_token(&token).unwrap();
                prop_assert_eq!(parsed, Directive::Index {
                    symbol: sym,
                    attribute: attr,
                    start: n,
                });
            }

            #[test]
            fn garbage_never_panics(body in "[^<>]{0,40}") {
                let _ = parse_token(&format!("<<{}>>", body));
            }
        }
    }
}
