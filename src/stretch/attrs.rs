use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("attributes must be in the format 'key:value', got '{entry}'")]
pub struct AttrParseError {
    pub entry: String,
}

/// Turns `key:value` flags into attributes. Only the first colon separates, so values may contain
/// colons themselves. A repeated key keeps the last value.
pub fn parse_attrs<S: AsRef<str>>(
    attrs: &[S],
) -> Result<BTreeMap<String, String>, AttrParseError> {
    attrs
        .iter()
        .map(|attr| {
            let attr = attr.as_ref();
            attr.split_once(':')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| AttrParseError {
                    entry: attr.to_owned(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_attrs, AttrParseError};

    #[test]
    fn parses_pairs() {
        let attrs = parse_attrs(&["env:prod", "owner:bob"]).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["env"], "prod");
        assert_eq!(attrs["owner"], "bob");
    }

    #[test]
    fn splits_on_first_colon_only() {
        let attrs = parse_attrs(&["k:v:w", "url:http://x"]).unwrap();
        assert_eq!(attrs["k"], "v:w");
        assert_eq!(attrs["url"], "http://x");
    }

    #[test]
    fn last_duplicate_wins() {
        let attrs = parse_attrs(&["k:1", "k:2"]).unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs["k"], "2");
    }

    #[test]
    fn missing_colon_fails() {
        assert_eq!(
            parse_attrs(&["env:prod", "badattr"]),
            Err(AttrParseError {
                entry: "badattr".into()
            })
        );
        assert!(parse_attrs::<&str>(&[]).unwrap().is_empty());
    }
}
