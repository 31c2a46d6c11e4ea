//! Request text parsing.
//!
//! Grammar (whitespace insensitive):
//!
//! ```text
//! request := [ "record[" options "]" ] [ "field(" list ")" | list ]
//! options := name "=" value { "," name "=" value }
//! list    := [ path { "," path } ]
//! path    := ident { "." ident }
//! ```
//!
//! An empty or missing list selects the whole record.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{DatabaseError, DbResult};

/// A parsed client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvRequest {
    options: BTreeMap<String, String>,
    fields: Vec<String>,
}

impl PvRequest {
    /// Parse request text.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for unbalanced brackets, malformed options or paths.
    pub fn parse(text: &str) -> DbResult<Self> {
        let mut rest = text.trim();
        let mut request = Self::default();

        if let Some(after) = rest.strip_prefix("record[") {
            let (body, tail) = split_closing(after, ']', text)?;
            for entry in body.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let Some((key, value)) = entry.split_once('=') else {
                    return Err(DatabaseError::invalid_request(format!(
                        "option '{entry}' is not name=value in '{text}'"
                    )));
                };
                let key = key.trim();
                if !is_ident(key) {
                    return Err(DatabaseError::invalid_request(format!(
                        "bad option name '{key}' in '{text}'"
                    )));
                }
                request.options.insert(key.to_string(), value.trim().to_string());
            }
            rest = tail.trim_start();
        }

        let list = if let Some(after) = rest.strip_prefix("field(") {
            let (body, tail) = split_closing(after, ')', text)?;
            if !tail.trim().is_empty() {
                return Err(DatabaseError::invalid_request(format!(
                    "unexpected trailing text '{}' in '{text}'",
                    tail.trim()
                )));
            }
            body
        } else {
            rest
        };

        for path in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !path.split('.').all(is_ident) {
                return Err(DatabaseError::invalid_request(format!(
                    "bad field path '{path}' in '{text}'"
                )));
            }
            request.fields.push(path.to_string());
        }
        Ok(request)
    }

    /// Request that selects the whole record with no options.
    #[must_use]
    pub fn whole() -> Self {
        Self::default()
    }

    /// Requested field paths in request order.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// True when no field list was given.
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of a `record[...]` option.
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// All options.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// `queueSize` option, if present.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the value is not a non-negative integer.
    pub fn queue_size(&self) -> DbResult<Option<usize>> {
        self.option("queueSize")
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|e| DatabaseError::invalid_request(format!("queueSize {v}: {e}")))
            })
            .transpose()
    }

    /// `process` option, falling back to `default` when absent or not a bool.
    #[must_use]
    pub fn process(&self, default: bool) -> bool {
        match self.option("process") {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }
}

impl FromStr for PvRequest {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_closing<'a>(s: &'a str, close: char, text: &str) -> DbResult<(&'a str, &'a str)> {
    s.find(close)
        .map(|i| (&s[..i], &s[i + close.len_utf8()..]))
        .ok_or_else(|| DatabaseError::invalid_request(format!("missing '{close}' in '{text}'")))
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_field_empty_select_all() {
        assert!(PvRequest::parse("").unwrap().selects_all());
        assert!(PvRequest::parse("field()").unwrap().selects_all());
        assert_eq!(PvRequest::parse("field()").unwrap(), PvRequest::whole());
    }

    #[test]
    fn field_list_and_bare_list() {
        let r = PvRequest::parse("field(a, b.c)").unwrap();
        assert_eq!(r.fields(), &["a".to_string(), "b.c".to_string()]);
        let r: PvRequest = "value,timeStamp".parse().unwrap();
        assert_eq!(r.fields().len(), 2);
    }

    #[test]
    fn record_options() {
        let r = PvRequest::parse("record[queueSize=5, process=true]field(value)").unwrap();
        assert_eq!(r.queue_size().unwrap(), Some(5));
        assert!(r.process(false));
        assert_eq!(r.fields(), &["value".to_string()]);

        let r = PvRequest::parse("record[process=FALSE]").unwrap();
        assert!(!r.process(true));
        assert!(r.selects_all());
    }

    #[test]
    fn bad_queue_size_is_invalid() {
        let r = PvRequest::parse("record[queueSize=lots]field()").unwrap();
        assert!(matches!(r.queue_size(), Err(DatabaseError::InvalidRequest { .. })));
    }

    #[test]
    fn malformed_requests() {
        for bad in ["field(a", "record[queueSize=2", "record[nope]", "field(a..b)", "field(a) x", "a b"] {
            assert!(
                matches!(PvRequest::parse(bad), Err(DatabaseError::InvalidRequest { .. })),
                "expected failure for {bad:?}"
            );
        }
    }
}
