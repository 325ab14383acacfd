//! Connection string parsing.
//!
//! Two shapes are accepted:
//! - URL strings understood by the drivers (`postgres://…`, `mysql://…`, `sqlite:…`)
//! - key/value strings in the `Key=Value;Key2=Value2` style used by vendor providers
//!
//! The original text is kept verbatim so it round-trips; lookups are case-insensitive.

use crate::error::{DbError, DbResult};
use url::Url;

/// Keys whose values are credentials and never appear in logs.
const CREDENTIAL_KEYS: &[&str] = &["password", "pwd", "user id", "uid", "user", "username"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Url(Url),
    KeyValue(Vec<(String, String)>),
}

/// A parsed connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
    shape: Shape,
}

impl ConnectionString {
    /// Parse a connection string. Blank or malformed strings are configuration errors.
    pub fn parse(s: &str) -> DbResult<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(DbError::configuration("connection string cannot be empty"));
        }

        let shape = if looks_like_url(raw) {
            let url = Url::parse(raw).map_err(|e| {
                DbError::configuration(format!("malformed connection string URL: {}", e))
            })?;
            Shape::Url(url)
        } else {
            Shape::KeyValue(parse_key_values(raw)?)
        };

        Ok(Self {
            raw: raw.to_string(),
            shape,
        })
    }

    /// The connection string exactly as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_url(&self) -> bool {
        matches!(self.shape, Shape::Url(_))
    }

    /// Look up a value by key (case-insensitive).
    ///
    /// For URL strings the query parameters are searched, plus the synthetic keys
    /// `host`, `port`, `database` and `user`.
    pub fn get(&self, key: &str) -> Option<String> {
        match &self.shape {
            Shape::KeyValue(pairs) => pairs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone()),
            Shape::Url(url) => match key.to_ascii_lowercase().as_str() {
                "host" | "server" => url.host_str().map(String::from),
                "port" => url.port().map(|p| p.to_string()),
                "database" => url
                    .path()
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(String::from),
                "user" | "username" => {
                    Some(url.username().to_string()).filter(|s| !s.is_empty())
                }
                _ => url
                    .query_pairs()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.into_owned()),
            },
        }
    }

    /// The URL scheme, for URL strings.
    pub fn scheme(&self) -> Option<&str> {
        match &self.shape {
            Shape::Url(url) => Some(url.scheme()),
            Shape::KeyValue(_) => None,
        }
    }

    /// A copy of the connection string safe to log: credentials are removed.
    pub fn without_credentials(&self) -> String {
        match &self.shape {
            Shape::Url(url) => {
                let mut url = url.clone();
                // Only fails for URLs that cannot have credentials in the first place.
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            Shape::KeyValue(pairs) => pairs
                .iter()
                .filter(|(k, _)| {
                    !CREDENTIAL_KEYS
                        .iter()
                        .any(|c| k.eq_ignore_ascii_case(c))
                })
                .map(|(k, v)| format!("{}={}", k, quote_if_needed(v)))
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionString")
            .field(&self.without_credentials())
            .finish()
    }
}

impl std::str::FromStr for ConnectionString {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn looks_like_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    match lower.find("://") {
        // `Key=Value` strings can hold URLs in their values; the scheme must come first.
        Some(idx) => !lower[..idx].contains('=') && !lower[..idx].contains(';'),
        None => lower.starts_with("sqlite:"),
    }
}

/// Parse `Key=Value;…` pairs. Values may be wrapped in single or double quotes
/// (doubling the quote escapes it), which lets them contain `;`.
fn parse_key_values(s: &str) -> DbResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        // key
        let mut key = String::new();
        let mut has_value = false;
        for c in chars.by_ref() {
            if c == '=' {
                has_value = true;
                break;
            }
            if c == ';' {
                if key.trim().is_empty() {
                    key.clear();
                    continue;
                }
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();
        if !has_value {
            if key.is_empty() {
                break;
            }
            return Err(DbError::configuration(format!(
                "malformed connection string: '{}' has no value",
                key
            )));
        }
        if key.is_empty() {
            return Err(DbError::configuration(
                "malformed connection string: empty key",
            ));
        }

        // value
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            value.push(quote);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(DbError::configuration(format!(
                        "malformed connection string: unterminated quote in value of '{}'",
                        key
                    )));
                }
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        return Err(DbError::configuration(format!(
                            "malformed connection string: unexpected text after quoted value of '{}'",
                            key
                        )));
                    }
                }
            }
            _ => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }

        pairs.push((key, value));
        if chars.peek().is_none() {
            break;
        }
    }

    if pairs.is_empty() {
        return Err(DbError::configuration(
            "malformed connection string: no key/value pairs",
        ));
    }
    Ok(pairs)
}

fn quote_if_needed(value: &str) -> String {
    if value.contains(';') || value.starts_with(' ') || value.ends_with(' ') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
