//! URL authorization against the configured allow-list
//!
//! Every capture target passes through two steps before dispatch: resolution
//! of the address the caller actually means (the URL may arrive wrapped in
//! base64), and a match against the allow-list patterns. The resolved address
//! is both the value the patterns are tested against and the value handed to
//! the engine, so the gate can never approve one address while another gets
//! captured.

use crate::error::CaptureError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;

/// Outcome of resolving a request URL into a capture target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    /// The address to authorize and capture.
    pub url: String,
    /// Whether the request URL was base64-wrapped.
    pub decoded: bool,
}

/// Compiled allow-list of capturable URL patterns.
///
/// Patterns use url-pattern syntax: `*` matches any run of characters,
/// `:name` matches one path segment, `(...)` marks an optional group, and
/// `\\` escapes the next character. Compilation happens once at startup;
/// matching is a plain anchored regex test per pattern.
#[derive(Debug, Clone)]
pub struct UrlAllowlist {
    patterns: Vec<Regex>,
}

impl UrlAllowlist {
    pub fn compile(patterns: &[String]) -> Result<Self, CaptureError> {
        let mut compiled = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let regex = Regex::new(&translate_pattern(pattern)).map_err(|e| {
                CaptureError::ConfigurationError(format!(
                    "Invalid whitelist pattern \"{pattern}\": {e}"
                ))
            })?;
            compiled.push(regex);
        }

        Ok(Self { patterns: compiled })
    }

    /// Whether any pattern matches the URL. An empty allow-list matches
    /// nothing, so a service without configured patterns captures nothing.
    pub fn is_allowed(&self, url: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(url))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Resolve the address a request URL refers to.
///
/// A URL that is structurally valid base64 and decodes to UTF-8 text is
/// treated as a wrapped address and replaced by its decoded form. Anything
/// else is taken literally; plain URLs always contain characters outside the
/// base64 alphabet, so they are never mistaken for wrapped ones.
pub fn resolve_target(url: &str) -> CaptureTarget {
    if let Ok(bytes) = STANDARD.decode(url) {
        if let Ok(decoded) = String::from_utf8(bytes) {
            return CaptureTarget {
                url: decoded,
                decoded: true,
            };
        }
    }

    CaptureTarget {
        url: url.to_string(),
        decoded: false,
    }
}

/// Resolve the request URL and gate it against the allow-list.
pub fn authorize(allowlist: &UrlAllowlist, url: &str) -> Result<CaptureTarget, CaptureError> {
    let target = resolve_target(url);

    if allowlist.is_allowed(&target.url) {
        Ok(target)
    } else {
        Err(CaptureError::NotAllowed(target.url))
    }
}

fn translate_pattern(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2 + 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => regex.push_str(".*"),
            '(' => regex.push_str("(?:"),
            ')' => regex.push_str(")?"),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    push_literal(&mut regex, escaped);
                }
            }
            ':' => {
                let mut named = false;
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        named = true;
                        chars.next();
                    } else {
                        break;
                    }
                }
                if named {
                    regex.push_str("[a-zA-Z0-9_~ %-]+");
                } else {
                    push_literal(&mut regex, ':');
                }
            }
            other => push_literal(&mut regex, other),
        }
    }

    regex.push('$');
    regex
}

fn push_literal(out: &mut String, ch: char) {
    out.push_str(&regex::escape(&ch.to_string()));
}
