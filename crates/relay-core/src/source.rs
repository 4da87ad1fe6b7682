//! Validation and redaction of camera source URLs.

use crate::errors::RelayError;

/// Scheme prefixes accepted when no configuration overrides them.
pub const DEFAULT_ACCEPTED_SCHEMES: &[&str] = &["rtsp://", "http://"];

/// Check that `url` starts with one of `accepted` (case-sensitive, like the
/// browser client sends it).
pub fn validate_source<S: AsRef<str>>(url: &str, accepted: &[S]) -> Result<(), RelayError> {
    if accepted.iter().any(|prefix| url.starts_with(prefix.as_ref())) {
        return Ok(());
    }
    let hint = accepted
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(RelayError::InvalidSource(format!("Use {hint}")))
}

/// Strip `user:password@` from a URL so it can be logged.
pub fn redact_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***{}", &url[..scheme_end + 3], &rest[at..]),
        None => url.to_string(),
    }
}
