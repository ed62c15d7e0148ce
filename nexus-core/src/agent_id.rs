//! Agent-ID validation: the security boundary every untrusted ID crosses.

use thiserror::Error;

const MAX_LEN: usize = 128;
const FORBIDDEN_SUBSTRINGS: &[&str] = &["/", "\\", "..", "%2f", "%2F", "%5c", "%5C"];
const FORBIDDEN_PREFIXES: &[&str] = &["/", "\\", "./"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("agent_id cannot be empty")]
    Empty,
    #[error("agent_id too long: {0} bytes (max {MAX_LEN})")]
    TooLong(usize),
    #[error("agent_id contains forbidden pattern")]
    ForbiddenPattern,
    #[error("agent_id looks like a path")]
    LooksLikePath,
}

/// Reject agent IDs that could be used for path traversal or injection.
///
/// Accepts temp IDs beginning with `.`, IDs with embedded dots
/// (`my.agent`), and mixed case.
pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::Empty);
    }
    if agent_id.len() > MAX_LEN {
        return Err(ValidationError::TooLong(agent_id.len()));
    }

    let lower = agent_id.to_ascii_lowercase();
    for pattern in FORBIDDEN_SUBSTRINGS {
        if lower.contains(&pattern.to_ascii_lowercase()) {
            return Err(ValidationError::ForbiddenPattern);
        }
    }

    for prefix in FORBIDDEN_PREFIXES {
        if agent_id.starts_with(prefix) {
            return Err(ValidationError::LooksLikePath);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_ids() {
        assert!(validate_agent_id("w1").is_ok());
        assert!(validate_agent_id("my.agent").is_ok());
        assert!(validate_agent_id("MixedCase").is_ok());
    }

    #[test]
    fn accepts_temp_ids() {
        assert!(validate_agent_id(".1").is_ok());
        assert!(validate_agent_id(".42").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_agent_id(""), Err(ValidationError::Empty));
    }

    #[test]
    fn rejects_too_long() {
        let long = "a".repeat(129);
        assert_eq!(
            validate_agent_id(&long),
            Err(ValidationError::TooLong(129))
        );
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(
            validate_agent_id("../etc/passwd"),
            Err(ValidationError::ForbiddenPattern)
        );
        assert_eq!(
            validate_agent_id("foo%2Fbar"),
            Err(ValidationError::ForbiddenPattern)
        );
        assert_eq!(
            validate_agent_id("foo%5cbar"),
            Err(ValidationError::ForbiddenPattern)
        );
    }

    #[test]
    fn rejects_path_like_prefixes() {
        assert_eq!(
            validate_agent_id("/etc/passwd"),
            Err(ValidationError::ForbiddenPattern)
        );
        assert_eq!(
            validate_agent_id("./config"),
            Err(ValidationError::ForbiddenPattern)
        );
    }
}
