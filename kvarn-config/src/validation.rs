//! Custom validation functions shared by the configuration modules.

use validator::ValidationError;

/// Longest accepted pool, queue or namespace name.
pub const NAME_LEN_MAX: usize = 32;

/// Validate a resource name: ASCII alphanumerics, `_` and `-`.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= NAME_LEN_MAX
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_name"))
    }
}

/// Validate a metrics prefix: `[a-zA-Z_][a-zA-Z0-9_]*`, the subset of
/// Prometheus metric names that a prefix may use.
pub fn validate_metrics_namespace(namespace: &str) -> Result<(), ValidationError> {
    let mut chars = namespace.chars();
    let valid = namespace.len() <= NAME_LEN_MAX
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_metrics_namespace"))
    }
}

/// Validate a default tracing level.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"]
        .contains(&level.to_ascii_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("pkt_pool-0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(NAME_LEN_MAX + 1)).is_err());
    }

    #[test]
    fn metrics_namespaces() {
        assert!(validate_metrics_namespace("kvarn").is_ok());
        assert!(validate_metrics_namespace("_edge_node2").is_ok());
        assert!(validate_metrics_namespace("edge-node").is_err());
        assert!(validate_metrics_namespace("2edge").is_err());
        assert!(validate_metrics_namespace("").is_err());
    }

    #[test]
    fn log_levels() {
        assert!(validate_log_level("INFO").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
