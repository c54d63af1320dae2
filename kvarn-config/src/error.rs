//! Error types for configuration loading and validation

use std::path::PathBuf;
use thiserror::Error;
use validator::ValidationErrors;

/// Unified configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found error.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Field-level validation error.
    #[error("Invalid configuration:\n{}", format_validation_errors(.0))]
    Validation(#[source] ValidationErrors),

    /// Values that are individually valid but inconsistent with each other.
    #[error("Inconsistent configuration: {0}")]
    Limits(String),

    /// Figment parsing error.
    #[error("Configuration parsing error: {0}")]
    Parsing(#[from] figment::Error),
}

fn format_validation_errors(errors: &ValidationErrors) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    for (field, errors) in errors.field_errors() {
        let _ = writeln!(output, "Field '{}':", field);
        for error in errors {
            let message = match &error.message {
                Some(msg) => msg.to_string(),
                None => error.code.to_string(),
            };
            let _ = writeln!(output, "  - {}", message);
        }
    }
    for (field, kind) in errors.errors() {
        if let validator::ValidationErrorsKind::Struct(nested) = kind {
            let _ = write!(output, "In '{}': {}", field, format_validation_errors(nested));
        }
        if let validator::ValidationErrorsKind::List(items) = kind {
            for (index, nested) in items {
                let _ = write!(
                    output,
                    "In '{}[{}]': {}",
                    field,
                    index,
                    format_validation_errors(nested)
                );
            }
        }
    }
    output
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Validation(errors)
    }
}
