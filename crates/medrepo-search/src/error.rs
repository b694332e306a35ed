//! Search query errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("Unknown search parameter '{param}' for {resource_type}")]
    UnknownParameter { resource_type: String, param: String },

    #[error("Unsupported modifier ':{modifier}' on '{param}'")]
    UnsupportedModifier { param: String, modifier: String },

    #[error("Invalid value '{value}' for '{param}'")]
    InvalidValue { param: String, value: String },
}

impl SearchError {
    pub fn invalid_value(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            param: param.into(),
            value: value.into(),
        }
    }
}
