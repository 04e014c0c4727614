use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("validation failed for `{field}`: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("unknown feed event type `{0}`")]
    UnknownEvent(String),
    #[error("malformed `{kind}` event: {message}")]
    MalformedEvent { kind: String, message: String },
}

impl DomainError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn malformed_event(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
