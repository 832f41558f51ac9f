use thiserror::Error;

/// Closed error set used across the serving core.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Status {
    /// Configuration disagrees with a loaded model, a request carries a
    /// malformed buffer, or an unknown accelerator was asked for.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An internal invariant was violated.
    #[error("internal: {0}")]
    Internal(String),

    /// Transparent pass-through from an engine adapter.
    #[error("engine error {code}: {message}")]
    Engine { code: i32, message: String },

    /// The requested capability is not compiled in or not present.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl Status {
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Status::InvalidArg(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::Internal(message.into())
    }

    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Status::Engine {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::Unavailable(message.into())
    }

    /// Engine errors cross the scheduler boundary as internal errors; every
    /// other kind passes through unchanged.
    pub fn into_scheduler(self) -> Self {
        match self {
            Status::Engine { code, message } => {
                Status::Internal(format!("engine error {code}: {message}"))
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_maps_to_internal_at_scheduler_boundary() {
        let err = Status::engine(7, "bad kernel").into_scheduler();
        assert_eq!(err, Status::Internal("engine error 7: bad kernel".into()));
    }

    #[test]
    fn non_engine_kinds_pass_through() {
        let err = Status::invalid_arg("nope");
        assert_eq!(err.clone().into_scheduler(), err);
    }
}
