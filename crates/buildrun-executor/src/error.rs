//! Strategy errors.

use thiserror::Error;

/// Errors from turning a Build into a pod spec.
///
/// None of these can be fixed by retrying: the Build itself is something
/// this controller does not understand. The controller reports them as
/// fatal errors so the queue drops the build after one attempt.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("build strategy {0} is not supported by this controller")]
    UnsupportedStrategy(&'static str),

    #[error("{strategy} strategy requires an image")]
    MissingImage { strategy: &'static str },

    #[error("{0} has not been resolved to a pull spec")]
    UnresolvedImage(String),

    #[error("invalid build spec: {0}")]
    InvalidSpec(String),
}

impl From<StrategyError> for buildrun_core::Error {
    fn from(err: StrategyError) -> Self {
        buildrun_core::Error::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_errors_are_fatal() {
        let err: buildrun_core::Error = StrategyError::MissingImage {
            strategy: "CustomExecutor",
        }
        .into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("CustomExecutor strategy requires an image"));

        let err: buildrun_core::Error =
            StrategyError::UnresolvedImage("ImageStreamTag ruby:3".into()).into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ImageStreamTag ruby:3 has not been resolved"));
    }
}
