use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GenerationMode;

/// Failure classes a caller can branch on without parsing messages.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("model unavailable: {0:#}")]
    ModelUnavailable(anyhow::Error),

    #[error("invalid input image: {0}")]
    InvalidInput(String),

    #[error("device resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("mode not supported: {0}")]
    Unsupported(GenerationMode),

    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("generation failed: {0:#}")]
    Backend(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelUnavailable,
    InvalidInput,
    ResourceExhausted,
    Unsupported,
    Io,
    Backend,
}

impl GenerateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Io(_) => ErrorKind::Io,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Sort an error surfaced by the model call into the taxonomy. Device
    /// allocation failures only show up as message text, so this matches on
    /// the strings the backends actually emit.
    pub(crate) fn from_backend(err: anyhow::Error) -> Self {
        let message = format!("{err:#}").to_lowercase();
        if message.contains("out of memory") || message.contains("out_of_memory") {
            Self::ResourceExhausted(format!("{err:#}"))
        } else {
            Self::Backend(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn oom_messages_classify_as_resource_exhausted() {
        let err = GenerateError::from_backend(anyhow!("CUDA_ERROR_OUT_OF_MEMORY"));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = GenerateError::from_backend(anyhow!("driver reported out of memory"));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn other_failures_classify_as_backend() {
        let err = GenerateError::from_backend(anyhow!("shape mismatch in matmul"));
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn unsupported_names_the_mode() {
        let err = GenerateError::Unsupported(GenerationMode::ControlNet);
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.to_string().contains("controlnet"));
    }
}
