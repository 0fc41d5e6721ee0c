use std::path::PathBuf;

use thiserror::Error;

/// Unified application error type. Every variant aborts the current stage.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Required artifact {} does not exist.", .0.display())]
    MissingArtifact(PathBuf),
    #[error("Artifact {} is malformed. {reason}", path.display())]
    MalformedArtifact { path: PathBuf, reason: String },
    #[error("Artifacts do not agree. {0}")]
    SchemaMismatch(String),
    #[error("Cannot form {k} clusters from {samples} samples.")]
    InsufficientSamples { samples: usize, k: usize },
    #[error("Invalid feedback input. {0}")]
    InvalidInput(String),
    #[error("Embedding model is unavailable. {0}")]
    ModelUnavailable(String),
    #[error("Embedding backend returned unusable output. {0}")]
    EmbeddingFailed(String),
    #[error("Invalid theme map. {0}")]
    InvalidThemeMap(String),
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error communicating with the embedding server. {0}")]
    AIClient(#[from] async_openai::error::OpenAIError),
    #[cfg(feature = "local-ml")]
    #[error("Error while running a local ML model. {0}")]
    LocalEmbedder(#[from] feedback_themes_local_embedder::EmbedderError),
    #[error("Runtime error. {0}")]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl AppError {
    pub(crate) fn malformed<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        AppError::MalformedArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;
