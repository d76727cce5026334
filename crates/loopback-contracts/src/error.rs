use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("invalid loop config: {0}")]
    InvalidConfig(String),

    #[error("unknown denoise curve '{0}' (expected Aggressive, Linear or Lazy)")]
    UnknownCurve(String),

    #[error("unknown append mode '{0}' (expected None, CLIP or DeepBooru)")]
    UnknownAppendMode(String),

    #[error("structured prompt is malformed: {0}")]
    PromptSpec(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
