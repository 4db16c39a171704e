use thiserror::Error;

/// Typed outcomes a generation or finalization request can surface to its
/// caller. Everything unexpected is folded into `GenerationFailed` at the
/// orchestrator boundary; the original message survives in logs and in the
/// trace detail, never verbatim in API responses.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no OpenAI credentials configured")]
    NoApiKey,
    #[error("daily generation limit reached")]
    RateLimit,
    #[error("story rejected by quality gate: {0}")]
    QaRejected(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl EngineError {
    /// Stable machine-readable code for API payloads and trace details.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoApiKey => "NO_API_KEY",
            EngineError::RateLimit => "RATE_LIMIT",
            EngineError::QaRejected(_) => "QA_REJECTED",
            EngineError::GenerationFailed(_) => "GENERATION_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
