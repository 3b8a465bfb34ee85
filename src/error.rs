//! Error taxonomy shared by the pipelines and their components.

/// Errors surfaced by the generation pipelines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument is unusable (empty text, bad image
    /// dimensions, zero inference steps, ...). Retrying with the same
    /// input will fail again.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The latent state stopped being finite during sampling. `step` is
    /// the index of the denoising step that produced the bad value.
    #[error("non-finite latent state after denoising step {step}")]
    NumericInstability { step: usize },

    /// A required external resource (weights, tokenizer files, device)
    /// could not be obtained.
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error(transparent)]
    Tensor(#[from] candle::Error),

    #[error("tokenizer: {0}")]
    Tokenizer(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<tokenizers::Error> for Error {
    fn from(e: tokenizers::Error) -> Self {
        Self::Tokenizer(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
