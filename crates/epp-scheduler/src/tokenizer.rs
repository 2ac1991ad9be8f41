use std::sync::Arc;

use tiktoken_rs::CoreBPE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer '{name}': {reason}")]
    Load { name: String, reason: String },
    #[error("unknown tokenizer '{0}', available: cl100k_base, o200k_base, none")]
    Unknown(String),
    #[error("tokenizer unavailable: {0}")]
    Unavailable(String),
}

/// Black-box "count tokens in text" capability.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize, TokenizerError>;

    fn name(&self) -> &'static str;
}

pub struct TiktokenCounter {
    name: &'static str,
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k_base() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError::Load {
            name: "cl100k_base".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: "cl100k_base",
            bpe,
        })
    }

    pub fn o200k_base() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::o200k_base().map_err(|e| TokenizerError::Load {
            name: "o200k_base".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: "o200k_base",
            bpe,
        })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> Result<usize, TokenizerError> {
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Resolve a tokenizer by name. `none` disables token counting so every
/// estimate uses the byte heuristic.
pub fn tokenizer_from_name(name: &str) -> Result<Option<Arc<dyn TokenCounter>>, TokenizerError> {
    match name {
        "none" => Ok(None),
        "cl100k_base" => Ok(Some(Arc::new(TiktokenCounter::cl100k_base()?))),
        "o200k_base" => Ok(Some(Arc::new(TiktokenCounter::o200k_base()?))),
        other => Err(TokenizerError::Unknown(other.to_string())),
    }
}
