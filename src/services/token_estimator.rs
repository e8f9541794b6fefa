use anyhow::{Context, Result};
use tiktoken_rs::CoreBPE;

/// External token estimator seam. The engine only accumulates the returned
/// values; it performs no estimation itself.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// BPE-based estimator using the `cl100k_base` encoding
pub struct TiktokenEstimator {
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base().context("Failed to load cl100k_base encoding")?,
        })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_counts_tokens() {
        let estimator = TiktokenEstimator::new().unwrap();
        assert_eq!(estimator.estimate(""), 0);
        assert!(estimator.estimate("Hello, world") > 0);
    }
}
