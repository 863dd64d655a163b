//! Adapter over the HuggingFace `tokenizers` crate (`tokenizer.json`).

use std::path::Path;

use crate::{TokenId, Tokenizer, TokenizerError, TokenizerResult};

/// Tokenizer loaded from a `tokenizer.json` file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> TokenizerResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| TokenizerError::Load(format!("{}: {e}", path.display())))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| TokenizerError::EncodingError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId], skip_special_tokens: bool) -> TokenizerResult<String> {
        self.inner
            .decode(tokens, skip_special_tokens)
            .map_err(|e| TokenizerError::DecodingError(e.to_string()))
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
