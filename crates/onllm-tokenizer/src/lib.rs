//! # onllm-tokenizer
//!
//! Tokenization for onllm.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A reference character tokenizer with special tokens, for tests and tooling
//! - Streaming decoding that emits only the newly decoded text per token
//! - A HuggingFace `tokenizer.json` adapter (`hf` feature)

#[cfg(feature = "hf")]
mod hf;

#[cfg(feature = "hf")]
pub use hf::HfTokenizer;

use std::collections::HashMap;

/// Token ID type, as produced by `tokenizer.json` vocabularies.
pub type TokenId = u32;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("Failed to load tokenizer: {0}")]
    Load(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs. `add_special_tokens` controls implicit markers
    /// such as a sequence-start token; special tokens written in `text` are always
    /// recognized.
    fn encode(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<TokenId>>;

    /// Decode token IDs into text, optionally dropping special tokens.
    fn decode(&self, tokens: &[TokenId], skip_special_tokens: bool) -> TokenizerResult<String>;

    /// Look up the ID of a single token string.
    fn token_to_id(&self, token: &str) -> Option<TokenId>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Incremental decoder for streaming generated tokens.
///
/// Each push re-decodes the generated tokens and yields only the text that was not
/// yielded before. Byte-level and SentencePiece vocabularies can need several tokens
/// to form one character, or change a leading space depending on what follows; a
/// fragment is held back while the decoded text ends in a replacement character.
#[derive(Debug, Clone, Default)]
pub struct TextStream {
    tokens: Vec<TokenId>,
    text: String,
}

impl TextStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one token and return the newly decoded fragment (possibly empty).
    pub fn push(&mut self, tokenizer: &dyn Tokenizer, token: TokenId) -> TokenizerResult<String> {
        self.tokens.push(token);
        let full = tokenizer.decode(&self.tokens, true)?;
        if full.ends_with('\u{FFFD}') {
            return Ok(String::new());
        }

        let common = common_prefix_len(&self.text, &full);
        let fragment = full[common..].to_string();
        self.text = full;
        Ok(fragment)
    }

    /// Text decoded so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.text.clear();
    }
}

/// Length in bytes of the longest common prefix, on a char boundary.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

/// Reference tokenizer: one token per Unicode scalar value, plus named special tokens.
///
/// - Special tokens get IDs `0..n`, characters get `n + codepoint`
/// - Special tokens written in the input are matched greedily (longest first)
/// - Deterministic and lossless: `decode(encode(x), false) == x`
/// - An optional beginning-of-sequence token is prepended when
///   `add_special_tokens` is true
pub struct CharTokenizer {
    specials: Vec<String>,
    special_ids: HashMap<String, TokenId>,
    bos: Option<TokenId>,
}

impl CharTokenizer {
    /// Build a tokenizer with the given special tokens. Empty strings are ignored.
    pub fn new<I, S>(specials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tok = Self {
            specials: Vec::new(),
            special_ids: HashMap::new(),
            bos: None,
        };
        for s in specials {
            let s = s.into();
            if s.is_empty() || tok.special_ids.contains_key(&s) {
                continue;
            }
            tok.special_ids.insert(s.clone(), tok.specials.len() as TokenId);
            tok.specials.push(s);
        }
        tok
    }

    /// ChatML-style vocabulary (`<|im_start|>`, `<|im_end|>`, `<|endoftext|>`).
    pub fn chatml() -> Self {
        Self::new(["<|endoftext|>", "<|im_start|>", "<|im_end|>"])
    }

    /// Prepend `token` (which must be one of the special tokens) on
    /// `encode(_, true)`.
    pub fn with_bos(mut self, token: &str) -> Self {
        self.bos = self.special_ids.get(token).copied();
        self
    }

    /// ID of the character `c`.
    pub fn char_id(&self, c: char) -> TokenId {
        self.specials.len() as TokenId + c as TokenId
    }

    pub fn is_special(&self, token: TokenId) -> bool {
        (token as usize) < self.specials.len()
    }

    fn match_special(&self, rest: &str) -> Option<(&str, TokenId)> {
        self.specials
            .iter()
            .filter(|s| rest.starts_with(s.as_str()))
            .max_by_key(|s| s.len())
            .map(|s| (s.as_str(), self.special_ids[s]))
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special_tokens {
            ids.extend(self.bos);
        }

        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            if let Some((special, id)) = self.match_special(rest) {
                ids.push(id);
                pos += special.len();
                continue;
            }
            let c = rest
                .chars()
                .next()
                .ok_or_else(|| TokenizerError::EncodingError(format!("no char at byte {pos}")))?;
            ids.push(self.char_id(c));
            pos += c.len_utf8();
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId], skip_special_tokens: bool) -> TokenizerResult<String> {
        let mut out = String::with_capacity(tokens.len());
        for &id in tokens {
            if let Some(special) = self.specials.get(id as usize) {
                if !skip_special_tokens {
                    out.push_str(special);
                }
                continue;
            }
            let c = char::from_u32(id - self.specials.len() as TokenId)
                .ok_or(TokenizerError::InvalidToken(id))?;
            out.push(c);
        }
        Ok(out)
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        if let Some(id) = self.special_ids.get(token) {
            return Some(*id);
        }
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(self.char_id(c)),
            _ => None,
        }
    }

    fn vocab_size(&self) -> usize {
        self.specials.len() + char::MAX as usize + 1
    }
}
