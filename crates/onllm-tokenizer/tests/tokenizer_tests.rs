//! Tokenizer tests: roundtrip, special tokens, and streaming.
//!
//! Validates:
//! - `decode(encode(x), false) == x` across ASCII, unicode and chat markup
//! - Special-token stripping on decode
//! - Streaming fragments concatenate to the full decoded text

use onllm_tokenizer::{CharTokenizer, TextStream, Tokenizer};

// ===== Section A: Roundtrip =====

#[test]
fn roundtrip_ascii_and_unicode() {
    let tok = CharTokenizer::chatml();
    for input in [
        "hello",
        "hello world",
        "  leading and trailing  ",
        "tabs\tand\nnewlines",
        "héllo wörld",
        "日本語のテキスト",
        "emoji 🦀🚀",
        "",
    ] {
        let ids = tok.encode(input, false).unwrap();
        assert_eq!(tok.decode(&ids, false).unwrap(), input, "roundtrip failed for {input:?}");
    }
}

#[test]
fn roundtrip_chat_markup() {
    let tok = CharTokenizer::chatml();
    let text = "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n";
    let ids = tok.encode(text, false).unwrap();
    assert_eq!(tok.decode(&ids, false).unwrap(), text);
    assert_eq!(tok.decode(&ids, true).unwrap(), "user\nHi\nassistant\n");
}

#[test]
fn special_tokens_are_single_ids() {
    let tok = CharTokenizer::chatml();
    let ids = tok.encode("<|im_start|><|im_end|><|endoftext|>", false).unwrap();
    assert_eq!(ids.len(), 3);
    for (id, name) in ids.iter().zip(["<|im_start|>", "<|im_end|>", "<|endoftext|>"]) {
        assert_eq!(tok.token_to_id(name), Some(*id));
    }
}

#[test]
fn partial_special_is_plain_text() {
    let tok = CharTokenizer::chatml();
    let ids = tok.encode("<|im_sta", false).unwrap();
    assert_eq!(ids.len(), "<|im_sta".chars().count());
}

#[test]
fn longest_special_wins() {
    let tok = CharTokenizer::new(["<a>", "<a><b>"]);
    assert_eq!(tok.encode("<a><b>", false).unwrap(), vec![1]);
}

// ===== Section B: Streaming =====

#[test]
fn streaming_fragments_concatenate() {
    let tok = CharTokenizer::chatml();
    let text = "Streaming ünïcode works 🦀";
    let ids = tok.encode(text, false).unwrap();

    let mut stream = TextStream::new();
    let mut joined = String::new();
    for id in ids {
        joined.push_str(&stream.push(&tok, id).unwrap());
    }
    assert_eq!(joined, text);
    assert_eq!(stream.into_text(), text);
}

#[test]
fn streaming_specials_yield_nothing() {
    let tok = CharTokenizer::chatml();
    let mut stream = TextStream::new();
    let end = tok.token_to_id("<|im_end|>").unwrap();
    assert_eq!(stream.push(&tok, end).unwrap(), "");
    assert_eq!(stream.text(), "");
}

#[test]
fn streaming_invalid_token_errors() {
    let tok = CharTokenizer::chatml();
    let mut stream = TextStream::new();
    assert!(stream.push(&tok, u32::MAX).is_err());
}

#[test]
fn tokenizer_is_object_safe() {
    let tok: Box<dyn Tokenizer> = Box::new(CharTokenizer::chatml());
    assert!(tok.vocab_size() > 3);
}
