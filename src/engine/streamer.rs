//! Token streaming.
//!
//! A [`Streamer`] receives each generated token as soon as it is sampled and can
//! ask the engine to stop or cancel.

use tracing::trace;

use super::sampler::TokenId;

/// Streamer verdict after each token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingStatus {
    #[default]
    Running,
    /// Finish after the current token.
    Stop,
    /// Abort and drop the current token.
    Cancel,
}

pub trait Streamer {
    fn write(&mut self, token: TokenId) -> StreamingStatus;

    /// Called once when decoding ends.
    fn end(&mut self) {}
}

/// Streamer that ignores every token.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamer;

impl Streamer for NoopStreamer {
    fn write(&mut self, _token: TokenId) -> StreamingStatus {
        StreamingStatus::Running
    }
}

/// Forwards raw token ids to a callback.
pub struct TokenCallbackStreamer<F> {
    callback: F,
}

impl<F: FnMut(TokenId) -> StreamingStatus> TokenCallbackStreamer<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F: FnMut(TokenId) -> StreamingStatus> Streamer for TokenCallbackStreamer<F> {
    fn write(&mut self, token: TokenId) -> StreamingStatus {
        (self.callback)(token)
    }
}

/// Turns token ids back into text.
pub trait Detokenizer {
    fn decode(&self, ids: &[TokenId]) -> String;
}

impl<F: Fn(&[TokenId]) -> String> Detokenizer for F {
    fn decode(&self, ids: &[TokenId]) -> String {
        self(ids)
    }
}

/// Streams decoded text.
///
/// Text is re-decoded from all tokens so far and only the new suffix is passed on.
/// A trailing U+FFFD means a multi-byte character is still incomplete; that text is
/// held back until more tokens arrive or [`end`](Streamer::end) flushes it.
pub struct TextStreamer<D, F> {
    detokenizer: D,
    callback: F,
    tokens: Vec<TokenId>,
    printed: usize,
}

impl<D: Detokenizer, F: FnMut(&str) -> StreamingStatus> TextStreamer<D, F> {
    pub fn new(detokenizer: D, callback: F) -> Self {
        Self {
            detokenizer,
            callback,
            tokens: Vec::new(),
            printed: 0,
        }
    }

    fn emit(&mut self, text: &str) -> StreamingStatus {
        let fresh = text.get(self.printed..).unwrap_or_default();
        self.printed = text.len();
        if fresh.is_empty() {
            return StreamingStatus::Running;
        }
        trace!(chunk = fresh, "Streaming text");
        (self.callback)(fresh)
    }
}

impl<D: Detokenizer, F: FnMut(&str) -> StreamingStatus> Streamer for TextStreamer<D, F> {
    fn write(&mut self, token: TokenId) -> StreamingStatus {
        self.tokens.push(token);
        let text = self.detokenizer.decode(&self.tokens);
        if text.ends_with('\u{FFFD}') {
            return StreamingStatus::Running;
        }
        self.emit(&text)
    }

    fn end(&mut self) {
        let text = self.detokenizer.decode(&self.tokens);
        // The verdict is moot once decoding has ended.
        let _ = self.emit(&text);
        self.tokens.clear();
        self.printed = 0;
    }
}
