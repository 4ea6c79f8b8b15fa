//! The answer-generation seam.
//!
//! A [`Generator`] is a synchronous, possibly slow collaborator. The streaming
//! path calls [`Generator::stream`] on a dedicated worker thread and receives
//! text through the `emit` callback; the immediate path calls
//! [`Generator::answer`] for one complete string.

use std::sync::Arc;

use parley_shared::{GeneratorConfig, GeneratorProvider, History, Result, Scope};

use crate::xai::XaiGenerator;

/// Everything a generator sees for one turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prior turns, oldest first. Never includes the turn being answered.
    pub history: History,
    /// The new question.
    pub question: String,
    /// Per-request auxiliary values.
    pub scope: Scope,
}

/// Produces answers for questions in the context of a history.
pub trait Generator: Send + Sync {
    /// Produce the answer incrementally, calling `emit` once per fragment in
    /// order. Returning `Err` ends the turn as a failure.
    fn stream(&self, request: &GenerationRequest, emit: &mut dyn FnMut(String)) -> Result<()>;

    /// Produce the complete answer in one call.
    fn answer(&self, request: &GenerationRequest) -> Result<String> {
        let mut answer = String::new();
        self.stream(request, &mut |fragment| answer.push_str(&fragment))?;
        Ok(answer)
    }
}

/// Build the generator selected by `config`.
pub fn build_generator(config: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    match config.provider {
        GeneratorProvider::Xai => Ok(Arc::new(XaiGenerator::from_config(config)?)),
        GeneratorProvider::Echo => Ok(Arc::new(EchoGenerator)),
    }
}

// ---------------------------------------------------------------------------
// Echo generator
// ---------------------------------------------------------------------------

/// Offline generator that streams the question back word by word.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGenerator;

impl Generator for EchoGenerator {
    fn stream(&self, request: &GenerationRequest, emit: &mut dyn FnMut(String)) -> Result<()> {
        for word in request.question.split_inclusive(' ') {
            emit(word.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

/// Buffers tiny upstream deltas into fragments of at least `min_bytes`.
#[derive(Debug)]
pub struct FragmentCoalescer {
    min_bytes: usize,
    buffer: String,
}

impl FragmentCoalescer {
    pub fn new(min_bytes: usize) -> Self {
        Self {
            min_bytes,
            buffer: String::with_capacity(min_bytes.max(16) * 2),
        }
    }

    /// Add a delta; emits the buffer once it reaches the threshold.
    pub fn push(&mut self, delta: &str, emit: &mut dyn FnMut(String)) {
        self.buffer.push_str(delta);
        if !self.buffer.is_empty() && self.buffer.len() >= self.min_bytes {
            emit(std::mem::take(&mut self.buffer));
        }
    }

    /// Emit whatever is left.
    pub fn finish(mut self, emit: &mut dyn FnMut(String)) {
        if !self.buffer.is_empty() {
            emit(std::mem::take(&mut self.buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::UserId;

    fn request(question: &str) -> GenerationRequest {
        GenerationRequest {
            history: History::new(),
            question: question.into(),
            scope: Scope::for_user(&UserId::parse("tester").unwrap()),
        }
    }

    #[test]
    fn echo_streams_words_in_order() {
        let mut fragments = Vec::new();
        EchoGenerator
            .stream(&request("one two three"), &mut |f| fragments.push(f))
            .unwrap();
        assert_eq!(fragments, vec!["one ", "two ", "three"]);
    }

    #[test]
    fn default_answer_concatenates_stream() {
        let answer = EchoGenerator.answer(&request("hello there")).unwrap();
        assert_eq!(answer, "hello there");
    }

    #[test]
    fn coalescer_batches_until_threshold() {
        let mut out = Vec::new();
        let mut emit = |f: String| out.push(f);
        let mut coalescer = FragmentCoalescer::new(10);

        for delta in ["Hel", "lo", ", wor", "ld", "!"] {
            coalescer.push(delta, &mut emit);
        }
        coalescer.finish(&mut emit);

        assert_eq!(out, vec!["Hello, wor", "ld!"]);
    }

    #[test]
    fn coalescer_with_zero_threshold_passes_through() {
        let mut out = Vec::new();
        let mut emit = |f: String| out.push(f);
        let mut coalescer = FragmentCoalescer::new(0);
        coalescer.push("a", &mut emit);
        coalescer.push("", &mut emit);
        coalescer.push("b", &mut emit);
        coalescer.finish(&mut emit);
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn build_echo_from_config() {
        let config = GeneratorConfig {
            provider: GeneratorProvider::Echo,
            ..GeneratorConfig::default()
        };
        let generator = build_generator(&config).unwrap();
        assert_eq!(generator.answer(&request("ping")).unwrap(), "ping");
    }
}
