//! Media pipeline: audio buffering, echo, sentence splitting, TTS streaming.

pub mod echo;
pub mod ring_buffer;
pub mod sentence;
pub mod synth;
pub mod tts_stream;

pub use echo::EchoEngine;
pub use ring_buffer::AudioRingBuffer;
pub use sentence::SentenceBuffer;
pub use synth::{SpeechSynthesizer, synthesize_with_retry};
pub use tts_stream::ElevenLabsSynthesizer;
