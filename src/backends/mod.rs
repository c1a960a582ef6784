//! # Backend Clients
//!
//! Stateless wrappers around the two external services a conversation turn needs:
//!
//! - **Text generation** (`generation`): prompt text in, completion text out
//! - **Speech synthesis** (`synthesis`): text in, encoded audio bytes out
//!
//! Each service is a trait so the pipeline can be driven by the real OpenAI clients
//! in production and by in-memory fakes in tests. Implementations translate every
//! backend failure into `RelayError::Generation` / `RelayError::Synthesis` and never
//! retry.

pub mod generation;
pub mod synthesis;

pub use generation::{GenerationRequest, GenerationResponse, OpenAiTextGenerator, TextGenerator};
pub use synthesis::{
    AudioFormat, OpenAiSpeechSynthesizer, SpeechSynthesizer, SynthesisRequest, SynthesisResponse,
};

/// Join a base URL and an API path without doubling the slash.
fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
