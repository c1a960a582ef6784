//! # Conversation Pipeline
//!
//! Per-connection state machine that turns one text message into one audio frame:
//!
//! ```text
//!            submit(text)                      ready_for_next
//!   Idle ──────────────────▶ Processing ──────────────────────▶ Idle ─┐
//!    ▲                        │  validate → generate →                │ queue non-empty:
//!    │                        │  synthesize → emit                    │ start head
//!    │          any error     │                                       │
//!    └────────────────────────┘  (report, then start head if any) ◀───┘
//! ```
//!
//! ## Rules:
//! - Only one message is in flight per connection. While busy, new messages go to a
//!   FIFO queue and the client is told to wait.
//! - A successful turn keeps the pipeline busy until the client says `ready_for_next`
//!   (it must finish playing the audio first).
//! - A failed turn releases the pipeline immediately and starts the next queued message
//!   without waiting for a ready signal.
//! - Empty input submitted while idle is reported and changes nothing.
//!
//! The pipeline is driven through `&mut self` by a single worker task per connection
//! (see [`ConversationPipeline::run`]), so no two steps for the same connection ever
//! overlap.

use super::protocol::{Signal, WAIT_NOTICE};
use crate::backends::{GenerationRequest, SpeechSynthesizer, SynthesisRequest, TextGenerator};
use crate::error::{RelayError, Stage};
use crate::registry::ConnectionRegistry;
use crate::state::{AppState, ConversationStats};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Tunables taken from configuration when the pipeline is created.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upper bound for each backend call
    pub backend_timeout: Duration,
    /// `None` keeps the pending queue unbounded
    pub max_pending: Option<usize>,
}

pub struct ConversationPipeline {
    client_id: String,
    generator: Arc<dyn TextGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ConversationStats>,
    settings: PipelineSettings,
    busy: bool,
    pending: VecDeque<String>,
}

impl ConversationPipeline {
    /// Create an idle pipeline for `client_id` wired to the shared services.
    pub fn new(client_id: impl Into<String>, state: &AppState) -> Self {
        Self {
            client_id: client_id.into(),
            generator: state.generator.clone(),
            synthesizer: state.synthesizer.clone(),
            registry: state.registry.clone(),
            stats: state.conversation.clone(),
            settings: PipelineSettings {
                backend_timeout: state.config.backend_timeout(),
                max_pending: state.config.conversation.max_pending,
            },
            busy: false,
            pending: VecDeque::new(),
        }
    }

    /// True while a message is in flight (including after its audio was sent and
    /// before the client's ready signal).
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queued messages, head first.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    /// Apply one inbound signal.
    ///
    /// Errors returned here mean the client can no longer be reached (the error
    /// report itself could not be delivered); everything else is reported on the
    /// connection and swallowed.
    pub async fn handle(&mut self, signal: Signal) -> Result<(), RelayError> {
        match signal {
            Signal::Submit(text) => self.submit(text).await,
            Signal::ReadyForNext => self.ready_for_next().await,
            Signal::Unrecognized(kind) => self.report(&RelayError::UnrecognizedSignal(kind)).await,
            Signal::Malformed(detail) => self.report(&RelayError::InvalidFrame(detail)).await,
        }
    }

    /// Accept a new message: process it now if idle, queue it if busy.
    pub async fn submit(&mut self, text: String) -> Result<(), RelayError> {
        if self.busy {
            if let Some(limit) = self.settings.max_pending {
                if self.pending.len() >= limit {
                    self.stats.message_rejected();
                    warn!(client_id = %self.client_id, limit, "Pending queue full, message dropped");
                    return self.report(&RelayError::QueueFull { limit }).await;
                }
            }

            self.pending.push_back(text);
            self.stats.message_queued();
            debug!(client_id = %self.client_id, queued = self.pending.len(), "Message queued");
            return self.registry.send_text(&self.client_id, WAIT_NOTICE).await;
        }

        if let Err(err) = validate(&text) {
            self.stats.message_rejected();
            return self.report(&err).await;
        }

        self.process(text).await
    }

    /// The client finished with the previous result: release the pipeline and start
    /// the next queued message, if any.
    pub async fn ready_for_next(&mut self) -> Result<(), RelayError> {
        if !self.busy {
            debug!(client_id = %self.client_id, "Ready signal while idle");
        }
        self.busy = false;

        match self.pending.pop_front() {
            Some(next) => self.process(next).await,
            None => Ok(()),
        }
    }

    /// Run messages until one succeeds (pipeline stays busy) or the queue is empty
    /// after a failure (pipeline idle).
    async fn process(&mut self, first: String) -> Result<(), RelayError> {
        let mut next = Some(first);

        while let Some(text) = next.take() {
            self.busy = true;
            let turn_id = Uuid::new_v4();
            let started = Instant::now();
            let span = info_span!("turn", client_id = %self.client_id, %turn_id);

            match self.run_turn(&text).instrument(span).await {
                Ok(()) => {
                    self.stats.turn_completed();
                    info!(
                        client_id = %self.client_id,
                        %turn_id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Turn completed, waiting for ready signal"
                    );
                    return Ok(());
                }
                Err(err) => {
                    self.stats.turn_failed();
                    warn!(
                        client_id = %self.client_id,
                        %turn_id,
                        kind = err.kind(),
                        error = %err,
                        "Turn failed"
                    );
                    self.report(&err).await?;
                    self.busy = false;
                    next = self.pending.pop_front();
                }
            }
        }

        Ok(())
    }

    /// validate → generate → synthesize → emit, for a single message.
    async fn run_turn(&self, text: &str) -> Result<(), RelayError> {
        validate(text)?;

        let request = GenerationRequest {
            text: text.to_string(),
            conversation_id: Some(self.client_id.clone()),
        };
        let generated = self
            .with_timeout(Stage::Generation, self.generator.generate(request))
            .await?;
        debug!(
            chars = generated.text.len(),
            conversation_id = ?generated.conversation_id,
            "Generated reply"
        );

        let speech = self
            .with_timeout(
                Stage::Synthesis,
                self.synthesizer.synthesize(SynthesisRequest {
                    text: generated.text,
                }),
            )
            .await?;
        debug!(bytes = speech.audio.len(), format = speech.format.as_str(), "Synthesized reply");

        self.registry.send_binary(&self.client_id, speech.audio).await
    }

    async fn with_timeout<T>(
        &self,
        stage: Stage,
        call: impl Future<Output = Result<T, RelayError>>,
    ) -> Result<T, RelayError> {
        let limit = self.settings.backend_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RelayError::Timeout {
                stage,
                seconds: limit.as_secs(),
            })?
    }

    /// Send the user-facing text for `err` to this connection.
    async fn report(&self, err: &RelayError) -> Result<(), RelayError> {
        self.registry.send_text(&self.client_id, err.user_message()).await
    }

    /// Drive the pipeline from a stream of signals until the stream closes or the
    /// client becomes unreachable.
    pub async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if let Err(err) = self.handle(signal).await {
                warn!(
                    client_id = %self.client_id,
                    error = %err,
                    "Stopping conversation: client is no longer reachable"
                );
                break;
            }
        }
        debug!(
            client_id = %self.client_id,
            dropped = self.pending.len(),
            "Conversation worker finished"
        );
    }
}

fn validate(text: &str) -> Result<(), RelayError> {
    if text.trim().is_empty() {
        return Err(RelayError::InvalidInput("Empty message received".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fakes::{FakeGenerator, FakeSynthesizer};
    use crate::config::AppConfig;
    use crate::registry::testing::RecordingChannel;

    const CLIENT: &str = "test_client";

    struct Harness {
        pipeline: ConversationPipeline,
        generator: Arc<FakeGenerator>,
        synthesizer: Arc<FakeSynthesizer>,
        channel: Arc<RecordingChannel>,
        state: AppState,
    }

    fn harness_with(generator: FakeGenerator, synthesizer: FakeSynthesizer, config: AppConfig) -> Harness {
        let generator = Arc::new(generator);
        let synthesizer = Arc::new(synthesizer);
        let state = AppState::new(config, generator.clone(), synthesizer.clone());
        let channel = Arc::new(RecordingChannel::default());
        state.registry.register(CLIENT, channel.clone());
        Harness {
            pipeline: ConversationPipeline::new(CLIENT, &state),
            generator,
            synthesizer,
            channel,
            state,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeGenerator::default(), FakeSynthesizer::default(), AppConfig::default())
    }

    fn audio_for(prompt: &str) -> Vec<u8> {
        format!("audio_Processed: {}", prompt).into_bytes()
    }

    #[tokio::test]
    async fn test_round_trip_emits_single_audio_frame() {
        let mut h = harness();

        h.pipeline.submit("Hello world".to_string()).await.unwrap();

        assert_eq!(h.channel.binaries(), vec![audio_for("Hello world")]);
        assert!(h.channel.texts().is_empty());
        assert_eq!(h.generator.calls(), vec!["Hello world".to_string()]);
        assert_eq!(h.synthesizer.calls(), vec!["Processed: Hello world".to_string()]);
    }

    #[tokio::test]
    async fn test_success_stays_busy_until_ready_signal() {
        let mut h = harness();

        h.pipeline.submit("hello".to_string()).await.unwrap();
        assert_eq!(h.channel.binaries().len(), 1);
        assert!(h.pipeline.is_busy());

        h.pipeline.ready_for_next().await.unwrap();
        assert!(!h.pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_second_message_waits_for_ready_signal() {
        let mut h = harness();

        h.pipeline.submit("A".to_string()).await.unwrap();
        assert!(h.pipeline.is_busy());

        h.pipeline.submit("B".to_string()).await.unwrap();
        assert_eq!(h.generator.calls(), vec!["A".to_string()]);
        assert_eq!(h.pipeline.pending().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(h.channel.texts(), vec![WAIT_NOTICE.to_string()]);

        h.pipeline.ready_for_next().await.unwrap();
        assert_eq!(h.generator.calls(), vec!["A".to_string(), "B".to_string()]);
        assert!(h.pipeline.is_busy());
        assert_eq!(h.pipeline.pending_len(), 0);
        assert_eq!(h.channel.binaries(), vec![audio_for("A"), audio_for("B")]);
    }

    #[tokio::test]
    async fn test_queue_drains_in_fifo_order() {
        let mut h = harness();

        h.pipeline.submit("first".to_string()).await.unwrap();
        for text in ["A", "B", "C"] {
            h.pipeline.submit(text.to_string()).await.unwrap();
        }
        assert_eq!(h.pipeline.pending().collect::<Vec<_>>(), vec!["A", "B", "C"]);

        for _ in 0..3 {
            h.pipeline.ready_for_next().await.unwrap();
        }

        assert_eq!(h.generator.calls(), vec!["first", "A", "B", "C"]);
        assert_eq!(h.state.conversation.snapshot().messages_queued, 3);
        assert_eq!(h.state.conversation.snapshot().turns_completed, 4);
    }

    /// Identical texts are neither merged nor reordered.
    #[tokio::test]
    async fn test_duplicate_messages_are_kept() {
        let mut h = harness();

        h.pipeline.submit("same".to_string()).await.unwrap();
        h.pipeline.submit("same".to_string()).await.unwrap();
        h.pipeline.submit("same".to_string()).await.unwrap();

        assert_eq!(h.pipeline.pending_len(), 2);
        assert_eq!(h.channel.texts(), vec![WAIT_NOTICE.to_string(), WAIT_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn test_blank_input_rejected_while_idle() {
        let mut h = harness();

        for text in ["", "   ", "\n\t"] {
            h.pipeline.submit(text.to_string()).await.unwrap();
            assert!(!h.pipeline.is_busy());
            assert_eq!(h.pipeline.pending_len(), 0);
        }

        assert!(h.generator.calls().is_empty());
        assert!(h.synthesizer.calls().is_empty());
        assert_eq!(h.channel.texts(), vec!["Empty message received".to_string(); 3]);
        assert_eq!(h.state.conversation.snapshot().messages_rejected, 3);
    }

    /// While busy, blank input is queued like anything else and only rejected when
    /// its turn comes, after which the pipeline moves on without a ready signal.
    #[tokio::test]
    async fn test_blank_input_is_validated_when_dequeued() {
        let mut h = harness();

        h.pipeline.submit("hello".to_string()).await.unwrap();
        h.pipeline.submit("   ".to_string()).await.unwrap();
        h.pipeline.submit("after".to_string()).await.unwrap();
        assert_eq!(h.pipeline.pending_len(), 2);

        h.pipeline.ready_for_next().await.unwrap();

        assert_eq!(
            h.channel.texts(),
            vec![
                WAIT_NOTICE.to_string(),
                WAIT_NOTICE.to_string(),
                "Empty message received".to_string(),
            ]
        );
        assert_eq!(h.generator.calls(), vec!["hello", "after"]);
        assert!(h.pipeline.is_busy());
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_returns_to_idle() {
        let mut h = harness();

        h.pipeline.submit("fail".to_string()).await.unwrap();

        assert!(!h.pipeline.is_busy());
        assert_eq!(h.channel.texts(), vec!["Text generation failed".to_string()]);
        assert!(h.channel.binaries().is_empty());
        assert!(h.synthesizer.calls().is_empty());
        assert_eq!(h.state.conversation.snapshot().turns_failed, 1);

        // Idle again: the next message is processed immediately
        h.pipeline.submit("hello".to_string()).await.unwrap();
        assert_eq!(h.channel.binaries(), vec![audio_for("hello")]);
    }

    #[tokio::test]
    async fn test_failure_auto_advances_queue() {
        let mut h = harness();

        h.pipeline.submit("hello".to_string()).await.unwrap();
        h.pipeline.submit("fail".to_string()).await.unwrap();
        h.pipeline.submit("please fail too".to_string()).await.unwrap();
        h.pipeline.submit("next".to_string()).await.unwrap();

        // One ready signal: "fail" errors, "please fail too" errors, "next" succeeds
        h.pipeline.ready_for_next().await.unwrap();

        assert_eq!(
            h.generator.calls(),
            vec!["hello", "fail", "please fail too", "next"]
        );
        assert_eq!(
            h.channel.texts()[3..],
            ["Text generation failed".to_string(), "Text generation failed".to_string()]
        );
        assert_eq!(h.channel.binaries(), vec![audio_for("hello"), audio_for("next")]);
        assert!(h.pipeline.is_busy());
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failure_with_empty_queue_leaves_pipeline_idle() {
        let mut h = harness();

        h.pipeline.submit("hello".to_string()).await.unwrap();
        h.pipeline.submit("fail".to_string()).await.unwrap();
        h.pipeline.ready_for_next().await.unwrap();

        assert!(!h.pipeline.is_busy());
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_returns_to_idle() {
        let mut h = harness_with(
            FakeGenerator::default(),
            FakeSynthesizer::broken(),
            AppConfig::default(),
        );

        h.pipeline.submit("hello".to_string()).await.unwrap();

        assert!(!h.pipeline.is_busy());
        assert_eq!(h.channel.texts(), vec!["Speech synthesis failed".to_string()]);
        assert!(h.channel.binaries().is_empty());
    }

    #[tokio::test]
    async fn test_backend_timeout_is_reported_and_releases_pipeline() {
        let mut h = harness_with(
            FakeGenerator::slow(Duration::from_secs(5)),
            FakeSynthesizer::default(),
            AppConfig::default(),
        );
        h.pipeline.settings.backend_timeout = Duration::from_millis(20);

        h.pipeline.submit("hello".to_string()).await.unwrap();

        assert!(!h.pipeline.is_busy());
        assert_eq!(h.channel.texts(), vec!["Text generation timed out".to_string()]);
        assert!(h.synthesizer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_signal_changes_nothing() {
        let mut h = harness();
        h.pipeline.submit("hello".to_string()).await.unwrap();

        h.pipeline
            .handle(Signal::Unrecognized("bogus".to_string()))
            .await
            .unwrap();
        h.pipeline
            .handle(Signal::Malformed("expected value".to_string()))
            .await
            .unwrap();

        assert!(h.pipeline.is_busy());
        assert_eq!(h.pipeline.pending_len(), 0);
        assert_eq!(
            h.channel.texts(),
            vec![
                "Unknown message type: bogus".to_string(),
                "Invalid message format".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ready_signal_while_idle_is_harmless() {
        let mut h = harness();

        h.pipeline.ready_for_next().await.unwrap();

        assert!(!h.pipeline.is_busy());
        assert!(h.channel.frames().is_empty());
        assert!(h.generator.calls().is_empty());
    }

    /// Known gap: without `max_pending` nothing limits how much a client can queue.
    #[tokio::test]
    async fn test_pending_queue_is_unbounded_by_default() {
        let mut h = harness();

        h.pipeline.submit("hello".to_string()).await.unwrap();
        for i in 0..500 {
            h.pipeline.submit(format!("message {}", i)).await.unwrap();
        }

        assert_eq!(h.pipeline.pending_len(), 500);
        assert_eq!(h.generator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_overflow() {
        let mut config = AppConfig::default();
        config.conversation.max_pending = Some(2);
        let mut h = harness_with(FakeGenerator::default(), FakeSynthesizer::default(), config);

        h.pipeline.submit("hello".to_string()).await.unwrap();
        for text in ["A", "B", "C"] {
            h.pipeline.submit(text.to_string()).await.unwrap();
        }

        assert_eq!(h.pipeline.pending().collect::<Vec<_>>(), vec!["A", "B"]);
        let texts = h.channel.texts();
        assert_eq!(texts.len(), 3);
        assert!(texts[2].starts_with("Too many pending messages (limit 2)"));
        assert_eq!(h.state.conversation.snapshot().messages_rejected, 1);
    }

    #[tokio::test]
    async fn test_unregistered_client_cannot_be_served() {
        let mut h = harness();
        h.state.registry.unregister(CLIENT);

        let err = h.pipeline.submit("hello".to_string()).await.unwrap_err();

        assert!(matches!(err, RelayError::NoActiveConnection(ref id) if id == CLIENT));
        assert!(h.channel.frames().is_empty());
    }

    #[tokio::test]
    async fn test_worker_applies_signals_in_order() {
        let h = harness();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(Signal::Submit("A".to_string())).unwrap();
        tx.send(Signal::Submit("B".to_string())).unwrap();
        tx.send(Signal::ReadyForNext).unwrap();
        tx.send(Signal::Submit("fail".to_string())).unwrap();
        tx.send(Signal::ReadyForNext).unwrap();
        tx.send(Signal::Unrecognized("bogus".to_string())).unwrap();
        drop(tx);

        h.pipeline.run(rx).await;

        assert_eq!(h.generator.calls(), vec!["A", "B", "fail"]);
        assert_eq!(h.channel.binaries(), vec![audio_for("A"), audio_for("B")]);
        assert_eq!(
            h.channel.texts(),
            vec![
                WAIT_NOTICE.to_string(),
                WAIT_NOTICE.to_string(),
                "Text generation failed".to_string(),
                "Unknown message type: bogus".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_stops_when_client_disappears() {
        let h = harness();
        h.state.registry.unregister(CLIENT);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(Signal::Submit("hello".to_string())).unwrap();
        tx.send(Signal::Submit("again".to_string())).unwrap();

        // Returns even though the sender is still open
        h.pipeline.run(rx).await;

        assert_eq!(h.generator.calls(), vec!["hello"]);
        drop(tx);
    }
}
