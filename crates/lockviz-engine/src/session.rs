use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lockviz_contracts::catalog::LockReference;
use lockviz_contracts::events::{new_session_id, EventWriter};
use lockviz_contracts::state::{AttemptState, FailureKind};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::config::PipelineConfig;
use crate::error::{error_chain_text, truncate_text, ImageRole, MissingInput, PipelineError};
use crate::invoker::{AttemptObserver, Invocation, RetryInvoker};
use crate::normalize::{normalize_async, NormalizedImage, SourceImage};
use crate::request::build;
use crate::service::{GenerationService, ServiceError};

const LOGGED_DIAGNOSTIC_MAX_CHARS: usize = 512;

#[derive(Debug, Clone)]
struct SelectedLock {
    reference: LockReference,
    image: Arc<SourceImage>,
}

#[derive(Debug, Default)]
struct SessionInner {
    door: Option<Arc<SourceImage>>,
    lock: Option<SelectedLock>,
    /// Bumped by every input change and every `generate()`; completions carrying an older
    /// ticket are discarded.
    generation: u64,
    state: AttemptState,
}

/// Inputs and lifecycle of one user's preview session.
///
/// All mutation goes through a mutex that is never held across an `.await`. A generation only
/// writes state while its ticket is still the newest, so a late response from a superseded
/// request can never overwrite what a newer one produced.
pub struct GenerationSession<S> {
    service: S,
    config: PipelineConfig,
    invoker: RetryInvoker,
    events: EventWriter,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<AttemptState>,
}

impl<S: GenerationService> GenerationSession<S> {
    pub fn new(service: S, config: PipelineConfig) -> Self {
        let (state_tx, _) = watch::channel(AttemptState::Idle);
        Self {
            invoker: RetryInvoker::from_config(&config),
            service,
            config,
            events: EventWriter::disabled(new_session_id()),
            inner: Mutex::new(SessionInner::default()),
            state_tx,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self.emit(
            "session_started",
            json!({
                "provider": self.service.name(),
                "max_attempts": self.invoker.policy().max_attempts(),
                "door_max_width": self.config.door_max_width,
                "lock_max_width": self.config.lock_max_width,
            }),
        );
        self
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn state(&self) -> AttemptState {
        self.lock_inner().state.clone()
    }

    /// Receives every published state; only the latest value is retained.
    pub fn subscribe(&self) -> watch::Receiver<AttemptState> {
        self.state_tx.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        self.lock_inner().generation
    }

    pub fn has_door_image(&self) -> bool {
        self.lock_inner().door.is_some()
    }

    pub fn selected_lock(&self) -> Option<LockReference> {
        self.lock_inner()
            .lock
            .as_ref()
            .map(|lock| lock.reference.clone())
    }

    /// New upload: supersedes any in-flight generation and drops the previous result.
    pub fn set_door_image(&self, image: SourceImage) {
        let (width, height) = (image.width(), image.height());
        {
            let mut inner = self.lock_inner();
            inner.door = Some(Arc::new(image));
            self.supersede(&mut inner);
        }
        self.emit(
            "door_image_set",
            json!({ "width": width, "height": height }),
        );
    }

    pub fn select_lock(&self, reference: LockReference, image: SourceImage) {
        let lock_id = reference.id.clone();
        {
            let mut inner = self.lock_inner();
            inner.lock = Some(SelectedLock {
                reference,
                image: Arc::new(image),
            });
            self.supersede(&mut inner);
        }
        self.emit("lock_selected", json!({ "lock_id": lock_id }));
    }

    /// Back to `Idle` without touching inputs.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        self.supersede(&mut inner);
    }

    /// Explicit user retry: a fresh generation from attempt 0 with the current inputs.
    pub async fn retry(&self) -> Result<Invocation, PipelineError> {
        self.generate().await
    }

    pub async fn generate(&self) -> Result<Invocation, PipelineError> {
        let (ticket, door, lock) = {
            let mut inner = self.lock_inner();
            let (door, lock) = match (inner.door.clone(), inner.lock.clone()) {
                (Some(door), Some(lock)) => (door, lock),
                (door, _) => {
                    let missing = if door.is_none() {
                        MissingInput::DoorImage
                    } else {
                        MissingInput::LockImage
                    };
                    drop(inner);
                    self.emit(
                        "generation_rejected",
                        json!({ "reason": missing.to_string() }),
                    );
                    return Err(PipelineError::MissingInput(missing));
                }
            };
            inner.generation += 1;
            let ticket = inner.generation;
            self.publish(
                &mut inner,
                AttemptState::Generating {
                    generation: ticket,
                    attempt: 0,
                    max_attempts: self.invoker.policy().max_attempts(),
                },
            );
            (ticket, door, lock)
        };

        self.emit(
            "generation_started",
            json!({
                "generation": ticket,
                "lock_id": lock.reference.id,
                "max_attempts": self.invoker.policy().max_attempts(),
            }),
        );
        let result = self.run_pipeline(ticket, door, lock.image).await;
        self.settle(ticket, result)
    }

    async fn run_pipeline(
        &self,
        ticket: u64,
        door: Arc<SourceImage>,
        lock: Arc<SourceImage>,
    ) -> Result<Invocation, PipelineError> {
        let quality = self.config.jpeg_quality;
        let door = normalize_async(door, self.config.door_max_width, quality).await?;
        self.log_normalized(ticket, ImageRole::Door, &door);
        let lock = normalize_async(lock, self.config.lock_max_width, quality).await?;
        self.log_normalized(ticket, ImageRole::Lock, &lock);

        let request = build(&door, &lock)?;
        if !self.is_current(ticket) {
            return Err(PipelineError::Superseded { generation: ticket });
        }
        self.emit(
            "request_built",
            json!({
                "generation": ticket,
                "digest": request.digest(),
                "payload_bytes": request.payload_bytes(),
            }),
        );

        let mut progress = SessionProgress {
            session: self,
            ticket,
        };
        self.invoker
            .invoke(&self.service, &request, &mut progress)
            .await
    }

    fn settle(
        &self,
        ticket: u64,
        result: Result<Invocation, PipelineError>,
    ) -> Result<Invocation, PipelineError> {
        let mut inner = self.lock_inner();
        if inner.generation != ticket {
            let current = inner.generation;
            drop(inner);
            self.emit(
                "generation_superseded",
                json!({ "generation": ticket, "current": current }),
            );
            return Err(PipelineError::Superseded { generation: ticket });
        }

        match &result {
            Ok(invocation) => {
                self.publish(
                    &mut inner,
                    AttemptState::Succeeded {
                        generation: ticket,
                        image: invocation.image.clone(),
                        attempts: invocation.attempts,
                    },
                );
                drop(inner);
                self.emit(
                    "generation_succeeded",
                    json!({
                        "generation": ticket,
                        "attempts": invocation.attempts,
                        "mime_type": invocation.image.mime_type,
                        "bytes": invocation.image.data.len(),
                    }),
                );
            }
            Err(err) => {
                if let Some(kind) = err.failure_kind() {
                    let diagnostic =
                        truncate_text(&err.diagnostic(), self.config.diagnostic_max_chars);
                    let message = kind.user_message(&diagnostic);
                    self.publish(
                        &mut inner,
                        AttemptState::Failed {
                            generation: ticket,
                            kind,
                            attempt: err.attempts().saturating_sub(1),
                            message: message.clone(),
                            diagnostic,
                        },
                    );
                    drop(inner);
                    self.emit(
                        "generation_failed",
                        json!({
                            "generation": ticket,
                            "classification": kind.as_str(),
                            "attempts": err.attempts(),
                            "message": message,
                            "error": truncate_text(&err.to_string(), LOGGED_DIAGNOSTIC_MAX_CHARS),
                            "retry_after_s": kind.retry_after().map(|wait| wait.as_secs()),
                        }),
                    );
                }
            }
        }
        result
    }

    fn record_attempt(&self, ticket: u64, attempt: u32) {
        let mut inner = self.lock_inner();
        if inner.generation != ticket {
            return;
        }
        let max_attempts = self.invoker.policy().max_attempts();
        self.publish(
            &mut inner,
            AttemptState::Generating {
                generation: ticket,
                attempt,
                max_attempts,
            },
        );
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.lock_inner().generation == ticket
    }

    fn supersede(&self, inner: &mut SessionInner) {
        inner.generation += 1;
        self.publish(inner, AttemptState::Idle);
    }

    fn publish(&self, inner: &mut SessionInner, state: AttemptState) {
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn log_normalized(&self, ticket: u64, role: ImageRole, image: &NormalizedImage) {
        self.emit(
            "image_normalized",
            json!({
                "generation": ticket,
                "role": role.as_str(),
                "width": image.width,
                "height": image.height,
                "bytes": image.data.len(),
                "quality": image.quality,
            }),
        );
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, map_object(payload));
    }
}

struct SessionProgress<'a, S> {
    session: &'a GenerationSession<S>,
    ticket: u64,
}

impl<S: GenerationService> AttemptObserver for SessionProgress<'_, S> {
    fn attempt_started(&mut self, attempt: u32) {
        self.session.record_attempt(self.ticket, attempt);
        self.session.emit(
            "attempt_started",
            json!({ "generation": self.ticket, "attempt": attempt }),
        );
    }

    fn attempt_failed(&mut self, attempt: u32, kind: FailureKind, error: &ServiceError) {
        self.session.emit(
            "attempt_failed",
            json!({
                "generation": self.ticket,
                "attempt": attempt,
                "classification": kind.as_str(),
                "diagnostic": error_chain_text(error, LOGGED_DIAGNOSTIC_MAX_CHARS),
            }),
        );
    }

    fn retry_scheduled(&mut self, attempt: u32, delay: Duration) {
        self.session.emit(
            "retry_scheduled",
            json!({
                "generation": self.ticket,
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
            }),
        );
    }

    fn keep_retrying(&self) -> bool {
        self.session.is_current(self.ticket)
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lockviz_contracts::catalog::LockReference;
    use lockviz_contracts::events::{read_events, EventWriter};
    use lockviz_contracts::state::{AttemptState, FailureKind};
    use serde_json::Value;

    use super::GenerationSession;
    use crate::config::PipelineConfig;
    use crate::error::{MissingInput, PipelineError};
    use crate::normalize::SourceImage;
    use crate::test_support::{
        gradient_png, http_error, image_response, text_response, ScriptedService,
    };

    fn lock_reference() -> LockReference {
        LockReference {
            id: "p90-gold".to_string(),
            name: "Stanley P90 Gold".to_string(),
            description: String::new(),
            image_url: "https://example.test/p90.png".to_string(),
        }
    }

    fn door() -> SourceImage {
        SourceImage::from_bytes(gradient_png(1200, 900)).expect("door png")
    }

    fn lock() -> SourceImage {
        SourceImage::from_bytes(gradient_png(200, 400)).expect("lock png")
    }

    fn ready_session(service: ScriptedService) -> GenerationSession<ScriptedService> {
        let session = GenerationSession::new(service, PipelineConfig::default());
        session.set_door_image(door());
        session.select_lock(lock_reference(), lock());
        session
    }

    fn event_types(rows: &[Value]) -> Vec<String> {
        rows.iter()
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn generate_without_door_stays_idle() {
        let session = GenerationSession::new(
            ScriptedService::new(vec![Ok(image_response(b"never"))]),
            PipelineConfig::default(),
        );
        session.select_lock(lock_reference(), lock());

        let result = session.generate().await;
        assert_eq!(
            result,
            Err(PipelineError::MissingInput(MissingInput::DoorImage))
        );
        assert_eq!(session.state(), AttemptState::Idle);
        assert_eq!(session.service().calls(), 0);
    }

    #[tokio::test]
    async fn generate_without_lock_is_rejected() {
        let session = GenerationSession::new(ScriptedService::new(vec![]), PipelineConfig::default());
        session.set_door_image(door());
        assert_eq!(
            session.generate().await,
            Err(PipelineError::MissingInput(MissingInput::LockImage))
        );
        assert_eq!(session.service().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_rate_limits() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let session = ready_session(ScriptedService::new(vec![
            Err(http_error(429, "Too Many Requests")),
            Err(http_error(429, "Too Many Requests")),
            Ok(image_response(b"edited door")),
        ]))
        .with_events(EventWriter::new(&events_path, "session-test"));

        let invocation = session.generate().await?;
        assert_eq!(invocation.attempts, 3);
        assert_eq!(session.service().calls(), 3);
        match session.state() {
            AttemptState::Succeeded {
                image, attempts, ..
            } => {
                assert_eq!(image.data, b"edited door".to_vec());
                assert_eq!(attempts - 1, 2, "two retries performed");
            }
            other => panic!("unexpected state: {other:?}"),
        }

        let rows = read_events(&events_path)?;
        let attempts: Vec<u64> = rows
            .iter()
            .filter(|row| row["type"] == "attempt_started")
            .filter_map(|row| row["attempt"].as_u64())
            .collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        let delays: Vec<u64> = rows
            .iter()
            .filter(|row| row["type"] == "retry_scheduled")
            .filter_map(|row| row["delay_ms"].as_u64())
            .collect();
        assert_eq!(delays, vec![3000, 6000]);
        let types = event_types(&rows);
        assert_eq!(types.first().map(String::as_str), Some("session_started"));
        assert_eq!(types.last().map(String::as_str), Some("generation_succeeded"));
        let built = rows
            .iter()
            .find(|row| row["type"] == "request_built")
            .ok_or_else(|| anyhow::anyhow!("request_built missing"))?;
        assert_eq!(built["digest"].as_str().map(str::len), Some(64));
        assert!(built["payload_bytes"].as_u64().unwrap_or(0) > 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limits_fail_after_three_calls() {
        let session = ready_session(ScriptedService::new(vec![
            Err(http_error(429, "Too Many Requests")),
            Err(http_error(429, "Too Many Requests")),
            Err(http_error(429, "Too Many Requests")),
        ]));

        let result = session.generate().await;
        assert!(matches!(
            result,
            Err(PipelineError::RateLimited { attempts: 3, .. })
        ));
        assert_eq!(session.service().calls(), 3);
        match session.state() {
            AttemptState::Failed {
                kind,
                attempt,
                message,
                diagnostic,
                ..
            } => {
                assert_eq!(kind, FailureKind::RateLimited);
                assert_eq!(attempt, 2);
                assert_eq!(message, "AI is busy. Please wait 60s.");
                assert_eq!(diagnostic, "429: Too Many Reques…");
                assert!(kind.retry_after().is_some());
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_response_fails_without_retrying() {
        let session = ready_session(ScriptedService::new(vec![
            Ok(text_response("No image for you")),
            Ok(image_response(b"never")),
        ]));

        let result = session.generate().await;
        assert_eq!(result, Err(PipelineError::EmptyResponse { attempts: 1 }));
        assert_eq!(session.service().calls(), 1);
        assert_eq!(
            session.state().failure_kind(),
            Some(FailureKind::EmptyResponse)
        );
        match session.state() {
            AttemptState::Failed { message, .. } => {
                assert_eq!(message, "AI Error, try again later. (Empty Response)");
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_failure_shows_status_and_body() {
        let session = ready_session(ScriptedService::new(vec![Err(http_error(
            400,
            "API key not valid. Please pass a valid API key.",
        ))]));

        assert!(session.generate().await.is_err());
        match session.state() {
            AttemptState::Failed {
                kind,
                message,
                diagnostic,
                ..
            } => {
                assert_eq!(kind, FailureKind::Unclassified);
                assert_eq!(diagnostic, "400: API key not val…");
                assert_eq!(message, "AI Error, try again later. (400: API key not val…)");
                assert!(kind.retry_after().is_none());
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_door_fails_before_any_network_call() {
        let session = GenerationSession::new(
            ScriptedService::new(vec![Ok(image_response(b"never"))]),
            PipelineConfig::default(),
        );
        session.set_door_image(SourceImage::unchecked(b"not a png".to_vec(), 10, 10));
        session.select_lock(lock_reference(), lock());

        let result = session.generate().await;
        assert!(matches!(result, Err(PipelineError::Decode(_))));
        assert_eq!(session.state().failure_kind(), Some(FailureKind::Decode));
        assert_eq!(session.service().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_from_superseded_generation_is_ignored() {
        let session = ready_session(ScriptedService::with_latency(vec![
            (Ok(image_response(b"stale")), Duration::from_secs(10)),
            (Ok(image_response(b"fresh")), Duration::ZERO),
        ]));

        let first = session.generate();
        let second = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            session.set_door_image(door());
            session.generate().await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(
            first,
            Err(PipelineError::Superseded { generation: 3 })
        ));
        assert!(second.is_ok());
        let state = session.state();
        assert_eq!(state.generation(), Some(session.current_generation()));
        assert_eq!(
            state.output_image().map(|image| image.data.clone()),
            Some(b"fresh".to_vec())
        );
        assert_eq!(session.service().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_generation_stops_retrying() {
        let session = ready_session(ScriptedService::new(vec![
            Err(http_error(429, "Too Many Requests")),
            Err(http_error(429, "Too Many Requests")),
        ]));

        let first = session.generate();
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.reset();
        };
        let (first, ()) = tokio::join!(first, interrupt);

        assert!(matches!(first, Err(PipelineError::Superseded { .. })));
        assert_eq!(session.state(), AttemptState::Idle);
        assert_eq!(session.service().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_retry_starts_a_fresh_generation() -> anyhow::Result<()> {
        let config = PipelineConfig {
            max_attempts: 1,
            ..PipelineConfig::default()
        };
        let session = GenerationSession::new(
            ScriptedService::new(vec![
                Err(http_error(503, "The model is overloaded.")),
                Ok(image_response(b"second try")),
            ]),
            config,
        );
        session.set_door_image(door());
        session.select_lock(lock_reference(), lock());

        assert!(session.generate().await.is_err());
        let failed_generation = session.state().generation();
        assert_eq!(
            session.state().failure_kind(),
            Some(FailureKind::RateLimited)
        );

        let invocation = session.retry().await?;
        assert_eq!(invocation.attempts, 1);
        assert!(session.state().generation() > failed_generation);
        assert!(session.state().is_terminal());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn new_selection_resets_to_idle_and_notifies_subscribers() -> anyhow::Result<()> {
        let session = ready_session(ScriptedService::new(vec![Ok(image_response(b"done"))]));
        let mut updates = session.subscribe();

        session.generate().await?;
        assert!(updates.has_changed()?);
        assert_eq!(updates.borrow_and_update().name(), "succeeded");

        session.select_lock(lock_reference(), lock());
        assert_eq!(session.state(), AttemptState::Idle);
        assert_eq!(*updates.borrow_and_update(), AttemptState::Idle);
        assert_eq!(
            session.selected_lock().map(|lock| lock.id),
            Some("p90-gold".to_string())
        );
        Ok(())
    }
}
