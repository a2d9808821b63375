use std::time::Duration;

use lockviz_contracts::state::{FailureKind, OutputImage};

use crate::config::PipelineConfig;
use crate::error::{truncate_text, PipelineError};
use crate::request::GenerationRequest;
use crate::service::{GenerationService, ServiceError};

/// Hard ceiling on attempts regardless of configuration.
pub const MAX_ATTEMPTS_CEILING: u32 = 5;

const TRANSIENT_STATUS_CODES: [u16; 2] = [429, 503];

const TRANSIENT_MARKERS: [&str; 10] = [
    "429",
    "503",
    "too many requests",
    "resource_exhausted",
    "resource exhausted",
    "service unavailable",
    "unavailable",
    "overloaded",
    "rate limit",
    "quota",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            base_delay,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_attempts, config.retry_base_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Linear schedule: the k-th retry waits `base_delay * k`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }
}

/// Hooks fired by the invoker so the caller can track progress.
pub trait AttemptObserver {
    fn attempt_started(&mut self, _attempt: u32) {}

    fn attempt_failed(&mut self, _attempt: u32, _kind: FailureKind, _error: &ServiceError) {}

    fn retry_scheduled(&mut self, _attempt: u32, _delay: Duration) {}

    /// Checked before and after each backoff; returning false surfaces the last failure
    /// without another call.
    fn keep_retrying(&self) -> bool {
        true
    }
}

impl AttemptObserver for () {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub image: OutputImage,
    /// Network calls performed, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryInvoker {
    policy: RetryPolicy,
    diagnostic_max_chars: usize,
}

impl RetryInvoker {
    pub fn new(policy: RetryPolicy, diagnostic_max_chars: usize) -> Self {
        Self {
            policy,
            diagnostic_max_chars,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(RetryPolicy::from_config(config), config.diagnostic_max_chars)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn invoke<S, O>(
        &self,
        service: &S,
        request: &GenerationRequest,
        observer: &mut O,
    ) -> Result<Invocation, PipelineError>
    where
        S: GenerationService + ?Sized,
        O: AttemptObserver + ?Sized,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            observer.attempt_started(attempt);
            let error = match service.generate(request).await {
                Ok(response) => {
                    let Some((mime_type, data)) = response.first_image() else {
                        return Err(PipelineError::EmptyResponse {
                            attempts: attempt + 1,
                        });
                    };
                    return Ok(Invocation {
                        image: OutputImage {
                            mime_type: mime_type.to_string(),
                            data: data.to_vec(),
                        },
                        attempts: attempt + 1,
                    });
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            observer.attempt_failed(attempt, kind, &error);
            if kind != FailureKind::RateLimited
                || attempt + 1 >= max_attempts
                || !observer.keep_retrying()
            {
                return Err(self.give_up(kind, attempt + 1, &error));
            }

            let delay = self.policy.delay_before_retry(attempt + 1);
            observer.retry_scheduled(attempt + 1, delay);
            tokio::time::sleep(delay).await;
            if !observer.keep_retrying() {
                return Err(self.give_up(kind, attempt + 1, &error));
            }
            attempt += 1;
        }
    }

    fn give_up(&self, kind: FailureKind, attempts: u32, error: &ServiceError) -> PipelineError {
        let message = truncate_text(&error.detail(), self.diagnostic_max_chars);
        match kind {
            FailureKind::RateLimited => PipelineError::RateLimited { attempts, message },
            _ => PipelineError::Unclassified { attempts, message },
        }
    }
}

/// Transient (rate limit / overload) vs. everything else. Status codes win; text markers cover
/// transports that only surface a message.
pub fn classify(error: &ServiceError) -> FailureKind {
    if let Some(status) = error.status() {
        if TRANSIENT_STATUS_CODES.contains(&status) {
            return FailureKind::RateLimited;
        }
    }
    let text = error.to_string().to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker)) {
        return FailureKind::RateLimited;
    }
    FailureKind::Unclassified
}
