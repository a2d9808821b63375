use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Suggested wait before a manual retry after the provider reported overload.
pub const RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(60);

const BUSY_MESSAGE: &str = "AI is busy. Please wait 60s.";
const ERROR_MESSAGE: &str = "AI Error, try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Decode,
    EmptyResponse,
    RateLimited,
    Unclassified,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::EmptyResponse => "empty_response",
            Self::RateLimited => "rate_limited",
            Self::Unclassified => "unclassified",
        }
    }

    /// Only overload failures carry retry-after semantics.
    pub fn retry_after(self) -> Option<Duration> {
        match self {
            Self::RateLimited => Some(RATE_LIMIT_RETRY_AFTER),
            _ => None,
        }
    }

    pub fn user_message(self, diagnostic: &str) -> String {
        match self {
            Self::RateLimited => BUSY_MESSAGE.to_string(),
            _ if diagnostic.trim().is_empty() => ERROR_MESSAGE.to_string(),
            _ => format!("{ERROR_MESSAGE} ({})", diagnostic.trim()),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl OutputImage {
    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("png") {
            "png"
        } else if lowered.contains("webp") {
            "webp"
        } else {
            "jpg"
        }
    }
}

/// User-visible lifecycle of one generation.
///
/// `generation` is the ticket of the `generate()` call that produced the state; attempts are
/// zero-based (`attempt == 1` is the first retry).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttemptState {
    #[default]
    Idle,
    Generating {
        generation: u64,
        attempt: u32,
        max_attempts: u32,
    },
    Succeeded {
        generation: u64,
        image: OutputImage,
        attempts: u32,
    },
    Failed {
        generation: u64,
        kind: FailureKind,
        attempt: u32,
        message: String,
        diagnostic: String,
    },
}

impl AttemptState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating { .. } => "generating",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(self, Self::Generating { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Generating { generation, .. }
            | Self::Succeeded { generation, .. }
            | Self::Failed { generation, .. } => Some(*generation),
        }
    }

    pub fn output_image(&self) -> Option<&OutputImage> {
        match self {
            Self::Succeeded { image, .. } => Some(image),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// "attempt 2 of 3" while generating.
    pub fn progress_label(&self) -> Option<String> {
        match self {
            Self::Generating {
                attempt,
                max_attempts,
                ..
            } => Some(format!("attempt {} of {}", attempt + 1, max_attempts)),
            _ => None,
        }
    }
}
