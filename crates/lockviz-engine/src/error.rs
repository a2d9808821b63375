use std::fmt;

use lockviz_contracts::state::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Door,
    Lock,
}

impl ImageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Door => "door",
            Self::Lock => "lock",
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MissingInput {
    #[error("upload a door photo first")]
    DoorImage,
    #[error("select a lock first")]
    LockImage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("missing input: {0}")]
    MissingInput(MissingInput),
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("{role} image payload is empty")]
    EmptyPayload { role: ImageRole },
    #[error("generation returned no image after {attempts} attempt(s)")]
    EmptyResponse { attempts: u32 },
    #[error("generation rate limited after {attempts} attempt(s): {message}")]
    RateLimited { attempts: u32, message: String },
    #[error("generation failed after {attempts} attempt(s): {message}")]
    Unclassified { attempts: u32, message: String },
    #[error("generation {generation} was superseded by a newer request")]
    Superseded { generation: u64 },
}

impl PipelineError {
    /// Classification shown in a `Failed` state. Rejections that never start or never settle the
    /// pipeline have none.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Decode(_) | Self::EmptyPayload { .. } => Some(FailureKind::Decode),
            Self::EmptyResponse { .. } => Some(FailureKind::EmptyResponse),
            Self::RateLimited { .. } => Some(FailureKind::RateLimited),
            Self::Unclassified { .. } => Some(FailureKind::Unclassified),
            Self::MissingInput(_) | Self::Superseded { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::EmptyResponse { attempts }
            | Self::RateLimited { attempts, .. }
            | Self::Unclassified { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Short text safe to show next to the failure message.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Decode(message)
            | Self::RateLimited { message, .. }
            | Self::Unclassified { message, .. } => message.clone(),
            Self::EmptyResponse { .. } => "Empty Response".to_string(),
            other => other.to_string(),
        }
    }
}

pub(crate) fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
