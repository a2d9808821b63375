use std::future::Future;

use crate::request::GenerationRequest;

mod dryrun;
mod gemini;

pub use dryrun::DryrunService;
pub use gemini::{GeminiService, DEFAULT_GEMINI_API_BASE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    InlineImage { mime_type: String, data: Vec<u8> },
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResponse {
    pub parts: Vec<ResponsePart>,
}

impl GenerationResponse {
    pub fn new(parts: Vec<ResponsePart>) -> Self {
        Self { parts }
    }

    /// First inline image in response order.
    pub fn first_image(&self) -> Option<(&str, &[u8])> {
        self.parts.iter().find_map(|part| match part {
            ResponsePart::InlineImage { mime_type, data } if !data.is_empty() => {
                Some((mime_type.as_str(), data.as_slice()))
            }
            _ => None,
        })
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ResponsePart::InlineImage { data, .. } if !data.is_empty()))
            .count()
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ResponsePart::Text(text) => Some(text.trim()),
                ResponsePart::InlineImage { .. } => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Raw failure from the remote service, before the invoker classifies it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{provider} request failed ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} rejected the request: {message}")]
    InvalidRequest { provider: String, message: String },
    #[error("{provider} returned an invalid payload: {message}")]
    InvalidResponse { provider: String, message: String },
}

impl ServiceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Error content without the provider prefix, for short user-facing diagnostics.
    pub fn detail(&self) -> String {
        match self {
            Self::Http { status, body, .. } => format!("{status}: {}", body.trim()),
            Self::Transport { message, .. }
            | Self::InvalidRequest { message, .. }
            | Self::InvalidResponse { message, .. } => message.clone(),
        }
    }
}

/// The one call the pipeline needs from a provider: send parts, receive parts or an error.
pub trait GenerationService {
    fn name(&self) -> &str;

    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<GenerationResponse, ServiceError>> + Send;
}
