//! Door + smart-lock preview pipeline: normalize both photos, build one edit request, call the
//! image model with bounded linear backoff, and track the result in a [`GenerationSession`].

pub mod config;
pub mod error;
pub mod invoker;
pub mod normalize;
pub mod request;
pub mod service;
pub mod session;

pub use config::PipelineConfig;
pub use error::{ImageRole, MissingInput, PipelineError};
pub use invoker::{classify, AttemptObserver, Invocation, RetryInvoker, RetryPolicy};
pub use normalize::{normalize, normalize_async, NormalizedImage, SourceImage};
pub use request::{build as build_request, GenerationRequest, RequestPart, EDIT_INSTRUCTION};
pub use service::{
    DryrunService, GeminiService, GenerationResponse, GenerationService, ResponsePart,
    ServiceError,
};
pub use session::GenerationSession;
