//! External capabilities consumed by the stages.
//!
//! LLM, speech synthesis, object storage, and embedding clients live outside
//! this crate; stages only see these traits.

use async_trait::async_trait;

use dailycast_core::{Article, PodcastLanguage};

/// Failure of an external capability call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// Network error or 5xx; worth retrying
    #[error("transient failure: {0}")]
    Transient(String),
    /// 429 from the provider; worth retrying after backoff
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Malformed request, auth failure, or any other 4xx
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CapabilityError {
    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("{status}: {}", message.into());
        match status {
            429 => CapabilityError::RateLimited(message),
            500..=599 => CapabilityError::Transient(message),
            _ => CapabilityError::Permanent(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, CapabilityError::Permanent(_))
    }
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Produces the daily digest from source articles.
#[async_trait]
pub trait SummarizeCapability: Send + Sync {
    async fn generate(&self, articles: &[Article]) -> CapabilityResult<String>;
}

/// Turns a digest into a narration script.
#[async_trait]
pub trait NarrateCapability: Send + Sync {
    async fn generate(
        &self,
        summary_text: &str,
        context: &[Article],
        language: PodcastLanguage,
    ) -> CapabilityResult<String>;
}

/// Text-to-speech.
#[async_trait]
pub trait SynthesizeCapability: Send + Sync {
    async fn speak(&self, text: &str, language: PodcastLanguage) -> CapabilityResult<Vec<u8>>;
}

/// Metadata of an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub key: String,
    pub content_type: String,
}

/// Blob storage returning a public URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, metadata: ObjectMetadata) -> CapabilityResult<String>;
}

/// Vector embedding provider. Returns one vector per input, in order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>>;
}
