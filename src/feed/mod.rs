mod fetch;
mod parse;
mod resolve;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{FeedError, SourceError};
use crate::http::HttpClient;
use crate::model::{Candidate, Source};

pub use fetch::fetch_feed_bytes;
pub use parse::parse_feed;
pub use resolve::{channel_feed_url, extract_channel_id, is_channel_url, resolve_channel};

/// Reads a source's current entries and resolves channel URLs to feeds.
///
/// Pollers and the source registry only talk to this trait, so tests can swap
/// the network out.
#[async_trait]
pub trait FeedReader: Send + Sync {
    /// Fetch and parse the feed behind `source`, in feed order
    async fn read(&self, source: &Source) -> Result<Vec<Candidate>, FeedError>;

    /// Turn a channel page URL into its feed URL
    async fn resolve(&self, url: &str) -> Result<String, SourceError>;
}

/// [`FeedReader`] backed by an [`HttpClient`]
pub struct HttpFeedReader<C> {
    client: C,
}

impl<C: HttpClient> HttpFeedReader<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> FeedReader for HttpFeedReader<C> {
    #[instrument(skip_all, fields(url = %source.url))]
    async fn read(&self, source: &Source) -> Result<Vec<Candidate>, FeedError> {
        url::Url::parse(&source.url)?;
        let bytes = fetch_feed_bytes(&self.client, &source.url).await?;
        let candidates = parse_feed(&bytes, &source.url)?;
        debug!(count = candidates.len(), "Parsed feed");
        Ok(candidates)
    }

    async fn resolve(&self, url: &str) -> Result<String, SourceError> {
        resolve_channel(&self.client, url).await
    }
}
