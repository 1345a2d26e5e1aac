pub mod discord;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::report::Embed;

/// A message read from the channel, either live or from history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Platform message ID
    pub id: String,
    /// Platform user ID of the author
    pub author_id: String,
    /// Raw text content
    pub text: String,
    /// Set when the message was relayed by a webhook integration
    pub webhook_id: Option<String>,
}

/// Cursor that precedes every message in a channel
pub const ORIGIN_CURSOR: &str = "0";

/// Message IDs are snowflakes: numeric order is chronological order
pub fn snowflake(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

impl ChannelMessage {
    /// Whether the message was delivered by an integration rather than typed by a member
    pub fn is_relay(&self) -> bool {
        self.webhook_id.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("channel {channel_id} not found or not accessible")]
    ChannelUnavailable { channel_id: String },

    #[error("API error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// The slice of a chat platform client that the bot needs
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// User ID the bot is logged in as
    async fn current_user_id(&self) -> PlatformResult<String>;

    /// Lazily page through the full history of a channel
    fn history<'a>(&'a self, channel_id: &'a str)
        -> BoxStream<'a, PlatformResult<ChannelMessage>>;

    /// ID of the newest message in the channel, or `ORIGIN_CURSOR` when it is empty.
    /// Live delivery starts after this cursor.
    async fn live_cursor(&self, channel_id: &str) -> PlatformResult<String>;

    /// Push messages newer than `cursor` into `tx` until the receiver is dropped.
    /// `cursor` is advanced past every message handed to `tx`, so a later call
    /// resumes where this one stopped.
    async fn listen(
        &self,
        channel_id: &str,
        cursor: &mut String,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> PlatformResult<()>;

    /// Post a formatted message to a channel
    async fn send_embed(&self, channel_id: &str, embed: &Embed) -> PlatformResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_ordering() {
        let mut ids = vec!["1200000000000000010", "999999999999999999", "1200000000000000002"];
        ids.sort_by_key(|id| snowflake(id));
        assert_eq!(
            ids,
            vec!["999999999999999999", "1200000000000000002", "1200000000000000010"]
        );
        assert!(snowflake(ORIGIN_CURSOR) < snowflake("1"));
    }
}
