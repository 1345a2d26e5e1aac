use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DiscordConfig;
use crate::platform::{
    snowflake, ChannelMessage, ChatPlatform, PlatformError, PlatformResult, ORIGIN_CURSOR,
};
use crate::report::Embed;

/// Discord returns at most this many messages per request
const PAGE_LIMIT: usize = 100;

/// How many 429 responses a single request waits out before giving up
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Upper bound on a single rate-limit wait
const MAX_RETRY_AFTER_SECS: f64 = 60.0;

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: WireUser,
    #[serde(default)]
    webhook_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

#[derive(Serialize)]
struct CreateMessage<'a> {
    embeds: [&'a Embed; 1],
}

impl From<WireMessage> for ChannelMessage {
    fn from(msg: WireMessage) -> Self {
        Self {
            id: msg.id,
            author_id: msg.author.id,
            text: msg.content,
            webhook_id: msg.webhook_id,
        }
    }
}

/// How long a 429 response asks us to wait: the JSON body first, then the
/// `Retry-After` header, then one second.
async fn retry_after(response: reqwest::Response) -> Duration {
    let header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());
    let body = response
        .json::<RateLimited>()
        .await
        .ok()
        .map(|r| r.retry_after);
    let secs = body.or(header).unwrap_or(1.0);
    Duration::from_secs_f64(secs.clamp(0.0, MAX_RETRY_AFTER_SECS))
}

/// Discord REST client. Live messages are picked up by polling the channel.
pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    poll_interval: Duration,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            poll_interval,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send the request built by `build`, waiting out rate limits, and map
    /// the final response through `check`.
    async fn execute<F>(
        &self,
        build: F,
        channel_id: Option<&str>,
    ) -> PlatformResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let response = build()
                .header("Authorization", format!("Bot {}", self.token))
                .send()
                .await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS
                && attempt < MAX_RATE_LIMIT_RETRIES
            {
                attempt += 1;
                let wait = retry_after(response).await;
                warn!(
                    "Rate limited by Discord, retrying in {:?} ({}/{})",
                    wait, attempt, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            return Self::check(response, channel_id).await;
        }
    }

    /// Map non-success responses to a `PlatformError`.
    /// 403 and 404 on a channel route mean the channel cannot be resolved.
    async fn check(
        response: reqwest::Response,
        channel_id: Option<&str>,
    ) -> PlatformResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if let Some(channel_id) = channel_id {
            if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
                return Err(PlatformError::ChannelUnavailable {
                    channel_id: channel_id.to_string(),
                });
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(PlatformError::Api { status, body })
    }

    /// Fetch one page of channel messages
    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        query: &[(&str, &str)],
    ) -> PlatformResult<Vec<ChannelMessage>> {
        let url = self.url(&format!("/channels/{}/messages", channel_id));
        let limit = limit.to_string();
        let response = self
            .execute(
                || {
                    self.client
                        .get(url.as_str())
                        .query(&[("limit", limit.as_str())])
                        .query(query)
                },
                Some(channel_id),
            )
            .await?;
        let page: Vec<WireMessage> = response.json().await?;
        Ok(page.into_iter().map(ChannelMessage::from).collect())
    }

    /// All messages newer than `cursor`, oldest first
    async fn fetch_after(
        &self,
        channel_id: &str,
        cursor: &str,
    ) -> PlatformResult<Vec<ChannelMessage>> {
        let mut collected: Vec<ChannelMessage> = Vec::new();
        let mut after = cursor.to_string();
        loop {
            let page = self
                .fetch_messages(channel_id, PAGE_LIMIT, &[("after", after.as_str())])
                .await?;
            let full = page.len() == PAGE_LIMIT;
            collected.extend(page);
            collected.sort_by_key(|m| snowflake(&m.id));
            collected.dedup_by(|a, b| a.id == b.id);
            match collected.last() {
                Some(last) if full => after = last.id.clone(),
                _ => break,
            }
        }
        Ok(collected)
    }
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn current_user_id(&self) -> PlatformResult<String> {
        let url = self.url("/users/@me");
        let response = self.execute(|| self.client.get(url.as_str()), None).await?;
        let user: WireUser = response.json().await?;
        Ok(user.id)
    }

    fn history<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> BoxStream<'a, PlatformResult<ChannelMessage>> {
        // State: None = exhausted, Some(before) = next page to fetch
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(before) = cursor else {
                return Ok(None);
            };
            let page = match before.as_deref() {
                Some(before) => {
                    self.fetch_messages(channel_id, PAGE_LIMIT, &[("before", before)])
                        .await?
                }
                None => self.fetch_messages(channel_id, PAGE_LIMIT, &[]).await?,
            };
            debug!("Fetched history page of {} messages", page.len());
            let next = if page.len() < PAGE_LIMIT {
                None
            } else {
                page.iter()
                    .min_by_key(|m| snowflake(&m.id))
                    .map(|m| Some(m.id.clone()))
            };
            Ok::<_, PlatformError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, PlatformError>)))
        .try_flatten()
        .boxed()
    }

    async fn live_cursor(&self, channel_id: &str) -> PlatformResult<String> {
        let latest = self.fetch_messages(channel_id, 1, &[]).await?;
        Ok(latest
            .into_iter()
            .next()
            .map(|m| m.id)
            .unwrap_or_else(|| ORIGIN_CURSOR.to_string()))
    }

    async fn listen(
        &self,
        channel_id: &str,
        cursor: &mut String,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> PlatformResult<()> {
        info!(
            "Polling channel {} every {:?} for messages after {}",
            channel_id, self.poll_interval, cursor
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                return Ok(());
            }

            let fresh = match self.fetch_after(channel_id, cursor).await {
                Ok(fresh) => fresh,
                Err(e @ PlatformError::ChannelUnavailable { .. }) => return Err(e),
                Err(e) => {
                    warn!("Polling channel {} failed: {}", channel_id, e);
                    continue;
                }
            };

            for msg in fresh {
                let id = msg.id.clone();
                if tx.send(msg).await.is_err() {
                    return Ok(());
                }
                *cursor = id;
            }
        }
    }

    async fn send_embed(&self, channel_id: &str, embed: &Embed) -> PlatformResult<()> {
        let url = self.url(&format!("/channels/{}/messages", channel_id));
        let body = CreateMessage { embeds: [embed] };
        self.execute(
            || self.client.post(url.as_str()).json(&body),
            Some(channel_id),
        )
        .await?;
        Ok(())
    }
}
