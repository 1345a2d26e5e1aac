use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ReportConfig;
use crate::platform::{ChatPlatform, PlatformError};
use crate::stats::{CounterStore, Snapshot};

const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";
const ZERO_WIDTH_SPACE: &str = "\u{200b}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Rich message payload: title, body sections, colour accent, footer and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
    /// RFC 3339
    pub timestamp: String,
}

fn field(name: impl Into<String>, value: impl Into<String>) -> EmbedField {
    EmbedField {
        name: name.into(),
        value: value.into(),
        inline: false,
    }
}

/// Counters captured at the moment a summary is produced
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub at: DateTime<Local>,
    pub appstore: u64,
    pub playstore: u64,
}

impl Report {
    pub fn capture(snapshot: &Snapshot, at: DateTime<Local>) -> Self {
        Self {
            at,
            appstore: snapshot.appstore,
            playstore: snapshot.playstore,
        }
    }

    pub fn total(&self) -> u64 {
        self.appstore + self.playstore
    }

    /// `(appstore %, playstore %)`, or `None` when nothing has been counted
    pub fn percentages(&self) -> Option<(f64, f64)> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let total = total as f64;
        Some((
            self.appstore as f64 / total * 100.0,
            self.playstore as f64 / total * 100.0,
        ))
    }

    /// The breakdown line, e.g. `🍎 iOS: **75.0%** | 🤖 Android: **25.0%**`
    pub fn breakdown(&self) -> Option<String> {
        self.percentages().map(|(apple, android)| {
            format!(
                "🍎 iOS: **{:.1}%** | 🤖 Android: **{:.1}%**",
                apple, android
            )
        })
    }

    pub fn to_embed(&self, config: &ReportConfig) -> Embed {
        let time_str = self.at.format("%d %B %Y, %H:%M");

        let mut fields = vec![
            field(SEPARATOR, ZERO_WIDTH_SPACE),
            field(
                "🍎 **App Store (iOS) Redirects**",
                format!("```\n{:06} redirects\n```", self.appstore),
            ),
            field(
                "🤖 **Play Store (Android) Redirects**",
                format!("```\n{:06} redirects\n```", self.playstore),
            ),
            field(SEPARATOR, ZERO_WIDTH_SPACE),
        ];
        if let Some(breakdown) = self.breakdown() {
            fields.push(field("📊 **Breakdown**", breakdown));
        }

        Embed {
            title: config.title.clone(),
            description: format!("Redirect statistics as of **{}**", time_str),
            color: config.color,
            fields,
            footer: EmbedFooter {
                text: config.footer.clone(),
            },
            timestamp: self.at.to_rfc3339(),
        }
    }
}

/// Post the current counters to the channel. Failures are logged and never
/// touch the counters.
pub async fn send_summary(
    platform: &dyn ChatPlatform,
    channel_id: &str,
    store: &CounterStore,
    config: &ReportConfig,
) {
    let report = Report::capture(&store.snapshot().await, Local::now());
    let embed = report.to_embed(config);

    match platform.send_embed(channel_id, &embed).await {
        Ok(()) => info!(
            "Hourly summary sent: App Store: {}, Play Store: {}",
            report.appstore, report.playstore
        ),
        Err(e @ PlatformError::ChannelUnavailable { .. }) => {
            warn!("Skipping hourly summary: {}", e)
        }
        Err(e) => error!("Failed to send hourly summary: {}", e),
    }
}
