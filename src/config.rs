use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const TOKEN_ENV: &str = "DISCORD_BOT_TOKEN";
pub const CHANNEL_ENV: &str = "DISCORD_CHANNEL_ID";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Channel the webhook integration posts redirects into
    #[serde(default)]
    pub channel_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReportConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_footer")]
    pub footer: String,
    #[serde(default = "default_color")]
    pub color: u32,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_title() -> String {
    "📊 Hourly Redirect Summary".to_string()
}

fn default_footer() -> String {
    "Automatic Statistics Bot".to_string()
}

fn default_color() -> u32 {
    0x5865F2
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            channel_id: String::new(),
            api_base: default_api_base(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            footer: default_footer(),
            color: default_color(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `DISCORD_BOT_TOKEN` and
    /// `DISCORD_CHANNEL_ID` from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = if path.exists() {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?
        } else {
            String::new()
        };
        Self::from_sources(&content, |key| std::env::var(key).ok())
    }

    /// Merge file content with variables from `env` and validate the result
    pub fn from_sources(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).context("Failed to parse config file")?;

        if let Some(token) = env(TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            config.discord.bot_token = token;
        }
        if let Some(channel) = env(CHANNEL_ENV).filter(|v| !v.trim().is_empty()) {
            config.discord.channel_id = channel;
        }
        config.discord.bot_token = config.discord.bot_token.trim().to_string();
        config.discord.channel_id = config.discord.channel_id.trim().to_string();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.discord.bot_token.is_empty() {
            bail!("{} is not set", TOKEN_ENV);
        }
        if self.discord.channel_id.is_empty() {
            bail!("{} is not set", CHANNEL_ENV);
        }
        if self.discord.channel_id.parse::<u64>().is_err() {
            bail!(
                "{} must be a numeric channel id, got '{}'",
                CHANNEL_ENV,
                self.discord.channel_id
            );
        }
        if self.listener.poll_interval_secs == 0 {
            bail!("listener.poll_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.listener.poll_interval_secs)
    }
}
