use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Microsoft Graph endpoint
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,

    /// Bearer token for Graph requests (acquired elsewhere)
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_graph_base_url(),
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Messages requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How often to refresh the open conversation (seconds)
    #[serde(default = "default_chat_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Delay before the follow-up refresh after posting a reply (milliseconds)
    #[serde(default = "default_post_refresh_delay")]
    pub post_refresh_delay_ms: u64,

    /// Prefix displayed messages with their send time
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// strftime format for messages sent today
    #[serde(default = "default_timestamp_format_today")]
    pub timestamp_format_today: String,

    /// strftime format for messages from earlier days
    #[serde(default = "default_timestamp_format_past")]
    pub timestamp_format_past: String,

    /// Chats listed by /chats and at startup
    #[serde(default = "default_max_chats")]
    pub max_chats: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            refresh_interval_secs: default_chat_refresh_interval(),
            post_refresh_delay_ms: default_post_refresh_delay(),
            timestamps: true,
            timestamp_format_today: default_timestamp_format_today(),
            timestamp_format_past: default_timestamp_format_past(),
            max_chats: default_max_chats(),
        }
    }
}

impl ChatConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn post_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.post_refresh_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Show reminder notifications at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to check reminders (seconds)
    #[serde(default = "default_reminder_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minutes a "snooze all" response postpones the batch
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: i64,

    /// How far ahead the reminder view reaches (days)
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,

    /// Reminders for meetings that started longer ago than this are stale
    #[serde(default = "default_stale_after_start")]
    pub stale_after_start_minutes: i64,

    /// Upper bound on pages drained from a single feed per refresh
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_reminder_poll_interval(),
            snooze_minutes: default_snooze_minutes(),
            lookahead_days: default_lookahead_days(),
            stale_after_start_minutes: default_stale_after_start(),
            max_pages: default_max_pages(),
        }
    }
}

impl ReminderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_page_size() -> usize {
    50
}

fn default_chat_refresh_interval() -> u64 {
    20
}

fn default_post_refresh_delay() -> u64 {
    500
}

fn default_timestamp_format_today() -> String {
    "%H:%M".to_string()
}

fn default_timestamp_format_past() -> String {
    "%Y-%m-%d %H:%M".to_string()
}

fn default_max_chats() -> usize {
    25
}

fn default_true() -> bool {
    true
}

fn default_reminder_poll_interval() -> u64 {
    60 // 1 minute
}

fn default_snooze_minutes() -> i64 {
    5
}

fn default_lookahead_days() -> i64 {
    60 // ~2 months
}

fn default_stale_after_start() -> i64 {
    15
}

fn default_max_pages() -> usize {
    100
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the sync loops cannot run with
    pub fn validate(&self) -> Result<()> {
        let chat = &self.chat;
        if chat.page_size == 0 {
            bail!("chat.page_size must be at least 1");
        }
        if chat.refresh_interval_secs == 0 {
            bail!("chat.refresh_interval_secs must be at least 1");
        }
        if chat.max_chats == 0 {
            bail!("chat.max_chats must be at least 1");
        }
        check_time_format("chat.timestamp_format_today", &chat.timestamp_format_today)?;
        check_time_format("chat.timestamp_format_past", &chat.timestamp_format_past)?;

        let reminders = &self.reminders;
        if reminders.poll_interval_secs == 0 {
            bail!("reminders.poll_interval_secs must be at least 1");
        }
        if reminders.snooze_minutes < 1 {
            bail!(
                "reminders.snooze_minutes must be at least 1, got {}",
                reminders.snooze_minutes
            );
        }
        if reminders.lookahead_days < 1 {
            bail!(
                "reminders.lookahead_days must be at least 1, got {}",
                reminders.lookahead_days
            );
        }
        if reminders.stale_after_start_minutes < 0 {
            bail!("reminders.stale_after_start_minutes cannot be negative");
        }
        if reminders.max_pages == 0 {
            bail!("reminders.max_pages must be at least 1");
        }
        Ok(())
    }

    /// Apply environment variable overrides on top of file values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("GRAPH_ACCESS_TOKEN") {
            self.graph.access_token = Some(token);
        }
        if let Ok(url) = std::env::var("GRAPH_BASE_URL") {
            self.graph.base_url = url;
        }
        if let Ok(secs) = std::env::var("CHAT_REFRESH_INTERVAL_SECS") {
            self.chat.refresh_interval_secs = secs
                .parse()
                .context("CHAT_REFRESH_INTERVAL_SECS must be a valid number")?;
        }
        if let Ok(secs) = std::env::var("REMINDER_POLL_INTERVAL_SECS") {
            self.reminders.poll_interval_secs = secs
                .parse()
                .context("REMINDER_POLL_INTERVAL_SECS must be a valid number")?;
        }
        if let Ok(mins) = std::env::var("REMINDER_SNOOZE_MINUTES") {
            self.reminders.snooze_minutes = mins
                .parse()
                .context("REMINDER_SNOOZE_MINUTES must be a valid number")?;
        }
        self.validate()
    }

    pub fn example() -> Self {
        Config {
            graph: GraphConfig {
                base_url: default_graph_base_url(),
                access_token: Some("paste-a-graph-token-here".to_string()),
            },
            chat: ChatConfig::default(),
            reminders: ReminderConfig::default(),
        }
    }
}

fn check_time_format(key: &str, format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        bail!("{} is not a valid strftime format: '{}'", key, format);
    }
    Ok(())
}
