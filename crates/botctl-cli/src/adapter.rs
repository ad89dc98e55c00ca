//! [`Diagnostics`] backed by the automation application's own state files
//! and configuration loader.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use botctl_core::diagnostics::{
    DedupCounts, DiagnosticError, Diagnostics, TokenStatus, UsageCounters,
};
use botctl_core::{LaunchSpec, Settings};

const TOKENS_FILE: &str = "tokens.json";
const USAGE_FILE: &str = "api_usage.json";
const TRACKER_FILE: &str = "content_tracker_v2.json";

/// Builds the application's configuration object and discards it. Fails
/// when a required setting is missing.
const CONFIG_PROBE: &str = "from twitter_bot.core.config import get_config; get_config()";

pub struct AppAdapter<'a> {
    settings: &'a Settings,
    today: NaiveDate,
}

impl<'a> AppAdapter<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            today: Local::now().date_naive(),
        }
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.settings.project_root.join(name)
    }
}

#[derive(Debug, Deserialize)]
struct StoredToken {
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredUsage {
    posts_this_month: u64,
    reads_this_month: u64,
    daily_posts: HashMap<String, u64>,
    daily_reads: HashMap<String, u64>,
    current_month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredTracker {
    replied_tweets: serde_json::Map<String, serde_json::Value>,
    used_rss_posts: serde_json::Map<String, serde_json::Value>,
    email_content: Vec<serde_json::Value>,
    posted_content: Vec<serde_json::Value>,
    content_themes: serde_json::Map<String, serde_json::Value>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DiagnosticError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(DiagnosticError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(DiagnosticError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&text).map_err(|e| DiagnosticError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Expiry timestamps are written as naive local ISO-8601; an explicit
/// offset is converted to local time.
fn parse_expiry(raw: &str) -> Option<NaiveDateTime> {
    raw.parse::<NaiveDateTime>().ok().or_else(|| {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Local).naive_local())
    })
}

impl Diagnostics for AppAdapter<'_> {
    fn check_config(&self) -> Result<(), DiagnosticError> {
        let python = &self.settings.python;
        let mut spec = LaunchSpec::from_cmd(
            "config-check",
            &[python.clone(), "-c".to_string(), CONFIG_PROBE.to_string()],
        )
        .map_err(|e| DiagnosticError::Unavailable(e.to_string()))?;
        spec.cwd = Some(self.settings.project_root.clone());
        if self.settings.env_file.is_file() {
            spec = spec.sourcing(&self.settings.env_file);
        }

        tracing::debug!(command = %spec.command_line(), "checking application configuration");
        let output = spec
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DiagnosticError::Unavailable(format!("cannot run {python}: {e}")))?;
        if output.status.success() {
            return Ok(());
        }

        // The loader's last stderr line carries the exception message.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map_or_else(|| format!("loader exited with {}", output.status), str::to_string);
        Err(DiagnosticError::ConfigRejected(reason))
    }

    fn token_status(&self, user_id: &str) -> Result<Option<TokenStatus>, DiagnosticError> {
        let path = self.state_file(TOKENS_FILE);
        let mut tokens: HashMap<String, StoredToken> = match read_json(&path) {
            Ok(tokens) => tokens,
            Err(DiagnosticError::Missing(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(token) = tokens.remove(user_id) else {
            return Ok(None);
        };
        let expires_at = match token.expires_at.as_deref() {
            Some(raw) => Some(parse_expiry(raw).ok_or_else(|| DiagnosticError::Malformed {
                path: path.clone(),
                reason: format!("unreadable expires_at {raw:?}"),
            })?),
            None => None,
        };
        Ok(Some(TokenStatus {
            expires_at,
            has_refresh_token: token.refresh_token.is_some_and(|t| !t.is_empty()),
        }))
    }

    fn usage(&self) -> Result<UsageCounters, DiagnosticError> {
        let usage: StoredUsage = read_json(&self.state_file(USAGE_FILE))?;
        let today = self.today.format("%Y-%m-%d").to_string();
        let month = self.today.format("%Y-%m").to_string();
        // Monthly counters belong to `current_month` and reset on rollover.
        let same_month = usage.current_month.as_deref().is_none_or(|m| m == month);
        let (writes_this_month, reads_this_month) = if same_month {
            (usage.posts_this_month, usage.reads_this_month)
        } else {
            (0, 0)
        };
        Ok(UsageCounters {
            writes_this_month,
            reads_this_month,
            writes_today: usage.daily_posts.get(&today).copied().unwrap_or(0),
            reads_today: usage.daily_reads.get(&today).copied().unwrap_or(0),
        })
    }

    fn dedup_counts(&self) -> Result<DedupCounts, DiagnosticError> {
        let tracker: StoredTracker = read_json(&self.state_file(TRACKER_FILE))?;
        Ok(DedupCounts {
            replied_tweets: tracker.replied_tweets.len(),
            used_rss_posts: tracker.used_rss_posts.len(),
            email_content: tracker.email_content.len(),
            posted_content: tracker.posted_content.len(),
            content_themes: tracker.content_themes.len(),
        })
    }
}
