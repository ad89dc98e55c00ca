//! Typed queries against the external automation application.
//!
//! The supervisor never looks inside the application. An adapter implements
//! [`Diagnostics`]; [`collect_diagnostics`] turns its answers into display
//! lines, and any failure becomes a degraded line instead of an error.

use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDateTime, TimeDelta};
use thiserror::Error;

/// Tokens expiring within this window count as expired.
pub const TOKEN_EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Twitter API free-tier limits tracked by the application.
pub const MONTHLY_WRITE_LIMIT: u64 = 500;
pub const MONTHLY_READ_LIMIT: u64 = 100;
pub const DAILY_WRITE_LIMIT: u64 = 16;
pub const DAILY_READ_LIMIT: u64 = 3;

/// Failure of an external collaborator. Never fatal.
#[derive(Debug, Error)]
pub enum DiagnosticError {
    /// The collaborator's state file does not exist yet.
    #[error("{} not found", .0.display())]
    Missing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    /// The configuration loader refused the configuration.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// The data source cannot be queried on this system.
    #[error("{0}")]
    Unavailable(String),
}

/// Stored OAuth tokens for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub expires_at: Option<NaiveDateTime>,
    pub has_refresh_token: bool,
}

impl TokenStatus {
    /// Valid when the token outlives `now` by more than the expiry buffer.
    pub fn is_valid_at(&self, now: NaiveDateTime) -> bool {
        self.expires_at
            .is_some_and(|at| at > now + TimeDelta::minutes(TOKEN_EXPIRY_BUFFER_MINUTES))
    }
}

/// API usage counters for the current month and day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub writes_this_month: u64,
    pub reads_this_month: u64,
    pub writes_today: u64,
    pub reads_today: u64,
}

impl UsageCounters {
    pub const fn writes_remaining(&self) -> u64 {
        MONTHLY_WRITE_LIMIT.saturating_sub(self.writes_this_month)
    }

    pub const fn reads_remaining(&self) -> u64 {
        MONTHLY_READ_LIMIT.saturating_sub(self.reads_this_month)
    }
}

/// Sizes of the content deduplication tracker's collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupCounts {
    pub replied_tweets: usize,
    pub used_rss_posts: usize,
    pub email_content: usize,
    pub posted_content: usize,
    pub content_themes: usize,
}

pub trait Diagnostics {
    /// Construct the application's configuration, or explain why not.
    fn check_config(&self) -> Result<(), DiagnosticError>;

    /// Tokens stored for `user_id`, `None` when there are none.
    fn token_status(&self, user_id: &str) -> Result<Option<TokenStatus>, DiagnosticError>;

    fn usage(&self) -> Result<UsageCounters, DiagnosticError>;

    fn dedup_counts(&self) -> Result<DedupCounts, DiagnosticError>;
}

/// One rendered diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLine {
    pub label: &'static str,
    pub detail: String,
    /// The collaborator failed; `detail` holds the reason.
    pub degraded: bool,
}

impl DiagnosticLine {
    fn ok(label: &'static str, detail: String) -> Self {
        Self {
            label,
            detail,
            degraded: false,
        }
    }

    fn degraded(label: &'static str, err: &DiagnosticError) -> Self {
        tracing::debug!(label, error = %err, "diagnostic unavailable");
        Self {
            label,
            detail: format!("unavailable ({err})"),
            degraded: true,
        }
    }
}

impl fmt::Display for DiagnosticLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16} {}", format!("{}:", self.label), self.detail)
    }
}

/// Query every collaborator. Never fails.
pub fn collect_diagnostics(
    diagnostics: &dyn Diagnostics,
    user_id: &str,
    now: NaiveDateTime,
) -> Vec<DiagnosticLine> {
    let config = match diagnostics.check_config() {
        Ok(()) => DiagnosticLine::ok("Configuration", "loads".to_string()),
        Err(e) => DiagnosticLine::degraded("Configuration", &e),
    };

    let tokens = match diagnostics.token_status(user_id) {
        Ok(Some(status)) => DiagnosticLine::ok("OAuth tokens", describe_tokens(&status, now)),
        Ok(None) => DiagnosticLine::ok("OAuth tokens", format!("none stored for {user_id}")),
        Err(e) => DiagnosticLine::degraded("OAuth tokens", &e),
    };

    let usage = match diagnostics.usage() {
        Ok(u) => DiagnosticLine::ok(
            "API usage",
            format!(
                "writes {}/{MONTHLY_WRITE_LIMIT} this month ({}/{DAILY_WRITE_LIMIT} today), \
                 reads {}/{MONTHLY_READ_LIMIT} ({}/{DAILY_READ_LIMIT} today); \
                 {} writes and {} reads left",
                u.writes_this_month,
                u.writes_today,
                u.reads_this_month,
                u.reads_today,
                u.writes_remaining(),
                u.reads_remaining()
            ),
        ),
        Err(e) => DiagnosticLine::degraded("API usage", &e),
    };

    let dedup = match diagnostics.dedup_counts() {
        Ok(c) => DiagnosticLine::ok(
            "Content tracker",
            format!(
                "{} posts, {} replies, {} RSS posts, {} emails, {} themes",
                c.posted_content,
                c.replied_tweets,
                c.used_rss_posts,
                c.email_content,
                c.content_themes
            ),
        ),
        Err(e) => DiagnosticLine::degraded("Content tracker", &e),
    };

    vec![config, tokens, usage, dedup]
}

fn describe_tokens(status: &TokenStatus, now: NaiveDateTime) -> String {
    let refresh = if status.has_refresh_token {
        "refresh token stored"
    } else {
        "no refresh token"
    };
    match status.expires_at {
        Some(at) if status.is_valid_at(now) => {
            format!("valid until {}, {refresh}", at.format("%Y-%m-%d %H:%M"))
        }
        Some(at) => format!("expired at {}, {refresh}", at.format("%Y-%m-%d %H:%M")),
        None => format!("present without expiry, {refresh}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    struct Healthy;

    impl Diagnostics for Healthy {
        fn check_config(&self) -> Result<(), DiagnosticError> {
            Ok(())
        }
        fn token_status(&self, _: &str) -> Result<Option<TokenStatus>, DiagnosticError> {
            Ok(Some(TokenStatus {
                expires_at: Some(noon() + TimeDelta::hours(2)),
                has_refresh_token: true,
            }))
        }
        fn usage(&self) -> Result<UsageCounters, DiagnosticError> {
            Ok(UsageCounters {
                writes_this_month: 12,
                reads_this_month: 4,
                writes_today: 3,
                reads_today: 1,
            })
        }
        fn dedup_counts(&self) -> Result<DedupCounts, DiagnosticError> {
            Ok(DedupCounts {
                posted_content: 7,
                ..DedupCounts::default()
            })
        }
    }

    struct Broken;

    impl Diagnostics for Broken {
        fn check_config(&self) -> Result<(), DiagnosticError> {
            Err(DiagnosticError::ConfigRejected("missing TWITTER_API_KEY".into()))
        }
        fn token_status(&self, _: &str) -> Result<Option<TokenStatus>, DiagnosticError> {
            Err(DiagnosticError::Malformed {
                path: "tokens.json".into(),
                reason: "expected object".into(),
            })
        }
        fn usage(&self) -> Result<UsageCounters, DiagnosticError> {
            Err(DiagnosticError::Missing("api_usage.json".into()))
        }
        fn dedup_counts(&self) -> Result<DedupCounts, DiagnosticError> {
            Err(DiagnosticError::Unavailable("tracker locked".into()))
        }
    }

    #[test]
    fn token_validity_respects_buffer() {
        let mut status = TokenStatus {
            expires_at: Some(noon() + TimeDelta::minutes(4)),
            has_refresh_token: false,
        };
        assert!(!status.is_valid_at(noon()));
        status.expires_at = Some(noon() + TimeDelta::minutes(6));
        assert!(status.is_valid_at(noon()));
        status.expires_at = None;
        assert!(!status.is_valid_at(noon()));
    }

    #[test]
    fn remaining_quota_saturates() {
        let usage = UsageCounters {
            writes_this_month: 600,
            reads_this_month: 40,
            ..UsageCounters::default()
        };
        assert_eq!(usage.writes_remaining(), 0);
        assert_eq!(usage.reads_remaining(), 60);
    }

    #[test]
    fn healthy_collaborators_render_details() {
        let lines = collect_diagnostics(&Healthy, "oauth_user", noon());
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| !l.degraded));
        assert_eq!(lines[1].detail, "valid until 2025-03-14 14:00, refresh token stored");
        assert!(lines[2].detail.starts_with("writes 12/500 this month (3/16 today)"));
        assert!(lines[2].detail.ends_with("488 writes and 96 reads left"));
        assert!(lines[3].detail.starts_with("7 posts"));
    }

    #[test]
    fn failing_collaborators_degrade_one_line_each() {
        let lines = collect_diagnostics(&Broken, "oauth_user", noon());
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.degraded));
        assert_eq!(
            lines[0].detail,
            "unavailable (configuration rejected: missing TWITTER_API_KEY)"
        );
        assert_eq!(lines[2].detail, "unavailable (api_usage.json not found)");
    }

    #[test]
    fn display_aligns_labels() {
        let line = DiagnosticLine::ok("API usage", "fine".into());
        assert_eq!(line.to_string(), "API usage:       fine");
    }
}
