//! Diagnostic output for the `botctl` binary.
//!
//! Everything goes to stderr so reports printed on stdout stay clean.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Level override consulted when `RUST_LOG` is unset.
pub const LOG_LEVEL_VAR: &str = "BOTCTL_LOG_LEVEL";

/// `RUST_LOG`, then [`LOG_LEVEL_VAR`], then `fallback`. Blank values are
/// skipped.
fn filter_directive(lookup: impl Fn(&str) -> Option<String>, fallback: &str) -> String {
    ["RUST_LOG", LOG_LEVEL_VAR]
        .into_iter()
        .filter_map(&lookup)
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Install the global subscriber. An unparseable directive falls back to
/// `default_filter`; a second call is a no-op.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let directive = filter_directive(|key| std::env::var(key).ok(), default_filter);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json = log_json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let plain = (!log_json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn rust_log_wins() {
        let env = lookup(&[("RUST_LOG", "botctl_core=trace"), (LOG_LEVEL_VAR, "info")]);
        assert_eq!(filter_directive(env, "warn"), "botctl_core=trace");
    }

    #[test]
    fn level_var_is_second() {
        let env = lookup(&[("RUST_LOG", "  "), (LOG_LEVEL_VAR, "debug")]);
        assert_eq!(filter_directive(env, "warn"), "debug");
    }

    #[test]
    fn fallback_when_unset() {
        assert_eq!(filter_directive(lookup(&[]), "warn"), "warn");
    }
}
