//! Tracing/logging bootstrap for relay processes.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,relay_session=debug,relay_core=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `RELAY_SESSION_LOG`
/// 3) `RELAY_LOG`
/// 4) internal default filter
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init() {
    let env_filter = filter_from_lookup(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_lookup<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    filter_directives(lookup)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// First non-empty directive string that parses as a filter.
fn filter_directives<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    ["RUST_LOG", "RELAY_SESSION_LOG", "RELAY_LOG"]
        .into_iter()
        .filter_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        .find(|value| EnvFilter::try_new(value).is_ok())
}
