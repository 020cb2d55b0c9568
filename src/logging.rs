//! Tracing subscriber setup.

use std::str::FromStr;

use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the target filter, e.g. `emo_finetune=debug`.
pub const LOG_ENV: &str = "EMO_LOG";

/// Install a global fmt subscriber filtered by `EMO_LOG`.
///
/// Returns `false` when a global subscriber is already set. An unparsable filter
/// falls back to the default (everything off) instead of failing.
pub fn try_init_tracing() -> bool {
    let targets = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| Targets::from_str(&value).ok())
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(targets)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
