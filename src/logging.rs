//! Structured JSON logging (spec §7), modeled on the original service's
//! `JsonLogFormatter`: one JSON line per log event, `tracing`'s span/field
//! machinery standing in for the Python formatter's explicit field list.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(true)
        .flatten_event(true)
        .try_init()
        .unwrap_or_else(|err| eprintln!("logging already initialized: {err}"));
}
