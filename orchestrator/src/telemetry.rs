use std::env;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

static LOG_FORMAT: OnceLock<LogFormat> = OnceLock::new();

/// Structured JSON unless `FORQ_LOG_FORMAT=pretty` asks for human output.
pub fn log_format() -> LogFormat {
    *LOG_FORMAT
        .get_or_init(|| parse_log_format(&env::var("FORQ_LOG_FORMAT").unwrap_or_default()))
}

fn parse_log_format(value: &str) -> LogFormat {
    if value.trim().eq_ignore_ascii_case("pretty") {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_format() {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_current_span(true)
                .with_filter(filter);
            tracing_subscriber::registry().with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_filter(filter);
            tracing_subscriber::registry().with(fmt_layer).init();
        }
    }
}
