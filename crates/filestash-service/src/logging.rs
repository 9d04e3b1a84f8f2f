use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::util::SubscriberInitExt;

/// The default filter directives for the configured log `level`.
///
/// Below `DEBUG`, only the filestash crates get more verbose. Everything else stays at `INFO`.
fn default_directives(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             filestash=DEBUG,\
             filestash_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             filestash=TRACE,\
             filestash_service=TRACE"
        }
    }
}

/// Returns the filter directives to log with.
///
/// The `RUST_LOG` environment variable takes precedence over the configured `level`.
pub fn rust_log(level: LevelFilter) -> String {
    env::var("RUST_LOG").unwrap_or_else(|_| default_directives(level).to_owned())
}

/// Installs a global subscriber that writes one JSON object per event to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .init();
}
