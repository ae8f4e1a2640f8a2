//! Tracing subscriber setup for the daemon.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map `CTLROUTE_LOG` to a level. Unknown values fall back to info.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(level: &str) -> String {
    format!("ctlroute={level},ctlrouted={level}")
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `CTLROUTE_LOG` picks the level for
/// this crate. `LOG_FORMAT=json` switches to JSON lines. Calling twice is
/// harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("CTLROUTE_LOG").ok().as_deref());
        EnvFilter::new(default_filter(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
