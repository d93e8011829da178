mod advisory;
mod cli;
mod config;
mod context;
mod diagnostics;
mod escalation;
mod github;
mod known_issue;
mod model;
mod process;
mod router;
mod slash;
mod storage;

use std::{env, io, process::ExitCode};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    init_tracing();

    match cli::run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so hook stdout stays clean. `HOOKLINE_LOG` takes an
/// env-filter directive; `HOOKLINE_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("HOOKLINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = env::var("HOOKLINE_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .init();
    }
}
