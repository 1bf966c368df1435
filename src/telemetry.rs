//! Logging setup.
//!
//! All logging goes to stderr. The default level comes from repeated
//! `--verbose` flags; the `LOG` env var takes precedence.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
