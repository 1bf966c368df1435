use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use retcon::{config, daemon, telemetry};

#[derive(Parser, Debug)]
#[command(name = "retcond", version, about = "Retcon reconciliation daemon")]
struct Cli {
    /// Config file path (RETCON_CONFIG overrides).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let config = match config::config_path(cli.config.as_deref())
        .and_then(|path| config::load(&path))
    {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("config error: {err}");
            return ExitCode::from(1);
        }
    };

    match daemon::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
