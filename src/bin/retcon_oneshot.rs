use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use retcon::model::{ChangeNotification, EntityName, SourceName};
use retcon::{config, daemon, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "retcon-oneshot",
    version,
    about = "Run one Process cycle synchronously"
)]
struct Cli {
    /// Config file path (RETCON_CONFIG overrides).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    entity: String,
    source: String,
    foreign_id: String,
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

    let notification = match notification_from(&cli) {
        Ok(notification) => notification,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::from(1);
        }
    };

    match daemon::run_once(&config, notification) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn notification_from(cli: &Cli) -> Result<ChangeNotification, retcon::model::NameError> {
    Ok(ChangeNotification {
        entity: EntityName::new(&cli.entity)?,
        source: SourceName::new(&cli.source)?,
        foreign_id: cli.foreign_id.clone(),
    })
}
