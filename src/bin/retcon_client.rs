use std::process::ExitCode;

use clap::{Parser, Subcommand};

use retcon::client::{Client, ClientError};
use retcon::config::DEFAULT_ADDRESS;
use retcon::model::{DiffId, DiffOp, DiffOpId};
use retcon::telemetry;

#[derive(Parser, Debug)]
#[command(name = "retcon-client", version, about = "Retcon request/reply client")]
struct Cli {
    /// Server address.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Post a change notification for one per-source copy.
    Notify {
        entity: String,
        source: String,
        foreign_id: String,
    },
    /// List parked conflicts.
    ListConflicts,
    /// Accept a subset of a conflict's operations.
    Resolve {
        diff_id: i64,
        #[arg(required = true)]
        op_ids: Vec<i64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ClientError::Server(code)) => {
            eprintln!("server error: {} (code {code})", ClientError::describe(code));
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let mut client = Client::connect(&cli.address)?;
    match cli.command {
        Command::Notify {
            entity,
            source,
            foreign_id,
        } => {
            client.notify(&entity, &source, &foreign_id)?;
            println!("notified {entity}/{source}/{foreign_id}");
        }
        Command::ListConflicts => {
            let entries = client.list_conflicts()?;
            if entries.is_empty() {
                println!("no conflicts");
            }
            for entry in entries {
                println!("conflict {}:", entry.diff_id);
                for (path, value) in entry.initial.iter() {
                    println!("  initial {path} = {value:?}");
                }
                for (op_id, op) in &entry.conflicts {
                    println!("  op {op_id}: {}", render_op(op));
                }
            }
        }
        Command::Resolve { diff_id, op_ids } => {
            let ops: Vec<DiffOpId> = op_ids.into_iter().map(DiffOpId).collect();
            client.resolve(DiffId(diff_id), &ops)?;
            println!("resolution queued for diff {diff_id}");
        }
    }
    Ok(())
}

fn render_op(op: &DiffOp<()>) -> String {
    match op {
        DiffOp::Insert { path, value, .. } => format!("insert {path} = {value:?}"),
        DiffOp::Delete { path, .. } => format!("delete {path}"),
    }
}
