//! opdispatch CLI: the `opdispatch` command.

mod cli;
mod commands;
mod support;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("OPDISPATCH_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keys { config, json } => commands::keys::run(config, json),

        Commands::Schema { text, json } => commands::schema::run(text, json),

        Commands::Ops { json } => commands::ops::run(json),

        Commands::Explain {
            op,
            operand,
            mode,
            run,
            config,
            json,
        } => commands::explain::run(op, operand, mode, run, config, json),
    }
}
