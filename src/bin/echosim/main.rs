use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use create_config::create_config;
use run::run;

mod create_config;
mod run;

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the default scenario config file
    GenConfig {
        /// File to write the scenario config to
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run a scenario and print what every router and server saw
    Run {
        /// Scenario config file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// File to write the full report, including every burst, to (JSON)
        #[arg(short, long)]
        trace: Option<PathBuf>,

        /// Log every component's activity to stdout
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Send periodic bursts of echo requests from routers to servers in virtual time.", long_about = None)]
struct Args {
    #[command(subcommand)]
    pub command: Command,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::GenConfig { output } => create_config(&output),
        Command::Run {
            config,
            trace,
            verbose,
        } => run(&config, trace.as_deref(), verbose),
    }
}
