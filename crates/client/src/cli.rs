use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "pywren",
    version,
    about = "Serverless function-invocation engine client"
)]
pub struct Cli {
    /// Configuration file to use instead of the default lookup order.
    #[arg(short = 'c', long, env = "PYWREN_CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the configuration and print the effective settings.
    Config(ConfigArgs),
    /// Drive the engine against an in-process loopback backend.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Dump the full resolved configuration instead of a summary.
    #[arg(long)]
    pub full: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of calls in the simulated job.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub calls: u32,

    /// Outstanding-activation cap of the invoker.
    #[arg(short = 'w', long, default_value_t = 4)]
    pub workers: u32,

    /// Simulated remote execution time per call, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub call_ms: u64,

    /// Transiently reject the first dispatch of every k-th call (0 disables).
    #[arg(long, default_value_t = 0)]
    pub flaky_every: u32,

    /// Number of simulated regions.
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=16)
    )]
    pub regions: u32,
}
