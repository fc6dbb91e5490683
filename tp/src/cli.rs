//! CLI argument parsing for taskpace

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tp")]
#[command(author, version, about = "Recurring timers and bounded fan-out", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a recurring timer for a while and report what it did
    Tick {
        /// Delay before the first tick in ms (-1 for never)
        #[arg(long, allow_negative_numbers = true)]
        due_ms: Option<i64>,

        /// Delay between ticks in ms (-1 for a single tick)
        #[arg(long, allow_negative_numbers = true)]
        period_ms: Option<i64>,

        /// Let ticks overlap instead of waiting for each one
        #[arg(long)]
        overlap: bool,

        /// Simulated work per tick in ms
        #[arg(short, long, default_value = "0")]
        work_ms: u64,

        /// How long to keep the timer running in ms
        #[arg(short, long, default_value = "2000")]
        run_for_ms: u64,

        /// Fail on this tick number (1-based)
        #[arg(long)]
        fail_on: Option<u64>,
    },

    /// Double a range of numbers with bounded parallelism
    Fanout {
        /// Number of items
        #[arg(short, long, default_value = "10")]
        items: u64,

        /// Max items in flight (unbounded when absent)
        #[arg(short, long)]
        max_concurrency: Option<usize>,

        /// Simulated work per item in ms
        #[arg(short, long, default_value = "100")]
        delay_ms: u64,
    },
}
