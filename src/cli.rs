use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ember - a local agent that manages its own prompt, rules and binary.
#[derive(Parser, Debug)]
#[command(name = "ember", version, about, long_about = None)]
pub struct Cli {
    /// Config file (falls back to EMBER_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat on stdin (the default)
    Chat {
        /// Continue an existing thread
        #[arg(short, long)]
        thread: Option<String>,
    },

    /// Send one message, print the reply and exit
    Ask {
        message: String,
        #[arg(short, long)]
        thread: Option<String>,
    },

    /// Inspect stored conversations
    #[command(subcommand)]
    Threads(ThreadCommands),

    /// Inspect or change the agent's self-state
    #[command(subcommand)]
    State(StateCommands),

    /// Write a config file with an interactive wizard
    Init {
        /// Destination (defaults to config/default.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ThreadCommands {
    /// Threads, most recently updated first
    List,
    /// Print a thread's full log
    Show { id: String },
    /// Keyword search over a thread's full log
    Search {
        id: String,
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete a thread's log and metadata
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Current version, parameters, rules and prompt
    Show,
    /// Snapshots, oldest first
    History,
    /// Restore an earlier version (0 is the factory state)
    Rollback {
        version: u64,
        #[arg(short, long, default_value = "manual rollback")]
        reason: String,
    },
    /// Score the current self-state with the probe battery
    Benchmark,
}
