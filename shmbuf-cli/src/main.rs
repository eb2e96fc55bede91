// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shmbuf CLI
//!
//! Command-line access to a System V backed shared memory buffer.

use clap::{Parser, Subcommand};

mod commands;

/// Shmbuf - single-buffer shared memory transport
#[derive(Parser)]
#[command(name = "shmbuf")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shmbuf.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Open as master (create the segment) regardless of the configured role
    #[arg(short, long)]
    pub master: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a message into the buffer
    Write {
        /// Message text
        message: String,

        /// Only write if the previous message has been read
        #[arg(long)]
        if_read: bool,
    },

    /// Read the current message
    Read {
        /// Leave the was-read flag untouched
        #[arg(short, long)]
        peek: bool,

        /// Wait up to this many seconds for new data (negative waits forever)
        #[arg(short, long, allow_hyphen_values = true)]
        blocking: Option<f64>,
    },

    /// Report whether the current message has been read
    Check,

    /// Show the configuration and segment layout
    Info,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let target = commands::Target {
        config: &cli.config,
        master: cli.master,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Write { message, if_read } => commands::write::execute(&target, &message, if_read),
        Commands::Read { peek, blocking } => commands::read::execute(&target, peek, blocking),
        Commands::Check => commands::check::execute(&target),
        Commands::Info => commands::info::execute(&target),
    }
}
