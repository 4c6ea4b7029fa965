//! CLI argument definitions using clap
//!
//! Commands:
//! - tablesnap serve
//! - tablesnap take <TABLE>...
//! - tablesnap diff <TABLE> [--output <file>]
//! - tablesnap tables [--kind <kind>]...
//! - tablesnap metadata [--output <file>]
//! - tablesnap versions <TABLE>
//! - tablesnap prune <TABLE> --keep <n>
//! - tablesnap clear

use crate::source::TableKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// TableSnap - table snapshots and row diffs for databases without an audit log
#[derive(Parser, Debug)]
#[command(name = "tablesnap")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API
    Serve,

    /// Capture tables under one new snapshot version
    Take {
        #[arg(required = true)]
        tables: Vec<String>,
    },

    /// Diff the two newest snapshots of a table
    Diff {
        table: String,
        /// Write the diff to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List candidate tables of the source
    Tables {
        /// table, view, materialized_view, foreign_table, system_table
        #[arg(long = "kind")]
        kinds: Vec<TableKind>,
    },

    /// Introspect every candidate table and write the table definitions
    Metadata {
        #[arg(long, short, default_value = "tabledefs.json")]
        output: PathBuf,
    },

    /// Show the version ledger of a table
    Versions { table: String },

    /// Drop snapshot tables older than the newest `keep` versions
    Prune {
        table: String,
        #[arg(long, default_value_t = 2)]
        keep: usize,
    },

    /// Drop every snapshot and reset the version ledger
    Clear,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
