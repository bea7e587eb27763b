pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "listmill")]
#[command(about = "Fetch, cache, and refresh filter-list assets", long_about = None)]
pub struct Cli {
    /// Data directory (default: platform data dir)
    #[arg(short, long, global = true)]
    pub data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch an asset by key or URL, printing its content
    Get {
        /// Asset key, or a bare URL for a one-off fetch
        key: String,
        /// Skip writing the fetched content to the cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Refresh every known asset that is past its TTL
    Update {
        /// Delay between fetches in seconds
        #[arg(short, long)]
        delay_secs: Option<u64>,
    },
    /// List known assets and their cache state
    List,
    /// Register an asset source
    Register {
        /// Asset key
        key: String,
        /// Candidate URLs, in priority order
        #[arg(short, long, required = true)]
        url: Vec<String>,
        /// Treat the asset as a filter list (expands !#include)
        #[arg(long)]
        filters: bool,
    },
    /// Remove an asset and its cached content
    Unregister {
        /// Asset key
        key: String,
    },
    /// Mark cached assets obsolete so the next update refreshes them
    Dirty {
        /// Only keys matching this regular expression
        pattern: Option<String>,
    },
}
