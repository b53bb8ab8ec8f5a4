//! Hanash CLI - command-line driver for the download engine

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Hanash - resumable multi-connection download manager
#[derive(Parser)]
#[command(name = "hanash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory holding the registry and settings
    #[arg(long, env = "HANASH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a URL and show the resource metadata
    Probe {
        /// URL to probe
        url: String,
    },

    /// Add a download and run it to completion
    Add {
        /// URL to download
        url: String,

        /// Destination folder (defaults to the configured folder)
        #[arg(short, long)]
        folder: Option<PathBuf>,

        /// Replace an existing file with the same name
        #[arg(long)]
        overwrite: bool,

        /// Register the download without starting it
        #[arg(long)]
        no_start: bool,
    },

    /// List the download registry
    List,

    /// Pause a running download
    Pause {
        /// Download id
        id: usize,
    },

    /// Resume a cancelled or paused download
    Resume {
        /// Download id
        id: usize,
    },

    /// Cancel a download
    Cancel {
        /// Download id
        id: usize,
    },

    /// Delete a registry item and its temp files
    Delete {
        /// Download id
        id: usize,
    },

    /// Resume every cancelled download
    ResumeAll,

    /// Cancel every pending and active download
    StopAll,

    /// Set the global speed limit in KB/s (0 disables)
    Limit {
        /// Limit in KB/s
        kb_per_sec: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hanash_core=debug,hanash=debug"
    } else {
        "hanash_core=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hanash")
    });
    let core = hanash_core::HanashCore::new(data_dir).await?;

    match cli.command {
        Commands::Probe { url } => commands::probe(&core, &url).await?,
        Commands::Add {
            url,
            folder,
            overwrite,
            no_start,
        } => commands::add(&core, &url, folder, overwrite, no_start).await?,
        Commands::List => commands::list(&core).await?,
        Commands::Pause { id } => commands::pause(&core, id).await?,
        Commands::Resume { id } => commands::resume(&core, id).await?,
        Commands::Cancel { id } => commands::cancel(&core, id).await?,
        Commands::Delete { id } => commands::delete(&core, id).await?,
        Commands::ResumeAll => commands::resume_all(&core).await?,
        Commands::StopAll => commands::stop_all(&core).await?,
        Commands::Limit { kb_per_sec } => commands::limit(&core, kb_per_sec).await?,
    }

    core.shutdown().await?;
    Ok(())
}
