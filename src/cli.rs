//! Argument structs for the treesync subcommands.

use std::path::PathBuf;

use clap::Parser;

#[derive(Clone, Debug, Parser)]
pub struct ShareOpts {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Directory to share
    #[arg(short = 'd', long, default_value = ".")]
    pub dir: PathBuf,

    /// Regex of relative paths to leave out of the share
    #[arg(short = 'i', long)]
    pub ignore: Option<String>,
}

#[derive(Clone, Debug, Parser)]
pub struct SyncOpts {
    /// Server url (tcp://host:port)
    pub url: String,

    /// Local directory to mirror into (wiped and rebuilt)
    #[arg(short = 'd', long)]
    pub dir: PathBuf,

    /// Remote subdirectory to mirror instead of the whole share
    #[arg(long)]
    pub remote_dir: Option<String>,
}

#[derive(Clone, Debug, Parser)]
pub struct InspectOpts {
    /// Server url (tcp://host:port)
    pub url: String,
}
