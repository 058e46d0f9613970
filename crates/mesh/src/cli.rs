//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// bucket-mesh: keeps a set of buckets replicating to each other.
#[derive(Parser)]
#[command(name = "bucket-mesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Handle a lifecycle event and print the protocol response.
    Handle(HandleArgs),
    /// Print the rules each bucket of a mesh must carry.
    Compile(EventArgs),
    /// Print the IAM policies a set of meshes needs.
    Permissions(PermissionsArgs),
    /// Print version information.
    Version,
}

/// Where to read an event from.
#[derive(Args)]
pub struct EventArgs {
    /// Path to a JSON lifecycle event, or `-` for stdin.
    #[arg(short, long, default_value = "-")]
    pub event: String,
}

/// Arguments for the handle command.
#[derive(Args)]
pub struct HandleArgs {
    /// Event source.
    #[command(flatten)]
    pub event: EventArgs,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Compute and report changes without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum number of buckets processed at once.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Custom S3 endpoint URL.
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// Deployment scope; defaults to the event's stack id.
    #[arg(long)]
    pub scope: Option<String>,

    /// Pretty-print the response.
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments for the permissions command.
#[derive(Args)]
pub struct PermissionsArgs {
    /// JSON lifecycle events, one per mesh; `-` reads stdin.
    #[arg(short, long = "event", required = true)]
    pub events: Vec<String>,
}
