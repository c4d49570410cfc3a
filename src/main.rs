use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::EnvFilter;

use treesync::cli::{InspectOpts, ShareOpts, SyncOpts};
use treesync::server::ShareOptions;
use treesync::{paths, Client, Server};

#[derive(Parser)]
#[command(
    name = "treesync",
    version,
    about = "Share a directory over TCP and mirror it live on other machines"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Share a local directory with connecting clients
    Share(ShareOpts),
    /// Mirror a remote share into a local directory and keep it current
    Sync(SyncOpts),
    /// Print the structure of a remote share
    Inspect(InspectOpts),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    match args.command {
        Command::Share(opts) => rt.block_on(run_share(opts)),
        Command::Sync(opts) => rt.block_on(run_sync(opts)),
        Command::Inspect(opts) => rt.block_on(run_inspect(opts)),
    }
}

async fn run_share(opts: ShareOpts) -> Result<()> {
    let ignore = opts
        .ignore
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid ignore pattern")?;
    let server = Server::bind(ShareOptions {
        bind: opts.bind,
        dir: opts.dir,
        ignore,
    })
    .await?;
    println!("Sharing on {}", server.local_addr()?);
    server.run().await
}

async fn run_sync(opts: SyncOpts) -> Result<()> {
    let mut client = Client::connect(&opts.url).await?;
    client.sync(&opts.dir, opts.remote_dir.as_deref()).await?;
    println!("Mirror of {} ready in {}", opts.url, opts.dir.display());
    client.run_mirror().await
}

async fn run_inspect(opts: InspectOpts) -> Result<()> {
    let mut client = Client::connect(&opts.url).await?;
    let listing = client.inspect().await?;
    print!("{}", paths::draw_tree(&opts.url, &listing));
    client.close().await
}
