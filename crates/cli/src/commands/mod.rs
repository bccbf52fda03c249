// CLI subcommand dispatch.

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};

use workshop_sync_client::config::SyncConfig;
use workshop_sync_client::store::FileSessionStore;

use crate::output::{self, OutputFormat};

pub mod presence;
pub mod token;
pub mod watch;

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Force JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Read settings from this file instead of ~/.workshop-sync/config.toml.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `server_url` from the config file.
    #[arg(long, global = true, value_name = "URL")]
    pub server: Option<String>,

    /// Keep the session in this file instead of ~/.workshop-sync/session.json.
    #[arg(long, global = true, value_name = "PATH")]
    pub session_file: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn format(&self) -> OutputFormat {
        OutputFormat::detect(self.json)
    }

    pub fn load_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load_from(path)
                .with_context(|| format!("failed to load config `{}`", path.display()))?,
            None => SyncConfig::load(),
        };
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        Ok(config)
    }

    pub fn session_store(&self) -> anyhow::Result<FileSessionStore> {
        match &self.session_file {
            Some(path) => Ok(FileSessionStore::new(path)),
            None => FileSessionStore::global()
                .context("cannot locate a home directory; pass --session-file"),
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Stay connected and print channel events and presence changes
    Watch(watch::WatchArgs),
    /// Pull the online roster once and print it
    Presence(presence::PresenceArgs),
    /// Inspect or replace the stored access token
    Token(token::TokenArgs),
}

pub fn run(global: &GlobalArgs, cmd: Command) -> anyhow::Result<()> {
    let format = global.format();
    let result = match cmd {
        Command::Watch(args) => watch::run(global, format, args),
        Command::Presence(args) => presence::run(global, format, args),
        Command::Token(args) => token::run(global, format, args),
    };
    if let Err(error) = &result {
        output::print_anyhow_error(format, error);
    }
    result
}

/// Drive `future` on a fresh runtime. Commands are synchronous at the edge.
pub fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    Ok(runtime.block_on(future))
}
