//! Dojo Bridge CLI
//!
//! Opens shells, runs commands, moves files and mounts the remote project
//! over a single SSH connection.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use dojo_bridge::proxy::{InteractiveProxy, StdTerminal};
use dojo_bridge::transport::{SessionPool, SshConnector};
use dojo_bridge::vfs::{self, MountStatus};
use dojo_bridge::{BridgeConfig, RemoteRunner, RunRequest, Transfer};

/// Dojo Bridge - work on a remote host as though it were local
#[derive(Parser, Debug)]
#[command(name = "dojo-bridge")]
#[command(about = "Interactive sessions, file transfer and mounts for a remote host")]
struct Args {
    /// Config file (defaults to $DOJO_CONFIG or ~/.config/dojo-bridge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remote host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Remote SSH port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Remote user
    #[arg(long, global = true)]
    user: Option<String>,

    /// Private key for authentication
    #[arg(long, global = true)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open an interactive shell
    Shell,
    /// Run a single command
    Run {
        /// Command line executed by the remote shell
        command: String,
        /// Print output only after the command finishes
        #[arg(long)]
        capture: bool,
    },
    /// Download a remote file
    Get {
        /// Remote file
        remote: String,
        /// Local file or directory
        local: Option<PathBuf>,
    },
    /// Upload a local file
    Put {
        /// Local file
        local: PathBuf,
        /// Remote file or directory
        remote: Option<String>,
    },
    /// Print a remote file
    Cat {
        /// Remote file
        path: String,
    },
    /// List a remote directory
    Ls {
        /// Remote directory
        #[arg(default_value = ".")]
        path: String,
    },
    /// Total size of a remote file or directory in bytes
    Size {
        /// Remote path
        path: String,
    },
    /// Remove a remote file or directory tree
    Rm {
        /// Remote path
        path: String,
    },
    /// Create a remote directory and its parents
    Mkdir {
        /// Remote path
        path: String,
    },
    /// Mount the remote project locally until Ctrl+C or an external unmount
    Mount {
        /// Local mount point
        #[arg(long)]
        point: Option<PathBuf>,
    },
}

impl Args {
    fn load_config(&self) -> anyhow::Result<BridgeConfig> {
        let path = self.config.clone().unwrap_or_else(BridgeConfig::default_path);
        let mut config = BridgeConfig::load(&path)?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.username = user.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity_file = identity.clone();
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Logs go to stderr so they never mix with remote output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("dojo-bridge: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.load_config()?;
    let pool = Arc::new(SessionPool::new(SshConnector::new(config.clone())));
    let runner = RemoteRunner::new(pool.clone(), &config);

    let result = dispatch(&runner, &config, args.command).await;
    if let Err(e) = pool.close().await {
        tracing::debug!(error = %e, "failed to close connection");
    }
    result
}

async fn dispatch(runner: &RemoteRunner, config: &BridgeConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Shell => {
            let mut proxy = InteractiveProxy::new(StdTerminal::new());
            runner.run(&mut proxy, RunRequest::shell()).await?;
        }
        Command::Run { command, capture } => {
            let mut proxy = InteractiveProxy::new(StdTerminal::new());
            let mut request = RunRequest::command(command);
            if capture {
                request = request.capture();
            }
            if let Some(output) = runner.run(&mut proxy, request).await? {
                write_stdout(&output)?;
            }
        }
        Command::Get { remote, local } => {
            runner.transfer(Transfer::Download { remote, local }).await?;
        }
        Command::Put { local, remote } => {
            runner.transfer(Transfer::Upload { local, remote }).await?;
        }
        Command::Cat { path } => {
            let contents = runner.read_file(&path).await?;
            write_stdout(&contents)?;
        }
        Command::Ls { path } => {
            let fs = runner.filesystem().await?;
            let mut out = String::new();
            for name in fs.list(&path).await? {
                out.push_str(&name);
                out.push('\n');
            }
            write_stdout(out.as_bytes())?;
        }
        Command::Size { path } => {
            let fs = runner.filesystem().await?;
            let size = fs.size_of(&path).await?;
            if size < 0 {
                anyhow::bail!("{path}: no such file or directory");
            }
            println!("{size}");
        }
        Command::Rm { path } => {
            runner.filesystem().await?.remove_recursive(&path).await?;
        }
        Command::Mkdir { path } => {
            runner.filesystem().await?.makedirs(&path).await?;
        }
        Command::Mount { point } => {
            let point = point
                .map(|p| dojo_bridge::expand_home(&p))
                .unwrap_or_else(|| config.mount_path());
            let fs = Arc::new(runner.filesystem().await?);
            let handle = tokio::runtime::Handle::current();
            let target = point.clone();
            eprintln!("dojo-bridge: mounting at {}, press Ctrl+C to unmount", point.display());
            let status = tokio::task::spawn_blocking(move || vfs::mount(fs, &target, handle))
                .await
                .context("mount task failed")??;
            if status == MountStatus::AlreadyMounted {
                eprintln!("dojo-bridge: {} is not empty, assuming already mounted", point.display());
            }
        }
    }
    Ok(())
}

fn write_stdout(data: &[u8]) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(data)?;
    stdout.flush()?;
    Ok(())
}
