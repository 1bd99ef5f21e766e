use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerchat::config::{get_config_path, Config};
use peerchat::webrtc::Session;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerchat")]
#[command(about = "Peer-to-peer chat over WebRTC data channels", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.peerchat/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the session on a signaling relay and chat from stdin
    Join {
        /// Signaling relay WebSocket URL (overrides the config file)
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peerchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(get_config_path);
    let loaded = match cli.config {
        Some(ref path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config =
        loaded.with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Join { url } => {
            if let Some(url) = url {
                config.signaling.url = url;
            }
            join(config).await?;
        }
        Commands::Config => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn join(config: Config) -> Result<()> {
    println!("Joining session on {}", config.signaling.url);
    println!("Type a message and press enter; Ctrl-D or Ctrl-C to leave.");

    let mut session = Session::mount(&config).context("Failed to mount session")?;
    let mut messages = session
        .messages()
        .context("Session inbox already taken")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = session.send_message(text).await {
                        println!("! not sent: {}", e);
                    }
                }
                None => break,
            },
            Some(message) = messages.recv() => {
                println!("[{} {}] {}", message.role, message.from, message.text);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.unmount().await;
    println!("Left session");
    Ok(())
}
