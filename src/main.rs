//! tcplink: async TCP client and server
//!
//! A small command-line front end over the tcplink transport. `serve` runs a
//! multi-client server that logs traffic (and optionally echoes it back);
//! `connect` opens a client, sends each stdin line, and prints what arrives.
//!
//! Usage:
//!   tcplink serve                                # 127.0.0.1:9000, backlog 5
//!   tcplink serve --port 8080 --echo             # Echo everything back
//!   tcplink connect --port 8080                  # Interactive client
//!   tcplink --config tcplink.json connect --auto-reconnect

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcplink_core::{LinkConfig, LinkEvent};
use tcplink_transport::{TcpClient, TcpServer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tcplink", about = "Async TCP client and server")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.tcplink/logs/tcplink.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    /// JSON file with `client` and `server` settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a TCP server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,

        /// Port to listen on (0 for OS-assigned)
        #[arg(long, default_value = "9000")]
        port: u16,

        /// Listen backlog
        #[arg(long, default_value = "5")]
        backlog: u32,

        /// Send every received chunk back to its sender
        #[arg(long)]
        echo: bool,
    },
    /// Connect to a TCP server and exchange lines over stdin/stdout
    Connect {
        /// Server host name or IP address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(long, default_value = "9000")]
        port: u16,

        /// Reconnect automatically when the connection drops
        #[arg(long)]
        auto_reconnect: bool,
    },
}

fn init_logging(verbose: bool, log_file: Option<&str>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Some(log_file_arg) = log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(home).join(".tcplink/logs/tcplink.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        // Logs go to stderr so `connect` output on stdout stays clean
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => LinkConfig::from_json_file(path)
            .with_context(|| format!("Invalid config {}", path.display()))?,
        None => LinkConfig::default(),
    };

    match cli.command {
        Command::Serve {
            hostname,
            port,
            backlog,
            echo,
        } => serve(config, &hostname, port, backlog, echo).await,
        Command::Connect {
            host,
            port,
            auto_reconnect,
        } => connect(config, &host, port, auto_reconnect).await,
    }
}

async fn serve(config: LinkConfig, hostname: &str, port: u16, backlog: u32, echo: bool) -> Result<()> {
    let server = TcpServer::new(config.server);
    let mut events = server.subscribe();

    server
        .start(hostname, port, backlog)
        .await
        .with_context(|| format!("Failed to start server on {hostname}:{port}"))?;

    let bound = server
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| format!("{hostname}:{port}"));
    println!("  Listening on {bound}{}", if echo { " (echo)" } else { "" });
    println!("  Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::DataReceived(data)) => {
                    info!("{} bytes from {}", data.bytes.len(), data.id);
                    if echo {
                        if let Err(e) = server.send(&data.id, &data.bytes).await {
                            warn!("Echo to {} failed: {e}", data.id);
                        }
                    }
                }
                Ok(LinkEvent::Error(e)) => warn!("Server error: {}", e.message),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Event stream lagged, skipped {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("  Shutting down...");
    server.stop().await?;
    println!("  Server stopped.");
    Ok(())
}

async fn connect(config: LinkConfig, host: &str, port: u16, auto_reconnect: bool) -> Result<()> {
    let client_config = if auto_reconnect {
        config.client.auto_reconnect(true)
    } else {
        config.client
    };
    let client = TcpClient::new(client_config);
    let mut events = client.subscribe();

    client
        .connect(host, port)
        .await
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(mut line)) => {
                    line.push('\n');
                    if let Err(e) = client.send(line.as_bytes()).await {
                        error!("Send failed: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(LinkEvent::DataReceived(data)) => {
                    stdout.write_all(&data.bytes).await?;
                    stdout.flush().await?;
                }
                Ok(LinkEvent::Disconnected(e)) => {
                    warn!("Disconnected: {}", e.reason);
                    if !client.auto_reconnect() {
                        break;
                    }
                }
                Ok(LinkEvent::Connected(e)) => info!("Connected to {}", e.remote_address),
                Ok(LinkEvent::Error(e)) => warn!("{}", e.message),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Event stream lagged, skipped {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await?;
    Ok(())
}
