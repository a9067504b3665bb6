//! Line-based TCP Chat Server - Entry Point
//!
//! Starts the chat server, prints its event log, and broadcasts every
//! line typed on stdin as an operator notice. Ctrl-C stops it.

use std::net::SocketAddr;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcp_chat::config::DEFAULT_MAX_LINE_LENGTH;
use tcp_chat::{ChatServer, ServerConfig, ServerEvent};

#[derive(Debug, Parser)]
#[command(name = "tcp_chat", about = "Line-based multi-user chat server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:6010")]
    bind: SocketAddr,

    /// Longest accepted line in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_chat=info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.bind,
        max_line_length: args.max_line_length,
    };

    let (mut server, mut events) = ChatServer::new(config);
    let addr = server.start().await?;
    println!("Monitoring connections on {}...", addr);

    tokio::spawn(async move {
        while let Some(ServerEvent::Log(line)) = events.recv().await {
            println!("{}", line);
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = server.send_notice(&line).await {
                        error!("Failed to send notice: {}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    server.stop().await;
    Ok(())
}
