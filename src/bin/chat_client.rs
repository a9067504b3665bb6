//! Line-based TCP Chat Client - Entry Point
//!
//! Connects as the given username, prints every received line, and sends
//! each line typed on stdin. End of input leaves the chat.

use std::net::SocketAddr;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;
use tracing_subscriber::EnvFilter;

use tcp_chat::config::DEFAULT_MAX_LINE_LENGTH;
use tcp_chat::{ChatClient, ClientConfig, ClientError, ClientEvent};

#[derive(Debug, Parser)]
#[command(name = "chat_client", about = "Line-based chat client")]
struct Args {
    /// Name to join the chat with
    username: String,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:6010")]
    server: SocketAddr,

    /// Longest accepted line in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_chat=warn")),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        max_line_length: args.max_line_length,
    };

    let (mut client, mut events) = ChatClient::new(config);

    if let Err(e) = client.connect(&args.username, args.server).await {
        if let ClientError::Rejected(reason) = &e {
            eprintln!("{}", reason);
        }
        return Err(e.into());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::MessageReceived(line)) => println!("{}", line),
                Some(ClientEvent::Disconnected) | None => {
                    println!("Disconnected from server.");
                    break;
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = client.send_message(&line) {
                        error!("Failed to send: {}", e);
                    }
                }
                Ok(None) => {
                    let _ = client.leave();
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    client.close();
                    break;
                }
            },
        }
    }

    client.wait_closed().await;
    Ok(())
}
