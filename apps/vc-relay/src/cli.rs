use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "vc-relay")]
#[command(about = "Proximity voice chat relay server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay as a browser client and dump its frames
    Debug {
        /// Relay server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Open a new room as its owner and print the assigned room code
    Host,

    /// Join an existing room with an identity code
    Join {
        /// Room code shown to the host
        #[arg(short, long)]
        room: String,

        /// Identity code delivered in-game
        #[arg(short, long)]
        code: String,
    },
}

pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let ws_url = match &command {
        DebugCommands::Host => format!("{}/frontendws", url),
        DebugCommands::Join { room, code } => {
            format!("{}/frontendws?roomId={}&playerCode={}", url, room, code)
        }
    };
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    println!("Connected. Printing relay frames; Ctrl-C to stop.");
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", text),
            },
            Message::Close(frame) => {
                match frame {
                    Some(frame) => {
                        println!("Connection closed: {} {}", u16::from(frame.code), frame.reason)
                    }
                    None => println!("Connection closed"),
                }
                break;
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
