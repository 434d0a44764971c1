//! Minimal DDP client for poking at a running server.
//!
//! Connects, subscribes to a publication, calls `hello`, answers keepalive
//! pings and prints every envelope it receives until interrupted.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Talk DDP to a server over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "ddp_client", version, about)]
struct Cli {
    /// Server address (host:port)
    #[arg(long, env = "DDP_ADDR", default_value = "localhost:3000")]
    addr: String,

    /// WebSocket endpoint path
    #[arg(long, default_value = "/websocket")]
    path: String,

    /// Publication to subscribe to once connected
    #[arg(long, default_value = "mysubscription")]
    subscribe: String,

    /// Name passed to the `hello` method
    #[arg(long, default_value = "Miguel")]
    name: String,

    /// Protocol version to request
    #[arg(long = "ddp-version", default_value = "1")]
    ddp_version: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddp_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("ws://{}{}", cli.addr, cli.path);
    info!("connecting to {}", url);
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut tx, mut rx) = ws.split();

    let connect = json!({
        "msg": "connect",
        "version": cli.ddp_version,
        "support": ["1", "pre2", "pre1"],
    });
    tx.send(Message::Text(connect.to_string().into())).await?;

    let mut next_id = 0u32;
    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                let _ = tx.send(Message::Close(None)).await;
                return Ok(());
            }
            message = rx.next() => message,
        };
        let Some(message) = message else {
            info!("server closed the connection");
            return Ok(());
        };

        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Close(_) => {
                info!("server closed the connection");
                return Ok(());
            }
            _ => continue,
        };
        println!("recv: {}", text);

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("unparsable envelope: {}", e);
                continue;
            }
        };

        match envelope["msg"].as_str() {
            Some("ping") => {
                let mut pong = json!({"msg": "pong"});
                if let Some(id) = envelope.get("id") {
                    pong["id"] = id.clone();
                }
                tx.send(Message::Text(pong.to_string().into())).await?;
            }
            Some("connected") => {
                next_id += 1;
                let sub = json!({"msg": "sub", "id": next_id.to_string(), "name": cli.subscribe});
                tx.send(Message::Text(sub.to_string().into())).await?;

                next_id += 1;
                let method = json!({
                    "msg": "method",
                    "id": next_id.to_string(),
                    "method": "hello",
                    "params": [cli.name],
                });
                tx.send(Message::Text(method.to_string().into())).await?;
            }
            Some("failed") => {
                warn!("server rejected version, proposes {}", envelope["version"]);
                return Ok(());
            }
            _ => {}
        }
    }
}
