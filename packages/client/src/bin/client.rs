//! Interactive chat client for one marketplace chat room.
//!
//! Connects to the broker with a bearer token, opens the room and streams its
//! messages. Type to send; `/image <path>` sends an image, `/leave` leaves the
//! room, `/quit` closes it. The connection is re-established automatically.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin souk-client -- --token alice-token --user-id 7 --room room-1
//! SOUK_TOKEN=bob-token SOUK_USER_ID=8 cargo run --bin souk-client -- -r room-1
//! ```

use std::sync::Arc;

use clap::Parser;

use souk_client::{ChatClient, ChatConfig, ChatIdentity, RoomId, SharedCredentials, cli::run_room};
use souk_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "souk-client")]
#[command(about = "Real-time chat client for Souk marketplace rooms", long_about = None)]
struct Args {
    /// Room to open
    #[arg(short = 'r', long)]
    room: String,

    /// Bearer token presented to the broker and the chat API
    #[arg(short = 't', long, env = "SOUK_TOKEN")]
    token: Option<String>,

    /// Id of the signed-in user (sender id of outgoing messages)
    #[arg(short = 'u', long, env = "SOUK_USER_ID")]
    user_id: i64,

    /// WebSocket URL of the broker
    #[arg(long, env = "SOUK_BROKER_URL", default_value = "ws://127.0.0.1:8080/ws")]
    broker_url: String,

    /// Base URL of the chat REST API
    #[arg(long, env = "SOUK_API_URL", default_value = "http://127.0.0.1:8080")]
    api_url: String,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(&[env!("CARGO_BIN_NAME"), "souk_client"], "info");

    let args = Args::parse();

    let credentials = SharedCredentials::new(args.token);
    let client = ChatClient::over_websocket(
        ChatConfig::new(args.broker_url, args.api_url),
        Arc::new(credentials.clone()),
        ChatIdentity {
            user_id: args.user_id,
        },
    );

    if let Err(e) = client.start().await {
        tracing::error!("Failed to start chat: {}", e);
        std::process::exit(1);
    }

    let result = run_room(&client, RoomId::new(args.room), &credentials).await;
    client.shutdown().await;

    if let Err(e) = result {
        tracing::error!("Chat error: {}", e);
        if e.is_fatal() {
            eprintln!("Your session has expired, please log in again.");
        }
        std::process::exit(1);
    }
}
