//! Development message broker and chat REST stand-in.
//!
//! Routes room subscriptions and published chat messages between clients over
//! WebSocket, and serves room snapshots, leave-room and image uploads from
//! memory.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin souk-broker
//! cargo run --bin souk-broker -- --port 3000 --token alice-token --token bob-token
//! ```

use clap::Parser;

use souk_broker::{AppState, Server};
use souk_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "souk-broker")]
#[command(about = "Development message broker for Souk chat rooms", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// Base URL put into upload references (defaults to http://{host}:{port})
    #[arg(long)]
    public_url: Option<String>,

    /// Accepted bearer token (repeatable); none accepts any non-empty token
    #[arg(short = 't', long = "token")]
    tokens: Vec<String>,

    /// Seed a room as `id=title` (repeatable)
    #[arg(long = "room")]
    rooms: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(&[env!("CARGO_BIN_NAME"), "souk_broker", "tower_http"], "debug");

    let args = Args::parse();

    if args.tokens.is_empty() {
        tracing::warn!("No --token given, accepting any non-empty token");
    }
    let public_url = args
        .public_url
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));
    let state = AppState::new(args.tokens, public_url);

    for room in &args.rooms {
        match room.split_once('=') {
            Some((id, title)) => {
                state.create_room(id, title).await;
                tracing::info!("Room '{}' created!", id);
            }
            None => tracing::warn!("Ignoring --room '{}', expected id=title", room),
        }
    }

    let server = Server::new(state);
    if let Err(e) = server.run(args.host, args.port).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
