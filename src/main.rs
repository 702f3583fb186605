//! # roomsync
//!
//! Presence, chat, and ephemeral file service for realtime room demos.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default settings (roomsync.db, port 3000)
//! roomsync
//!
//! # Custom database and port
//! roomsync --db rooms.db --port 8080
//!
//! # In-memory mode (for testing)
//! roomsync --memory
//! ```
//!
//! ## API Usage
//!
//! ```bash
//! # Mint an anonymous identity
//! curl -X POST http://localhost:3000/v1/auth/anonymous
//!
//! # Heartbeat into a room
//! curl -X PUT http://localhost:3000/v1/rooms/lobby/presence \
//!   -H "Content-Type: application/json" \
//!   -d '{"data": {"name": "Alice", "color": "#f43"}, "session_id": "demo-1"}'
//!
//! # Who is here?
//! curl http://localhost:3000/v1/rooms/lobby/presence
//! ```

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use roomsync::api::{create_router, AppState};
use roomsync::cleanup::CLEANUP_INTERVAL;
use roomsync::db::RoomStore;
use roomsync::identity::IdentityService;

/// CLI arguments
struct Args {
    /// Database file path
    db_path: String,
    /// Server port
    port: u16,
    /// Use in-memory database
    in_memory: bool,
    /// Host to bind to
    host: String,
    /// JWT secret for identity tokens
    jwt_secret: Option<String>,
    /// Directory for file blobs
    storage_path: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            db_path: "roomsync.db".to_string(),
            port: 3000,
            in_memory: false,
            host: "0.0.0.0".to_string(),
            jwt_secret: None,
            storage_path: None,
        }
    }
}

impl Args {
    fn from_env() -> Self {
        let mut args = Args::default();
        let env_args: Vec<String> = env::args().collect();
        let mut i = 1;

        while i < env_args.len() {
            match env_args[i].as_str() {
                "--db" | "-d" => {
                    if i + 1 < env_args.len() {
                        args.db_path = env_args[i + 1].clone();
                        i += 1;
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < env_args.len() {
                        args.port = env_args[i + 1].parse().unwrap_or(3000);
                        i += 1;
                    }
                }
                "--host" | "-h" => {
                    if i + 1 < env_args.len() {
                        args.host = env_args[i + 1].clone();
                        i += 1;
                    }
                }
                "--storage" | "-s" => {
                    if i + 1 < env_args.len() {
                        args.storage_path = Some(env_args[i + 1].clone());
                        i += 1;
                    }
                }
                "--memory" | "-m" => {
                    args.in_memory = true;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        // Environment variable overrides
        if let Ok(port) = env::var("ROOMSYNC_PORT") {
            args.port = port.parse().unwrap_or(args.port);
        }
        if let Ok(db) = env::var("ROOMSYNC_PATH") {
            args.db_path = db;
        }
        if let Ok(host) = env::var("ROOMSYNC_HOST") {
            args.host = host;
        }
        if env::var("ROOMSYNC_MEMORY").is_ok() {
            args.in_memory = true;
        }
        if let Ok(secret) = env::var("ROOMSYNC_JWT_SECRET") {
            args.jwt_secret = Some(secret);
        }
        if let Ok(storage) = env::var("ROOMSYNC_STORAGE_PATH") {
            args.storage_path = Some(storage);
        }

        args
    }
}

fn print_help() {
    println!(
        r#"
roomsync - presence, chat, and ephemeral file service

USAGE:
    roomsync [OPTIONS]

OPTIONS:
    -d, --db <PATH>       Database file path [default: roomsync.db]
    -p, --port <PORT>     Server port [default: 3000]
    -h, --host <HOST>     Host to bind to [default: 0.0.0.0]
    -s, --storage <PATH>  Directory for file blobs [default: ./roomsync_files]
    -m, --memory          Use in-memory database
        --help            Print this help message

ENVIRONMENT VARIABLES:
    ROOMSYNC_PORT          Server port
    ROOMSYNC_PATH          Database file path
    ROOMSYNC_HOST          Host to bind to
    ROOMSYNC_MEMORY        Set to use in-memory database
    ROOMSYNC_JWT_SECRET    Secret for identity tokens
    ROOMSYNC_STORAGE_PATH  Directory for file blobs

API ENDPOINTS:
    POST   /v1/auth/anonymous           Mint an anonymous identity
    POST   /v1/auth/refresh             Rotate a refresh token
    POST   /v1/auth/logout              Invalidate a refresh token
    GET    /v1/auth/me                  Current user
    PUT    /v1/auth/profile             Update display name/image
    GET    /v1/users/:id                Public profile
    PUT    /v1/rooms/:room/presence     Heartbeat
    GET    /v1/rooms/:room/presence     Active entries
    DELETE /v1/rooms/:room/presence     Leave
    POST   /v1/rooms/:room/messages     Send a message
    GET    /v1/rooms/:room/messages     Room messages
    DELETE /v1/messages/:id             Delete own message
    POST   /v1/files                    Upload a file (multipart)
    GET    /v1/files                    Own files
    GET    /v1/files/:sid/content       Download
    DELETE /v1/files/:id                Delete own file
    GET    /v1/rooms/:room/stream       SSE change stream
    POST   /v1/admin/cleanup            Run a sweep now
    GET    /health                      Health check
"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    // Parse arguments
    let args = Args::from_env();

    // Initialize database
    let store = if args.in_memory {
        info!("Using in-memory database");
        Arc::new(RoomStore::in_memory().await?)
    } else {
        info!("Using database file: {}", args.db_path);
        Arc::new(RoomStore::open(&args.db_path).await?)
    };

    // Initialize JWT secret (use provided or generate new)
    let jwt_secret = args.jwt_secret.map(|s| s.into_bytes()).unwrap_or_else(|| {
        info!("Generating random JWT secret (set ROOMSYNC_JWT_SECRET for persistence)");
        IdentityService::generate_secret()
    });

    // Create application state
    let storage_path = args.storage_path.map(PathBuf::from);
    let state = AppState::new(Arc::clone(&store), jwt_secret, storage_path);

    // Spawn the periodic expiry sweep
    state.cleanup.clone().spawn(CLEANUP_INTERVAL);

    // Build router
    let app = create_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("Invalid address");

    info!("roomsync listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C signal handler");
        })
        .await?;

    Ok(())
}
