//! crashpoint server binary.
//!
//! Thin transport glue around the engine crate: load config, seed the demo
//! ledger, start the registry, and expose one WebSocket endpoint per game
//! room. Everything stateful lives in the library.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use crashpoint::{
    BroadcastHub, ConfigHandle, EngineConfig, EngineRegistry, GameType, Identity, InMemoryLedger,
    WireEvent,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crashpoint-server", about = "Provably-fair crash game engine")]
struct Args {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the WebSocket server on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

struct AppState {
    registry: EngineRegistry,
    hub: Arc<BroadcastHub>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConfigHandle::from_file(path)?,
        None => ConfigHandle::new(EngineConfig::default()),
    };
    let cfg = config.snapshot().await;

    // Demo ledger with a few funded accounts. A production deployment
    // plugs a transactional store in behind the same trait.
    let ledger = Arc::new(InMemoryLedger::new());
    for user in ["alice", "bob", "carol"] {
        ledger.credit(user, 10_000.0).await;
    }

    let hub = Arc::new(BroadcastHub::new(cfg.hub.history_limit));
    let registry = EngineRegistry::new(ledger, config, hub.clone());
    registry.start_game(GameType::Crash).await?;
    registry.start_background_tasks().await;

    let state = Arc::new(AppState { registry, hub });

    let app = Router::new()
        .route("/ws/:game_type", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!(bind = %args.bind, "crashpoint server listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    state.registry.shutdown().await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    user_id: Option<String>,
    name: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(game_type): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = Identity {
        user_id: query.user_id,
        display_name: query.name,
    };
    ws.on_upgrade(move |socket| async move {
        match game_type.parse::<GameType>() {
            Ok(game_type) => handle_socket(socket, game_type, identity, state).await,
            Err(e) => warn!(error = %e, "websocket rejected"),
        }
    })
}

/// Commands a connected client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientCommand {
    PlaceBet { amount: f64 },
    CashOut,
    SetAutoCashout { target: f64 },
    GetState,
    GetHistory { limit: Option<usize> },
    Ping,
}

async fn handle_socket(
    socket: WebSocket,
    game_type: GameType,
    identity: Identity,
    state: Arc<AppState>,
) {
    let user_id = identity.user_id.clone();
    let (conn_id, mut events) = state.hub.register(identity);
    state.hub.join(conn_id, game_type).await;

    let (mut sink, mut stream) = socket.split();

    // Pump engine events out to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "event serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Handle client commands until the socket closes.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.hub.touch(conn_id);
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        dispatch(&state, conn_id, game_type, user_id.as_deref(), command).await
                    }
                    Err(e) => state.hub.send_to_connection(
                        conn_id,
                        WireEvent::Error {
                            message: format!("unrecognized command: {}", e),
                            code: Some("bad_command".into()),
                        },
                    ),
                }
            }
            Ok(Message::Pong(_)) => state.hub.touch(conn_id),
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(conn_id).await;
    send_task.abort();
}

async fn dispatch(
    state: &AppState,
    conn_id: crashpoint::ConnectionId,
    game_type: GameType,
    user_id: Option<&str>,
    command: ClientCommand,
) {
    let outcome = match command {
        ClientCommand::PlaceBet { amount } => {
            let Some(user) = user_id else {
                return send_anonymous_rejection(state, conn_id);
            };
            state
                .registry
                .place_bet(game_type, user, amount)
                .await
                .map(|receipt| serde_json::to_value(receipt).unwrap_or_default())
        }
        ClientCommand::CashOut => {
            let Some(user) = user_id else {
                return send_anonymous_rejection(state, conn_id);
            };
            state
                .registry
                .cash_out(game_type, user)
                .await
                .map(|result| serde_json::to_value(result).unwrap_or_default())
        }
        ClientCommand::SetAutoCashout { target } => {
            let Some(user) = user_id else {
                return send_anonymous_rejection(state, conn_id);
            };
            state
                .registry
                .set_auto_cashout(game_type, user, target)
                .await
                .map(|_| serde_json::json!({ "auto_cashout": target }))
        }
        ClientCommand::GetState => {
            match state.registry.get_state(game_type, user_id).await {
                Ok(snapshot) => {
                    state
                        .hub
                        .send_to_connection(conn_id, WireEvent::StateUpdate { snapshot });
                }
                Err(e) => send_failure(state, conn_id, e),
            }
            return;
        }
        ClientCommand::GetHistory { limit } => {
            match state
                .registry
                .get_history(game_type, limit.unwrap_or(20))
                .await
            {
                Ok(history) => {
                    for record in history.iter().rev() {
                        state
                            .hub
                            .send_to_connection(conn_id, WireEvent::from_record(record));
                    }
                }
                Err(e) => send_failure(state, conn_id, e),
            }
            return;
        }
        ClientCommand::Ping => {
            state.hub.touch(conn_id);
            return;
        }
    };

    match outcome {
        Ok(_) => {
            // Personalized state so the caller sees its own bet reflected.
            if let Ok(snapshot) = state.registry.get_state(game_type, user_id).await {
                state
                    .hub
                    .send_to_connection(conn_id, WireEvent::StateUpdate { snapshot });
            }
        }
        Err(e) => send_failure(state, conn_id, e),
    }
}

/// Actions that move money require an identified user.
fn send_anonymous_rejection(state: &AppState, conn_id: crashpoint::ConnectionId) {
    state.hub.send_to_connection(
        conn_id,
        WireEvent::Error {
            message: "this action requires a user identity".into(),
            code: Some("anonymous".into()),
        },
    );
}

fn send_failure(state: &AppState, conn_id: crashpoint::ConnectionId, error: crashpoint::EngineError) {
    state.hub.send_to_connection(
        conn_id,
        WireEvent::Error {
            message: error.to_string(),
            code: Some(error.code().to_string()),
        },
    );
}
