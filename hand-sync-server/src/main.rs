use clap::Parser;
use env_logger::Builder;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use uuid::Uuid;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Largest number of peers allowed in one session (0 = unlimited)
    #[clap(long, default_value = "0")]
    max_session_size: usize,
}

// Message types for the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientMessage {
    pub command: String,
    pub session_id: Option<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerMessage {
    event_type: String,
    sender_id: String,
    data: serde_json::Value,
}

impl ServerMessage {
    fn session_members(sender_id: &str, session_id: &str, members: &[String]) -> Self {
        Self {
            event_type: "session_members".to_string(),
            sender_id: sender_id.to_string(),
            data: serde_json::json!({
                "session_id": session_id,
                "members": members,
            }),
        }
    }
}

#[derive(Debug, PartialEq)]
enum JoinError {
    SessionFull(usize),
}

// Server state
struct ServerState {
    // Map from connection ID to session ID
    connections: HashMap<String, Option<String>>,
    // Map from session ID to set of connection IDs
    sessions: HashMap<String, Vec<String>>,
    // Membership and error events, never dropped under pose load
    control: HashMap<String, mpsc::UnboundedSender<String>>,
    max_session_size: usize,
}

impl ServerState {
    fn new(max_session_size: usize) -> Self {
        Self {
            connections: HashMap::new(),
            sessions: HashMap::new(),
            control: HashMap::new(),
            max_session_size,
        }
    }

    fn register_connection(&mut self, id: &str, control: mpsc::UnboundedSender<String>) {
        info!("Registering connection: {}", id);
        self.connections.insert(id.to_string(), None);
        self.control.insert(id.to_string(), control);
    }

    fn remove_connection(&mut self, id: &str) {
        self.leave_session(id);
        self.connections.remove(id);
        self.control.remove(id);
    }

    fn send_control(&self, target: &str, msg: &str) {
        if let Some(control) = self.control.get(target) {
            if control.send(msg.to_string()).is_err() {
                debug!("Control channel of {} already closed", target);
            }
        }
    }

    fn announce_members(
        &self,
        sender_id: &str,
        session_id: &str,
    ) -> Result<(), serde_json::Error> {
        let members = self.get_session_members(session_id);
        let msg = ServerMessage::session_members(sender_id, session_id, &members);
        let msg_str = serde_json::to_string(&msg)?;
        for member in &members {
            self.send_control(member, &msg_str);
        }
        Ok(())
    }

    fn join_session(
        &mut self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<Vec<String>, JoinError> {
        if self.is_in_session(connection_id, session_id) {
            return Ok(self.get_session_members(session_id));
        }

        let size = self.sessions.get(session_id).map_or(0, Vec::len);
        if self.max_session_size > 0 && size >= self.max_session_size {
            return Err(JoinError::SessionFull(self.max_session_size));
        }

        // A connection lives in at most one session
        self.leave_session(connection_id);

        self.connections
            .insert(connection_id.to_string(), Some(session_id.to_string()));

        let session_members = self.sessions.entry(session_id.to_string()).or_default();
        session_members.push(connection_id.to_string());

        Ok(session_members.clone())
    }

    fn leave_session(&mut self, connection_id: &str) -> Option<String> {
        let session_id = self.connections.get(connection_id).cloned().flatten()?;
        self.connections.insert(connection_id.to_string(), None);

        if let Some(connections) = self.sessions.get_mut(&session_id) {
            connections.retain(|cid| cid != connection_id);
            // Clean up empty sessions
            if connections.is_empty() {
                self.sessions.remove(&session_id);
            }
        }

        Some(session_id)
    }

    fn session_of(&self, connection_id: &str) -> Option<String> {
        self.connections.get(connection_id).cloned().flatten()
    }

    fn get_session_members(&self, session_id: &str) -> Vec<String> {
        self.sessions.get(session_id).cloned().unwrap_or_default()
    }

    fn is_in_session(&self, connection_id: &str, session_id: &str) -> bool {
        matches!(self.connections.get(connection_id), Some(Some(s)) if s == session_id)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = Builder::from_default_env();

    #[cfg(debug_assertions)]
    builder.filter_level(log::LevelFilter::Debug);
    #[cfg(not(debug_assertions))]
    builder.filter_level(log::LevelFilter::Info);

    builder.init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on: {}", addr);

    let state = Arc::new(Mutex::new(ServerState::new(args.max_session_size)));

    // Pose fan-out only: (target connection, payload). Lagging here drops
    // stale poses, which is fine for last-write-wins records.
    let (tx, _) = broadcast::channel::<(String, String)>(100);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);

        let tx = tx.clone();
        let state = Arc::clone(&state);
        let connection_id = Uuid::new_v4().to_string();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        {
            let mut state = state.lock().unwrap();
            state.register_connection(&connection_id, control_tx);
        }

        tokio::spawn(async move {
            if let Err(e) = handle_connection(
                stream,
                connection_id.clone(),
                Arc::clone(&state),
                tx,
                control_rx,
            )
            .await
            {
                error!("Error handling connection {}: {}", connection_id, e);
            }

            // On disconnect, clean up and tell whoever is left
            {
                let mut state = state.lock().unwrap();
                if let Some(session_id) = state.leave_session(&connection_id) {
                    if let Err(e) = state.announce_members(&connection_id, &session_id) {
                        error!("Failed to announce departure of {}: {}", connection_id, e);
                    }
                }
                state.remove_connection(&connection_id);
            }
            info!("Connection closed: {}", connection_id);
        });
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    connection_id: String,
    state: Arc<Mutex<ServerState>>,
    tx: broadcast::Sender<(String, String)>,
    mut control_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = ServerMessage {
        event_type: "welcome".to_string(),
        sender_id: connection_id.clone(),
        data: serde_json::json!({}),
    };

    ws_sender
        .send(Message::Text(serde_json::to_string(&welcome)?))
        .await?;

    let mut rx = tx.subscribe();

    // Forward control events and the poses addressed to this connection
    let conn_id = connection_id.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                control = control_rx.recv() => match control {
                    Some(msg) => msg,
                    None => break,
                },
                pose = rx.recv() => match pose {
                    Ok((target, msg)) if target == conn_id => msg,
                    Ok(_) => continue,
                    // Pose records are last-write-wins, dropping old ones is fine
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Connection {} lagged, skipped {} poses", conn_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Err(e) = ws_sender.send(Message::Text(msg)).await {
                error!("Failed to forward message: {}", e);
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        debug!("Received text message from {}: {}", connection_id, text);

        let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => client_msg,
            Err(e) => {
                error!("Failed to parse message: {} ({})", text, e);
                continue;
            }
        };

        for (target, msg) in route_message(&state, &connection_id, client_msg)? {
            tx.send((target, msg))?;
        }
    }

    forward_task.abort();

    Ok(())
}

/// Applies one client command. Membership and error events go straight to
/// the control channels; the returned `(target, payload)` pairs are the pose
/// fan-out for the broadcast.
fn route_message(
    state: &Mutex<ServerState>,
    connection_id: &str,
    client_msg: ClientMessage,
) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    let mut state = state.lock().map_err(|e| e.to_string())?;
    let mut outbound = Vec::new();

    match client_msg.command.as_str() {
        "join_session" => {
            let Some(session_id) = client_msg.session_id else {
                warn!("join_session from {} without session_id", connection_id);
                return Ok(outbound);
            };

            let previous = state.session_of(connection_id);
            match state.join_session(connection_id, &session_id) {
                Ok(members) => {
                    // Tell the session we moved out of, if any
                    if let Some(previous) = previous.filter(|p| p != &session_id) {
                        state.announce_members(connection_id, &previous)?;
                    }

                    state.announce_members(connection_id, &session_id)?;
                    info!(
                        "Peer {} joined session {} ({} members)",
                        connection_id,
                        session_id,
                        members.len()
                    );
                }
                Err(JoinError::SessionFull(limit)) => {
                    let msg = ServerMessage {
                        event_type: "error".to_string(),
                        sender_id: connection_id.to_string(),
                        data: serde_json::json!({
                            "reason": "session_full",
                            "session_id": session_id,
                            "limit": limit,
                        }),
                    };
                    state.send_control(connection_id, &serde_json::to_string(&msg)?);
                    warn!("Peer {} refused, session {} is full", connection_id, session_id);
                }
            }
        }

        "leave_session" => {
            if let Some(session_id) = state.leave_session(connection_id) {
                state.announce_members(connection_id, &session_id)?;
                info!("Peer {} left session {}", connection_id, session_id);
            }
        }

        "pose_sync" => {
            let Some(session_id) = state.session_of(connection_id) else {
                debug!("Dropping pose from {} outside any session", connection_id);
                return Ok(outbound);
            };

            let sync_msg = ServerMessage {
                event_type: "pose_sync".to_string(),
                sender_id: connection_id.to_string(),
                data: client_msg.data.unwrap_or(serde_json::Value::Null),
            };
            let msg_str = serde_json::to_string(&sync_msg)?;

            // Everyone in the session, sender included; clients drop their own echo
            for member in state.get_session_members(&session_id) {
                outbound.push((member, msg_str.clone()));
            }
        }

        _ => {
            error!("Unknown command: {}", client_msg.command);
        }
    }

    Ok(outbound)
}
