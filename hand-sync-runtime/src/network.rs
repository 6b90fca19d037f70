use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::messages::{
    JoinSessionMessage, LeaveSessionMessage, PoseData, PoseSyncMessage, ServerMessage,
};
use crate::schema::PoseFrame;
use crate::transport::PoseTransport;
use crate::types::RemotePose;

pub static TOKIO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

// Get or initialize the tokio runtime
fn get_tokio_runtime() -> Result<&'static Runtime> {
    if let Some(runtime) = TOKIO_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = Runtime::new()?;
    Ok(TOKIO_RUNTIME.get_or_init(|| runtime))
}

/// State written by the socket reader task and drained by the sim thread.
#[derive(Debug, Default)]
pub struct PeerState {
    pub client_id: String,
    pub session_members: Vec<String>,
    /// Newest unconsumed frame per sender.
    pub pending_poses: HashMap<String, RemotePose>,
    /// Remote senders in the order they were first heard.
    pub heard: Vec<String>,
    /// Senders already followed by some observer link.
    pub claimed: HashSet<String>,
}

impl PeerState {
    // Claims belong to live links, so they outlive a connection
    fn reset(&mut self) {
        let claimed = std::mem::take(&mut self.claimed);
        *self = PeerState {
            claimed,
            ..PeerState::default()
        };
    }

    fn forget(&mut self, sender_id: &str) {
        self.pending_poses.remove(sender_id);
        self.heard.retain(|id| id != sender_id);
        self.claimed.remove(sender_id);
    }
}

// Shared between the module, its socket tasks and every link
#[derive(Debug, Default)]
struct Connection {
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    peers: Mutex<PeerState>,
}

impl Connection {
    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = None;
        }
    }

    fn send_json(&self, json: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(anyhow!("Not connected to server"));
        }

        let outbound = self
            .outbound
            .lock()
            .map_err(|e| anyhow!("Failed to lock outbound channel: {}", e))?;
        let tx = outbound
            .as_ref()
            .ok_or_else(|| anyhow!("Outbound channel missing"))?;
        tx.send(Message::Text(json.to_string()))
            .map_err(|_| anyhow!("Connection writer has stopped"))?;

        Ok(())
    }
}

/// WebSocket connection to the relay server. One per process; every hand
/// replicated over it gets its own [`NetworkLink`].
pub struct HandSyncModule {
    current_session_id: Option<String>,
    reader_task: Option<JoinHandle<()>>,
    connection: Arc<Connection>,
}

impl HandSyncModule {
    pub fn new() -> Self {
        Self {
            current_session_id: None,
            reader_task: None,
            connection: Arc::new(Connection::default()),
        }
    }

    /// False once the server closed the socket, even without `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> String {
        self.connection
            .peers
            .lock()
            .map(|peers| peers.client_id.clone())
            .unwrap_or_default()
    }

    pub fn session_members(&self) -> Vec<String> {
        self.connection
            .peers
            .lock()
            .map(|peers| peers.session_members.clone())
            .unwrap_or_default()
    }

    /// Remote senders heard so far and still in the session.
    pub fn remote_peers(&self) -> Vec<String> {
        self.connection
            .peers
            .lock()
            .map(|peers| peers.heard.clone())
            .unwrap_or_default()
    }

    /// Transport for one hand. Links stay valid across reconnects.
    pub fn link(&self, authoritative: bool) -> NetworkLink {
        NetworkLink {
            authoritative,
            following: None,
            pinned: false,
            connection: Arc::clone(&self.connection),
        }
    }

    pub fn connect(&mut self, url: &str) -> Result<()> {
        if self.is_connected() {
            return Err(anyhow!("Already connected"));
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        let runtime = get_tokio_runtime()?;
        let (ws_stream, _) = runtime.block_on(connect_async(url))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Live before the tasks start, so an immediate hang-up is not lost
        {
            let mut outbound = self
                .connection
                .outbound
                .lock()
                .map_err(|e| anyhow!("Failed to lock outbound channel: {}", e))?;
            *outbound = Some(tx);
        }
        if let Ok(mut peers) = self.connection.peers.lock() {
            peers.reset();
        }
        self.connection.connected.store(true, Ordering::SeqCst);

        let connection = Arc::clone(&self.connection);
        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    log::error!("Failed to send to server: {}", e);
                    connection.mark_closed();
                    break;
                }
            }
        });

        let connection = Arc::clone(&self.connection);
        let reader_task = runtime.spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = process_network_message(&text, &connection.peers) {
                            log::error!("Error processing message: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Error receiving message: {}", e);
                        break;
                    }
                }
            }
            connection.mark_closed();
            log::info!("Connection to server closed");
        });

        self.reader_task = Some(reader_task);

        Ok(())
    }

    // Join a relay session; members receive each other's poses
    pub fn join_session(&mut self, session_id: &str) -> Result<()> {
        let join_msg = JoinSessionMessage {
            command: "join_session".to_string(),
            session_id: session_id.to_string(),
        };
        self.connection
            .send_json(&serde_json::to_string(&join_msg)?)?;

        // Confirmed later by a session_members event
        self.current_session_id = Some(session_id.to_string());
        log::info!("Sent join request for session: {}", session_id);

        Ok(())
    }

    pub fn leave_session(&mut self) -> Result<()> {
        if let Some(session_id) = self.current_session_id.take() {
            let leave_msg = LeaveSessionMessage {
                command: "leave_session".to_string(),
            };
            self.connection
                .send_json(&serde_json::to_string(&leave_msg)?)?;
            log::info!("Sent request to leave session: {}", session_id);
        }

        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if let Ok(mut outbound) = self.connection.outbound.lock() {
            if let Some(tx) = outbound.take() {
                let _ = tx.send(Message::Close(None));
            }
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        self.connection.mark_closed();
        self.current_session_id = None;
        if let Ok(mut peers) = self.connection.peers.lock() {
            peers.reset();
        }

        Ok(())
    }
}

impl Default for HandSyncModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandSyncModule {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Per-hand [`PoseTransport`] over a shared [`HandSyncModule`] connection.
///
/// An observer link locks onto one remote sender and stays with it until
/// that sender leaves the session. Without an explicit
/// [`follow`](Self::follow) it picks the first heard sender that no other
/// link has taken.
pub struct NetworkLink {
    authoritative: bool,
    following: Option<String>,
    pinned: bool,
    connection: Arc<Connection>,
}

impl NetworkLink {
    /// Only take frames from `sender_id`, whether or not it was heard yet.
    pub fn follow(&mut self, sender_id: &str) {
        if let Ok(mut peers) = self.connection.peers.lock() {
            if let Some(previous) = self.following.take() {
                peers.claimed.remove(&previous);
            }
            peers.claimed.insert(sender_id.to_string());
        }
        self.following = Some(sender_id.to_string());
        self.pinned = true;
    }

    pub fn following(&self) -> Option<&str> {
        self.following.as_deref()
    }

    fn release(&mut self, peers: &mut PeerState) {
        if let Some(previous) = self.following.take() {
            peers.claimed.remove(&previous);
        }
    }
}

impl Drop for NetworkLink {
    fn drop(&mut self) {
        if let Some(previous) = self.following.take() {
            if let Ok(mut peers) = self.connection.peers.lock() {
                peers.claimed.remove(&previous);
            }
        }
    }
}

impl PoseTransport for NetworkLink {
    fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    fn send_frame(&mut self, frame: PoseFrame) -> Result<()> {
        let msg = PoseSyncMessage {
            command: "pose_sync".to_string(),
            data: PoseData { frame },
        };
        self.connection.send_json(&serde_json::to_string(&msg)?)
    }

    fn take_latest(&mut self) -> Option<PoseFrame> {
        let connection = Arc::clone(&self.connection);
        let mut peers = match connection.peers.lock() {
            Ok(peers) => peers,
            Err(e) => {
                log::error!("Failed to lock peer state: {}", e);
                return None;
            }
        };

        if self.authoritative {
            // Not ours to consume; observers on the same connection may want it
            return None;
        }

        if !self.pinned {
            let departed = match &self.following {
                Some(id) => !peers.heard.contains(id),
                None => false,
            };
            if departed {
                log::info!("Followed peer {:?} left, looking for another", self.following);
                self.release(&mut peers);
            }

            if self.following.is_none() {
                let next = peers
                    .heard
                    .iter()
                    .find(|id| !peers.claimed.contains(*id))
                    .cloned();
                if let Some(id) = next {
                    log::info!("Following remote hand of {}", id);
                    peers.claimed.insert(id.clone());
                    self.following = Some(id);
                }
            }
        }

        let sender = self.following.as_ref()?;
        let pose = peers.pending_poses.remove(sender)?;
        log::debug!(
            "Taking pose from {} ({:?} old)",
            pose.sender_id,
            pose.last_update.elapsed()
        );

        Some(pose.frame)
    }
}

fn process_network_message(message: &str, peers: &Mutex<PeerState>) -> Result<()> {
    if message.trim().is_empty() {
        log::debug!("Received empty message, ignoring");
        return Ok(());
    }

    let server_msg = match serde_json::from_str::<ServerMessage>(message) {
        Ok(msg) => msg,
        Err(e) => {
            log::debug!("Failed to parse message: {} (Error: {})", message, e);
            return Ok(());
        }
    };

    let mut peers = peers
        .lock()
        .map_err(|e| anyhow!("Failed to lock peer state: {}", e))?;

    match server_msg {
        ServerMessage::Welcome(msg) => {
            peers.client_id = msg.sender_id;
            log::info!("Connected as client ID: {}", peers.client_id);
        }

        ServerMessage::SessionMembers(msg) => {
            let session_id = msg.data.get("session_id").and_then(|v| v.as_str());
            let members = msg.data.get("members").and_then(|v| v.as_array());

            if let (Some(session_id), Some(members)) = (session_id, members) {
                let members: Vec<String> = members
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();

                let old_members = std::mem::replace(&mut peers.session_members, members.clone());
                for old_member in old_members {
                    if !members.contains(&old_member) {
                        peers.forget(&old_member);
                        log::info!("Peer {} has left", old_member);
                    }
                }

                log::info!(
                    "Session '{}' updated: {} members: {:?}",
                    session_id,
                    peers.session_members.len(),
                    peers.session_members
                );
            }
        }

        ServerMessage::PoseSync(msg) => {
            // The relay echoes our own frames back
            if msg.sender_id != peers.client_id {
                log::debug!("Received pose from {}", msg.sender_id);
                if !peers.heard.contains(&msg.sender_id) {
                    peers.heard.push(msg.sender_id.clone());
                }
                peers.pending_poses.insert(
                    msg.sender_id.clone(),
                    RemotePose {
                        sender_id: msg.sender_id,
                        frame: msg.data.frame,
                        last_update: Instant::now(),
                    },
                );
            }
        }

        ServerMessage::ServerError(msg) => {
            log::warn!("Server rejected request: {}", msg.data);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn feed(module: &HandSyncModule, json: &str) {
        process_network_message(json, &module.connection.peers).unwrap();
    }

    fn pose_from(module: &HandSyncModule, sender: &str, value: f32) {
        let json = serde_json::json!({
            "event_type": "pose_sync",
            "sender_id": sender,
            "data": { "frame": [value] },
        });
        feed(module, &json.to_string());
    }

    fn members(module: &HandSyncModule, members: &[&str]) {
        let json = serde_json::json!({
            "event_type": "session_members",
            "sender_id": "server",
            "data": { "session_id": "s", "members": members },
        });
        feed(module, &json.to_string());
    }

    #[test]
    fn welcome_sets_client_id() {
        let module = HandSyncModule::new();
        feed(&module, r#"{"event_type":"welcome","sender_id":"me","data":{}}"#);
        assert_eq!(module.client_id(), "me");
    }

    #[test]
    fn own_echo_is_ignored() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);
        feed(&module, r#"{"event_type":"welcome","sender_id":"me","data":{}}"#);
        pose_from(&module, "me", 1.0);
        assert_eq!(link.take_latest(), None);
        assert!(module.remote_peers().is_empty());
    }

    #[test]
    fn latest_frame_per_sender_wins() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);
        pose_from(&module, "a", 1.0);
        pose_from(&module, "a", 2.0);

        assert_eq!(link.take_latest(), Some(vec![2.0]));
        assert_eq!(link.take_latest(), None);
    }

    #[test]
    fn observer_stays_with_first_sender_when_frames_interleave() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);

        let mut taken = Vec::new();
        for _ in 0..5 {
            pose_from(&module, "a", 1.0);
            taken.extend(link.take_latest());
            pose_from(&module, "b", -1.0);
            taken.extend(link.take_latest());
        }

        assert_eq!(link.following(), Some("a"));
        assert_eq!(taken, vec![vec![1.0]; 5]);
    }

    #[test]
    fn observer_moves_on_only_after_sender_leaves() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);
        members(&module, &["me", "a", "b"]);
        pose_from(&module, "a", 1.0);
        pose_from(&module, "b", -1.0);
        assert_eq!(link.take_latest(), Some(vec![1.0]));

        members(&module, &["me", "b"]);
        pose_from(&module, "b", -2.0);

        assert_eq!(link.take_latest(), Some(vec![-2.0]));
        assert_eq!(link.following(), Some("b"));
    }

    #[test]
    fn each_observer_gets_its_own_sender() {
        let module = HandSyncModule::new();
        let mut first = module.link(false);
        let mut second = module.link(false);
        let mut local = module.link(true);

        pose_from(&module, "a", 1.0);
        pose_from(&module, "b", 2.0);

        assert_eq!(local.take_latest(), None);
        assert_eq!(first.take_latest(), Some(vec![1.0]));
        assert_eq!(second.take_latest(), Some(vec![2.0]));
    }

    #[test]
    fn dropped_link_frees_its_sender() {
        let module = HandSyncModule::new();
        pose_from(&module, "a", 1.0);
        {
            let mut link = module.link(false);
            assert_eq!(link.take_latest(), Some(vec![1.0]));
        }

        let mut next = module.link(false);
        pose_from(&module, "a", 3.0);
        assert_eq!(next.take_latest(), Some(vec![3.0]));
    }

    #[test]
    fn followed_peer_is_preferred() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);
        link.follow("b");
        pose_from(&module, "a", 1.0);
        pose_from(&module, "b", 2.0);

        assert_eq!(link.take_latest(), Some(vec![2.0]));
    }

    #[test]
    fn departed_member_is_dropped() {
        let module = HandSyncModule::new();
        let mut link = module.link(false);
        members(&module, &["a", "b"]);
        pose_from(&module, "b", 3.0);
        members(&module, &["a"]);

        assert_eq!(module.session_members(), vec!["a".to_string()]);
        assert_eq!(link.take_latest(), None);
    }

    #[test]
    fn garbage_is_skipped() {
        let module = HandSyncModule::new();
        feed(&module, "not json");
        feed(&module, "   ");
    }

    #[test]
    fn sending_while_disconnected_fails() {
        let mut module = HandSyncModule::new();
        let mut link = module.link(true);
        assert!(link.send_frame(vec![0.0]).is_err());
        assert!(module.join_session("s").is_err());
    }

    #[test]
    fn server_closing_the_socket_allows_reconnect() {
        let runtime = get_tokio_runtime().unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();

        // Accepts two clients and hangs up on each right away
        runtime.spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let _ = ws.close(None).await;
            }
        });

        let url = format!("ws://{}", addr);
        let mut module = HandSyncModule::new();
        let mut link = module.link(true);
        module.connect(&url).unwrap();

        let mut waited = Duration::ZERO;
        while module.is_connected() && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }

        assert!(!module.is_connected());
        assert!(link.send_frame(vec![0.0]).is_err());
        module.connect(&url).unwrap();
    }
}
