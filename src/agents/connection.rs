use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::pool::AgentSummary;
use super::protocol::{self, Inbound, PromptResponse};
use crate::config::AgentsConfig;
use crate::errors::MenderError;
use crate::events::{Broadcaster, Event};
use crate::registry::RegistryEntry;
use crate::utils::truncation::{truncate_activity_prompt, truncate_activity_response};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Stale,
    Disconnected,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Stale => "stale",
            Health::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime view of one agent.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub connected: bool,
    pub health: Health,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Self-description received in the handshake.
    pub config: Option<Value>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            connected: false,
            health: Health::Disconnected,
            last_heartbeat: None,
            config: None,
        }
    }
}

/// One WebSocket channel to one agent process.
///
/// Requests are correlated through one-shot slots keyed by request id (prompts),
/// command name (commands) or `pong:<token>` (heartbeats). A slot resolves at
/// most once and is removed on every exit path.
pub struct AgentConnection {
    instance_id: String,
    entry: StdRwLock<RegistryEntry>,
    status: StdRwLock<AgentStatus>,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
    pending: DashMap<String, oneshot::Sender<Value>>,
    active_prompt: StdMutex<Option<String>>,
    in_flight: AtomicUsize,
    stop: CancellationToken,
    settings: AgentsConfig,
    ping_timeout: Duration,
    broadcaster: Arc<Broadcaster>,
}

/// Removes a pending slot when dropped.
struct PendingSlot<'a> {
    conn: &'a AgentConnection,
    key: String,
    prompt: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.conn.pending.remove(&self.key);
        if self.prompt {
            self.conn.in_flight.fetch_sub(1, Ordering::SeqCst);
            let mut active = self
                .conn
                .active_prompt
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if active.as_deref() == Some(self.key.as_str()) {
                *active = None;
            }
        }
    }
}

impl AgentConnection {
    pub fn new(
        instance_id: impl Into<String>,
        entry: RegistryEntry,
        settings: AgentsConfig,
        ping_timeout: Duration,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            entry: StdRwLock::new(entry),
            status: StdRwLock::new(AgentStatus::default()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pending: DashMap::new(),
            active_prompt: StdMutex::new(None),
            in_flight: AtomicUsize::new(0),
            stop: CancellationToken::new(),
            settings,
            ping_timeout,
            broadcaster,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn entry(&self) -> RegistryEntry {
        self.entry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_entry(&self, entry: RegistryEntry) {
        *self.entry.write().unwrap_or_else(|e| e.into_inner()) = entry;
    }

    pub fn project_path(&self) -> String {
        self.entry.read().unwrap_or_else(|e| e.into_inner()).project_path.clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().unwrap_or_else(|e| e.into_inner()).connected
    }

    pub fn health(&self) -> Health {
        self.status.read().unwrap_or_else(|e| e.into_inner()).health
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.status.read().unwrap_or_else(|e| e.into_inner()).last_heartbeat
    }

    /// Set health without touching `connected`. Ignored once disconnected.
    pub fn set_health(&self, health: Health) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if status.connected {
            status.health = health;
        }
    }

    /// True while a prompt is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn summary(&self) -> AgentSummary {
        let entry = self.entry();
        let status = self.status();
        AgentSummary {
            instance_id: self.instance_id.clone(),
            port: entry.port,
            address: entry.address.clone(),
            project_name: entry.project_name(),
            project_path: entry.project_path,
            capabilities: entry.capabilities,
            role: entry.role,
            agent_name: entry.agent_name,
            connected: status.connected,
            last_heartbeat: status.last_heartbeat,
            health: status.health,
            busy: self.is_busy(),
        }
    }

    /// Open the channel and read the handshake frame. Never errors: failure
    /// marks the agent disconnected and returns false.
    pub async fn connect(&self) -> bool {
        let entry = self.entry();
        let Some(url) = entry.url() else {
            warn!(instance_id = %self.instance_id, "Registry entry has no port or address");
            self.mark_disconnected();
            return false;
        };

        match self.open(&url).await {
            Ok(config) => {
                {
                    let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
                    status.connected = true;
                    status.health = Health::Healthy;
                    status.last_heartbeat = Some(Utc::now());
                    status.config = Some(config);
                }
                info!(instance_id = %self.instance_id, url = %url, "Agent connected");
                self.broadcaster
                    .log_activity("agent_connected", &self.instance_id, entry.port, Map::new());
                self.broadcaster.broadcast(Event::AgentAdded { agent: self.summary() });
                true
            }
            Err(e) => {
                warn!(
                    instance_id = %self.instance_id,
                    url = %url,
                    error = %e,
                    error_type = e.classify().error_type,
                    "Failed to connect to agent"
                );
                self.mark_disconnected();
                false
            }
        }
    }

    async fn open(&self, url: &str) -> Result<Value, MenderError> {
        let (ws, _) = timeout(self.settings.connect_timeout(), connect_async(url))
            .await
            .map_err(|_| MenderError::RequestTimeout(format!("connecting to {}", url)))?
            .map_err(|e| MenderError::ConnectionUnavailable(format!("{}: {}", url, e)))?;

        let (writer, mut reader) = ws.split();

        let config = loop {
            let frame = timeout(self.settings.recv_timeout(), reader.next())
                .await
                .map_err(|_| MenderError::RequestTimeout(format!("handshake from {}", url)))?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<Value>(&text).map_err(|e| {
                        MenderError::ConnectionUnavailable(format!(
                            "malformed handshake from {}: {}",
                            url, e
                        ))
                    })?;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    return Err(MenderError::ConnectionUnavailable(format!(
                        "unexpected handshake frame from {}: {}",
                        url, other
                    )));
                }
                Some(Err(e)) => {
                    return Err(MenderError::ConnectionUnavailable(format!("{}: {}", url, e)));
                }
                None => {
                    return Err(MenderError::ConnectionUnavailable(format!(
                        "{} closed during handshake",
                        url
                    )));
                }
            }
        };

        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        Ok(config)
    }

    /// Read frames until the channel closes or the connection is stopped.
    pub async fn listen(self: Arc<Self>) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return;
        };
        let poll = self.settings.listen_poll();

        let closed = loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break None,
                frame = timeout(poll, reader.next()) => frame,
            };
            match frame {
                Err(_) => continue,
                Ok(None) => break Some("stream ended".to_string()),
                Ok(Some(Err(e))) => break Some(e.to_string()),
                Ok(Some(Ok(Message::Close(frame)))) => {
                    break Some(
                        frame
                            .map(|f| format!("closed by agent: {}", f.reason))
                            .unwrap_or_else(|| "closed by agent".to_string()),
                    );
                }
                Ok(Some(Ok(message))) => self.handle_message(message),
            }
        };

        if let Some(reason) = closed {
            if !self.stop.is_cancelled() {
                self.on_closed(&reason);
            }
        }
        debug!(instance_id = %self.instance_id, "Listener exiting");
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Text(text) => match Inbound::parse(&text) {
                Ok(Inbound::PromptResult { response, raw }) => {
                    if response.is_interim() {
                        trace!(instance_id = %self.instance_id, "Prompt still executing");
                        return;
                    }
                    let mut fields = Map::new();
                    fields.insert(
                        "response".into(),
                        Value::String(truncate_activity_response(&response.content)),
                    );
                    fields.insert("status".into(), json!(response.status));
                    self.broadcaster.log_activity(
                        "prompt_response",
                        &self.instance_id,
                        self.entry().port,
                        fields,
                    );
                    self.resolve_prompt(response.request_id.as_deref(), raw);
                }
                Ok(Inbound::Typed { kind, body }) => {
                    if !self.resolve(&kind, body) {
                        trace!(instance_id = %self.instance_id, kind = %kind, "Unsolicited frame");
                    }
                }
                Ok(Inbound::Untyped(_)) => {
                    trace!(instance_id = %self.instance_id, "Ignoring untyped frame");
                }
                Err(e) => {
                    debug!(instance_id = %self.instance_id, error = %e, "Ignoring malformed frame");
                }
            },
            Message::Pong(payload) => {
                let token = String::from_utf8_lossy(&payload).to_string();
                self.resolve(&protocol::pong_key(&token), Value::Null);
            }
            _ => {}
        }
    }

    /// Match by explicit request id, then fall back to the single active slot.
    fn resolve_prompt(&self, request_id: Option<&str>, value: Value) {
        if let Some(id) = request_id {
            if self.pending.contains_key(id) {
                self.resolve(id, value);
                return;
            }
        }
        let active = self
            .active_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match active {
            Some(key) => {
                self.resolve(&key, value);
            }
            None => debug!(instance_id = %self.instance_id, "Prompt result with no pending slot"),
        }
    }

    fn resolve(&self, key: &str, value: Value) -> bool {
        match self.pending.remove(key) {
            Some((_, tx)) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    fn on_closed(&self, reason: &str) {
        warn!(instance_id = %self.instance_id, reason = %reason, "Agent connection closed");
        self.mark_disconnected();
        self.pending.clear();

        self.broadcaster.log_activity(
            "agent_disconnected",
            &self.instance_id,
            self.entry().port,
            Map::new(),
        );
        let mut changes = Map::new();
        changes.insert("connected".into(), Value::Bool(false));
        changes.insert("health".into(), Value::String(Health::Disconnected.to_string()));
        self.broadcaster.broadcast(Event::AgentDelta {
            instance_id: self.instance_id.clone(),
            changes,
        });
    }

    fn mark_disconnected(&self) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.connected = false;
        status.health = Health::Disconnected;
    }

    /// Stop listening, close the channel and mark disconnected.
    pub async fn disconnect(&self) {
        self.stop.cancel();
        if let Some(mut sink) = self.writer.lock().await.take() {
            if timeout(self.settings.recv_timeout(), sink.close()).await.is_err() {
                debug!(instance_id = %self.instance_id, "Close handshake timed out");
            }
        }
        self.mark_disconnected();
        self.pending.clear();
        info!(instance_id = %self.instance_id, "Agent disconnected");
    }

    async fn send_frame(&self, message: Message) -> Result<(), MenderError> {
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| MenderError::NotConnected(self.instance_id.clone()))?;
        sink.send(message).await.map_err(|e| {
            MenderError::ConnectionUnavailable(format!("{}: {}", self.instance_id, e))
        })
    }

    /// Send a prompt and wait for its result.
    pub async fn send_prompt(&self, prompt: &str) -> Result<PromptResponse, MenderError> {
        if !self.is_connected() {
            return Err(MenderError::NotConnected(self.instance_id.clone()));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        *self.active_prompt.lock().unwrap_or_else(|e| e.into_inner()) = Some(request_id.clone());
        let _slot = PendingSlot {
            conn: self,
            key: request_id.clone(),
            prompt: true,
        };

        let mut fields = Map::new();
        fields.insert("prompt".into(), Value::String(truncate_activity_prompt(prompt)));
        self.broadcaster
            .log_activity("prompt_sent", &self.instance_id, self.entry().port, fields);

        self.send_frame(Message::Text(protocol::prompt_frame(prompt, &request_id)))
            .await?;
        debug!(instance_id = %self.instance_id, request_id = %request_id, "Prompt sent");

        let reply = timeout(self.settings.prompt_timeout(), rx)
            .await
            .map_err(|_| MenderError::RequestTimeout(format!("prompt to {}", self.instance_id)))?
            .map_err(|_| MenderError::NotConnected(self.instance_id.clone()))?;

        Ok(serde_json::from_value(reply)?)
    }

    /// Send `{"type": command}` and wait for the frame of the same type. One
    /// command of a given type may be in flight at a time.
    pub async fn send_command(
        &self,
        command: &str,
        wait: Duration,
    ) -> Result<Value, MenderError> {
        if !self.is_connected() {
            return Err(MenderError::NotConnected(self.instance_id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(command.to_string()) {
            Entry::Occupied(_) => {
                return Err(MenderError::InvalidState(format!(
                    "{} already in flight on {}",
                    command, self.instance_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _slot = PendingSlot {
            conn: self,
            key: command.to_string(),
            prompt: false,
        };

        self.send_frame(Message::Text(protocol::command_frame(command)))
            .await?;

        timeout(wait, rx)
            .await
            .map_err(|_| {
                MenderError::RequestTimeout(format!("{} on {}", command, self.instance_id))
            })?
            .map_err(|_| MenderError::NotConnected(self.instance_id.clone()))
    }

    /// Ping and wait for the matching pong. Success refreshes the heartbeat
    /// timestamp and health; failure leaves `connected` untouched.
    pub async fn heartbeat(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        let token = Uuid::new_v4().to_string();
        let key = protocol::pong_key(&token);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);
        let _slot = PendingSlot {
            conn: self,
            key,
            prompt: false,
        };

        if let Err(e) = self.send_frame(Message::Ping(token.into_bytes())).await {
            debug!(instance_id = %self.instance_id, error = %e, "Ping failed");
            return false;
        }

        match timeout(self.ping_timeout, rx).await {
            Ok(Ok(_)) => {
                let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
                if status.connected {
                    status.last_heartbeat = Some(Utc::now());
                    status.health = Health::Healthy;
                }
                true
            }
            _ => false,
        }
    }
}
