#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mender::config::MenderConfig;
use mender::registry::RegistryEntry;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// How a mock agent answers prompts.
#[derive(Clone, Default)]
pub struct Behavior {
    pub reply: String,
    pub delay: Duration,
    pub command_delay: Duration,
    pub error: Option<String>,
}

impl Behavior {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: text.to_string(),
            ..Default::default()
        }
    }

    pub fn slow(text: &str, delay: Duration) -> Self {
        Self {
            reply: text.to_string(),
            delay,
            ..Default::default()
        }
    }

    pub fn slow_commands(delay: Duration) -> Self {
        Self {
            reply: "ok".to_string(),
            command_delay: delay,
            ..Default::default()
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// In-process coding agent speaking the WebSocket prompt protocol.
pub struct MockAgent {
    pub port: u16,
    prompts: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicUsize>,
    silenced: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    acceptor: JoinHandle<()>,
}

impl MockAgent {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let silenced = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let prompts = prompts.clone();
            let sessions = sessions.clone();
            let silenced = silenced.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handle = tokio::spawn(serve(
                        stream,
                        behavior.clone(),
                        prompts.clone(),
                        sessions.clone(),
                        silenced.clone(),
                    ));
                    connections.lock().unwrap().push(handle);
                }
            })
        };

        Self {
            port,
            prompts,
            sessions,
            silenced,
            connections,
            acceptor,
        }
    }

    pub fn entry(&self, project_path: &Path) -> RegistryEntry {
        RegistryEntry {
            address: Some(format!("127.0.0.1:{}", self.port)),
            project_path: project_path.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn session_resets(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Stop reading frames (pings included) while `on`, keeping the socket open.
    pub fn silence(&self, on: bool) {
        self.silenced.store(on, Ordering::SeqCst);
    }

    /// Drop every open connection and stop accepting.
    pub fn stop(&self) {
        self.acceptor.abort();
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    stream: TcpStream,
    behavior: Behavior,
    prompts: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicUsize>,
    silenced: Arc<AtomicBool>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let hello = json!({"type": "agentConfig", "name": "mock", "model": "test"});
    if sink.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        while silenced.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let Some(Ok(message)) = source.next().await else {
            break;
        };
        let reply = match message {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match frame["type"].as_str() {
                    Some("copilotPrompt") => {
                        let prompt = frame["prompt"].as_str().unwrap_or_default().to_string();
                        prompts.lock().unwrap().push(prompt);
                        let interim = json!({
                            "type": "copilotPromptResult",
                            "status": "executing",
                            "request_id": frame["request_id"],
                        });
                        if sink.send(Message::Text(interim.to_string())).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(behavior.delay).await;

                        let mut result = json!({
                            "type": "copilotPromptResult",
                            "content": behavior.reply,
                            "request_id": frame["request_id"],
                        });
                        match &behavior.error {
                            Some(error) => {
                                result["status"] = json!("error");
                                result["error"] = json!(error);
                            }
                            None => result["status"] = json!("success"),
                        }
                        Some(Message::Text(result.to_string()))
                    }
                    Some("newAgentSession") => {
                        sessions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(behavior.command_delay).await;
                        Some(Message::Text(
                            json!({"type": "newAgentSession", "success": true}).to_string(),
                        ))
                    }
                    _ => None,
                }
            }
            Message::Ping(payload) => Some(Message::Pong(payload)),
            Message::Close(_) => break,
            _ => None,
        };
        if let Some(reply) = reply {
            if sink.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// Serve `body` as JSON to every request. Returns the base URL.
pub async fn http_stub(body: Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let body = body.to_string();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://127.0.0.1:{}", port)
}

/// Defaults with short timers and every path under `home`.
pub fn test_config(home: &Path) -> MenderConfig {
    let mut config = MenderConfig::default();
    config.storage.home = Some(home.to_path_buf());
    config.registry.path = Some(home.join("registry.json"));
    config.registry.poll_interval_secs = 1;
    config.agents.connect_timeout_secs = 2;
    config.agents.recv_timeout_secs = 2;
    config.agents.prompt_timeout_secs = 5;
    config.agents.command_timeout_secs = 2;
    config.agents.listen_poll_millis = 50;
    config.agents.session_reset_delay_millis = 0;
    config.heartbeat.interval_secs = 1;
    config.heartbeat.ping_timeout_secs = 1;
    config.heartbeat.stale_threshold_secs = 3;
    config
}

pub fn write_registry(home: &Path, entries: &[(&str, RegistryEntry)]) {
    let mut map = Map::new();
    for (id, entry) in entries {
        map.insert(id.to_string(), serde_json::to_value(entry).unwrap());
    }
    let tmp = home.join("registry.json.tmp");
    std::fs::write(&tmp, Value::Object(map).to_string()).unwrap();
    std::fs::rename(tmp, home.join("registry.json")).unwrap();
}

pub fn write_workflow(dir: &Path, id: &str, graph: Value) {
    let dir = dir.join("workflows");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.json", id)), graph.to_string()).unwrap();
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
