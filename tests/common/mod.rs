//! Common test utilities - EncounterTest harness for end-to-end testing

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use encounterd::{Config, Server};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Test harness that spawns a real encounterd server on a random port
pub struct EncounterTest {
    pub addr: SocketAddr,
    pub client: Client,
    server: Arc<Server>,
    _handle: JoinHandle<()>,
}

impl EncounterTest {
    /// Start a new test server instance
    pub async fn start() -> Result<Self> {
        Self::start_with(Config::default()).await
    }

    /// Start a server whose unseeded encounters use `seed`
    pub async fn start_seeded(seed: u64) -> Result<Self> {
        Self::start_with(Config {
            default_seed: Some(seed),
            ..Config::default()
        })
        .await
    }

    async fn start_with(mut config: Config) -> Result<Self> {
        // Bind a random port up front so nothing can take it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        config.bind_addr = addr;

        let server = Arc::new(Server::new(config));
        let server_clone = server.clone();

        // Spawn the server in a background task
        let handle = tokio::spawn(async move {
            if let Err(e) = server_clone.serve(listener).await {
                eprintln!("Server error: {}", e);
            }
        });

        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;

        // Poll until server is ready (max 2 seconds)
        let mut ready = false;
        for _ in 0..20 {
            if client
                .get(format!("http://{}/health", addr))
                .send()
                .await
                .is_ok()
            {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !ready {
            bail!("Server failed to start within 2 seconds");
        }

        Ok(Self {
            addr,
            client,
            server,
            _handle: handle,
        })
    }

    /// Get the base URL for the server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Make a GET request
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await?)
    }

    /// Make a POST request with JSON body
    pub async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        Ok(self
            .client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await?)
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await?)
    }

    /// Direct access to the engine for setup and assertions
    pub fn engine(&self) -> Arc<encounterd::combat::EncounterManager> {
        self.server.engine()
    }

    pub fn battlefield(&self) -> Arc<encounterd::battlefield::Battlefield> {
        self.server.battlefield()
    }

    /// Create a two-sided encounter with fixed initiative and return its ID
    pub async fn create_skirmish(&self) -> Result<String> {
        let body = json!({
            "name": "Goblin ambush",
            "participants": [
                {"id": "fighter", "name": "Fighter", "maxHp": 28, "armorClass": 16,
                 "initiative": 15, "attackBonus": 5, "damageDice": "1d8+3"},
                {"id": "goblin", "name": "Goblin", "maxHp": 7, "armorClass": 15,
                 "initiative": 12, "isEnemy": true, "position": {"x": 1, "y": 0}},
                {"id": "cleric", "name": "Cleric", "maxHp": 22, "armorClass": 18,
                 "initiative": 8, "position": {"x": 0, "y": 1}}
            ]
        });
        let resp = self.post("/encounters", &body).await?;
        if resp.status() != 201 {
            bail!("create failed: {} {}", resp.status(), resp.text().await?);
        }
        let state: Value = resp.json().await?;
        match state["id"].as_str() {
            Some(id) => Ok(id.to_string()),
            None => bail!("create response has no id: {}", state),
        }
    }

    /// Get the WebSocket URL for the server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connect to the WebSocket endpoint and return a test client
    pub async fn connect_ws(&self) -> Result<WsClient> {
        let (ws_stream, _) = connect_async(&self.ws_url()).await?;
        let (write, read) = ws_stream.split();
        Ok(WsClient { write, read })
    }

    /// Shutdown the server gracefully
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

impl Drop for EncounterTest {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// WebSocket observer client for testing
pub struct WsClient {
    write: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    read: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl WsClient {
    /// Send a raw text frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.write.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, msg: &Value) -> Result<()> {
        self.send_text(&msg.to_string()).await
    }

    pub async fn subscribe(&mut self, encounter_id: &str) -> Result<()> {
        self.send_json(&json!({"type": "subscribe", "encounterId": encounter_id}))
            .await
    }

    pub async fn unsubscribe(&mut self, encounter_id: &str) -> Result<()> {
        self.send_json(&json!({"type": "unsubscribe", "encounterId": encounter_id}))
            .await
    }

    /// Send a ping message
    pub async fn send_ping(&mut self) -> Result<()> {
        self.send_json(&json!({"type": "ping"})).await
    }

    /// Receive the next message as JSON
    pub async fn recv_json(&mut self) -> Result<Value> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Close(_))) | None => {
                    bail!("WebSocket closed");
                }
                Some(Err(e)) => bail!("WebSocket error: {}", e),
                _ => continue, // Skip binary/ping/pong frames
            }
        }
    }

    /// Receive with timeout
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.recv_json()).await {
            Ok(result) => result,
            Err(_) => bail!("Timeout waiting for WebSocket message"),
        }
    }

    /// Receive the next message, requiring the given type
    pub async fn expect_type(&mut self, kind: &str) -> Result<Value> {
        let msg = self.recv_json_timeout(Duration::from_secs(2)).await?;
        if msg["type"] != kind {
            bail!("expected '{}' message, got {}", kind, msg);
        }
        Ok(msg)
    }

    /// Succeeds when nothing arrives within `timeout`
    pub async fn expect_silence(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.recv_json()).await {
            Ok(Ok(msg)) => bail!("expected no message, got {}", msg),
            _ => Ok(()),
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}
