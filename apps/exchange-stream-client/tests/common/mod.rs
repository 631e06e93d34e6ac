//! Scripted exchange server for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use exchange_stream_client::StreamEvent;

/// API key the default responder accepts.
pub const GOOD_KEY: &str = "good-key";

/// API key the default responder refuses with a bare message.
pub const MESSAGE_ONLY_KEY: &str = "message-only-key";

/// Instrument the default responder refuses to subscribe.
pub const REJECTED_PAIR: &str = "REJECT";

/// Replies produced for one client request.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

enum Command {
    Send(String),
    Close,
}

/// A local WebSocket server that answers requests through a [`Responder`]
/// and lets the test push frames or drop the connection.
pub struct MockExchange {
    pub url: String,
    commands: mpsc::UnboundedSender<Command>,
    requests: mpsc::UnboundedReceiver<Value>,
    _task: JoinHandle<()>,
}

impl MockExchange {
    /// Server with [`exchange_responder`].
    pub async fn start() -> Self {
        Self::with_responder(exchange_responder()).await
    }

    /// Server with a custom responder. Connections are served one at a time,
    /// so a client can reconnect after [`close`](Self::close).
    pub async fn with_responder(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let banner = json!({"event": "info", "version": 2}).to_string();
                let _ = ws.send(Message::Text(banner.into())).await;

                loop {
                    tokio::select! {
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                                    continue;
                                };
                                let _ = requests_tx.send(request.clone());
                                for reply in responder(&request) {
                                    let _ = ws.send(Message::Text(reply.into())).await;
                                }
                            }
                            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        command = commands_rx.recv() => match command {
                            Some(Command::Send(frame)) => {
                                let _ = ws.send(Message::Text(frame.into())).await;
                            }
                            Some(Command::Close) => {
                                let _ = ws.close(None).await;
                                break;
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            url,
            commands,
            requests,
            _task: task,
        }
    }

    /// Send a raw frame to the connected client.
    pub fn push(&self, frame: impl Into<String>) {
        self.commands.send(Command::Send(frame.into())).unwrap();
    }

    /// Close the current connection from the server side.
    pub fn close(&self) {
        self.commands.send(Command::Close).unwrap();
    }

    /// Next request the client sent.
    pub async fn next_request(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
            .await
            .expect("no request within 2s")
            .expect("server stopped")
    }

    /// Next request with the given `event` name, skipping others.
    pub async fn next_request_for(&mut self, event: &str) -> Value {
        loop {
            let request = self.next_request().await;
            if request["event"] == event {
                return request;
            }
        }
    }
}

/// Responder that behaves like the exchange: acks subscriptions with fresh
/// channel ids, checks the API key and answers pings.
pub fn exchange_responder() -> Responder {
    let next_id = Arc::new(AtomicU64::new(10));
    Arc::new(move |request| match request["event"].as_str() {
        Some("subscribe") => match request["args"].as_array() {
            Some(args) => args.iter().map(|arg| subscribed(arg, &next_id)).collect(),
            None if request["pair"] == REJECTED_PAIR => vec![
                json!({"event": "error", "msg": "symbol: invalid", "code": 10300}).to_string(),
            ],
            None => vec![subscribed(request, &next_id)],
        },
        Some("unsubscribe") => match request["args"].as_array() {
            Some(args) => args
                .iter()
                .map(|arg| {
                    let mut ack = arg.clone();
                    ack["event"] = json!("unsubscribed");
                    ack["status"] = json!("OK");
                    ack.to_string()
                })
                .collect(),
            None => vec![
                json!({"event": "unsubscribed", "status": "OK", "chanId": request["chanId"]})
                    .to_string(),
            ],
        },
        Some("auth") if request["apiKey"] == GOOD_KEY => {
            vec![json!({"event": "auth", "status": "OK", "userId": 42}).to_string()]
        }
        Some("auth") if request["apiKey"] == MESSAGE_ONLY_KEY => {
            vec![json!({"event": "auth", "msg": "apikey: invalid"}).to_string()]
        }
        Some("auth") => vec![
            json!({"event": "auth", "status": "FAILED", "msg": "apikey: invalid", "code": 10100})
                .to_string(),
        ],
        Some("ping") => vec![json!({"event": "pong", "cid": request["cid"]}).to_string()],
        _ => Vec::new(),
    })
}

/// Responder that never replies.
pub fn silent_responder() -> Responder {
    Arc::new(|_| Vec::new())
}

fn subscribed(args: &Value, next_id: &AtomicU64) -> String {
    let mut ack = args.clone();
    ack["event"] = json!("subscribed");
    ack["chanId"] = json!(next_id.fetch_add(1, Ordering::SeqCst));
    ack.to_string()
}

/// Next event within 2s.
pub async fn next_event(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .expect("event queue closed")
}

/// Poll `condition` every 10ms for up to 2s.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
