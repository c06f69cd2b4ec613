// Scripted in-process engine for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use ace_gateway::engine::{EngineSession, SessionOptions};
use ace_gateway::error::EngineError;
use ace_gateway::relay::EngineConnector;

/// How the fake engine answers the gateway.
#[derive(Clone)]
pub struct Script {
    /// Answer READY with AUTH.
    pub authenticate: bool,
    /// Lines sent back for every START.
    pub start_replies: Vec<String>,
    /// Answer LOADASYNC with a matching LOADRESP.
    pub answer_load: bool,
}

impl Script {
    pub fn serving(url: &str) -> Self {
        Self {
            authenticate: true,
            start_replies: vec![
                "STATUS main:starting".to_string(),
                format!("START {url} stream=1"),
            ],
            answer_load: true,
        }
    }

    pub fn silent_start() -> Self {
        Self {
            authenticate: true,
            start_replies: Vec::new(),
            answer_load: true,
        }
    }
}

pub struct FakeEngine {
    received: Arc<Mutex<Vec<String>>>,
    push_tx: mpsc::UnboundedSender<String>,
}

impl FakeEngine {
    pub fn spawn<S>(stream: S, script: Script) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            let mut lines = FramedRead::new(reader, LinesCodec::new());
            loop {
                let replies = tokio::select! {
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            log.lock().push(line.clone());
                            replies_for(&line, &script)
                        }
                        _ => break,
                    },
                    pushed = push_rx.recv() => match pushed {
                        Some(line) => vec![line],
                        None => break,
                    },
                };
                for reply in replies {
                    if writer.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
                let _ = writer.flush().await;
            }
        });

        Self { received, push_tx }
    }

    /// A session wired to a fresh fake engine.
    pub fn session(script: Script, options: SessionOptions) -> (Arc<EngineSession>, FakeEngine) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let engine = FakeEngine::spawn(server, script);
        (EngineSession::from_stream(client, options), engine)
    }

    /// Send an unsolicited line to the gateway.
    pub fn push(&self, line: &str) {
        let _ = self.push_tx.send(line.to_string());
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Poll until a received line starts with `prefix`.
    pub async fn wait_for(&self, prefix: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.received.lock().iter().any(|l| l.starts_with(prefix)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn replies_for(line: &str, script: &Script) -> Vec<String> {
    let mut words = line.split_whitespace();
    match words.next().unwrap_or_default() {
        "HELLOBG" => vec!["HELLOTS version=3.1.16 key=0a1b2c".to_string()],
        "READY" if script.authenticate => vec!["AUTH 1".to_string()],
        "READY" => vec!["NOTREADY".to_string()],
        "LOADASYNC" if script.answer_load => {
            let tag = words.next().unwrap_or_default();
            vec![format!(r#"LOADRESP {tag} {{"status": 1, "files": [["stream", 0]]}}"#)]
        }
        "START" => script.start_replies.clone(),
        "SHUTDOWN" => vec!["SHUTDOWN".to_string()],
        _ => Vec::new(),
    }
}

/// Hands out sessions backed by fake engines and keeps them for inspection.
pub struct FakeConnector {
    script: Script,
    connects: AtomicUsize,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            connects: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn engine(&self, index: usize) -> Option<Arc<FakeEngine>> {
        self.engines.lock().get(index).cloned()
    }
}

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<EngineSession>, EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (session, engine) = FakeEngine::session(self.script.clone(), SessionOptions::default());
        self.engines.lock().push(Arc::new(engine));
        Ok(session)
    }
}
