// Engine link: one TCP connection with CRLF framing and a single reader task.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ENGINE_LINE_TERMINATOR, MAX_ENGINE_LINE_BYTES};
use crate::error::EngineError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Decoded inbound lines, consumed only by the reader task.
pub type LineReader = FramedRead<BoxedReader, EngineLineCodec>;

/// Splits the engine's byte stream on `\n`.
///
/// Bytes that are not UTF-8 are replaced rather than rejected, and a line
/// longer than the limit is dropped up to its terminator. Neither ends the
/// stream; only I/O errors do.
pub struct EngineLineCodec {
    inner: AnyDelimiterCodec,
}

impl EngineLineCodec {
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
        }
    }

    fn convert(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Option<String>>, io::Error> {
        match result {
            Ok(Some(chunk)) => {
                let line = String::from_utf8_lossy(&chunk);
                Ok(Some(Some(line.trim_end_matches('\r').to_string())))
            }
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                warn!("dropping over-long engine line");
                Ok(Some(None))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Default for EngineLineCodec {
    fn default() -> Self {
        Self::new_with_max_length(MAX_ENGINE_LINE_BYTES)
    }
}

impl Decoder for EngineLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            match Self::convert(self.inner.decode(buf))? {
                Some(Some(line)) => return Ok(Some(line)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            match Self::convert(self.inner.decode_eof(buf))? {
                Some(Some(line)) => return Ok(Some(line)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

/// Receives every line read from the engine, in arrival order.
#[async_trait]
pub trait LineHandler: Send + Sync + 'static {
    async fn on_line(&self, line: String);

    /// Called once when the reader stops, for whatever reason.
    async fn on_closed(&self);
}

pub struct EngineLink {
    writer: Mutex<Option<BoxedWriter>>,
    alive: AtomicBool,
    stop: CancellationToken,
}

impl EngineLink {
    /// Connect to the engine control port.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
    ) -> Result<(Arc<Self>, LineReader), EngineError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::Transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| {
                EngineError::Transport(format!("connect to {} failed (engine not running?): {}", addr, e))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        info!("connected to engine at {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established bidirectional stream.
    pub fn from_stream<S>(stream: S) -> (Arc<Self>, LineReader)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            Box::new(read_half) as BoxedReader,
            EngineLineCodec::default(),
        );
        let link = Arc::new(Self {
            writer: Mutex::new(Some(Box::new(write_half))),
            alive: AtomicBool::new(true),
            stop: CancellationToken::new(),
        });
        (link, reader)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Write `line` followed by the protocol terminator.
    pub async fn send(&self, line: &str) -> Result<(), EngineError> {
        if !self.is_alive() {
            return Err(EngineError::Transport("engine link is closed".to_string()));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| EngineError::Transport("engine link is closed".to_string()))?;

        let mut frame = String::with_capacity(line.len() + ENGINE_LINE_TERMINATOR.len());
        frame.push_str(line);
        frame.push_str(ENGINE_LINE_TERMINATOR);

        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.mark_dead();
            return Err(EngineError::Transport(format!("write failed: {}", e)));
        }
        debug!(line, "engine <<");
        Ok(())
    }

    /// Stop the reader and close the write side. Idempotent.
    pub async fn close(&self) {
        self.mark_dead();
        self.stop.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("engine link shutdown: {}", e);
            }
        }
    }

    /// Spawn the single reader task that feeds `handler` until EOF, a read
    /// error, or [`close`](Self::close).
    pub fn spawn_reader<H: LineHandler>(
        self: &Arc<Self>,
        mut reader: LineReader,
        handler: Arc<H>,
    ) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = link.stop.cancelled() => break,
                    next = reader.next() => next,
                };
                match next {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        handler.on_line(line.to_string()).await;
                    }
                    Some(Err(e)) => {
                        if !link.stop.is_cancelled() {
                            warn!("engine read failed: {}", e);
                        }
                        break;
                    }
                    None => {
                        debug!("engine closed the control connection");
                        break;
                    }
                }
                if link.stop.is_cancelled() {
                    break;
                }
            }
            link.mark_dead();
            handler.on_closed().await;
        })
    }

    pub(crate) fn cancel_reader(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[derive(Default)]
    struct Recorder {
        lines: SyncMutex<Vec<String>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl LineHandler for Recorder {
        async fn on_line(&self, line: String) {
            self.lines.lock().push(line);
        }

        async fn on_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_appends_crlf() {
        let (client, server) = tokio::io::duplex(1024);
        let (link, _reader) = EngineLink::from_stream(client);
        link.send("HELLOBG version=3").await.unwrap();

        let mut server = BufReader::new(server);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "HELLOBG version=3\r\n");
    }

    #[tokio::test]
    async fn test_reader_forwards_lines_until_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (link, reader) = EngineLink::from_stream(client);
        let recorder = Arc::new(Recorder::default());
        let task = link.spawn_reader(reader, Arc::clone(&recorder));

        server.write_all(b"HELLOTS key=1\r\n\r\nAUTH 1\r\n").await.unwrap();
        drop(server);
        task.await.unwrap();

        assert_eq!(*recorder.lines.lock(), vec!["HELLOTS key=1", "AUTH 1"]);
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(!link.is_alive());
        assert!(matches!(
            link.send("READY").await,
            Err(EngineError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_survives_undecodable_line() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (link, reader) = EngineLink::from_stream(client);
        let recorder = Arc::new(Recorder::default());
        let task = link.spawn_reader(reader, Arc::clone(&recorder));

        server
            .write_all(b"EVENT showdialog text=\xff\xfe\r\nSTART http://127.0.0.1:6878/content/x\r\n")
            .await
            .unwrap();
        drop(server);
        task.await.unwrap();

        let lines = recorder.lines.lock().clone();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("EVENT showdialog text="));
        assert_eq!(lines[1], "START http://127.0.0.1:6878/content/x");
    }

    #[test]
    fn test_codec_drops_over_long_line() {
        let mut codec = EngineLineCodec::new_with_max_length(8);
        let mut buf = BytesMut::from(&b"STATE 2 with far too much text\r\nAUTH 1\r\nPAU"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("AUTH 1"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"SE\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PAUSE"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_stops_reader() {
        let (client, _server) = tokio::io::duplex(1024);
        let (link, reader) = EngineLink::from_stream(client);
        let recorder = Arc::new(Recorder::default());
        let task = link.spawn_reader(reader, Arc::clone(&recorder));

        link.close().await;
        task.await.unwrap();
        assert!(recorder.closed.load(Ordering::SeqCst));
        link.close().await;
    }
}
