//! WebSocket transport
//!
//! Concrete [`DuplexTransport`] over `tokio-tungstenite`. A reader task
//! forwards inbound frames to the session's event channel; the writer half
//! is shared behind an async mutex for serialized sends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::traits::{DuplexTransport, TransportEvent};
use crate::TransportError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket implementation of the duplex channel
pub struct WebSocketTransport {
    writer: Arc<Mutex<Option<WsSink>>>,
    event_tx: Option<mpsc::Sender<TransportEvent>>,
    reader_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            event_tx: None,
            reader_task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DuplexTransport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (sink, mut source) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let event_tx = self.event_tx.clone();
        let connected = Arc::clone(&self.connected);

        // Reader task: forward text frames, answer pings at the protocol
        // level, and report the close reason exactly once.
        self.reader_task = Some(tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ref tx) = event_tx {
                            if tx.send(TransportEvent::Message(text)).await.is_err() {
                                break "event channel closed".to_string();
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(Ok(_)) => {} // binary/ping/pong handled by tungstenite
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };

            connected.store(false, Ordering::SeqCst);
            if let Some(ref tx) = event_tx {
                let _ = tx.send(TransportEvent::Disconnected { reason }).await;
            }
        }));

        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(TransportEvent::Connected).await;
        }

        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text))
                .await
                .map_err(|e| TransportError::Send(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_callback(&mut self, tx: mpsc::Sender<TransportEvent>) {
        self.event_tx = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = WebSocketTransport::new();
        let err = transport.send("hello".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let transport = WebSocketTransport::new();
        assert!(!transport.is_connected());
    }
}
