//! The WebSocket frame layer.
//!
//! Owns the raw WebSocket: the write half stays with [`FrameSocket`]; the
//! read half is pumped by a background task that reassembles length-prefixed
//! frames and hands complete payloads to an mpsc channel. The 4-byte
//! connection header rides in front of the first outgoing frame only.

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::binary::{frame_length, FRAME_MAX_SIZE};
use crate::binary::token::DICT_VERSION;
use crate::error::SocketError;

/// Magic prologue identifying the protocol revision.
pub const CONN_HEADER: [u8; 4] = [b'W', b'A', 6, DICT_VERSION];

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct FrameSocket {
    sink: WsSink,
    header_sent: bool,
    reader: JoinHandle<()>,
}

impl FrameSocket {
    /// Connects and starts the read pump. Received frame payloads (without
    /// the length prefix) arrive on the returned channel; the channel
    /// closes when the socket does.
    pub async fn connect(
        url: &str,
        origin: &str,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), SocketError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Origin",
            origin
                .parse()
                .map_err(|_| SocketError::ConnectionFailed("bad origin".into()))?,
        );

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
        let (sink, mut stream) = ws.split();

        let (frames_tx, frames_rx) = mpsc::channel(32);
        let reader = tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(message) = stream.next().await {
                let data = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                buffer.extend_from_slice(&data);
                loop {
                    if buffer.len() < 3 {
                        break;
                    }
                    let mut header = [0u8; 3];
                    header.copy_from_slice(&buffer[..3]);
                    let len = frame_length(&header);
                    if buffer.len() < len + 3 {
                        break;
                    }
                    let payload = buffer[3..len + 3].to_vec();
                    buffer.drain(..len + 3);
                    if frames_tx.send(payload).await.is_err() {
                        return;
                    }
                }
            }
            log::debug!(target: "Socket", "read pump finished");
        });

        Ok((
            Self {
                sink,
                header_sent: false,
                reader,
            },
            frames_rx,
        ))
    }

    /// Sends one frame: optional connection header, 3-byte length, payload.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        if payload.len() > FRAME_MAX_SIZE {
            return Err(SocketError::FrameTooLarge(payload.len()));
        }
        let header_len = if self.header_sent { 0 } else { CONN_HEADER.len() };
        let mut frame = Vec::with_capacity(header_len + 3 + payload.len());
        if !self.header_sent {
            frame.extend_from_slice(&CONN_HEADER);
            self.header_sent = true;
        }
        frame.push((payload.len() >> 16) as u8);
        frame.push((payload.len() >> 8) as u8);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);

        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))
    }

    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

impl Drop for FrameSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
