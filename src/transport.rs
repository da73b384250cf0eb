use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Largest frame a server may send (16 MB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames waiting to be written to one server before new ones are dropped
pub const WRITE_QUEUE_LEN: usize = 256;

pub type ConnectionId = u64;

/// One raw message received from a connected server
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub connection: ConnectionId,
    pub bytes: Vec<u8>,
}

/// The network side of the relay as seen from the tick thread.
pub trait Transport: Send {
    /// Everything received since the last call, in arrival order. Never waits.
    fn poll(&mut self) -> Result<Vec<Frame>>;

    /// Send to every connected server, best-effort.
    fn broadcast(&mut self, bytes: &[u8]) -> Result<()>;

    /// Send to every connected server except `origin`.
    fn broadcast_except(&mut self, origin: ConnectionId, bytes: &[u8]) -> Result<()>;
}

enum TransportEvent {
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
        writer: mpsc::Sender<Bytes>,
    },
    Frame(Frame),
    Disconnected {
        id: ConnectionId,
    },
}

struct Connection {
    addr: SocketAddr,
    writer: mpsc::Sender<Bytes>,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Length-delimited TCP server.
///
/// Socket I/O runs on the tokio runtime; the connection table lives here and
/// is only touched by whoever owns the transport.
pub struct TcpTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connections: HashMap<ConnectionId, Connection>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind on all interfaces. Must be called from within the runtime.
    pub async fn bind(port: u16, backlog: u32) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = TcpSocket::new_v4().context("Failed to create TCP socket")?;
        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind TCP port {}", port))?;
        let listener = socket
            .listen(backlog)
            .with_context(|| format!("Failed to listen on port {}", port))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, tx));

        info!("Listening for game servers on {} (backlog {})", local_addr, backlog);
        Ok(Self {
            events: rx,
            connections: HashMap::new(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue `bytes` for every connection except `origin`. Never waits; a
    /// server whose queue is full misses the frame. Returns how many missed it.
    fn send_to_all(&self, origin: Option<ConnectionId>, bytes: &[u8]) -> usize {
        let bytes = Bytes::copy_from_slice(bytes);
        let mut dropped = 0;
        for (&id, connection) in &self.connections {
            if Some(id) == origin {
                continue;
            }
            match connection.writer.try_send(bytes.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Connection {} ({}) is not keeping up, dropping frame",
                        id, connection.addr
                    );
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Connection {} ({}) already closed", id, connection.addr);
                }
            }
        }
        dropped
    }
}

impl Transport for TcpTransport {
    fn poll(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(TransportEvent::Connected { id, addr, writer }) => {
                    self.connections.insert(id, Connection { addr, writer });
                    info!(
                        "Game server connected from {} (connection {}, {} total)",
                        addr,
                        id,
                        self.connection_count()
                    );
                }
                Ok(TransportEvent::Frame(frame)) => frames.push(frame),
                Ok(TransportEvent::Disconnected { id }) => {
                    if let Some(connection) = self.connections.remove(&id) {
                        info!(
                            "Game server disconnected from {} (connection {})",
                            connection.addr, id
                        );
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    anyhow::bail!("TCP listener on {} has stopped", self.local_addr)
                }
            }
        }
        Ok(frames)
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_to_all(None, bytes);
        Ok(())
    }

    fn broadcast_except(&mut self, origin: ConnectionId, bytes: &[u8]) -> Result<()> {
        self.send_to_all(Some(origin), bytes);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<TransportEvent>) {
    let mut next_id: ConnectionId = 1;
    while !events.is_closed() {
        match listener.accept().await {
            Ok((stream, addr)) => {
                spawn_connection(next_id, stream, addr, events.clone());
                next_id += 1;
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn spawn_connection(
    id: ConnectionId,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_LEN);

    if events
        .send(TransportEvent::Connected {
            id,
            addr,
            writer: writer_tx,
        })
        .is_err()
    {
        return;
    }

    // Ends once the connection is dropped from the table.
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, codec());
        while let Some(bytes) = writer_rx.recv().await {
            if let Err(e) = sink.send(bytes).await {
                warn!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut stream = FramedRead::new(read_half, codec());
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(bytes) => {
                    let frame = Frame {
                        connection: id,
                        bytes: bytes.to_vec(),
                    };
                    if events.send(TransportEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", addr, e);
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Disconnected { id });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Framed;

    async fn connect(transport: &TcpTransport) -> Framed<TcpStream, LengthDelimitedCodec> {
        let addr = SocketAddr::from(([127, 0, 0, 1], transport.local_addr().port()));
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, LengthDelimitedCodec::new())
    }

    async fn wait_for_connections(transport: &mut TcpTransport, count: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        for _ in 0..200 {
            frames.extend(transport.poll().unwrap());
            if transport.connection_count() == count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connections", count);
    }

    async fn poll_frames(transport: &mut TcpTransport, count: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        for _ in 0..200 {
            frames.extend(transport.poll().unwrap());
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} frames, got {}", count, frames.len());
    }

    async fn next_frame(client: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_poll_returns_frames_in_order() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        let mut client = connect(&transport).await;

        for payload in ["first", "second", "third"] {
            client.send(Bytes::from(payload)).await.unwrap();
        }

        let frames = poll_frames(&mut transport, 3).await;
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.bytes.as_slice()).collect();
        assert_eq!(payloads, vec![&b"first"[..], &b"second"[..], &b"third"[..]]);
        assert!(frames.iter().all(|f| f.connection == frames[0].connection));
    }

    #[tokio::test]
    async fn test_poll_is_empty_without_traffic() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        assert!(transport.poll().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        let mut a = connect(&transport).await;
        let mut b = connect(&transport).await;
        wait_for_connections(&mut transport, 2).await;

        transport.broadcast(b"hello servers").unwrap();

        assert_eq!(next_frame(&mut a).await, b"hello servers");
        assert_eq!(next_frame(&mut b).await, b"hello servers");
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_origin() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        let mut a = connect(&transport).await;
        let mut b = connect(&transport).await;
        wait_for_connections(&mut transport, 2).await;

        a.send(Bytes::from_static(b"from a")).await.unwrap();
        let frames = poll_frames(&mut transport, 1).await;
        let origin = frames[0].connection;

        transport.broadcast_except(origin, b"relayed").unwrap();
        transport.broadcast(b"to all").unwrap();

        assert_eq!(next_frame(&mut b).await, b"relayed");
        assert_eq!(next_frame(&mut b).await, b"to all");
        // a only sees the second broadcast
        assert_eq!(next_frame(&mut a).await, b"to all");
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        let client = connect(&transport).await;
        wait_for_connections(&mut transport, 1).await;

        drop(client);
        wait_for_connections(&mut transport, 0).await;
        transport.broadcast(b"nobody listening").unwrap();
    }

    #[tokio::test]
    async fn test_stalled_connection_drops_frames_instead_of_queueing() {
        let mut transport = TcpTransport::bind(0, 16).await.unwrap();
        // Never reads what it is sent
        let _idle = connect(&transport).await;
        wait_for_connections(&mut transport, 1).await;

        // No await in between, so the writer task cannot drain the queue
        let dropped: usize = (0..WRITE_QUEUE_LEN + 10)
            .map(|_| transport.send_to_all(None, b"tick update"))
            .sum();

        assert_eq!(dropped, 10);
        assert_eq!(transport.connection_count(), 1);
        transport.broadcast(b"still fine").unwrap();
    }
}
