// src/connection/client.rs

//! Defines `ClientConnection`, the exclusive owner of one live socket.

use crate::core::RelayError;
use crate::core::protocol::{Message, MessageCodec};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

type Reader = FramedRead<OwnedReadHalf, MessageCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

/// How long one queued send may sit in the transport before the recipient is
/// considered stalled and torn down.
const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One live, framed chat connection. No other component touches the raw
/// socket. Reads are sequential (one read loop per connection). Server-side
/// delivery goes through `post_message` and the per-connection outbound loop;
/// `send_message` writes directly and serializes on the writer lock. Identity
/// is the `id`, never the username.
pub struct ClientConnection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    /// Last sender name observed in any message from this connection. Read by
    /// logging/formatting from other threads, hence the lock.
    last_username: Mutex<Option<String>>,
    reader: AsyncMutex<Option<Reader>>,
    writer: AsyncMutex<Option<Writer>>,
    /// Server-side delivery queue, drained in FIFO order by `run_outbound`.
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Wakes a read suspended in `read_message` when `disconnect` is called
    /// from another task.
    kill_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ClientConnection {
    pub fn new(id: u64, stream: TcpStream) -> Self {
        // The endpoint is optional; a socket in a weird state may not report one.
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (kill_tx, _) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id,
            peer_addr,
            last_username: Mutex::new(None),
            reader: AsyncMutex::new(Some(FramedRead::new(read_half, MessageCodec))),
            writer: AsyncMutex::new(Some(FramedWrite::new(write_half, MessageCodec))),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            kill_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Client-side constructor: dials a relay server. The same type serves
    /// both ends of the wire.
    pub async fn connect(host: &str, port: u16) -> Result<Self, RelayError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(0, stream))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_username(&self) -> Option<String> {
        self.last_username.lock().clone()
    }

    pub fn set_last_username(&self, name: &str) {
        let mut slot = self.last_username.lock();
        if slot.as_deref() != Some(name) {
            *slot = Some(name.to_string());
        }
    }

    /// Sends one framed message. Fails with `Disconnected` once the
    /// connection has been torn down or the transport errors.
    pub async fn send_message(&self, message: &Message) -> Result<(), RelayError> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(RelayError::Disconnected { cause: None });
        };
        writer
            .send(message.clone())
            .await
            .map_err(RelayError::into_disconnected)
    }

    /// Queues one message for this connection's outbound loop. Never waits on
    /// the transport, so the caller is insulated from a recipient that has
    /// stopped reading. Fails with `Disconnected` once the connection has
    /// been torn down.
    pub fn post_message(&self, message: Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Disconnected { cause: None });
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| RelayError::Disconnected { cause: None })
    }

    /// Drains the outbound queue onto the socket in posting order. Runs as a
    /// dedicated per-connection task: a recipient whose socket stops draining
    /// stalls only this loop, and is disconnected once a single send exceeds
    /// `SEND_STALL_TIMEOUT`.
    pub async fn run_outbound(self: Arc<Self>) {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            return;
        };
        // Subscribe before checking the flag so a `disconnect` racing this
        // startup cannot leave the loop parked on an empty queue.
        let mut kill_rx = self.kill_tx.subscribe();
        if self.is_closed() {
            return;
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = kill_rx.recv() => return,
                message = outbound_rx.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            // The kill arm also covers a send in flight: `disconnect` must
            // not wait out a stalled write to take the writer lock.
            tokio::select! {
                biased;
                _ = kill_rx.recv() => return,
                res = tokio::time::timeout(SEND_STALL_TIMEOUT, self.send_message(&message)) => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            if !e.is_clean_disconnect() {
                                warn!("failed to deliver message to {self}: {e}");
                            }
                            self.disconnect().await;
                            return;
                        }
                        Err(_) => {
                            warn!("{self} stalled for {SEND_STALL_TIMEOUT:?}, disconnecting");
                            self.disconnect().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Reads the next complete message, suspending until a full frame is
    /// available. Never returns a partial message: it fails atomically
    /// (`Disconnected`, carrying the transport error when one exists) or
    /// returns a complete one.
    pub async fn read_message(&self) -> Result<Message, RelayError> {
        // Subscribe before checking the flag so a concurrent `disconnect`
        // cannot slip between the check and the select.
        let mut kill_rx = self.kill_tx.subscribe();
        if self.is_closed() {
            return Err(RelayError::Disconnected { cause: None });
        }
        let mut reader = self.reader.lock().await;
        let Some(reader) = reader.as_mut() else {
            return Err(RelayError::Disconnected { cause: None });
        };

        tokio::select! {
            biased;
            _ = kill_rx.recv() => Err(RelayError::Disconnected { cause: None }),
            frame = reader.next() => match frame {
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(e.into_disconnected()),
                // Clean end-of-stream.
                None => Err(RelayError::Disconnected { cause: None }),
            },
        }
    }

    /// Idempotent teardown. Safe to call from any task, including
    /// concurrently with this connection's own read loop tearing down: a read
    /// suspended in `read_message` is woken by the kill signal, which releases
    /// the reader lock taken below.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.kill_tx.send(());

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        // Dropping the read half closes the socket fully.
        self.reader.lock().await.take();
        debug!("{self} closed");
    }
}

impl fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_username.lock().as_deref() {
            Some(username) => write!(f, "'{username}'")?,
            None => write!(f, "client")?,
        }
        match self.peer_addr {
            Some(addr) => write!(f, "@{addr}"),
            None => write!(f, "@<unknown>"),
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("last_username", &self.last_username.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}
