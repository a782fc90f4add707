use std::{
    fmt, io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::debug;

use crate::error::ConnectionError;

/// Stable identifier handed out once per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticipantId(u64);

impl ParticipantId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client {}", self.0)
    }
}

/// Monotonic id source. Ids start at 1 and are never reused within a process.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ParticipantId {
        ParticipantId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound on shutting down the write half during [`Participant::close`].
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// One connected client as seen by everyone except its own read loop.
///
/// The write half lives behind an async mutex so concurrent broadcasts never
/// interleave partial writes on the wire. Closing is a one-shot signal: it
/// shuts the write half down and wakes the owning read loop, and every call
/// after the first is a no-op.
pub struct Participant {
    id: ParticipantId,
    peer: Option<SocketAddr>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Participant {
    pub fn new<W>(id: ParticipantId, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer,
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes the whole payload, holding this participant's send lock for the
    /// duration so another broadcast cannot split it.
    ///
    /// A peer that stops reading cannot stall the caller: if the lock and the
    /// write together take longer than `limit` the send fails with `TimedOut`,
    /// and a concurrent [`Participant::close`] aborts it with `NotConnected`.
    pub async fn send(&self, payload: &[u8], limit: Duration) -> Result<(), ConnectionError> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            writer.write_all(payload).await?;
            writer.flush().await
        };

        let outcome = select! {
            biased;
            _ = self.closed() => Err(io::Error::from(io::ErrorKind::NotConnected)),
            written = timeout(limit, write) => {
                written.unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut)))
            }
        };
        outcome.map_err(|source| self.send_error(source))
    }

    /// Returns `true` only for the call that actually closed the participant.
    ///
    /// The close flag is raised before taking the send lock, so a send stuck
    /// on a full socket gives the lock up instead of holding close hostage.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(id = %self.id, ?error, "write half did not shut down cleanly")
                }
                Err(_) => debug!(id = %self.id, "write half shutdown timed out"),
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Participant::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn send_error(&self, source: io::Error) -> ConnectionError {
        ConnectionError::Send {
            id: self.id,
            source,
        }
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
