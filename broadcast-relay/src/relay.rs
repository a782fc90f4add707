use std::{borrow::Cow, fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    error::ConnectionError,
    participant::{IdSequence, Participant, ParticipantId},
    registry::Registry,
};

/// Upper bound on a single read; one read is relayed as one message.
pub const READ_BUFFER_SIZE: usize = 1024;

/// How long a single delivery may take before the target counts as gone.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a participant's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The peer shut down its write side.
    PeerClosed,
    /// Reading failed with a non-transient error.
    ReadFailed(io::ErrorKind),
    /// A failed or timed-out delivery to this participant closed it from
    /// another session.
    Evicted,
    /// The relay is shutting down.
    Shutdown,
}

/// A chunk received from one participant, about to be fanned out.
#[derive(Debug, Clone, Copy)]
pub struct RelayMessage<'a> {
    origin: ParticipantId,
    payload: &'a [u8],
}

impl<'a> RelayMessage<'a> {
    pub fn new(origin: ParticipantId, payload: &'a [u8]) -> Self {
        Self { origin, payload }
    }

    pub fn origin(&self) -> ParticipantId {
        self.origin
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Payload decoded for logging. Invalid UTF-8 is replaced, the bytes on the
    /// wire are not touched.
    pub fn text(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.payload)
    }
}

impl fmt::Display for RelayMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.text())
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ParticipantId>,
}

/// Per-connection lifecycle plus the shared fan-out path.
#[derive(Debug)]
pub struct Relay {
    registry: Arc<Registry>,
    ids: IdSequence,
    send_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(registry: Arc<Registry>, send_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            ids: IdSequence::new(),
            send_timeout,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs one participant from registration to teardown.
    ///
    /// The reader is owned exclusively by this call; the writer becomes the
    /// participant's shared send path. Teardown (deregister, then close) runs
    /// exactly once no matter how the read loop ended.
    pub async fn serve<R, W>(&self, reader: R, writer: W, peer: Option<SocketAddr>) -> Termination
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let participant = Arc::new(Participant::new(self.ids.next_id(), peer, writer));
        self.registry.register(Arc::clone(&participant)).await;
        info!(?peer, "{} registered.", participant.id());

        let termination = self.read_loop(&participant, reader).await;
        self.teardown(&participant, termination).await;
        termination
    }

    async fn read_loop<R>(&self, participant: &Participant, mut reader: R) -> Termination
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = select! {
                biased;
                _ = self.shutdown_requested() => return Termination::Shutdown,
                _ = participant.closed() => return Termination::Evicted,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => return Termination::PeerClosed,
                Ok(n) => {
                    let message = RelayMessage::new(participant.id(), &buf[..n]);
                    info!("{message}");
                    select! {
                        biased;
                        _ = self.shutdown_requested() => return Termination::Shutdown,
                        _ = self.broadcast(&message) => {}
                    }
                }
                Err(error) if is_transient(&error) => continue,
                Err(source) => {
                    let error = ConnectionError::Read {
                        id: participant.id(),
                        source,
                    };
                    warn!(kind = ?error.kind(), "{error}");
                    return Termination::ReadFailed(error.kind());
                }
            }
        }
    }

    async fn teardown(&self, participant: &Participant, termination: Termination) {
        let id = participant.id();
        self.registry.deregister(id).await;
        participant.close().await;

        match termination {
            Termination::PeerClosed => info!(peer = ?participant.peer(), "{id} disconnected."),
            Termination::ReadFailed(kind) => {
                info!(peer = ?participant.peer(), ?kind, "{id} dropped after read error.")
            }
            Termination::Evicted => debug!(peer = ?participant.peer(), "{id} evicted."),
            Termination::Shutdown => debug!(peer = ?participant.peer(), "{id} closed for shutdown."),
        }
    }

    /// Sends `message` to every registered participant except its origin.
    ///
    /// Works on a snapshot, so a participant that disconnects mid-fan-out simply
    /// fails its send. A failed send, including one that outlives the send
    /// timeout because the target stopped reading, removes and closes that
    /// target only.
    pub async fn broadcast(&self, message: &RelayMessage<'_>) -> BroadcastReport {
        let targets: Vec<Arc<Participant>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|target| target.id() != message.origin() && !target.is_closed())
            .collect();

        let outcomes = join_all(
            targets
                .iter()
                .map(|target| target.send(message.payload(), self.send_timeout)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(kind = ?error.kind(), "{} disconnected (send error).", target.id());
                    self.registry.deregister(target.id()).await;
                    target.close().await;
                    report.dropped.push(target.id());
                }
            }
        }

        debug!(
            origin = %message.origin(),
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "broadcast complete"
        );
        report
    }

    /// Ends every running session and makes sessions that start later end at
    /// once. Each session still tears itself down.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf},
        time::timeout,
    };

    use super::*;

    /// Writer whose every write fails, standing in for a dead peer.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reader that fails on first use.
    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    async fn join_with_duplex(relay: &Relay, raw: u64) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(1024);
        let participant = Participant::new(ParticipantId::new(raw), None, ours);
        relay.registry().register(Arc::new(participant)).await;
        theirs
    }

    async fn read_exactly(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for payload")
            .expect("read payload");
        buf
    }

    async fn assert_silent(stream: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
        assert!(result.is_err(), "expected no data, got {result:?}");
    }

    #[test]
    fn message_displays_origin_and_lossy_text() {
        let message = RelayMessage::new(ParticipantId::new(5), b"hi \xff");
        assert_eq!(message.to_string(), "Client 5: hi \u{fffd}");
        assert_eq!(message.payload(), b"hi \xff");
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_origin() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let mut a = join_with_duplex(&relay, 1).await;
        let mut b = join_with_duplex(&relay, 2).await;
        let mut c = join_with_duplex(&relay, 3).await;

        let report = relay
            .broadcast(&RelayMessage::new(ParticipantId::new(1), b"hello"))
            .await;

        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());
        assert_eq!(read_exactly(&mut b, 5).await, b"hello");
        assert_eq!(read_exactly(&mut c, 5).await, b"hello");
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn failed_send_drops_only_the_target() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let _a = join_with_duplex(&relay, 1).await;
        relay
            .registry()
            .register(Arc::new(Participant::new(ParticipantId::new(2), None, BrokenPipe)))
            .await;
        let mut c = join_with_duplex(&relay, 3).await;

        let report = relay
            .broadcast(&RelayMessage::new(ParticipantId::new(1), b"ping"))
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![ParticipantId::new(2)]);
        assert_eq!(read_exactly(&mut c, 4).await, b"ping");
        assert!(!relay.registry().contains(ParticipantId::new(2)).await);
        assert!(relay.registry().contains(ParticipantId::new(1)).await);
        assert_eq!(relay.registry().len().await, 2);
    }

    #[tokio::test]
    async fn half_close_ends_session_without_read_error() {
        let relay = Arc::new(Relay::new(Arc::new(Registry::new())));
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);

        let session = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.serve(reader, writer, None).await })
        };

        let (_client_reader, mut client_writer) = tokio::io::split(client);
        client_writer.shutdown().await.expect("half close");

        let termination = timeout(Duration::from_secs(1), session)
            .await
            .expect("session ended")
            .expect("session task");
        assert_eq!(termination, Termination::PeerClosed);
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn read_error_is_reported_with_its_kind() {
        let relay = Relay::new(Arc::new(Registry::new()));

        let termination = relay.serve(ResetReader, tokio::io::sink(), None).await;

        assert_eq!(
            termination,
            Termination::ReadFailed(io::ErrorKind::ConnectionReset)
        );
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_ends_running_sessions() {
        let relay = Arc::new(Relay::new(Arc::new(Registry::new())));
        let (mut client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);

        let session = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.serve(reader, writer, None).await })
        };

        while relay.registry().is_empty().await {
            tokio::task::yield_now().await;
        }
        relay.shutdown();
        assert!(relay.is_shutting_down());

        let termination = timeout(Duration::from_secs(1), session)
            .await
            .expect("session ended")
            .expect("session task");
        assert_eq!(termination, Termination::Shutdown);
        assert!(relay.registry().is_empty().await);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("client sees eof");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn target_that_stops_reading_is_evicted_without_stalling_others() {
        let relay = Relay::with_send_timeout(Arc::new(Registry::new()), Duration::from_millis(100));
        let _a = join_with_duplex(&relay, 1).await;
        // B's far end stays open but is never read, so its small buffer fills.
        let (stalled, _held_open) = tokio::io::duplex(8);
        relay
            .registry()
            .register(Arc::new(Participant::new(ParticipantId::new(2), None, stalled)))
            .await;
        let mut c = join_with_duplex(&relay, 3).await;

        let payload = [b'x'; 64];
        let report = timeout(
            Duration::from_secs(2),
            relay.broadcast(&RelayMessage::new(ParticipantId::new(1), &payload)),
        )
        .await
        .expect("broadcast must finish despite the stalled target");

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![ParticipantId::new(2)]);
        assert_eq!(read_exactly(&mut c, payload.len()).await, payload);
        assert!(!relay.registry().contains(ParticipantId::new(2)).await);

        let report = relay
            .broadcast(&RelayMessage::new(ParticipantId::new(1), b"next"))
            .await;
        assert_eq!(report.delivered, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(read_exactly(&mut c, 4).await, b"next");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_broadcasts_do_not_interleave_on_one_target() {
        const LEN: usize = 64 * 1024;

        let relay = Arc::new(Relay::new(Arc::new(Registry::new())));
        let (ours, mut target) = tokio::io::duplex(4096);
        relay
            .registry()
            .register(Arc::new(Participant::new(ParticipantId::new(3), None, ours)))
            .await;

        let reader = tokio::spawn(async move {
            let mut received = vec![0u8; 2 * LEN];
            target.read_exact(&mut received).await.map(|_| received)
        });

        let senders: Vec<_> = [(1, b'a'), (2, b'b')]
            .into_iter()
            .map(|(origin, byte)| {
                let relay = Arc::clone(&relay);
                tokio::spawn(async move {
                    let payload = vec![byte; LEN];
                    relay
                        .broadcast(&RelayMessage::new(ParticipantId::new(origin), &payload))
                        .await
                })
            })
            .collect();
        for sender in senders {
            let report = sender.await.expect("sender task");
            assert_eq!(report.delivered, 1);
        }

        let received = timeout(Duration::from_secs(5), reader)
            .await
            .expect("target read both payloads")
            .expect("reader task")
            .expect("read");
        let (first, second) = received.split_at(LEN);
        let a_then_b = first.iter().all(|&b| b == b'a') && second.iter().all(|&b| b == b'b');
        let b_then_a = first.iter().all(|&b| b == b'b') && second.iter().all(|&b| b == b'a');
        assert!(a_then_b || b_then_a, "payloads were interleaved on the wire");
    }
}
