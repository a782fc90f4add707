use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket},
    select,
    task::{JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    registry::Registry,
    relay::{DEFAULT_SEND_TIMEOUT, Relay, Termination},
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKLOG: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    /// A delivery that takes longer than this evicts its target.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: DEFAULT_BACKLOG,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Accept loop. Owns the listening socket and one task per connection.
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Builds the listening socket by hand so the backlog and `SO_REUSEADDR`
    /// can be set. Must be called from within a Tokio runtime.
    pub fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let socket = match config.listen {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(RelayError::Socket)?;
        socket.set_reuseaddr(true).map_err(RelayError::Socket)?;

        socket
            .bind(config.listen)
            .map_err(|source| RelayError::Bind {
                addr: config.listen,
                source,
            })?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|source| RelayError::Listen {
                addr: config.listen,
                backlog: config.backlog,
                source,
            })?;

        let relay = Relay::with_send_timeout(Arc::new(Registry::new()), config.send_timeout);
        Ok(Self {
            listener,
            relay: Arc::new(relay),
        })
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new(Arc::new(Registry::new()))),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.relay.registry())
    }

    /// Accepts until `shutdown` resolves or accepting fails, then ends every
    /// session and waits for all of them before returning.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, relay } = self;
        let mut sessions = JoinSet::new();

        let outcome = accept_loop(&relay, &mut sessions, || listener.accept(), shutdown).await;

        drop(listener);
        drain_sessions(&relay, sessions).await;
        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Spawns a session per accepted stream and reaps finished ones. Returns on
/// shutdown, or with [`RelayError::Accept`] on the first accept failure.
async fn accept_loop<A, Fut, S, F>(
    relay: &Arc<Relay>,
    sessions: &mut JoinSet<Termination>,
    mut accept: A,
    shutdown: F,
) -> Result<(), RelayError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => {
                info!("relay shutting down");
                return Ok(());
            }
            accepted = accept() => match accepted {
                Ok((stream, peer)) => spawn_session(sessions, relay, stream, peer),
                Err(source) => {
                    let error = RelayError::Accept(source);
                    warn!(error = ?error, "accept loop stopped");
                    return Err(error);
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                log_session_result(finished);
            }
        }
    }
}

fn spawn_session<S>(
    sessions: &mut JoinSet<Termination>,
    relay: &Arc<Relay>,
    stream: S,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!(%peer, "New client connected.");
    let relay = Arc::clone(relay);
    sessions.spawn(async move {
        let (reader, writer) = tokio::io::split(stream);
        relay.serve(reader, writer, Some(peer)).await
    });
}

async fn drain_sessions(relay: &Relay, mut sessions: JoinSet<Termination>) {
    relay.shutdown();
    if !sessions.is_empty() {
        info!(sessions = sessions.len(), "waiting for sessions to close");
    }
    while let Some(finished) = sessions.join_next().await {
        log_session_result(finished);
    }
}

fn log_session_result(result: Result<Termination, JoinError>) {
    match result {
        Ok(termination) => debug!(?termination, "session finished"),
        Err(error) => warn!(error = ?error, "session task failed"),
    }
}
