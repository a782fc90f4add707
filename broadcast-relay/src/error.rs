use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::participant::ParticipantId;

/// Failures that stop the relay as a whole. None of these are retried.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to create listening socket")]
    Socket(#[source] io::Error),

    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr} (backlog {backlog})")]
    Listen {
        addr: SocketAddr,
        backlog: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection")]
    Accept(#[source] io::Error),

    #[error("log sink {} is unavailable", .path.display())]
    SinkUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures scoped to a single participant. They end that participant's
/// session and never reach the listener.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read from {id} failed ({})", .source.kind())]
    Read {
        id: ParticipantId,
        #[source]
        source: io::Error,
    },

    #[error("send to {id} failed ({})", .source.kind())]
    Send {
        id: ParticipantId,
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            ConnectionError::Read { source, .. } | ConnectionError::Send { source, .. } => {
                source.kind()
            }
        }
    }
}
