//! # Interpreter Channel (IPyC) Abstraction
//!
//! A kernel pair communicates over two private duplex byte channels. The
//! master end constructs the underlying resource (Unix socket or TCP
//! loopback socket) and hands the child a serializable [`Connector`]
//! sufficient to reconstruct the peer end after exec.
//!
//! The runtime core is transport-agnostic: it consumes an open channel as
//! a pair of byte-stream halves and layers strict length-prefix framing
//! on top (see [`framing`]). Endpoints are single-owner: exactly one task
//! reads from the reader half and writes to the writer half at a time;
//! the kernel client and server enforce this above.

use crate::error::{Result, TwinError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod framing;
pub mod socket;
pub mod tcp;

pub use framing::{FramedReader, FramedWriter};
pub use socket::UnixSocketIpyc;
pub use tcp::TcpIpyc;

/// Reader half of an open duplex channel.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
/// Writer half of an open duplex channel.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// An open duplex byte channel, already split into its two halves.
pub struct DuplexChannel {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl DuplexChannel {
    /// Wrap framing around the raw halves.
    pub fn into_framed(self) -> (FramedReader, FramedWriter) {
        (FramedReader::new(self.reader), FramedWriter::new(self.writer))
    }
}

/// Serializable descriptor from which the child process reconstructs its
/// end of a channel. Crosses the process boundary base64-encoded on the
/// bootstrap command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Connector {
    UnixSocket { path: PathBuf },
    Tcp { addr: SocketAddr },
}

impl Connector {
    /// Connect the child end of the channel described by this connector.
    pub async fn connect(&self) -> Result<DuplexChannel> {
        match self {
            Connector::UnixSocket { path } => socket::connect(path).await,
            Connector::Tcp { addr } => tcp::connect(*addr).await,
        }
    }
}

/// Master-side channel endpoint: owns the listening resource and accepts
/// exactly one peer.
#[async_trait]
pub trait Ipyc: Send {
    /// Accept the peer and return the open channel. Consumes the listener
    /// so each endpoint is opened at most once.
    async fn open(self: Box<Self>) -> Result<DuplexChannel>;

    /// Descriptor the child uses to connect its end.
    fn connector(&self) -> Connector;
}

/// Translate common socket teardown errors into the terminated-channel
/// signal; everything else stays an i/o error.
pub(crate) fn map_channel_error(err: std::io::Error) -> TwinError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => TwinError::ChannelTerminated,
        _ => TwinError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_round_trips_through_bincode() {
        let connector = Connector::UnixSocket {
            path: PathBuf::from("/tmp/twinterp-test.sock"),
        };
        let bytes = bincode::serialize(&connector).unwrap();
        let back: Connector = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, connector);
    }

    #[test]
    fn teardown_errors_map_to_terminated() {
        use std::io::{Error, ErrorKind};
        assert!(matches!(
            map_channel_error(Error::new(ErrorKind::BrokenPipe, "gone")),
            TwinError::ChannelTerminated
        ));
        assert!(matches!(
            map_channel_error(Error::new(ErrorKind::PermissionDenied, "no")),
            TwinError::Io(_)
        ));
    }
}
