//! Unix domain socket channel: the default substrate for master/twin
//! pairs on the same host. The master binds a private socket in the
//! system temp directory; the child connects via the connector path.

use super::{Connector, DuplexChannel, Ipyc};
use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long the master waits for the freshly spawned twin to connect.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Master end of a Unix socket channel.
pub struct UnixSocketIpyc {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixSocketIpyc {
    /// Bind a fresh socket under a private, collision-free temp path.
    pub fn bind() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("twinterp-{}.sock", Uuid::new_v4()));
        // The listener registers with whichever reactor is current; fall
        // back to the kernel runtime when called from a plain thread.
        let listener = match tokio::runtime::Handle::try_current() {
            Ok(_) => UnixListener::bind(&path),
            Err(_) => {
                let _guard = crate::state::runtime().enter();
                UnixListener::bind(&path)
            }
        }
        .map_err(|e| TwinError::Process(format!("bind {}: {e}", path.display())))?;
        debug!(path = %path.display(), "bound ipyc socket");
        Ok(Self { listener, path })
    }
}

#[async_trait]
impl Ipyc for UnixSocketIpyc {
    async fn open(self: Box<Self>) -> Result<DuplexChannel> {
        let accept = tokio::time::timeout(ACCEPT_TIMEOUT, self.listener.accept());
        let (stream, _addr) = match accept.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(super::map_channel_error(e)),
            Err(_) => {
                return Err(TwinError::Process(format!(
                    "twin did not connect to {} within {:?}",
                    self.path.display(),
                    ACCEPT_TIMEOUT
                )))
            }
        };
        debug!(path = %self.path.display(), "accepted twin connection");
        // The rendezvous file has served its purpose once both ends hold
        // the stream.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove socket file: {e}");
            }
        }
        Ok(split(stream))
    }

    fn connector(&self) -> Connector {
        Connector::UnixSocket {
            path: self.path.clone(),
        }
    }
}

/// Child-side connect for [`Connector::UnixSocket`].
pub(super) async fn connect(path: &Path) -> Result<DuplexChannel> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| TwinError::Process(format!("connect {}: {e}", path.display())))?;
    debug!(path = %path.display(), "connected to master socket");
    Ok(split(stream))
}

fn split(stream: UnixStream) -> DuplexChannel {
    let (reader, writer) = stream.into_split();
    DuplexChannel {
        reader: Box::new(reader),
        writer: Box::new(writer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_and_child_ends_rendezvous() {
        let endpoint = Box::new(UnixSocketIpyc::bind().unwrap());
        let connector = endpoint.connector();

        let child = tokio::spawn(async move { connector.connect().await.unwrap() });
        let master = endpoint.open().await.unwrap();
        let child = child.await.unwrap();

        let (_mr, mut mw) = master.into_framed();
        let (mut cr, _cw) = child.into_framed();
        mw.write_frame(b"ping").await.unwrap();
        assert_eq!(cr.read_frame().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn socket_file_is_removed_after_accept() {
        let endpoint = Box::new(UnixSocketIpyc::bind().unwrap());
        let connector = endpoint.connector();
        let path = match &connector {
            Connector::UnixSocket { path } => path.clone(),
            _ => unreachable!(),
        };
        let child = tokio::spawn(async move { connector.connect().await.unwrap() });
        let _master = endpoint.open().await.unwrap();
        let _child = child.await.unwrap();
        assert!(!path.exists());
    }
}
