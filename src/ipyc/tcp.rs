//! TCP loopback channel: same shape as the Unix socket substrate but
//! network-capable, for platforms or deployments where Unix sockets are
//! unavailable. The master binds an ephemeral loopback port.

use super::{Connector, DuplexChannel, Ipyc};
use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Master end of a TCP loopback channel.
pub struct TcpIpyc {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpIpyc {
    /// Bind an ephemeral port on the loopback interface.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TwinError::Process(format!("bind tcp loopback: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TwinError::Process(format!("resolve tcp address: {e}")))?;
        debug!(%addr, "bound ipyc tcp listener");
        Ok(Self { listener, addr })
    }
}

#[async_trait]
impl Ipyc for TcpIpyc {
    async fn open(self: Box<Self>) -> Result<DuplexChannel> {
        let accept = tokio::time::timeout(ACCEPT_TIMEOUT, self.listener.accept());
        let (stream, peer) = match accept.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(super::map_channel_error(e)),
            Err(_) => {
                return Err(TwinError::Process(format!(
                    "twin did not connect to {} within {:?}",
                    self.addr, ACCEPT_TIMEOUT
                )))
            }
        };
        debug!(%peer, "accepted twin connection");
        Ok(split(stream))
    }

    fn connector(&self) -> Connector {
        Connector::Tcp { addr: self.addr }
    }
}

/// Child-side connect for [`Connector::Tcp`].
pub(super) async fn connect(addr: SocketAddr) -> Result<DuplexChannel> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TwinError::Process(format!("connect {addr}: {e}")))?;
    debug!(%addr, "connected to master tcp endpoint");
    Ok(split(stream))
}

fn split(stream: TcpStream) -> DuplexChannel {
    // Kernel messages are small and latency-bound.
    let _ = stream.set_nodelay(true);
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
    async fn tcp_ends_rendezvous_and_frame() {
        let endpoint = Box::new(TcpIpyc::bind().await.unwrap());
        let connector = endpoint.connector();

        let child = tokio::spawn(async move { connector.connect().await.unwrap() });
        let master = endpoint.open().await.unwrap();
        let child = child.await.unwrap();

        let (mut mr, _mw) = master.into_framed();
        let (_cr, mut cw) = child.into_framed();
        cw.write_frame(b"pong").await.unwrap();
        assert_eq!(mr.read_frame().await.unwrap(), b"pong");
    }
}
