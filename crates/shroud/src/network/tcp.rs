use std::net::SocketAddr;

use futures::{future::BoxFuture, FutureExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

use super::{BoxConn, Network, PeerAddr};
use crate::error::Error;

/// Clearnet TCP, used on loopback by tests and for local swarms.
#[derive(Debug)]
pub struct TcpNetwork {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpNetwork {
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        debug!("listening on {local}");
        Ok(Self { listener, local })
    }
}

impl Network for TcpNetwork {
    fn dial<'a>(
        &'a self,
        addr: &'a PeerAddr,
    ) -> BoxFuture<'a, Result<BoxConn, Error>> {
        async move {
            let stream = TcpStream::connect(addr.0.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxConn)
        }
        .boxed()
    }

    fn accept(&self) -> BoxFuture<'_, Result<(BoxConn, PeerAddr), Error>> {
        async move {
            let (stream, remote) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as BoxConn, PeerAddr(remote.to_string())))
        }
        .boxed()
    }

    fn lookup<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<PeerAddr, Error>> {
        async move {
            let addr = lookup_host(name).await?.next().ok_or_else(|| {
                Error::IO(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{name} did not resolve"),
                ))
            })?;
            Ok(PeerAddr(addr.to_string()))
        }
        .boxed()
    }

    fn addr(&self) -> PeerAddr {
        PeerAddr(self.local.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept() {
        let net = TcpNetwork::bind("127.0.0.1:0").await.unwrap();
        let addr = net.addr();
        assert!(addr.port().is_some());

        let (dialed, accepted) = tokio::join!(net.dial(&addr), net.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _remote) = accepted.unwrap();

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let resolved = net.lookup(&addr.0).await.unwrap();
        assert_eq!(resolved, addr);
    }
}
