//! One-blob TCP file server.
//!
//! Targets often need a payload pushed at them (a script, a key, a
//! tarball). The server loads the content once — from a local path or by
//! fetching it from a `host:port` origin — and writes the cached bytes to
//! every connection. Serving is deliberately dumb: no protocol, no
//! ranges, connect-and-receive.

use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failures constructing or running the file server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid bind address: {0}")]
    BindAddress(String),
    #[error("failed to load {origin}: {source}")]
    Origin {
        origin: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept TCP connection: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to write a response: {0}")]
    ConnWrite(#[source] io::Error),
}

/// Serves one in-memory blob to every TCP connection.
#[derive(Debug)]
pub struct FileServer {
    bind_address: String,
    content: Arc<Vec<u8>>,
}

impl FileServer {
    /// Validate the bind address and load the content.
    ///
    /// An `origin` that parses as `host:port` is fetched over TCP;
    /// anything else is read as a local file. The whole content is cached
    /// in memory, so keep served files small.
    pub async fn new(origin: &str, bind_address: &str) -> Result<Self, ServeError> {
        if !is_host_port(bind_address) {
            return Err(ServeError::BindAddress(bind_address.to_string()));
        }

        let content = if is_host_port(origin) {
            fetch(origin).await
        } else {
            tokio::fs::read(origin).await
        }
        .map_err(|source| ServeError::Origin {
            origin: origin.to_string(),
            source,
        })?;

        Ok(Self {
            bind_address: bind_address.to_string(),
            content: Arc::new(content),
        })
    }

    /// Size of the cached content in bytes.
    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    /// Bind and start the accept loop.
    ///
    /// Returns the bound address and the error channel. An accept failure
    /// is fatal and ends the loop; a per-connection write failure is
    /// reported and serving continues. The loop also ends when `scope`
    /// trips.
    pub async fn serve(
        &self,
        scope: CancellationToken,
    ) -> Result<(std::net::SocketAddr, mpsc::Receiver<ServeError>), ServeError> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.bind_address.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServeError::Bind {
            addr: self.bind_address.clone(),
            source,
        })?;

        debug!(%addr, bytes = self.content.len(), "serving file");

        let (tx, rx) = mpsc::channel(1);
        let content = self.content.clone();

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = scope.cancelled() => return,
                    conn = listener.accept() => conn,
                };

                match conn {
                    Err(err) => {
                        let _ = tx.send(ServeError::Accept(err)).await;
                        return;
                    }
                    Ok((mut stream, _peer)) => {
                        let content = content.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = stream.write_all(&content).await {
                                let _ = tx.send(ServeError::ConnWrite(err)).await;
                            }
                        });
                    }
                }
            }
        });

        Ok((addr, rx))
    }
}

/// Pull the whole content from a remote `host:port` origin.
async fn fetch(origin: &str) -> io::Result<Vec<u8>> {
    let mut conn = TcpStream::connect(origin).await?;
    let mut content = Vec::new();
    conn.read_to_end(&mut content).await?;
    Ok(content)
}

fn is_host_port(addr: &str) -> bool {
    addr.to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}
