//! TCP Proxy Listener
//!
//! Host adapter that turns every accepted TCP connection into a proxied
//! stream flow for the [`ProxyProvider`].
//!
//! ```text
//! client ──TCP──▶ TcpProxyListener (127.0.0.1:8899) ──TcpFlow──▶ ProxyProvider
//! ```
//!
//! Packet enforcement belongs to the platform; the listener only observes
//! what clients send.

use crate::error::ProviderError;
use crate::proxy::{ProxyFlow, ProxyProvider, ReadEvent, Transport};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Listen address (usually 127.0.0.1)
    pub listen_addr: SocketAddr,
    /// Read buffer size per flow
    pub read_buffer: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8899)),
            read_buffer: 16 * 1024,
        }
    }
}

/// An accepted TCP connection read as a proxied flow
pub struct TcpFlow {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl TcpFlow {
    pub fn new(stream: TcpStream, peer: SocketAddr, read_buffer: usize) -> Self {
        Self {
            stream,
            peer,
            buf: vec![0u8; read_buffer.max(1)],
        }
    }
}

impl ProxyFlow for TcpFlow {
    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }

    async fn open(&mut self) -> io::Result<()> {
        self.stream.set_nodelay(true)
    }

    async fn read(&mut self) -> io::Result<ReadEvent> {
        match self.stream.read(&mut self.buf).await? {
            0 => Ok(ReadEvent::Closed),
            n => Ok(ReadEvent::Chunk(self.buf[..n].to_vec())),
        }
    }
}

/// TCP front end of the proxy provider
pub struct TcpProxyListener {
    config: ListenerConfig,
    provider: Arc<ProxyProvider>,
    listener: Option<TcpListener>,
}

impl TcpProxyListener {
    pub fn new(config: ListenerConfig, provider: Arc<ProxyProvider>) -> Self {
        Self {
            config,
            provider,
            listener: None,
        }
    }

    /// Bind the listen address. Returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr, ProviderError> {
        info!("Starting proxy listener on {}", self.config.listen_addr);

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| ProviderError::Bind(e.to_string()))?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);

        info!("Proxy listener bound to {}", addr);
        Ok(addr)
    }

    /// Accept connections until the provider stops. Returns at once when
    /// the provider isn't running.
    pub async fn run(&self) -> Result<(), ProviderError> {
        let listener = match &self.listener {
            Some(l) => l,
            None => return Err(ProviderError::NotBound),
        };
        let mut signal = self.provider.run_signal();

        loop {
            if signal.is_cancelled() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Proxy connection from {}", peer);
                        let flow = TcpFlow::new(stream, peer, self.config.read_buffer);
                        if let Err(e) = self.provider.handle_new_flow(flow).await {
                            warn!("Dropping connection from {}: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
                _ = signal.cancelled() => break,
            }
        }

        info!("Proxy listener stopped");
        Ok(())
    }
}
