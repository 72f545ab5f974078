//! TCP transport and replication listener

use super::codec::{read_frame, read_message, write_message, Frame};
use super::Transport;
use crate::replication::protocol::{ReplicationMessage, ReplicationReply};
use crate::replication::Receiver;
use crate::types::Destination;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Opens a connection per exchange
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        destination: &Destination,
        message: ReplicationMessage,
    ) -> Result<ReplicationReply> {
        let mut stream = TcpStream::connect(&destination.address)
            .await
            .map_err(|e| {
                Error::ReplicationUnavailable(format!("connect {}: {}", destination.address, e))
            })?;
        stream.set_nodelay(true)?;

        write_message(&mut stream, &message)
            .await
            .map_err(|e| Error::ReplicationUnavailable(format!("send to {}: {}", destination, e)))?;

        match read_message::<_, ReplicationReply>(&mut stream).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::ReplicationUnavailable(format!(
                "{} closed the connection",
                destination
            ))),
            Err(e) => Err(Error::ReplicationUnavailable(format!(
                "reply from {}: {}",
                destination, e
            ))),
        }
    }
}

/// Accepts replication connections and hands messages to a receiver
pub struct ReplicationListener {
    listener: TcpListener,
    receiver: Arc<Receiver>,
}

impl ReplicationListener {
    pub async fn bind(address: &str, receiver: Arc<Receiver>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, receiver })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let local = self.listener.local_addr().ok();
        tracing::info!(address = ?local, "Replication listener started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let receiver = Arc::clone(&self.receiver);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, receiver).await {
                                    tracing::debug!(peer = %peer, error = %e, "Replication connection closed");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        tracing::info!(address = ?local, "Replication listener stopped");
    }
}

async fn handle_connection(mut stream: TcpStream, receiver: Arc<Receiver>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let reply = match frame.decode::<ReplicationMessage>() {
            Ok(message) => receiver.handle(message).await,
            Err(e) => receiver.reject_undecodable(&e),
        };
        write_message(&mut stream, &reply).await?;
        // The unread payload leaves the stream out of step with frame boundaries
        if matches!(frame, Frame::Oversized(_)) {
            break;
        }
    }
    Ok(())
}
