//! Connection seam
//!
//! The transport and encryption layer lives outside the session. It is
//! reached through these traits: a `Connector` establishes a connection to an
//! endpoint and hands back the outgoing half plus a channel of inbound frames.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ConnectionError, MessageCenterResult};
use crate::job::JobProgress;
use crate::protocol::{Inbound, ProtocolRequest};
use crate::types::{ServerEndpoint, TransactionId};

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Create the channel a connection uses to deliver inbound frames
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Outgoing half of an established server connection
#[async_trait]
pub trait Connection: Send {
    /// Send a request, returning the transaction id the server will answer with
    async fn send(&mut self, request: ProtocolRequest) -> Result<TransactionId, ConnectionError>;

    /// Upload binary content, reporting progress between chunks
    ///
    /// The returned transaction id doubles as the file reference of the
    /// uploaded content. Progress reporting fails with `Cancelled` once the
    /// job is cancelled, aborting the upload.
    async fn upload(
        &mut self,
        mime: &str,
        content: &[u8],
        progress: &mut JobProgress<'_>,
    ) -> MessageCenterResult<TransactionId> {
        for chunk in content.chunks(progress.chunk_size()) {
            progress.advance(chunk.len() as u64)?;
        }
        let tx_id = self
            .send(ProtocolRequest::Upload {
                mime: mime.to_owned(),
                content: content.to_vec(),
            })
            .await?;
        Ok(tx_id)
    }

    fn is_connected(&self) -> bool;

    /// Release the connection
    async fn close(&mut self);
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// An established connection and its inbound frame stream
pub struct ConnectedSession {
    pub connection: Box<dyn Connection>,
    pub inbound: InboundReceiver,
}

/// Establishes connections to the messaging server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the endpoint; fails with an error when it is unreachable
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<ConnectedSession, ConnectionError>;
}
