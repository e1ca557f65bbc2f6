//! Client side of a channel.
//!
//! A `ChannelClient` owns one connection and performs strictly one-in-one-out
//! exchanges: write a command frame, then wait for exactly one response.

use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::protocol::{decode_response, read_frame, write_frame, CommandEnvelope};
use super::transport::{self, Channel, Endpoint};
use crate::config::IpcConfig;
use crate::error::{RemexError, Result};
use crate::handle::ObjectHandle;
use crate::value::Value;

/// One open connection to a remote execution server.
pub struct ChannelClient {
    channel: Channel,
    endpoint: Endpoint,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    /// Connect to a server.
    ///
    /// Uses the connection timeout from `IpcConfig`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let lost = || RemexError::ConnectionLost {
            endpoint: endpoint.to_string(),
        };

        let channel = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, transport::connect(endpoint))
            .await
            .map_err(|_| lost())?
            .map_err(|e| match e {
                RemexError::Io { .. } => lost(),
                other => other,
            })?;

        debug!("Connected to {}", endpoint);

        Ok(Self {
            channel,
            endpoint: endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one command and wait for its response.
    ///
    /// Channel failures surface as `ConnectionLost`; an unreadable response
    /// document surfaces as the decoding error.
    ///
    /// Not cancel-safe: once the request is written, a dropped future leaves
    /// its response unread on the channel. Discard the client in that case.
    pub async fn call(&mut self, envelope: &CommandEnvelope) -> Result<Value> {
        let request = envelope.encode()?;

        write_frame(&mut self.channel, &request)
            .await
            .map_err(|_| self.lost())?;

        let response = read_frame(&mut self.channel)
            .await
            .map_err(|_| self.lost())?
            .ok_or_else(|| self.lost())?;

        decode_response(&response)
    }

    /// Release `handle` on the server and close the channel.
    ///
    /// Waits at most `IpcConfig::CLOSE_ACK_TIMEOUT` for the acknowledgement;
    /// the channel is closed whether or not it arrives.
    pub async fn close(mut self, handle: ObjectHandle) {
        if !handle.is_sentinel() {
            let acknowledged = tokio::time::timeout(
                IpcConfig::CLOSE_ACK_TIMEOUT,
                self.call(&CommandEnvelope::close_connection(handle)),
            )
            .await;
            match acknowledged {
                Ok(Ok(_)) => debug!("Server acknowledged release of {}", handle),
                Ok(Err(e)) => debug!("Release of {} not acknowledged: {}", handle, e),
                Err(_) => debug!(
                    "Release of {} not acknowledged within {:?}",
                    handle,
                    IpcConfig::CLOSE_ACK_TIMEOUT
                ),
            }
        }
        let _ = self.channel.shutdown().await;
    }

    fn lost(&self) -> RemexError {
        RemexError::ConnectionLost {
            endpoint: self.endpoint.to_string(),
        }
    }
}
