//! Remote execution server.
//!
//! Binds an endpoint and keeps exactly one listener pending at all times:
//! whenever a listener accepts a connection it queues its own replacement
//! before serving that connection. Each connection runs in its own task and
//! handles one framed command at a time.
//!
//! # Shutdown
//!
//! Queuing a listener takes the read side of the `active` lock; shutdown takes
//! the write side once to clear the flag, so no listener can be queued after
//! shutdown has begun. Shutdown then fires the cancellation token, which every
//! pending accept, read, and write observes, and waits (bounded) for the
//! tracked connection tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::protocol::{encode_response, read_frame, write_frame, CommandEnvelope};
use super::transport::{Channel, ChannelListener, Endpoint};
use crate::cancel::CancellationToken;
use crate::config::{IpcConfig, ServerConfig};
use crate::error::Result;
use crate::value::Value;

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Written back to the client; `Value::Null` means "no value".
    pub response: Value,
    /// Tear the connection down once the response is flushed.
    pub close_connection: bool,
}

impl DispatchOutcome {
    pub fn respond(response: Value) -> Self {
        Self {
            response,
            close_connection: false,
        }
    }

    pub fn empty() -> Self {
        Self::respond(Value::Null)
    }

    pub fn close() -> Self {
        Self {
            response: Value::Null,
            close_connection: true,
        }
    }
}

/// Executes decoded commands for the server.
///
/// Implementations must not fail: every fault becomes an empty response.
#[async_trait::async_trait]
pub trait CommandDispatch: Send + Sync + 'static {
    async fn dispatch(&self, envelope: CommandEnvelope) -> DispatchOutcome;
}

/// State shared by the handle and every listener task.
struct ServerState {
    active: RwLock<bool>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    connections: AtomicUsize,
    max_connections: usize,
    shutdown_timeout: Duration,
}

/// Handle to a running server. Dropping it stops the server without waiting.
pub struct ServerHandle {
    endpoint: Endpoint,
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Endpoint clients connect to (with the real port for TCP).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        *self.state.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Stop accepting, cancel in-flight I/O, and wait for connection tasks.
    ///
    /// Tasks still running after the configured timeout are aborted. Calling
    /// this more than once is harmless.
    pub async fn shutdown(&self) {
        {
            let mut active = self.state.active.write().unwrap_or_else(PoisonError::into_inner);
            if !*active {
                return;
            }
            *active = false;
        }
        self.state.cancel.cancel();

        let mut tasks = std::mem::take(
            &mut *self.state.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let timeout = self.state.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!("Connection task panicked: {}", e);
                    }
                }
            }
        })
        .await;

        match drained {
            Ok(()) => info!("Server on {} stopped", self.endpoint),
            Err(_) => {
                warn!(
                    "{} connection task(s) still running after {:?}; abandoning them",
                    tasks.len(),
                    timeout
                );
                tasks.abort_all();
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        *self.state.active.write().unwrap_or_else(PoisonError::into_inner) = false;
        self.state.cancel.cancel();
    }
}

/// Entry point for starting servers.
pub struct RemoteExecutionServer;

impl RemoteExecutionServer {
    /// Bind the configured endpoint and queue the first listener.
    pub async fn start<D: CommandDispatch>(config: ServerConfig, dispatch: Arc<D>) -> Result<ServerHandle> {
        let listener = ChannelListener::bind(&config.endpoint).await?;
        let endpoint = listener.local_endpoint(&config.endpoint)?;

        let state = Arc::new(ServerState {
            active: RwLock::new(true),
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
            connections: AtomicUsize::new(0),
            max_connections: config.max_connections,
            shutdown_timeout: config.shutdown_timeout,
        });

        let acceptor = Arc::new(Acceptor {
            listener,
            dispatch,
            state: Arc::clone(&state),
        });
        Acceptor::queue_listener(&acceptor);

        info!("Remote execution server listening on {}", endpoint);
        Ok(ServerHandle { endpoint, state })
    }
}

struct Acceptor<D> {
    listener: ChannelListener,
    dispatch: Arc<D>,
    state: Arc<ServerState>,
}

impl<D: CommandDispatch> Acceptor<D> {
    /// Spawn one pending listener unless shutdown has begun.
    fn queue_listener(this: &Arc<Self>) {
        let active = this.state.active.read().unwrap_or_else(PoisonError::into_inner);
        if !*active {
            debug!("Server inactive; not queuing a listener");
            return;
        }

        let mut tasks = this.state.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    warn!("Connection task panicked: {}", e);
                }
            }
        }
        tasks.spawn(Self::listen(Arc::clone(this)));
    }

    async fn listen(this: Arc<Self>) {
        let accepted = tokio::select! {
            _ = this.state.cancel.cancelled() => return,
            result = this.listener.accept() => result,
        };

        let (channel, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::select! {
                    _ = this.state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(IpcConfig::ACCEPT_RETRY_DELAY) => {}
                }
                Self::queue_listener(&this);
                return;
            }
        };

        Self::queue_listener(&this);

        let current = this.state.connections.fetch_add(1, Ordering::SeqCst);
        if current >= this.state.max_connections {
            this.state.connections.fetch_sub(1, Ordering::SeqCst);
            warn!(
                "Rejecting connection from {}: at max capacity ({})",
                peer, this.state.max_connections
            );
            return;
        }

        debug!("Connection from {}", peer);
        if let Err(e) = this.serve(channel).await {
            debug!("Connection {} ended: {}", peer, e);
        }
        this.state.connections.fetch_sub(1, Ordering::SeqCst);
    }

    async fn serve(&self, mut channel: Channel) -> Result<()> {
        let cancel = &self.state.cancel;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = read_frame(&mut channel) => match result? {
                    Some(frame) => frame,
                    None => return Ok(()), // Clean disconnect
                },
            };

            let envelope = match CommandEnvelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping message: {}", e);
                    continue;
                }
            };
            debug!(
                "Dispatching {:?} {}",
                envelope.kind,
                envelope.member_name.as_deref().unwrap_or("")
            );

            let outcome = self.dispatch.dispatch(envelope).await;
            let response = response_frame(&outcome.response)?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = write_frame(&mut channel, &response) => result?,
            }

            if outcome.close_connection {
                let _ = channel.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Encode a response, degrading to "no value" when it cannot be framed.
fn response_frame(response: &Value) -> Result<Vec<u8>> {
    match encode_response(response) {
        Ok(bytes) if bytes.len() <= IpcConfig::MAX_MESSAGE_SIZE => Ok(bytes),
        Ok(bytes) => {
            warn!(
                "Response of {} bytes exceeds the {} byte frame limit; answering with no value",
                bytes.len(),
                IpcConfig::MAX_MESSAGE_SIZE
            );
            encode_response(&Value::Null)
        }
        Err(e) => {
            warn!("Failed to encode response: {}; answering with no value", e);
            encode_response(&Value::Null)
        }
    }
}
