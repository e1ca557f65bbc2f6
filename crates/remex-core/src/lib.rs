//! Remex Core - create and drive objects that live in another process.
//!
//! A server process exposes a catalog of types. Clients hold `RemoteProxy`
//! values that forward construction, method calls, and property access over a
//! local channel. The server keeps each object alive in a reference-counted
//! registry until every proxy attached to it has closed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remex_core::{
//!     remote_args, Dispatcher, Endpoint, RemoteExecutionServer, RemoteProxy, ServerConfig,
//!     TypeCatalog,
//! };
//!
//! #[tokio::main]
//! async fn main() -> remex_core::Result<()> {
//!     let catalog = TypeCatalog::builder().with_prelude().build();
//!     let dispatcher = Arc::new(Dispatcher::from_catalog(catalog));
//!     let config = ServerConfig::new(Endpoint::named("MyRemoteServer"));
//!     let server = RemoteExecutionServer::start(config, dispatcher).await?;
//!
//!     let text = RemoteProxy::create(
//!         server.endpoint().clone(),
//!         "System.String",
//!         remote_args![vec!['H', 'i']],
//!     )
//!     .await?;
//!     let upper: String = text.invoke("ToUpper", remote_args![]).await?;
//!     println!("{}", upper);
//!
//!     text.close().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod coerce;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod ipc;
pub mod proxy;
pub mod reflect;
pub mod registry;
pub mod value;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use coerce::Coercion;
pub use config::{IpcConfig, ServerConfig};
pub use descriptor::{names, DescriptorCodec, TypeDescriptor};
pub use dispatch::Dispatcher;
pub use error::{RemexError, Result};
pub use handle::ObjectHandle;
pub use ipc::{
    ChannelClient, CommandDispatch, CommandEnvelope, CommandKind, DispatchOutcome, Endpoint,
    RemoteExecutionServer, ServerHandle,
};
pub use proxy::RemoteProxy;
pub use reflect::{MemberScope, Reflection, TypeCatalog, TypeDef, TypeEntry};
pub use registry::{ObjectRegistry, ReleaseOutcome};
pub use value::{FromValue, IntoValue, RemoteType, Structured, Value};
