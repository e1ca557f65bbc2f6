//! Client-side proxy for a server-resident object.
//!
//! A `RemoteProxy` owns one lazily opened channel. Every operation sends one
//! command and waits for its single response, so operations on one proxy
//! never interleave. An operation abandoned mid-exchange (its future dropped)
//! takes the channel with it; the next operation opens a fresh one.
//!
//! ```no_run
//! use remex_core::{remote_args, Endpoint, RemoteProxy};
//!
//! # async fn example() -> remex_core::Result<()> {
//! let endpoint = Endpoint::named("MyRemoteServer");
//! let list = RemoteProxy::create(
//!     endpoint,
//!     "System.Collections.Generic.List`1[[System.Int32]]",
//!     remote_args![5],
//! )
//! .await?;
//! list.invoke::<()>("Add", remote_args![3]).await?;
//! let count: i32 = list.get_property("Count").await?;
//! assert_eq!(count, 1);
//! list.close().await;
//! # Ok(())
//! # }
//! ```

use tokio::sync::Mutex;
use tracing::debug;

use crate::descriptor::TypeDescriptor;
use crate::error::{RemexError, Result};
use crate::handle::ObjectHandle;
use crate::ipc::client::ChannelClient;
use crate::ipc::protocol::CommandEnvelope;
use crate::ipc::transport::Endpoint;
use crate::value::{FromValue, IntoValue, Value};

/// Handle-holding stand-in for a remote object.
pub struct RemoteProxy {
    endpoint: Endpoint,
    handle: ObjectHandle,
    descriptor: Option<TypeDescriptor>,
    client: Mutex<Option<ChannelClient>>,
    closed: bool,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("endpoint", &self.endpoint)
            .field("handle", &self.handle)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl RemoteProxy {
    /// A proxy without an object, for static members only.
    pub fn detached(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            handle: ObjectHandle::SENTINEL,
            descriptor: None,
            client: Mutex::new(None),
            closed: false,
        }
    }

    /// Construct a new remote instance of `descriptor`.
    ///
    /// Fails with `Construction` when the server could not build the object.
    pub async fn create(
        endpoint: Endpoint,
        descriptor: impl Into<TypeDescriptor>,
        args: Vec<Value>,
    ) -> Result<Self> {
        let descriptor = descriptor.into();
        let mut proxy = Self::detached(endpoint);

        let response = proxy
            .call(CommandEnvelope::new_object(descriptor.clone(), args))
            .await?;
        if response.is_null() {
            return Err(RemexError::Construction {
                type_name: descriptor.to_string(),
                message: "server returned no handle".to_string(),
            });
        }

        proxy.handle = ObjectHandle::from_value(response)?;
        proxy.descriptor = Some(descriptor);
        debug!("Created remote {} as {}", proxy.type_name(), proxy.handle);
        Ok(proxy)
    }

    /// Attach to an object created elsewhere, adding a reference to it.
    pub async fn attach(endpoint: Endpoint, handle: ObjectHandle) -> Result<Self> {
        let mut proxy = Self::detached(endpoint);
        let response = proxy.call(CommandEnvelope::retrieve_object(handle)).await?;
        let descriptor = match response {
            Value::Null => return Err(RemexError::ObjectNotFound(handle)),
            other => TypeDescriptor::from_value(other)?,
        };

        proxy.handle = handle;
        proxy.descriptor = Some(descriptor);
        debug!("Attached to remote {} {}", proxy.type_name(), handle);
        Ok(proxy)
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Type of the remote object, when the proxy holds one.
    pub fn descriptor(&self) -> Option<&TypeDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn invoke<R: FromValue>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let handle = self.require_object()?;
        let response = self.call(CommandEnvelope::invoke(handle, method, args)).await?;
        R::from_value(response)
    }

    pub async fn invoke_static<R: FromValue>(
        &self,
        descriptor: impl Into<TypeDescriptor>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R> {
        let envelope = CommandEnvelope::invoke_static(descriptor.into(), method, args);
        R::from_value(self.call(envelope).await?)
    }

    pub async fn get_property<R: FromValue>(&self, property: &str) -> Result<R> {
        let handle = self.require_object()?;
        let response = self.call(CommandEnvelope::get_property(handle, property)).await?;
        R::from_value(response)
    }

    pub async fn get_static_property<R: FromValue>(
        &self,
        descriptor: impl Into<TypeDescriptor>,
        property: &str,
    ) -> Result<R> {
        let envelope = CommandEnvelope::get_static_property(descriptor.into(), property);
        R::from_value(self.call(envelope).await?)
    }

    pub async fn set_property(&self, property: &str, value: impl IntoValue) -> Result<()> {
        let handle = self.require_object()?;
        self.call(CommandEnvelope::set_property(handle, property, value.into_value()))
            .await?;
        Ok(())
    }

    /// Release the remote object and close the channel.
    pub async fn close(mut self) {
        self.closed = true;
        let client = self.client.get_mut().take();
        release(self.endpoint.clone(), client, self.handle).await;
    }

    async fn call(&self, envelope: CommandEnvelope) -> Result<Value> {
        let mut guard = self.client.lock().await;
        // Owned for the exchange and put back only once it completes.
        let mut client = match guard.take() {
            Some(client) => client,
            None => ChannelClient::connect(&self.endpoint).await?,
        };

        let result = client.call(&envelope).await;
        match &result {
            Err(e) if e.is_channel_fault() => debug!("Dropping channel to {}: {}", self.endpoint, e),
            _ => *guard = Some(client),
        }
        result
    }

    fn require_object(&self) -> Result<ObjectHandle> {
        if self.handle.is_sentinel() {
            return Err(RemexError::ObjectNotFound(self.handle));
        }
        Ok(self.handle)
    }

    fn type_name(&self) -> &str {
        self.descriptor.as_ref().map_or("object", TypeDescriptor::as_str)
    }
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        if self.closed || self.handle.is_sentinel() {
            return;
        }
        let client = self.client.get_mut().take();
        let (endpoint, handle) = (self.endpoint.clone(), self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release(endpoint, client, handle));
            }
            Err(_) => debug!("No runtime to release {}; dropping the channel", handle),
        }
    }
}

/// Release `handle` over `client`, reconnecting when the channel was lost.
async fn release(endpoint: Endpoint, client: Option<ChannelClient>, handle: ObjectHandle) {
    let client = match client {
        Some(client) => client,
        None if handle.is_sentinel() => return,
        None => match ChannelClient::connect(&endpoint).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not reconnect to release {}: {}", handle, e);
                return;
            }
        },
    };
    client.close(handle).await;
}
