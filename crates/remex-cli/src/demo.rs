//! Demo types and the scripted client session.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use remex_core::{
    names, remote_args, Endpoint, RemexError, RemoteProxy, TypeCatalog, TypeDef, TypeDescriptor,
    Value,
};
use tracing::info;

pub const MESSAGE_HOLDER: &str = "Remex.Demo.MessageHolder, remex-cli";

/// A small mutable object for clients to drive remotely.
#[derive(Debug)]
pub struct MessageHolder {
    name: String,
    max_length: u8,
    queue: VecDeque<String>,
}

impl MessageHolder {
    fn new(name: String) -> Self {
        Self {
            name,
            max_length: 64,
            queue: VecDeque::new(),
        }
    }

    fn add(&mut self, message: String) -> remex_core::Result<()> {
        if message.chars().count() > usize::from(self.max_length) {
            return Err(RemexError::invocation(
                "AddMessageToQueue",
                format!("message longer than {} characters", self.max_length),
            ));
        }
        self.queue.push_back(message);
        Ok(())
    }
}

/// Prelude types plus the demo's own.
pub fn catalog() -> TypeCatalog {
    TypeCatalog::builder()
        .with_prelude()
        .register(
            TypeDef::<MessageHolder>::new(MESSAGE_HOLDER)
                .constructor0(|| Ok(MessageHolder::new("unnamed".to_string())))
                .constructor1(|name: String| Ok(MessageHolder::new(name)))
                .property_mut(
                    "Name",
                    |m: &MessageHolder| m.name.clone(),
                    |m: &mut MessageHolder, name: String| {
                        m.name = name;
                        Ok(())
                    },
                )
                .property_mut(
                    "MaxLength",
                    |m: &MessageHolder| m.max_length,
                    |m: &mut MessageHolder, max: u8| {
                        m.max_length = max;
                        Ok(())
                    },
                )
                .property("QueueLength", |m: &MessageHolder| m.queue.len() as i32)
                .method1("AddMessageToQueue", |m: &mut MessageHolder, message: String| {
                    m.add(message)
                })
                .method0("RetrieveMessageFromQueue", |m: &mut MessageHolder| {
                    Ok(m.queue.pop_front())
                }),
        )
        .build()
}

/// Exercise the server the way a client application would.
pub async fn run_client(endpoint: Endpoint) -> Result<()> {
    info!("Running demo session against {}", endpoint);

    // List<int> with an initial capacity.
    let list = RemoteProxy::create(
        endpoint.clone(),
        TypeDescriptor::list_of(&TypeDescriptor::new(names::INT32)),
        remote_args![5],
    )
    .await
    .context("creating remote list")?;
    list.invoke::<()>("Add", remote_args![3]).await?;
    list.invoke::<()>("Add", remote_args![5]).await?;
    let index: i32 = list.invoke("IndexOf", remote_args![5]).await?;
    let count: i32 = list.get_property("Count").await?;
    println!("List<int>: IndexOf(5) = {}, Count = {}", index, count);
    list.close().await;

    // A string built from a char array.
    let chars: Vec<char> = "Hello".chars().collect();
    let text = RemoteProxy::create(endpoint.clone(), names::STRING, remote_args![chars])
        .await
        .context("creating remote string")?;
    let upper: String = text.invoke("ToUpper", remote_args![]).await?;
    let length: i32 = text.get_property("Length").await?;
    println!("String: {:?} has {} chars", upper, length);
    text.close().await;

    // A user-defined type, shared by two proxies.
    let holder = RemoteProxy::create(endpoint.clone(), MESSAGE_HOLDER, remote_args!["inbox"])
        .await
        .context("creating message holder")?;
    holder
        .invoke::<()>("AddMessageToQueue", remote_args!["first message"])
        .await?;

    let second = RemoteProxy::attach(endpoint.clone(), holder.handle()).await?;
    second
        .invoke::<()>("AddMessageToQueue", remote_args!["second message"])
        .await?;
    let queued: i32 = holder.get_property("QueueLength").await?;
    let name: String = second.get_property("Name").await?;
    println!("{} holds {} messages", name, queued);

    while let Some(message) = holder
        .invoke::<Option<String>>("RetrieveMessageFromQueue", remote_args![])
        .await?
    {
        println!("  dequeued {:?}", message);
    }
    second.close().await;
    holder.close().await;

    // Static members need no object.
    let statics = RemoteProxy::detached(endpoint);
    let max: f64 = statics
        .invoke_static(names::MATH, "Max", remote_args![2.5, 7.25])
        .await?;
    let now: Value = statics
        .get_static_property(names::DATE_TIME, "UtcNow")
        .await?;
    println!("Math.Max(2.5, 7.25) = {}; server time {}", max, now.to_json());
    statics.close().await;

    info!("Demo session finished");
    Ok(())
}
