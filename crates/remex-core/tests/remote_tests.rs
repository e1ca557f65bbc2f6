//! End-to-end tests: proxies talking to a live server over real channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use remex_core::ipc::protocol::{decode_response, read_frame, write_frame};
use remex_core::{
    names, remote_args, CommandEnvelope, Dispatcher, Endpoint, ObjectRegistry, RemexError,
    RemoteExecutionServer, RemoteProxy, ServerConfig, ServerHandle, TypeCatalog, TypeDef,
    TypeDescriptor, Value,
};

#[derive(Default)]
struct MessageHolder {
    name: String,
    max_length: u8,
    queue: VecDeque<String>,
}

const MESSAGE_HOLDER: &str = "Demo.MessageHolder, Demo";

/// Holds N = 7; `Slow` blocks for `SLOW_CALL` and then answers 999.
struct Sluggish {
    n: i32,
}

const SLUGGISH: &str = "Demo.Sluggish, Demo";
const SLOW_CALL: Duration = Duration::from_millis(400);

fn catalog() -> TypeCatalog {
    TypeCatalog::builder()
        .with_prelude()
        .register(
            TypeDef::<MessageHolder>::new(MESSAGE_HOLDER)
                .constructor0(|| {
                    Ok(MessageHolder {
                        max_length: 32,
                        ..MessageHolder::default()
                    })
                })
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
                .method1("AddMessageToQueue", |m: &mut MessageHolder, message: String| {
                    if message.len() > usize::from(m.max_length) {
                        return Err(RemexError::invocation("AddMessageToQueue", "message too long"));
                    }
                    m.queue.push_back(message);
                    Ok(())
                })
                .method0("RetrieveMessageFromQueue", |m: &mut MessageHolder| {
                    Ok(m.queue.pop_front())
                }),
        )
        .register(
            TypeDef::<Sluggish>::new(SLUGGISH)
                .constructor0(|| Ok(Sluggish { n: 7 }))
                .property("N", |s: &Sluggish| s.n)
                .method0("Slow", |_: &mut Sluggish| {
                    std::thread::sleep(SLOW_CALL);
                    Ok(999)
                }),
        )
        .build()
}

/// Start a loopback server, keeping the registry for inspection.
async fn start_server() -> (ServerHandle, Arc<ObjectRegistry>) {
    let dispatcher = Arc::new(Dispatcher::from_catalog(catalog()));
    let registry = Arc::clone(dispatcher.registry());
    let server = RemoteExecutionServer::start(ServerConfig::new(Endpoint::loopback()), dispatcher)
        .await
        .unwrap();
    (server, registry)
}

fn int_list() -> TypeDescriptor {
    TypeDescriptor::list_of(&TypeDescriptor::new(names::INT32))
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_remote_list_of_int() {
    let (server, _) = start_server().await;

    let list = RemoteProxy::create(server.endpoint().clone(), int_list(), remote_args![5])
        .await
        .unwrap();
    list.invoke::<()>("Add", remote_args![3]).await.unwrap();
    list.invoke::<()>("Add", remote_args![5]).await.unwrap();

    let index: i32 = list.invoke("IndexOf", remote_args![5]).await.unwrap();
    assert_eq!(index, 1);
    let count: i32 = list.get_property("Count").await.unwrap();
    assert_eq!(count, 2);
    let items: Vec<i32> = list.invoke("ToArray", remote_args![]).await.unwrap();
    assert_eq!(items, vec![3, 5]);

    list.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_string_from_chars() {
    let (server, _) = start_server().await;

    let chars: Vec<char> = "Hello".chars().collect();
    let text = RemoteProxy::create(server.endpoint().clone(), names::STRING, remote_args![chars])
        .await
        .unwrap();

    let rendered: String = text.invoke("ToString", remote_args![]).await.unwrap();
    assert_eq!(rendered, "Hello");
    let length: i32 = text.get_property("Length").await.unwrap();
    assert_eq!(length, 5);
    let found: bool = text.invoke("Contains", remote_args!["ell"]).await.unwrap();
    assert!(found);

    text.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let (server, _) = start_server().await;
    let addr = match server.endpoint() {
        Endpoint::Tcp(addr) => *addr,
        other => panic!("expected a TCP endpoint, got {}", other),
    };

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, b"{ this is not a command").await.unwrap();

    let request = CommandEnvelope::get_static_property(TypeDescriptor::new(names::MATH), "PI");
    write_frame(&mut stream, &request.encode().unwrap()).await.unwrap();

    // The only response belongs to the valid command.
    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(decode_response(&frame).unwrap(), Value::F64(std::f64::consts::PI));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_creates_get_distinct_handles() {
    let (server, registry) = start_server().await;
    let endpoint = server.endpoint().clone();

    let (first, second) = tokio::join!(
        RemoteProxy::create(endpoint.clone(), MESSAGE_HOLDER, remote_args![]),
        RemoteProxy::create(endpoint.clone(), MESSAGE_HOLDER, remote_args![]),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.handle(), second.handle());
    assert_eq!(registry.len(), 2);

    first.close().await;
    second.close().await;
    assert!(registry.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_user_type_members() {
    let (server, _) = start_server().await;

    let holder = RemoteProxy::create(server.endpoint().clone(), MESSAGE_HOLDER, remote_args![])
        .await
        .unwrap();
    assert_eq!(holder.descriptor().unwrap().as_str(), MESSAGE_HOLDER);

    holder.set_property("Name", "inbox").await.unwrap();
    let name: String = holder.get_property("Name").await.unwrap();
    assert_eq!(name, "inbox");

    // An Int32 argument lands in the Byte property.
    holder.set_property("MaxLength", 5).await.unwrap();
    let max: u8 = holder.get_property("MaxLength").await.unwrap();
    assert_eq!(max, 5);

    holder.invoke::<()>("AddMessageToQueue", remote_args!["hi"]).await.unwrap();
    // Rejected server-side; the channel keeps working.
    holder
        .invoke::<()>("AddMessageToQueue", remote_args!["far too long"])
        .await
        .unwrap();

    let first: Option<String> = holder
        .invoke("RetrieveMessageFromQueue", remote_args![])
        .await
        .unwrap();
    assert_eq!(first.as_deref(), Some("hi"));
    let empty: Option<String> = holder
        .invoke("RetrieveMessageFromQueue", remote_args![])
        .await
        .unwrap();
    assert_eq!(empty, None);

    holder.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_attach_and_close_track_references() {
    let (server, registry) = start_server().await;
    let endpoint = server.endpoint().clone();

    let owner = RemoteProxy::create(endpoint.clone(), MESSAGE_HOLDER, remote_args![])
        .await
        .unwrap();
    let handle = owner.handle();
    owner.set_property("Name", "shared").await.unwrap();

    let attached = RemoteProxy::attach(endpoint.clone(), handle).await.unwrap();
    assert_eq!(attached.descriptor().unwrap().as_str(), MESSAGE_HOLDER);
    assert_eq!(registry.ref_count(handle), Some(2));
    let name: String = attached.get_property("Name").await.unwrap();
    assert_eq!(name, "shared");

    owner.close().await;
    assert_eq!(registry.ref_count(handle), Some(1));
    attached.close().await;
    assert!(!registry.contains(handle));

    let err = RemoteProxy::attach(endpoint, handle).await.unwrap_err();
    assert!(matches!(err, RemexError::ObjectNotFound(h) if h == handle));

    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_proxy_releases_its_object() {
    let (server, registry) = start_server().await;

    let holder = RemoteProxy::create(server.endpoint().clone(), MESSAGE_HOLDER, remote_args![])
        .await
        .unwrap();
    assert_eq!(registry.len(), 1);
    drop(holder);

    assert!(wait_until(|| registry.is_empty()).await);
    server.shutdown().await;
}

#[tokio::test]
async fn test_static_members_through_detached_proxy() {
    let (server, registry) = start_server().await;
    let statics = RemoteProxy::detached(server.endpoint().clone());

    let max: f64 = statics
        .invoke_static(names::MATH, "Max", remote_args![2.5, 7.0])
        .await
        .unwrap();
    assert_eq!(max, 7.0);
    let parsed: i32 = statics
        .invoke_static(names::INT32, "Parse", remote_args!["42"])
        .await
        .unwrap();
    assert_eq!(parsed, 42);
    let e: f64 = statics.get_static_property(names::MATH, "E").await.unwrap();
    assert_eq!(e, std::f64::consts::E);

    let err = statics.invoke::<()>("Anything", remote_args![]).await.unwrap_err();
    assert!(matches!(err, RemexError::ObjectNotFound(_)));
    assert!(registry.is_empty());

    statics.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_construction_surfaces_as_error() {
    let (server, registry) = start_server().await;

    let err = RemoteProxy::create(server.endpoint().clone(), "Nowhere.Missing", remote_args![])
        .await
        .unwrap_err();
    assert!(matches!(err, RemexError::Construction { .. }));
    assert!(registry.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_slow_member_does_not_stall_other_connections() {
    let (server, _) = start_server().await;
    let endpoint = server.endpoint().clone();

    let sluggish = RemoteProxy::create(endpoint.clone(), SLUGGISH, remote_args![])
        .await
        .unwrap();
    let slow = tokio::spawn(async move {
        let answer = sluggish.invoke::<i32>("Slow", remote_args![]).await;
        sluggish.close().await;
        answer
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let statics = RemoteProxy::detached(endpoint);
    let started = Instant::now();
    let pi: f64 = statics.get_static_property(names::MATH, "PI").await.unwrap();
    let waited = started.elapsed();
    assert_eq!(pi, std::f64::consts::PI);
    assert!(waited < SLOW_CALL / 2, "independent connection waited {:?}", waited);

    assert_eq!(slow.await.unwrap().unwrap(), 999);
    statics.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_response() {
    let (server, registry) = start_server().await;
    let sluggish = RemoteProxy::create(server.endpoint().clone(), SLUGGISH, remote_args![])
        .await
        .unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        sluggish.invoke::<i32>("Slow", remote_args![]),
    )
    .await;
    assert!(abandoned.is_err());

    // Answered on a fresh channel, not with the abandoned call's 999.
    let n: i32 = sluggish.get_property("N").await.unwrap();
    assert_eq!(n, 7);

    sluggish.close().await;
    assert!(wait_until(|| registry.is_empty()).await);
    server.shutdown().await;
}

#[tokio::test]
async fn test_calls_after_shutdown_report_connection_lost() {
    let (server, _) = start_server().await;
    let list = RemoteProxy::create(server.endpoint().clone(), int_list(), remote_args![])
        .await
        .unwrap();

    server.shutdown().await;
    assert!(!server.is_running());

    let err = list.get_property::<i32>("Count").await.unwrap_err();
    assert!(matches!(err, RemexError::ConnectionLost { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_named_endpoint_roundtrip() {
    let dispatcher = Arc::new(Dispatcher::from_catalog(catalog()));
    let server = RemoteExecutionServer::start(ServerConfig::unique(), dispatcher)
        .await
        .unwrap();
    assert!(matches!(server.endpoint(), Endpoint::Named { .. }));

    let holder = RemoteProxy::create(server.endpoint().clone(), MESSAGE_HOLDER, remote_args![])
        .await
        .unwrap();
    holder.invoke::<()>("AddMessageToQueue", remote_args!["over a socket"]).await.unwrap();
    let message: Option<String> = holder
        .invoke("RetrieveMessageFromQueue", remote_args![])
        .await
        .unwrap();
    assert_eq!(message.as_deref(), Some("over a socket"));

    holder.close().await;
    server.shutdown().await;
}
