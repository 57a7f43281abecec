//! End-to-end tests: a client and a server bound to the two ends of an
//! in-memory channel.

use std::sync::Arc;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use tokio::runtime::Handle as Runtime;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use tidepack::HandleTable;
use tidepack::StructType;
use tidepack::Type;
use tidepack::Value;

use tiderun::ChannelState;
use tiderun::Client;
use tiderun::ClientConfig;
use tiderun::Completer;
use tiderun::Error;
use tiderun::Event;
use tiderun::HandlerTable;
use tiderun::MemoryChannel;
use tiderun::Method;
use tiderun::ServerConfig;
use tiderun::ServerHandle;
use tiderun::UsageError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn echo() -> Method {
    Method::two_way(
        "test.echo/Echo.EchoString",
        StructType::new("EchoRequest", vec![("value", Type::string())]),
        StructType::new("EchoResponse", vec![("response", Type::string())]),
    )
}

fn notify() -> Method {
    Method::one_way("test.echo/Echo.Notify", StructType::new("NotifyRequest", vec![("count", Type::U32)]))
}

fn text(s: &str) -> Value {
    Value::Struct(vec![Value::string(s)])
}

fn string_field(value: &Value) -> Option<String> {
    match value.field(0) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Binds a server whose handlers pass every request out through a queue.
fn queued_server(channel: MemoryChannel) -> (ServerHandle, mpsc::UnboundedReceiver<(Value, Completer)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let one_way = tx.clone();
    let table = HandlerTable::new()
        .method(echo(), move |request, completer| {
            let _ = tx.send((request, completer));
        })
        .method(notify(), move |request, completer| {
            let _ = one_way.send((request, completer));
        });
    let server = tiderun::bind(table, Arc::new(channel), &Runtime::current(), ServerConfig::default());
    (server, rx)
}

fn echo_server(channel: MemoryChannel) -> ServerHandle {
    let table = HandlerTable::new().method(echo(), |request, mut completer| {
        let _ = completer.reply(request);
    });
    tiderun::bind(table, Arc::new(channel), &Runtime::current(), ServerConfig::default().with_name("echo"))
}

fn client(channel: MemoryChannel) -> Client {
    Client::bind(Arc::new(channel), &Runtime::current(), ClientConfig::default())
}

// ==== CALLS ====

#[tokio::test]
async fn test_echo_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let (a, b) = MemoryChannel::pair();
    let _server = echo_server(b);
    let client = client(a);

    let reply = client.call(&echo(), text("hello")).await?;
    assert_eq!(reply, text("hello"));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.state(), ChannelState::Open);
    Ok(())
}

#[tokio::test]
async fn test_call_is_pending_until_reply() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (_server, mut requests) = queued_server(b);
    let client = client(a);

    let (done_tx, done_rx) = oneshot::channel();
    let txid = client.call_async(&echo(), text("later"), move |result| {
        let _ = done_tx.send(result);
    })?;
    assert!(client.is_pending(txid));
    assert_eq!(client.pending_count(), 1);

    let (request, mut completer) = requests.recv().await.expect("request");
    assert_eq!(completer.txid(), txid.0);
    completer.reply(request)?;

    assert_eq!(done_rx.await??, text("later"));
    assert!(!client.is_pending(txid));
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_replies_in_any_order_reach_their_callers() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (_server, mut requests) = queued_server(b);
    let client = client(a);
    let method = echo();
    let count = 16;

    let calls = futures::future::join_all((0..count).map(|i| client.call(&method, text(&format!("call-{}", i)))));
    let replier = async {
        let mut pending = Vec::new();
        while pending.len() < count {
            pending.push(requests.recv().await.expect("request"));
        }
        pending.shuffle(&mut rand::thread_rng());
        for (request, mut completer) in pending {
            completer.reply(request).expect("reply");
        }
    };

    let (results, ()) = tokio::join!(calls, replier);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, text(&format!("call-{}", i)));
    }
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_reply_that_fails_to_decode_fails_only_its_call() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let _server = echo_server(b);
    let client = client(a);

    // Same ordinal, but the client expects a different response shape.
    let mismatched = Method::two_way(
        "test.echo/Echo.EchoString",
        StructType::new("EchoRequest", vec![("value", Type::string())]),
        StructType::new("Counted", vec![("count", Type::U64)]),
    );
    let result = client.call(&mismatched, text("hi")).await;
    assert!(matches!(result, Err(Error::Decode(_))));

    assert_eq!(client.state(), ChannelState::Open);
    assert_eq!(client.call(&echo(), text("still here")).await?, text("still here"));
    Ok(())
}

#[tokio::test]
async fn test_call_blocking_from_sync_code() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let _server = echo_server(b);
    let client = Arc::new(client(a));

    let blocking = Arc::clone(&client);
    let reply = tokio::task::spawn_blocking(move || blocking.call_blocking(&echo(), text("sync"))).await??;
    assert_eq!(reply, text("sync"));
    Ok(())
}

#[tokio::test]
async fn test_encode_error_sends_nothing() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let _server = echo_server(b);
    let client = client(a);

    let result = client.call(&echo(), Value::Struct(vec![Value::U32(1)])).await;
    assert!(matches!(result, Err(Error::Encode(_))));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.call(&echo(), text("ok")).await?, text("ok"));
    Ok(())
}

#[tokio::test]
async fn test_max_pending_is_enforced() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (_server, mut requests) = queued_server(b);
    let client = Client::bind(Arc::new(a), &Runtime::current(), ClientConfig::default().with_max_pending(1));

    let (done_tx, done_rx) = oneshot::channel();
    client.call_async(&echo(), text("one"), move |result| {
        let _ = done_tx.send(result);
    })?;
    let second = client.call_async(&echo(), text("two"), |_| {});
    assert_eq!(second.map(|_| ()), Err(Error::Usage(UsageError::TooManyPending(1))));

    let (request, mut completer) = requests.recv().await.expect("request");
    completer.reply(request)?;
    assert_eq!(done_rx.await??, text("one"));
    Ok(())
}

// ==== ONE-WAY ====

#[tokio::test]
async fn test_one_way_request() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (_server, mut requests) = queued_server(b);
    let client = client(a);

    client.send_one_way(&notify(), Value::Struct(vec![Value::U32(42)]))?;
    let (request, mut completer) = requests.recv().await.expect("request");
    assert_eq!(request, Value::Struct(vec![Value::U32(42)]));
    assert_eq!(completer.txid(), 0);
    assert_eq!(completer.reply(Value::empty_struct()), Err(Error::Usage(UsageError::ReplyOnOneWay)));
    Ok(())
}

#[tokio::test]
async fn test_method_kind_misuse() -> anyhow::Result<()> {
    let (a, _b) = MemoryChannel::pair();
    let client = client(a);

    assert_eq!(
        client.send_one_way(&echo(), text("x")),
        Err(Error::Usage(UsageError::NotOneWay))
    );
    assert_eq!(
        client.call(&notify(), Value::Struct(vec![Value::U32(1)])).await,
        Err(Error::Usage(UsageError::NotTwoWay))
    );
    assert_eq!(client.state(), ChannelState::Open);
    Ok(())
}

#[tokio::test]
async fn test_epitaph_ordinal_is_refused() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let mut reserved = echo();
    reserved.ordinal = tiderpc::EPITAPH_ORDINAL;

    let table = HandlerTable::new().method(reserved.clone(), |_, _| {});
    assert!(table.is_empty());
    let server = tiderun::bind(table, Arc::new(b), &Runtime::current(), ServerConfig::default());

    let client = client(a);
    assert_eq!(
        client.call(&reserved, text("x")).await,
        Err(Error::Usage(UsageError::ReservedOrdinal(tiderpc::EPITAPH_ORDINAL)))
    );
    assert_eq!(client.pending_count(), 0);

    let mut event = Event::new("test.echo/Echo.OnString", StructType::new("OnString", vec![("value", Type::string())]));
    event.ordinal = tiderpc::EPITAPH_ORDINAL;
    assert_eq!(
        server.send_event(&event, text("x")),
        Err(Error::Usage(UsageError::ReservedOrdinal(tiderpc::EPITAPH_ORDINAL)))
    );
    assert_eq!(client.state(), ChannelState::Open);
    Ok(())
}

// ==== EVENTS ====

#[tokio::test]
async fn test_events_reach_every_listener() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (server, _requests) = queued_server(b);
    let client = client(a);

    let event = Event::new("test.echo/Echo.OnString", StructType::new("OnString", vec![("value", Type::string())]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for listener in 0..2 {
        let tx = tx.clone();
        client.on_event(&event, move |value| {
            let _ = tx.send((listener, string_field(value)));
        });
    }

    server.send_event(&event, text("ping"))?;
    assert_eq!(rx.recv().await, Some((0, Some("ping".to_string()))));
    assert_eq!(rx.recv().await, Some((1, Some("ping".to_string()))));
    Ok(())
}

#[tokio::test]
async fn test_event_without_listener_is_dropped() -> anyhow::Result<()> {
    let (a, b) = MemoryChannel::pair();
    let (server, mut requests) = queued_server(b);
    let client = client(a);

    let event = Event::new("test.echo/Echo.Unheard", StructType::new("Unheard", vec![("value", Type::U64)]));
    server.send_event(&event, Value::Struct(vec![Value::U64(1)]))?;

    let echo_id = echo();
    let call = client.call(&echo_id, text("after"));
    let reply = async {
        let (request, mut completer) = requests.recv().await.expect("request");
        completer.reply(request).expect("reply");
    };
    let (result, ()) = tokio::join!(call, reply);
    assert_eq!(result?, text("after"));
    assert_eq!(client.state(), ChannelState::Open);
    Ok(())
}

#[tokio::test]
async fn test_event_handles_close_after_listeners_return() -> anyhow::Result<()> {
    let table = HandleTable::new();
    let (a, b) = MemoryChannel::pair();
    let (server, _requests) = queued_server(b);
    let client = client(a);

    let event = Event::new("test.echo/Echo.OnHandle", StructType::new("OnHandle", vec![("h", Type::handle())]));
    let tick = Event::new("test.echo/Echo.Tick", StructType::empty("Tick"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let tx = tx.clone();
        client.on_event(&event, move |value| {
            if let Some(Value::Handle(handle)) = value.field(0) {
                let _ = tx.send(Some(handle.raw()));
            }
        });
    }
    client.on_event(&tick, move |_| {
        let _ = tx.send(None);
    });

    let handle = table.create();
    let raw = handle.raw();
    server.send_event(&event, Value::Struct(vec![Value::Handle(handle)]))?;
    server.send_event(&tick, Value::empty_struct())?;

    assert_eq!(rx.recv().await, Some(Some(raw)));
    // Events are handled in order, so the first value is gone by the tick.
    assert_eq!(rx.recv().await, Some(None));
    assert_eq!(table.live_count(), 0);
    Ok(())
}

// ==== HANDLES ====

#[tokio::test]
async fn test_handles_travel_with_requests_and_replies() -> anyhow::Result<()> {
    let table = HandleTable::new();
    let transfer = Method::two_way(
        "test.handles/Mover.Transfer",
        StructType::new("TransferRequest", vec![("h", Type::handle())]),
        StructType::new("TransferResponse", vec![("h", Type::handle())]),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let seen = Arc::clone(&seen);
        HandlerTable::new().method(transfer.clone(), move |request, mut completer| {
            if let Some(Value::Handle(handle)) = request.field(0) {
                seen.lock().unwrap().push(handle.raw());
            }
            let _ = completer.reply(request);
        })
    };
    let (a, b) = MemoryChannel::pair();
    let _server = tiderun::bind(handlers, Arc::new(b), &Runtime::current(), ServerConfig::default());
    let client = client(a);

    let handle = table.create();
    let raw = handle.raw();
    let reply = client.call(&transfer, Value::Struct(vec![Value::Handle(handle)])).await?;

    assert_eq!(*seen.lock().unwrap(), vec![raw]);
    match reply.field(0) {
        Some(Value::Handle(handle)) => assert_eq!(handle.raw(), raw),
        other => panic!("expected a handle, got {:?}", other),
    }
    assert_eq!(table.live_count(), 1);
    drop(reply);
    assert_eq!(table.live_count(), 0);
    Ok(())
}

