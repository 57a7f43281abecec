//! Dispatcher and completer tests, driven one message at a time.

use std::sync::Arc;
use std::sync::Mutex;

use tidepack::StructType;
use tidepack::Type;
use tidepack::Value;
use tiderpc::HEADER_SIZE;
use tiderpc::MessageBuf;
use tiderpc::TransactionHeader;

use crate::channel;
use crate::channel::Channel;
use crate::channel::MemoryChannel;
use crate::completer::Completer;
use crate::config::LeakedCompleter;
use crate::config::ServerConfig;
use crate::epitaph::ChannelState;
use crate::epitaph::CloseCause;
use crate::error::Error;
use crate::error::UsageError;
use crate::protocol::Method;
use crate::server::Dispatcher;
use crate::server::HandlerTable;

use super::*;

type Stash = Arc<Mutex<Vec<(Value, Completer)>>>;

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

fn stashing_table(stash: &Stash) -> HandlerTable {
    let two_way = stash.clone();
    let one_way = stash.clone();
    HandlerTable::new()
        .method(echo(), move |request, completer| two_way.lock().unwrap().push((request, completer)))
        .method(notify(), move |request, completer| one_way.lock().unwrap().push((request, completer)))
}

fn setup(config: ServerConfig) -> (Dispatcher, MemoryChannel, Stash) {
    let (server_end, peer) = MemoryChannel::pair();
    let stash: Stash = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::new(stashing_table(&stash), Arc::new(server_end), config);
    (dispatcher, peer, stash)
}

fn echo_request(txid: u32, text: &str) -> MessageBuf {
    let method = echo();
    tiderpc::encode_message(txid, method.ordinal, Value::Struct(vec![Value::string(text)]), &method.request).unwrap()
}

fn take_completer(stash: &Stash) -> Completer {
    stash.lock().unwrap().pop().unwrap().1
}

fn read_epitaph(peer: &MemoryChannel) -> Status {
    let MessageBuf { bytes, handles } = peer.try_read().unwrap();
    let (header, body) = TransactionHeader::decode(&bytes).unwrap();
    assert!(header.is_epitaph());
    assert_eq!(header.txid, 0);
    tiderpc::decode_epitaph_body(body, handles).unwrap()
}

// ==== DISPATCH ====

#[test]
fn test_dispatch_passes_request_and_completer() {
    let (dispatcher, _peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(7, "hello")));

    let (request, completer) = stash.lock().unwrap().pop().unwrap();
    assert_eq!(request, Value::Struct(vec![Value::string("hello")]));
    assert_eq!(completer.txid(), 7);
    assert_eq!(completer.ordinal(), echo().ordinal);
    assert!(completer.is_two_way());
    completer.drop_without_shutdown();
}

#[test]
fn test_unknown_ordinal_sends_not_supported() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    let message = tiderpc::encode_message(1, 0xFFFF, Value::empty_struct(), &StructType::empty("Empty")).unwrap();

    assert!(!dispatcher.dispatch_one(message));
    assert_eq!(read_epitaph(&peer), Status::NOT_SUPPORTED);
    assert_eq!(peer.try_read(), Err(channel::Error::PeerClosed));
    assert!(stash.lock().unwrap().is_empty());
    assert!(matches!(dispatcher.state(), ChannelState::Closed(CloseCause::Protocol(_))));

    // Nothing further is dispatched once closed.
    assert!(!dispatcher.dispatch_one(echo_request(2, "late")));
    assert!(stash.lock().unwrap().is_empty());
}

#[test]
fn test_unknown_ordinal_status_is_configurable() {
    let config = ServerConfig::default().with_unknown_method_status(Status::UNAVAILABLE);
    let (dispatcher, peer, _stash) = setup(config);
    let message = tiderpc::encode_message(1, 0xFFFF, Value::empty_struct(), &StructType::empty("Empty")).unwrap();
    assert!(!dispatcher.dispatch_one(message));
    assert_eq!(read_epitaph(&peer), Status::UNAVAILABLE);
}

#[test]
fn test_undecodable_request_sends_invalid_args() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    let mut message = echo_request(1, "hi");
    // Corrupt the string's presence marker.
    message.bytes[HEADER_SIZE + 8] = 1;

    assert!(!dispatcher.dispatch_one(message));
    assert_eq!(read_epitaph(&peer), Status::INVALID_ARGS);
    assert!(stash.lock().unwrap().is_empty());
}

#[test]
fn test_incompatible_magic_sends_protocol_not_supported() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    let mut message = echo_request(1, "hi");
    message.bytes[7] = 2;

    assert!(!dispatcher.dispatch_one(message));
    assert_eq!(read_epitaph(&peer), Status::PROTOCOL_NOT_SUPPORTED);
    assert!(stash.lock().unwrap().is_empty());
}

#[test]
fn test_short_message_sends_invalid_args() {
    let (dispatcher, peer, _stash) = setup(ServerConfig::default());
    assert!(!dispatcher.dispatch_one(MessageBuf::new(vec![0; 4], vec![])));
    assert_eq!(read_epitaph(&peer), Status::INVALID_ARGS);
}

#[test]
fn test_two_way_request_without_txid_is_rejected() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(!dispatcher.dispatch_one(echo_request(0, "hi")));
    assert_eq!(read_epitaph(&peer), Status::INVALID_ARGS);
    assert!(stash.lock().unwrap().is_empty());
}

#[test]
fn test_duplicate_in_flight_txid_is_rejected() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(5, "first")));
    assert!(!dispatcher.dispatch_one(echo_request(5, "second")));
    assert_eq!(read_epitaph(&peer), Status::INVALID_ARGS);
    assert_eq!(stash.lock().unwrap().len(), 1);
}

#[test]
fn test_peer_epitaph_closes_dispatcher() {
    let (dispatcher, _peer, _stash) = setup(ServerConfig::default());
    assert!(!dispatcher.dispatch_one(tiderpc::encode_epitaph(Status::CANCELED)));
    assert_eq!(dispatcher.state(), ChannelState::Closed(CloseCause::Epitaph(Status::CANCELED)));
}

// ==== COMPLETERS ====

#[test]
fn test_reply_echoes_txid_and_ordinal() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(9, "hello")));

    let mut completer = take_completer(&stash);
    completer.reply(Value::Struct(vec![Value::string("hello")])).unwrap();

    let method = echo();
    let reply = peer.try_read().unwrap();
    let response = method.response.as_ref().unwrap();
    let (header, value) = tiderpc::decode_message(reply, method.ordinal, response).unwrap();
    assert_eq!(header.txid, 9);
    assert_eq!(value, Value::Struct(vec![Value::string("hello")]));
}

#[test]
fn test_second_reply_is_a_usage_error() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(1, "x")));

    let mut completer = take_completer(&stash);
    completer.reply(Value::Struct(vec![Value::string("x")])).unwrap();
    assert_eq!(
        completer.reply(Value::Struct(vec![Value::string("x")])),
        Err(Error::Usage(UsageError::AlreadyCompleted))
    );
    assert_eq!(completer.close(Status::INTERNAL), Err(Error::Usage(UsageError::AlreadyCompleted)));

    // Exactly one reply went out and the binding is untouched.
    assert!(peer.try_read().is_ok());
    assert_eq!(peer.try_read(), Err(channel::Error::WouldBlock));
    assert_eq!(dispatcher.state(), ChannelState::Open);
}

#[test]
fn test_reply_on_one_way_is_a_usage_error() {
    let (dispatcher, _peer, stash) = setup(ServerConfig::default());
    let method = notify();
    let message = tiderpc::encode_message(0, method.ordinal, Value::Struct(vec![Value::U32(3)]), &method.request).unwrap();
    assert!(dispatcher.dispatch_one(message));

    let (request, mut completer) = stash.lock().unwrap().pop().unwrap();
    assert_eq!(request, Value::Struct(vec![Value::U32(3)]));
    assert!(!completer.is_two_way());
    assert_eq!(completer.reply(Value::empty_struct()), Err(Error::Usage(UsageError::ReplyOnOneWay)));
    drop(completer);
    assert_eq!(dispatcher.state(), ChannelState::Open);
}

#[test]
fn test_encode_error_leaves_completer_usable() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(1, "x")));

    let mut completer = take_completer(&stash);
    assert!(matches!(completer.reply(Value::Struct(vec![Value::U8(1)])), Err(Error::Encode(_))));
    assert_eq!(peer.try_read(), Err(channel::Error::WouldBlock));
    completer.reply(Value::Struct(vec![Value::string("x")])).unwrap();
    assert!(peer.try_read().is_ok());
}

#[test]
fn test_completer_close_sends_epitaph() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(1, "x")));

    let mut completer = take_completer(&stash);
    completer.close(Status::INTERNAL).unwrap();
    assert_eq!(read_epitaph(&peer), Status::INTERNAL);
    assert_eq!(dispatcher.state(), ChannelState::Closed(CloseCause::Local(Some(Status::INTERNAL))));
}

#[test]
fn test_reply_after_close_reports_closure() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(1, "a")));
    assert!(dispatcher.dispatch_one(echo_request(2, "b")));

    let mut second = take_completer(&stash);
    let mut first = take_completer(&stash);
    first.close(Status::BAD_STATE).unwrap();

    assert_eq!(
        second.reply(Value::Struct(vec![Value::string("b")])),
        Err(Error::Usage(UsageError::Closed))
    );
    assert_eq!(read_epitaph(&peer), Status::BAD_STATE);
    assert_eq!(peer.try_read(), Err(channel::Error::PeerClosed));
}

#[test]
fn test_leaked_completer_shuts_down_without_epitaph() {
    let (dispatcher, peer, stash) = setup(ServerConfig::default());
    assert!(dispatcher.dispatch_one(echo_request(1, "x")));

    drop(take_completer(&stash));
    assert_eq!(dispatcher.state(), ChannelState::Closed(CloseCause::Local(None)));
    assert_eq!(peer.try_read(), Err(channel::Error::PeerClosed));
}

#[test]
fn test_leaked_completer_can_be_ignored() {
    let config = ServerConfig::default().with_leaked_completer(LeakedCompleter::Ignore);
    let (dispatcher, peer, stash) = setup(config);
    assert!(dispatcher.dispatch_one(echo_request(1, "x")));

    drop(take_completer(&stash));
    assert_eq!(dispatcher.state(), ChannelState::Open);
    assert_eq!(peer.try_read(), Err(channel::Error::WouldBlock));

    // The txid is free again.
    assert!(dispatcher.dispatch_one(echo_request(1, "y")));
    take_completer(&stash).drop_without_shutdown();
}

#[test]
fn test_handler_can_reply_synchronously() {
    let (server_end, peer) = MemoryChannel::pair();
    let table = HandlerTable::new().method(echo(), |request, mut completer| {
        let _ = completer.reply(request);
    });
    let dispatcher = Dispatcher::new(table, Arc::new(server_end), ServerConfig::default());

    assert!(dispatcher.dispatch_one(echo_request(3, "sync")));
    let reply = peer.try_read().unwrap();
    assert_eq!(reply.header().unwrap().txid, 3);
    assert!(!peer.is_closed());
}
