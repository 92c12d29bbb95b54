use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use static_assertions::assert_impl_all;

use crate::*;

assert_impl_all!(Client: Send, Sync);
assert_impl_all!(Service: Send, Sync);
assert_impl_all!(Connection: Send);

/// A scripted byte stream: reads pop from a list of chunks, writes append
/// to a shared buffer in at most `write_limit` byte slices.
struct ChunkedStream {
    chunks: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    write_limit: usize,
}

impl ChunkedStream {
    fn new(chunks: Vec<Vec<u8>>) -> ChunkedStream {
        ChunkedStream {
            chunks: chunks.into(),
            written: Arc::new(Mutex::new(Vec::new())),
            write_limit: usize::MAX,
        }
    }
}

impl Read for ChunkedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for ChunkedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.write_limit);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for ChunkedStream {
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn split_bytes(data: &[u8], step: usize) -> Vec<Vec<u8>> {
    data.chunks(step).map(|c| c.to_vec()).collect()
}

#[test]
fn test_framing_buffered_reads() {
    // Two messages arriving byte by byte, with the receive buffer far
    // smaller than the payload run.
    let wire = b"{\"method\":\"org.test.P\"}\0{\"method\":\"org.test.Q\",\"oneway\":true}\0";
    for step in [1, 2, 7, wire.len()] {
        let mut conn = Connection::new(Box::new(ChunkedStream::new(split_bytes(wire, step))));
        assert_eq!(conn.receive().unwrap(), json!({ "method": "org.test.P" }));
        assert_eq!(
            conn.receive().unwrap(),
            json!({ "method": "org.test.Q", "oneway": true })
        );
        assert!(matches!(conn.receive(), Err(Error::ConnectionClosed)));
    }
}

#[test]
fn test_framing_two_messages_one_chunk() {
    // Both messages in one read: the second receive must be served from
    // the buffer alone.
    let wire = b"{\"a\":1}\0{\"b\":2}\0".to_vec();
    let mut conn = Connection::new(Box::new(ChunkedStream::new(vec![wire])));
    assert_eq!(conn.receive().unwrap(), json!({ "a": 1 }));
    assert!(conn.buffered());
    assert_eq!(conn.receive().unwrap(), json!({ "b": 2 }));
    assert!(!conn.buffered());
}

#[test]
fn test_framing_errors() {
    // EOF in the middle of a frame
    let mut conn = Connection::new(Box::new(ChunkedStream::new(vec![b"{\"method\":\"org.".to_vec()])));
    assert!(matches!(conn.receive(), Err(Error::InvalidMessage(_))));

    // Garbage before the NUL
    let mut conn =
        Connection::new(Box::new(ChunkedStream::new(vec![b"{totally_not json]\0".to_vec()])));
    match conn.receive() {
        Err(Error::InvalidMessage(text)) => assert_eq!(text, "{totally_not json]"),
        other => panic!("expected InvalidMessage, got {:?}", other),
    }
}

#[test]
fn test_framing_round_trip_with_short_writes() {
    let values = vec![
        json!({ "method": "org.test.P", "parameters": { "p": "hello" } }),
        json!({ "parameters": {}, "continues": false }),
        json!({ "deep": { "nested": [1, 2, 3], "s": "NUL-free" } }),
    ];

    let mut writer = ChunkedStream::new(vec![]);
    writer.write_limit = 3;
    let written = Arc::clone(&writer.written);
    let mut conn = Connection::new(Box::new(writer));
    for v in &values {
        conn.send(v).unwrap();
    }
    drop(conn);

    let wire = written.lock().unwrap().clone();
    let mut reader = Connection::new(Box::new(ChunkedStream::new(split_bytes(&wire, 5))));
    for v in &values {
        assert_eq!(&reader.receive().unwrap(), v);
    }
    assert!(matches!(reader.receive(), Err(Error::ConnectionClosed)));
}

#[test]
fn test_message_parsing() {
    let m = Message::from_value(json!({ "method": "org.test.P" })).unwrap();
    assert_eq!(m.interface(), "org.test");
    assert_eq!(m.method(), "P");
    assert_eq!(m.full_method(), "org.test.P");
    assert_eq!(m.mode(), CallMode::Basic);
    assert_eq!(m.parameters(), &json!({}));

    let m = Message::from_value(json!({ "method": "org.test.P", "more": true })).unwrap();
    assert_eq!(m.mode(), CallMode::More);
    let m = Message::from_value(json!({ "method": "org.test.P", "oneway": true })).unwrap();
    assert_eq!(m.mode(), CallMode::Oneway);
    let m = Message::from_value(json!({ "method": "org.test.P", "upgrade": true })).unwrap();
    assert_eq!(m.mode(), CallMode::Upgrade);

    // An unqualified method has neither interface nor method.
    let m = Message::from_value(json!({ "method": "org" })).unwrap();
    assert_eq!(m.interface(), "");
    assert_eq!(m.method(), "");
    assert_eq!(m.full_method(), "org");

    for bad in [
        json!(["array"]),
        json!({ "notmethod": "org.test.P" }),
        json!({ "method": 42 }),
        json!({ "method": "org.test.P", "parameters": ["array"] }),
        json!({ "method": "org.test.P", "parameters": "scalar" }),
        json!({ "method": "org.test.P", "more": true, "oneway": true }),
    ] {
        assert!(
            matches!(Message::from_value(bad.clone()), Err(Error::InvalidMessage(_))),
            "should reject {}",
            bad
        );
    }

    // Flag flips end up on the wire; empty parameters are omitted.
    let m = Message::new("org.test.P", Value::Null, CallMode::More).unwrap();
    let req = m.to_request();
    assert_eq!(req.more, Some(true));
    assert_eq!(req.oneway, None);
    assert_eq!(req.parameters, None);

    assert!(Message::new("org.test.P", json!([1]), CallMode::Basic).is_err());
}

#[test]
fn test_uri_parsing() {
    let uri = VarlinkUri::parse("unix:/run/org.example.ping").unwrap();
    assert_eq!(uri.address, Address::Unix("/run/org.example.ping".into()));
    assert_eq!(uri.interface, None);

    // Anything from the first `;` on is reserved and ignored.
    let uri = VarlinkUri::parse("unix:/run/org.example.ping;mode=0666").unwrap();
    assert_eq!(uri.address, Address::Unix("/run/org.example.ping".into()));

    let uri = VarlinkUri::parse("tcp:127.0.0.1:12345").unwrap();
    assert_eq!(uri.address, Address::Tcp("127.0.0.1:12345".parse().unwrap()));

    let uri = VarlinkUri::parse("tcp:127.0.0.1:1234/org.example.ping.Ping").unwrap();
    assert_eq!(uri.address, Address::Tcp("127.0.0.1:1234".parse().unwrap()));
    assert_eq!(uri.interface.as_deref(), Some("org.example.ping"));
    assert_eq!(uri.method.as_deref(), Some("Ping"));

    let uri = VarlinkUri::parse_with_method("unix:/run/sock/org.example.Ping", true).unwrap();
    assert_eq!(uri.address, Address::Unix("/run/sock".into()));
    assert_eq!(uri.interface.as_deref(), Some("org.example"));
    assert_eq!(uri.method.as_deref(), Some("Ping"));

    for bad in [
        "http://example.org",
        "tcp:example.org:1234",
        "tcp:127.0.0.1",
        "tcp:127.0.0.1:notaport",
        "tcp:127.0.0.1:99999",
        "unix:",
        "just-a-path",
    ] {
        assert!(
            matches!(VarlinkUri::parse(bad), Err(Error::InvalidAddress(_))),
            "should reject {}",
            bad
        );
    }
}

fn test_service() -> Service {
    let mut service = Service::new("varlink", "test", "1", "test.org");
    let mut handlers = HashMap::new();
    handlers.insert(
        "P".to_string(),
        MethodHandler::sync(|parameters, _| Ok(json!({ "q": parameters["p"] }))),
    );
    handlers.insert(
        "M".to_string(),
        MethodHandler::streaming(|parameters, _, call: &mut Call| {
            let n = parameters["n"].as_i64().unwrap_or(0);
            for m in 0..n {
                call.reply(json!({ "m": m }))?;
            }
            call.close(json!({ "m": n }))
        }),
    );
    handlers.insert(
        "E".to_string(),
        MethodHandler::sync(|_, _| {
            Err(Error::varlink("org.test.Custom", json!({ "reason": "because" })))
        }),
    );
    handlers.insert(
        "Crash".to_string(),
        MethodHandler::sync(|_, _| Err(Error::InvalidArgument("boom".to_string()))),
    );
    handlers.insert(
        "Bad".to_string(),
        MethodHandler::sync(|_, _| Ok(json!({ "wrong": true }))),
    );
    service
        .add_interface(
            "interface org.test\n\
             method P(p: string) -> (q: string)\n\
             method M(n: int) -> (m: int)\n\
             method E() -> ()\n\
             method Crash() -> ()\n\
             method Bad() -> (ok: bool)\n\
             method NoHandler() -> ()",
            handlers,
        )
        .unwrap();
    service
}

fn dispatch(service: &Service, request: Value) -> Vec<Reply> {
    let message = Message::from_value(request).unwrap();
    let mut replies = Vec::new();
    let mut sink = |reply: Reply| -> Result<()> {
        replies.push(reply);
        Ok(())
    };
    service.process_call(&message, &mut sink).unwrap();
    replies
}

#[test]
fn test_dispatch_get_info() {
    let service = test_service();
    let replies = dispatch(&service, json!({ "method": "org.varlink.service.GetInfo" }));
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].parameters,
        Some(json!({
            "vendor": "varlink",
            "product": "test",
            "version": "1",
            "url": "test.org",
            "interfaces": ["org.varlink.service", "org.test"]
        }))
    );
    assert_eq!(replies[0].error, None);
    assert_eq!(replies[0].continues, None);
}

#[test]
fn test_dispatch_echo() {
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.P", "parameters": { "p": "hello" } }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].parameters, Some(json!({ "q": "hello" })));
}

#[test]
fn test_dispatch_invalid_parameter() {
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.P", "parameters": { "p": 42 } }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InvalidParameter")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "parameter": "p" })));
}

#[test]
fn test_dispatch_streaming_more() {
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.M", "parameters": { "n": 3 }, "more": true }),
    );
    assert_eq!(replies.len(), 4);
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.parameters, Some(json!({ "m": i })));
        assert_eq!(reply.continues, Some(i < 3));
    }
}

#[test]
fn test_dispatch_sync_handler_with_more() {
    // A sync handler answering a `more` call produces one terminal reply.
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.P", "parameters": { "p": "x" }, "more": true }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].continues, Some(false));
    assert_eq!(replies[0].parameters, Some(json!({ "q": "x" })));
}

#[test]
fn test_dispatch_streaming_without_more_flag() {
    // The handler emits intermediate replies, but the caller did not ask
    // for a stream; that is the handler misusing streaming.
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.M", "parameters": { "n": 5 } }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.MethodNotImplemented")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "method": "org.test.M" })));

    // With nothing to stream the single close() is a plain reply.
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.M", "parameters": { "n": 0 } }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].error, None);
    assert_eq!(replies[0].parameters, Some(json!({ "m": 0 })));
    assert_eq!(replies[0].continues, None);
}

#[test]
fn test_dispatch_oneway_produces_no_reply() {
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.P", "parameters": { "p": "x" }, "oneway": true }),
    );
    assert!(replies.is_empty());

    // Not even error replies.
    let replies = dispatch(&service, json!({ "method": "org.absent.X", "oneway": true }));
    assert!(replies.is_empty());

    let replies = dispatch(
        &service,
        json!({ "method": "org.test.M", "parameters": { "n": 3 }, "oneway": true }),
    );
    assert!(replies.is_empty());
}

#[test]
fn test_dispatch_upgrade_is_answered_like_basic() {
    let service = test_service();
    let replies = dispatch(
        &service,
        json!({ "method": "org.test.P", "parameters": { "p": "x" }, "upgrade": true }),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].parameters, Some(json!({ "q": "x" })));
    assert_eq!(replies[0].continues, None);
}

#[test]
fn test_dispatch_unknown_interface_and_method() {
    let service = test_service();

    let replies = dispatch(&service, json!({ "method": "org.absent.X" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InterfaceNotFound")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "interface": "org.absent" })));

    let replies = dispatch(&service, json!({ "method": "org.test.NoSuch" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.MethodNotFound")
    );
    assert_eq!(
        replies[0].parameters,
        Some(json!({ "method": "org.test.NoSuch" }))
    );

    // No dot means no interface.
    let replies = dispatch(&service, json!({ "method": "org" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InterfaceNotFound")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "interface": "" })));
}

#[test]
fn test_dispatch_handler_errors() {
    let service = test_service();

    // A typed error goes out verbatim.
    let replies = dispatch(&service, json!({ "method": "org.test.E" }));
    assert_eq!(replies[0].error.as_deref(), Some("org.test.Custom"));
    assert_eq!(replies[0].parameters, Some(json!({ "reason": "because" })));

    // Anything else maps to InternalError.
    let replies = dispatch(&service, json!({ "method": "org.test.Crash" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InternalError")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "what": "boom" })));

    // A method in the schema without a handler.
    let replies = dispatch(&service, json!({ "method": "org.test.NoHandler" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.MethodNotImplemented")
    );

    // A handler return value failing validation.
    let replies = dispatch(&service, json!({ "method": "org.test.Bad" }));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InvalidParameter")
    );
    assert_eq!(replies[0].parameters, Some(json!({ "parameter": "ok" })));
}

#[test]
fn test_dispatch_interface_description() {
    let service = test_service();

    let replies = dispatch(
        &service,
        json!({
            "method": "org.varlink.service.GetInterfaceDescription",
            "parameters": { "interface": "org.test" }
        }),
    );
    let description = replies[0].parameters.as_ref().unwrap()["description"]
        .as_str()
        .unwrap();
    assert!(description.starts_with("interface org.test\n"));
    assert!(description.contains("method P(p: string) -> (q: string)"));

    // The built-in description round-trips through the parser.
    let replies = dispatch(
        &service,
        json!({
            "method": "org.varlink.service.GetInterfaceDescription",
            "parameters": { "interface": "org.varlink.service" }
        }),
    );
    let description = replies[0].parameters.as_ref().unwrap()["description"]
        .as_str()
        .unwrap();
    let reparsed = idl::Interface::from_description(description).unwrap();
    assert_eq!(reparsed.name, "org.varlink.service");

    let replies = dispatch(
        &service,
        json!({
            "method": "org.varlink.service.GetInterfaceDescription",
            "parameters": { "interface": "org.notfound" }
        }),
    );
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InterfaceNotFound")
    );
    assert_eq!(
        replies[0].parameters,
        Some(json!({ "interface": "org.notfound" }))
    );

    // The `interface` parameter is required by the schema.
    let replies = dispatch(
        &service,
        json!({ "method": "org.varlink.service.GetInterfaceDescription" }),
    );
    assert_eq!(
        replies[0].error.as_deref(),
        Some("org.varlink.service.InvalidParameter")
    );
    assert_eq!(
        replies[0].parameters,
        Some(json!({ "parameter": "interface" }))
    );
}

#[test]
fn test_service_registration_rules() {
    let mut service = test_service();

    assert!(matches!(
        service.add_interface("interface org.test\nmethod P(p: string) -> (q: string)", HashMap::new()),
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        service.add_interface("interface org.varlink.service\nmethod F() -> ()", HashMap::new()),
        Err(Error::InvalidArgument(_))
    ));

    let mut handlers = HashMap::new();
    handlers.insert(
        "NoSuch".to_string(),
        MethodHandler::sync(|_, _| Ok(json!({}))),
    );
    assert!(matches!(
        service.add_interface("interface org.other\nmethod F() -> ()", handlers),
        Err(Error::InvalidArgument(_))
    ));
}

fn start_server(address: &str, idle_timeout: Duration) -> thread::JoinHandle<()> {
    let address = address.to_string();
    let handle = thread::spawn(move || {
        let config = ListenConfig {
            idle_timeout,
            ..Default::default()
        };
        match listen(test_service(), &address, &config) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("listen: {:?}", e),
        }
    });
    // give the server time to bind
    thread::sleep(Duration::from_millis(300));
    handle
}

#[test]
fn test_listen() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:{}", dir.path().join("test_listen").display());
    let server = start_server(&address, Duration::from_secs(2));

    let client = Client::connect(&address).unwrap();

    let info = client.get_info().unwrap();
    assert_eq!(info.vendor, "varlink");
    assert_eq!(info.product, "test");
    assert_eq!(info.version, "1");
    assert_eq!(info.url, "test.org");
    assert_eq!(info.interfaces[0], "org.varlink.service");

    let mut replies = client
        .call("org.test.P", json!({ "p": "hello" }), CallMode::Basic)
        .unwrap();
    assert_eq!(replies.recv().unwrap(), Some(json!({ "q": "hello" })));
    assert_eq!(replies.recv().unwrap(), None);

    match client
        .call("org.test.P", json!({ "p": 42 }), CallMode::Basic)
        .unwrap()
        .recv()
    {
        Err(Error::InvalidParameter(p)) => assert_eq!(p, "p"),
        other => panic!("expected InvalidParameter, got {:?}", other),
    }

    let replies = client
        .call("org.test.M", json!({ "n": 3 }), CallMode::More)
        .unwrap();
    let streamed: Vec<Value> = replies.map(|r| r.unwrap()).collect();
    assert_eq!(
        streamed,
        vec![
            json!({ "m": 0 }),
            json!({ "m": 1 }),
            json!({ "m": 2 }),
            json!({ "m": 3 })
        ]
    );

    // The connection survives varlink error replies.
    match client
        .call("org.absent.X", Value::Null, CallMode::Basic)
        .unwrap()
        .recv()
    {
        Err(Error::InterfaceNotFound(i)) => assert_eq!(i, "org.absent"),
        other => panic!("expected InterfaceNotFound, got {:?}", other),
    }
    match client
        .call("org.test.NoSuch", Value::Null, CallMode::Basic)
        .unwrap()
        .recv()
    {
        Err(Error::MethodNotFound(m)) => assert_eq!(m, "org.test.NoSuch"),
        other => panic!("expected MethodNotFound, got {:?}", other),
    }

    // A oneway call yields nothing and the next call is unaffected.
    client
        .call("org.test.P", json!({ "p": "x" }), CallMode::Oneway)
        .unwrap();
    let mut replies = client
        .call("org.test.P", json!({ "p": "y" }), CallMode::Basic)
        .unwrap();
    assert_eq!(replies.recv().unwrap(), Some(json!({ "q": "y" })));

    let description = client.get_interface_description("org.test").unwrap();
    assert!(description.starts_with("interface org.test\n"));

    drop(client);
    server.join().unwrap();
}

#[test]
fn test_two_requests_in_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two_in_one");
    let address = format!("unix:{}", path.display());
    let server = start_server(&address, Duration::from_secs(2));

    let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
    stream
        .write_all(b"{\"method\":\"org.not.found\"}\0{\"method\":\"org.not.found\"}\0")
        .unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    for _ in 0..2 {
        let mut frame = Vec::new();
        reader.read_until(0, &mut frame).unwrap();
        assert_eq!(frame.pop(), Some(0));
        let reply: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(
            reply,
            json!({
                "error": "org.varlink.service.InterfaceNotFound",
                "parameters": { "interface": "org.not" }
            })
        );
    }

    drop(stream);
    server.join().unwrap();
}

#[test]
fn test_client_serializes_calls() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:{}", dir.path().join("serialize").display());
    let server = start_server(&address, Duration::from_secs(3));

    let client = Arc::new(Client::connect(&address).unwrap());
    let mut first = client
        .call("org.test.M", json!({ "n": 1 }), CallMode::More)
        .unwrap();

    let (sent, got_slot) = mpsc::channel();
    let second_client = Arc::clone(&client);
    let second = thread::spawn(move || {
        // Blocks until the first call's final reply has been read.
        let mut replies = second_client
            .call("org.test.P", json!({ "p": "second" }), CallMode::Basic)
            .unwrap();
        sent.send(()).unwrap();
        assert_eq!(replies.recv().unwrap(), Some(json!({ "q": "second" })));
    });

    thread::sleep(Duration::from_millis(200));
    assert!(got_slot.try_recv().is_err(), "second call jumped the queue");

    assert_eq!(first.recv().unwrap(), Some(json!({ "m": 0 })));
    assert_eq!(first.recv().unwrap(), Some(json!({ "m": 1 })));
    assert_eq!(first.recv().unwrap(), None);

    got_slot
        .recv_timeout(Duration::from_secs(5))
        .expect("second call never ran");
    second.join().unwrap();

    drop(first);
    drop(client);
    server.join().unwrap();
}

#[test]
fn test_abandoned_stream_poisons_client() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:{}", dir.path().join("poison").display());
    let server = start_server(&address, Duration::from_secs(2));

    let client = Client::connect(&address).unwrap();
    {
        let mut replies = client
            .call("org.test.M", json!({ "n": 5 }), CallMode::More)
            .unwrap();
        assert!(replies.recv().unwrap().is_some());
        // dropped with replies still on the wire
    }
    assert!(matches!(
        client.call("org.test.P", json!({ "p": "x" }), CallMode::Basic),
        Err(Error::ConnectionClosed)
    ));

    drop(client);
    server.join().unwrap();
}

#[test]
fn test_listen_rejects_existing_socket_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exists");
    std::fs::write(&path, b"").unwrap();
    let address = format!("unix:{}", path.display());
    assert!(Listener::bind(&address).is_err());
}

#[test]
fn test_unix_socket_node_is_unlinked_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unlink");
    let address = format!("unix:{}", path.display());
    let listener = Listener::bind(&address).unwrap();
    assert!(path.exists());
    drop(listener);
    assert!(!path.exists());
}

#[test]
fn test_stop_listening() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:{}", dir.path().join("stop").display());
    let stop = Arc::new(AtomicBool::new(false));

    let server = {
        let address = address.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let config = ListenConfig {
                stop_listening: Some(stop),
                ..Default::default()
            };
            listen(test_service(), &address, &config)
        })
    };
    thread::sleep(Duration::from_millis(300));

    let client = Client::connect(&address).unwrap();
    client.get_info().unwrap();
    drop(client);

    stop.store(true, Ordering::SeqCst);
    match server.join().unwrap() {
        Ok(()) => {}
        Err(e) => panic!("listen: {:?}", e),
    }
}

#[cfg(feature = "tokio")]
mod aio_test {
    use super::*;
    use crate::aio;

    #[tokio::test]
    async fn test_aio_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix:{}", dir.path().join("aio").display());
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let address = address.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let config = aio::ListenConfig {
                    stop_listening: Some(stop),
                    ..Default::default()
                };
                aio::listen(Arc::new(test_service()), &address, &config).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = aio::Client::connect(&address).await.unwrap();

        let mut replies = client
            .call("org.test.P", json!({ "p": "hello" }), CallMode::Basic)
            .await
            .unwrap();
        assert_eq!(replies.recv().await.unwrap(), Some(json!({ "q": "hello" })));
        assert_eq!(replies.recv().await.unwrap(), None);

        let mut replies = client
            .call("org.test.M", json!({ "n": 2 }), CallMode::More)
            .await
            .unwrap();
        let mut streamed = Vec::new();
        while let Some(parameters) = replies.recv().await.unwrap() {
            streamed.push(parameters);
        }
        assert_eq!(
            streamed,
            vec![json!({ "m": 0 }), json!({ "m": 1 }), json!({ "m": 2 })]
        );

        match client
            .call("org.absent.X", Value::Null, CallMode::Basic)
            .await
            .unwrap()
            .recv()
            .await
        {
            Err(Error::InterfaceNotFound(i)) => assert_eq!(i, "org.absent"),
            other => panic!("expected InterfaceNotFound, got {:?}", other),
        }

        // oneway, then a normal call on the same connection
        client
            .call("org.test.P", json!({ "p": "x" }), CallMode::Oneway)
            .await
            .unwrap();
        let mut replies = client
            .call("org.test.P", json!({ "p": "y" }), CallMode::Basic)
            .await
            .unwrap();
        assert_eq!(replies.recv().await.unwrap(), Some(json!({ "q": "y" })));

        stop.store(true, Ordering::SeqCst);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_aio_calls_queue_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix:{}", dir.path().join("aio_queue").display());
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let address = address.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let config = aio::ListenConfig {
                    stop_listening: Some(stop),
                    ..Default::default()
                };
                aio::listen(Arc::new(test_service()), &address, &config).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = Arc::new(aio::Client::connect(&address).await.unwrap());
        let mut first = client
            .call("org.test.M", json!({ "n": 1 }), CallMode::More)
            .await
            .unwrap();

        let submitted = Arc::new(AtomicBool::new(false));
        let second = {
            let client = Arc::clone(&client);
            let submitted = Arc::clone(&submitted);
            tokio::spawn(async move {
                let mut replies = client
                    .call("org.test.P", json!({ "p": "second" }), CallMode::Basic)
                    .await
                    .unwrap();
                submitted.store(true, Ordering::SeqCst);
                assert_eq!(replies.recv().await.unwrap(), Some(json!({ "q": "second" })));
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !submitted.load(Ordering::SeqCst),
            "second call jumped the queue"
        );

        assert_eq!(first.recv().await.unwrap(), Some(json!({ "m": 0 })));
        assert_eq!(first.recv().await.unwrap(), Some(json!({ "m": 1 })));
        assert_eq!(first.recv().await.unwrap(), None);

        second.await.unwrap();

        stop.store(true, Ordering::SeqCst);
        server.await.unwrap().unwrap();
    }
}
