//! End-to-end scenarios over loopback TCP: the four call patterns, deadline
//! and cancellation behavior, the plain HTTP/JSON surface, and provider
//! churn through the in-memory registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rstest::*;
use serde::{Deserialize, Serialize};
use triple_rpc::client::{CallOptions, TripleClient};
use triple_rpc::registry::{MemoryRegistry, Registry};
use triple_rpc::server::TripleServer;
use triple_rpc::{
    ClientConfig, Code, Endpoint, RpcPattern, ServerConfig, ServiceKey, Status, TripleError,
};
use triple_rpc_codec::{json_method, json_service_method};

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct HelloRequest {
    name: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct HelloReply {
    message: String,
}

const GREETER: &str = "org.apache.dubbo.samples.HelloWorld";

#[fixture]
fn logger() {
    let _ = captains_log::recipe::raw_file_logger("/tmp/triple_rpc_test.log", log::Level::Debug)
        .test()
        .build();
}

struct Fixture {
    server: TripleServer,
    addr: String,
    handler_cancelled: Arc<AtomicBool>,
    received_names: Arc<Mutex<Vec<String>>>,
}

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    // clients keep idle connections alive, don't wait for them in tests
    config.server_close_wait = Duration::from_millis(200);
    config
}

fn start_server() -> Fixture {
    let handler_cancelled = Arc::new(AtomicBool::new(false));
    let received_names = Arc::new(Mutex::new(Vec::new()));
    let mut server = TripleServer::new(test_config()).expect("server");

    server
        .register_unary(
            json_service_method::<HelloRequest, HelloReply>(GREETER, "SayHello"),
            |_ctx, req| {
                if req.name.is_empty() {
                    return Err(Status::new(Code::InvalidArgument, "name must not be empty"));
                }
                Ok(HelloReply { message: format!("Hello, {}", req.name) })
            },
        )
        .expect("register SayHello");

    {
        let cancelled = handler_cancelled.clone();
        server
            .register_unary(
                json_service_method::<HelloRequest, HelloReply>(GREETER, "SlowHello"),
                move |ctx, req| {
                    // simulate slow work, observing cancellation
                    if ctx.wait_cancelled(Duration::from_secs(2)) {
                        cancelled.store(true, Ordering::SeqCst);
                        return Err(Status::new(Code::Cancelled, "gave up"));
                    }
                    Ok(HelloReply { message: format!("Hello, {}", req.name) })
                },
            )
            .expect("register SlowHello");
    }

    {
        let names = received_names.clone();
        server
            .register_client_stream(
                json_service_method::<HelloRequest, u64>(GREETER, "CountHellos"),
                move |_ctx, reader| {
                    let mut count = 0u64;
                    for item in reader {
                        let req = item.map_err(|e| e.into_status())?;
                        names.lock().unwrap().push(req.name);
                        count += 1;
                    }
                    Ok(count)
                },
            )
            .expect("register CountHellos");
    }

    {
        let cancelled = handler_cancelled.clone();
        server
            .register_server_stream(
                json_service_method::<HelloRequest, HelloReply>(GREETER, "ManyHellos"),
                move |ctx, req, sink| {
                    for i in 0..10 {
                        if ctx.is_cancelled() {
                            cancelled.store(true, Ordering::SeqCst);
                            break;
                        }
                        let reply =
                            HelloReply { message: format!("Hello #{} {}", i, req.name) };
                        if sink.send(&reply).is_err() {
                            cancelled.store(true, Ordering::SeqCst);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Ok(())
                },
            )
            .expect("register ManyHellos");
    }

    server
        .register_bidi(
            json_service_method::<HelloRequest, HelloReply>(GREETER, "EchoHellos"),
            |_ctx, reader, sink| {
                for item in reader {
                    let req = item.map_err(|e| e.into_status())?;
                    sink.send(&HelloReply { message: req.name })
                        .map_err(|e| e.into_status())?;
                }
                Ok(())
            },
        )
        .expect("register EchoHellos");

    let addr = server.listen("127.0.0.1:0").expect("listen");
    Fixture { server, addr, handler_cancelled, received_names }
}

fn client_for(fixture: &Fixture) -> TripleClient {
    TripleClient::direct(&format!("tri://{}/{}", fixture.addr, GREETER)).expect("client")
}

#[rstest]
fn test_unary_happy_path(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "SayHello", RpcPattern::Unary);

    let reply = client
        .unary(&method, &HelloRequest { name: "world".into() }, CallOptions::default())
        .expect("call");
    assert_eq!(reply.message, "Hello, world");
    fixture.server.close();
}

#[rstest]
fn test_unary_error_status(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "SayHello", RpcPattern::Unary);

    let err = client
        .unary(&method, &HelloRequest { name: "".into() }, CallOptions::default())
        .expect_err("must fail");
    assert_eq!(err.code(), Code::InvalidArgument);
    fixture.server.close();
}

#[rstest]
fn test_unknown_path_is_unimplemented(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "NoSuchMethod", RpcPattern::Unary);

    let err = client
        .unary(&method, &HelloRequest { name: "world".into() }, CallOptions::default())
        .expect_err("must fail");
    assert_eq!(err.code(), Code::Unimplemented);
    fixture.server.close();
}

#[rstest]
fn test_unary_deadline(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "SlowHello", RpcPattern::Unary);

    let started = Instant::now();
    let err = client
        .unary(
            &method,
            &HelloRequest { name: "late".into() },
            CallOptions::default().with_timeout(Duration::from_millis(60)),
        )
        .expect_err("must time out");
    assert!(matches!(err, TripleError::Timeout), "got {:?}", err);
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(1));

    // the server-side invocation observes cancellation shortly after
    let wait_start = Instant::now();
    while !fixture.handler_cancelled.load(Ordering::SeqCst) {
        assert!(wait_start.elapsed() < Duration::from_secs(2), "handler never cancelled");
        std::thread::sleep(Duration::from_millis(10));
    }
    fixture.server.close();
}

#[rstest]
fn test_client_stream_counts_in_order(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method =
        json_method::<HelloRequest, u64>(GREETER, "CountHellos", RpcPattern::ClientStream);

    let (mut sink, response) =
        client.client_stream(&method, CallOptions::default()).expect("open");
    for name in ["a", "b", "c", "d"] {
        sink.send(&HelloRequest { name: name.into() }).expect("send");
    }
    sink.close();
    drop(sink);

    assert_eq!(response.wait().expect("count"), 4);
    assert_eq!(*fixture.received_names.lock().unwrap(), vec!["a", "b", "c", "d"]);
    fixture.server.close();
}

#[rstest]
fn test_server_stream_cancel_after_two(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method =
        json_method::<HelloRequest, HelloReply>(GREETER, "ManyHellos", RpcPattern::ServerStream);

    let mut reader = client
        .server_stream(&method, &HelloRequest { name: "x".into() }, CallOptions::default())
        .expect("open");
    let first = reader.next_message().expect("first").expect("value");
    assert!(first.message.starts_with("Hello #0"));
    let second = reader.next_message().expect("second").expect("value");
    assert!(second.message.starts_with("Hello #1"));

    reader.cancel();
    // double-cancel is a no-op
    reader.cancel();
    let err = reader.next_message().expect_err("cancelled");
    assert_eq!(err.code(), Code::Cancelled);
    // after cancellation nothing further is delivered
    assert!(reader.next_message().expect("end").is_none());

    let wait_start = Instant::now();
    while !fixture.handler_cancelled.load(Ordering::SeqCst) {
        assert!(wait_start.elapsed() < Duration::from_secs(2), "handler never cancelled");
        std::thread::sleep(Duration::from_millis(10));
    }
    fixture.server.close();
}

#[rstest]
fn test_bidi_echo(_logger: ()) {
    let mut fixture = start_server();
    let client = client_for(&fixture);
    let method =
        json_method::<HelloRequest, HelloReply>(GREETER, "EchoHellos", RpcPattern::BiStream);

    let (mut sink, mut reader) =
        client.bidi_stream(&method, CallOptions::default()).expect("open");
    let words = ["hello", "world", "from", "dubbo"];
    for word in words {
        sink.send(&HelloRequest { name: word.into() }).expect("send");
        let echoed = reader.next_message().expect("echo").expect("value");
        assert_eq!(echoed.message, word);
    }
    sink.close();
    assert!(reader.next_message().expect("end").is_none());

    // sends after half-close are refused locally
    let err = sink.send(&HelloRequest { name: "late".into() }).expect_err("closed");
    assert!(matches!(err, TripleError::IllegalState(_)));
    // double-close is a no-op
    sink.close();
    fixture.server.close();
}

#[rstest]
fn test_plain_json_unary(_logger: ()) {
    let mut fixture = start_server();
    let addr = fixture.addr.clone();

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let (status, body) = rt.block_on(async move {
        let tcp = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        let (mut h2, connection) = h2::client::handshake(tcp).await.expect("handshake");
        tokio::spawn(async move {
            let _ = connection.await;
        });
        let request = http::Request::builder()
            .method("POST")
            .uri(format!("http://{}/{}/SayHello", addr, GREETER))
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        let (response, mut send) = h2.send_request(request, false).expect("send_request");
        send.send_data(serde_json::to_vec(&HelloRequest { name: "json".into() }).unwrap().into(), true)
            .expect("body");
        let response = response.await.expect("response");
        let status = response.status().as_u16();
        let mut body = response.into_body();
        let mut collected = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.expect("chunk");
            collected.extend_from_slice(&chunk);
            let _ = body.flow_control().release_capacity(chunk.len());
        }
        (status, collected)
    });

    assert_eq!(status, 200);
    let reply: HelloReply = serde_json::from_slice(&body).expect("json body");
    assert_eq!(reply.message, "Hello, json");
    fixture.server.close();
}

#[rstest]
fn test_plain_json_maps_status_to_http(_logger: ()) {
    let mut fixture = start_server();
    let addr = fixture.addr.clone();

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let status = rt.block_on(async move {
        let tcp = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        let (mut h2, connection) = h2::client::handshake(tcp).await.expect("handshake");
        tokio::spawn(async move {
            let _ = connection.await;
        });
        let request = http::Request::builder()
            .method("POST")
            .uri(format!("http://{}/{}/SayHello", addr, GREETER))
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        let (response, mut send) = h2.send_request(request, false).expect("send_request");
        send.send_data(
            serde_json::to_vec(&HelloRequest { name: "".into() }).unwrap().into(),
            true,
        )
        .expect("body");
        response.await.expect("response").status().as_u16()
    });

    // InvalidArgument maps onto 400
    assert_eq!(status, 400);
    fixture.server.close();
}

#[rstest]
fn test_provider_churn_through_registry(_logger: ()) {
    let key = ServiceKey::new(GREETER);
    let registry = Arc::new(MemoryRegistry::new());

    let mut fixture_a = start_server();
    let mut fixture_b = start_server();
    let port_a = fixture_a.addr.rsplit(':').next().unwrap().parse::<u16>().unwrap();
    let port_b = fixture_b.addr.rsplit(':').next().unwrap().parse::<u16>().unwrap();

    let _lease_a = registry
        .register(&key, &Endpoint::new("127.0.0.1", port_a))
        .expect("register a");
    let lease_b = registry
        .register(&key, &Endpoint::new("127.0.0.1", port_b))
        .expect("register b");

    let mut config = ClientConfig::default();
    config.stale_grace = Duration::from_millis(300);
    let client =
        TripleClient::with_registry(registry.clone(), key.clone(), config).expect("client");
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "SayHello", RpcPattern::Unary);
    let call = |client: &TripleClient| {
        client.unary(
            &method,
            &HelloRequest { name: "churn".into() },
            CallOptions::default(),
        )
    };

    for _ in 0..20 {
        call(&client).expect("call with both providers");
    }

    // B disappears: every new call lands on A
    registry.unregister(lease_b).expect("unregister b");
    fixture_b.server.close();
    for _ in 0..10 {
        call(&client).expect("call with provider a");
    }

    // registry goes empty: the stale list keeps serving within the grace
    // window
    registry.clear(&key);
    call(&client).expect("stale serving");

    // past the grace window the directory gives up
    std::thread::sleep(Duration::from_millis(400));
    let err = call(&client).expect_err("no providers");
    assert_eq!(err.code(), Code::Unavailable);
    assert!(matches!(err, TripleError::NoAvailableProvider(_)));

    fixture_a.server.close();
}

#[rstest]
fn test_call_options_metadata_reaches_handler(_logger: ()) {
    let mut server = TripleServer::new(test_config()).expect("server");
    let seen = Arc::new(Mutex::new(None::<String>));
    {
        let seen = seen.clone();
        server
            .register_unary(
                json_service_method::<HelloRequest, HelloReply>(GREETER, "SayHello"),
                move |ctx, req| {
                    *seen.lock().unwrap() = ctx.get_metadata("x-request-id").map(String::from);
                    Ok(HelloReply { message: req.name })
                },
            )
            .expect("register");
    }
    let addr = server.listen("127.0.0.1:0").expect("listen");
    let client = TripleClient::direct(&format!("tri://{}", addr)).expect("client");
    let method = json_method::<HelloRequest, HelloReply>(GREETER, "SayHello", RpcPattern::Unary);

    client
        .unary(
            &method,
            &HelloRequest { name: "meta".into() },
            CallOptions::default().with_metadata("x-request-id", "req-42"),
        )
        .expect("call");
    assert_eq!(seen.lock().unwrap().as_deref(), Some("req-42"));
    server.close();
}
