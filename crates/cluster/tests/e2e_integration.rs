//! End-to-end tests: a client and a server talking over an in-memory duplex
//! stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster::{
    CallOptions, Client, CodecKind, ConnectionConfig, Definitions, Error, ErrorMode,
    ExceptionReporter, ExportRegistry, Exports, Kwargs, LocalObject, PerOsThread, RemoteError,
    RemoteException, RemoteObject, Server, ThreadTarget, TypeDescriptor, Value,
};
use protocol::{MessageType, SharedKey, PROTOCOL_VERSION};
use tokio::task::JoinHandle;

// ============================================================================
// Helpers
// ============================================================================

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side object with a method, a plain attribute and a cached one.
struct Counter {
    value: Mutex<i64>,
    label_reads: Arc<AtomicUsize>,
}

impl RemoteObject for Counter {
    fn descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::Exports(Exports::new(&["incr", "get"], &["value"], &["label"]))
    }

    fn call_method(
        &self,
        method: &str,
        args: Vec<Value>,
        _kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        let mut value = self.value.lock().unwrap();
        match method {
            "incr" => {
                *value += args.first().and_then(Value::as_int).unwrap_or(1);
                Ok(Value::Int(*value))
            }
            "get" => Ok(Value::Int(*value)),
            other => Err(RemoteError::attribute_error(other)),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        match name {
            "value" => Ok(Value::Int(*self.value.lock().unwrap())),
            "label" => {
                self.label_reads.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from("counter"))
            }
            _ => Err(RemoteError::attribute_error(name)),
        }
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RemoteError> {
        match (name, value.as_int()) {
            ("value", Some(v)) => {
                *self.value.lock().unwrap() = v;
                Ok(())
            }
            ("value", None) => Err(RemoteError::type_error("value must be an int")),
            _ => Err(RemoteError::attribute_error(name)),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "incr" | "get")
    }
}

/// Records reported exceptions.
#[derive(Default)]
struct CapturingReporter {
    reports: Mutex<Vec<String>>,
}

impl ExceptionReporter for CapturingReporter {
    fn report(&self, _peer: &str, exc: &RemoteException) {
        self.reports.lock().unwrap().push(exc.text());
    }
}

/// State shared between the test and the served functions.
#[derive(Default, Clone)]
struct Probes {
    log: Arc<Mutex<Vec<i64>>>,
    label_reads: Arc<AtomicUsize>,
}

fn registry(probes: &Probes) -> ExportRegistry {
    let log = Arc::clone(&probes.log);
    let label_reads = Arc::clone(&probes.label_reads);
    ExportRegistry::new()
        .function("echo", |args, _| Ok(args.into_iter().next().unwrap_or_default()))
        .function("fail", |_, _| Err(RemoteError::value_error("boom")))
        .function("sleep", |args, _| {
            let ms = args.first().and_then(Value::as_int).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(Value::Nil)
        })
        .function("record", move |args, _| {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            let delay = args.get(1).and_then(Value::as_int).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(delay as u64));
            log.lock().unwrap().push(n);
            Ok(Value::Nil)
        })
        .function("make_counter", move |_, _| {
            Ok(Value::Local(LocalObject::new(Counter {
                value: Mutex::new(0),
                label_reads: Arc::clone(&label_reads),
            })))
        })
}

fn definitions(probes: &Probes) -> Arc<Definitions> {
    Arc::new(Definitions::new().with_module("remote_code", registry(probes)))
}

fn spawn_server(server: &Server) -> JoinHandle<cluster::Result<()>> {
    let server = server.clone();
    tokio::spawn(async move { server.run().await })
}

/// Client and running server over a duplex stream, not yet waited on.
async fn connect_with(
    client_config: &ConnectionConfig,
    server_config: &ConnectionConfig,
    probes: &Probes,
) -> (Client, Server, JoinHandle<cluster::Result<()>>) {
    let key = SharedKey::generate();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Server::new(server_io, &key, definitions(probes), server_config);
    let task = spawn_server(&server);
    let client = Client::new(client_io, &key, client_config).await.unwrap();
    client.spawn_reader();
    (client, server, task)
}

/// Ready client and server with default settings.
async fn connect(probes: &Probes) -> (Client, Server, JoinHandle<cluster::Result<()>>) {
    let config = ConnectionConfig::default();
    let (client, server, task) = connect_with(&config, &config, probes).await;
    tokio::time::timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("handshake timed out")
        .unwrap();
    (client, server, task)
}

/// Ready client and server where the client drives its own reads.
async fn connect_without_reader(probes: &Probes) -> (Client, Server, JoinHandle<cluster::Result<()>>) {
    let key = SharedKey::generate();
    let config = ConnectionConfig::default();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Server::new(server_io, &key, definitions(probes), &config);
    let task = spawn_server(&server);
    let client = Client::new(client_io, &key, &config).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("handshake timed out")
        .unwrap();
    (client, server, task)
}

async fn echo(client: &Client, value: Value) -> cluster::Result<Value> {
    client.call("echo", vec![value], Kwargs::new()).await
}

fn call_args(func: &str, args: Vec<Value>) -> Vec<Value> {
    let mut all = vec![Value::from(func)];
    all.extend(args);
    all
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_and_versions() {
    let probes = Probes::default();
    let (client, server, task) = connect(&probes).await;

    assert!(client.is_ready());
    assert_eq!(client.server_version().as_deref(), Some(PROTOCOL_VERSION));

    echo(&client, Value::Nil).await.unwrap();
    assert!(server.is_ready());

    client.close();
    tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_wrong_key_never_becomes_ready() {
    let probes = Probes::default();
    let config = ConnectionConfig::default();
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Server::new(server_io, &SharedKey::generate(), definitions(&probes), &config);
    let _task = spawn_server(&server);
    let client = Client::new(client_io, &SharedKey::generate(), &config)
        .await
        .unwrap();
    client.spawn_reader();

    let ready = tokio::time::timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .unwrap();
    assert!(ready.is_err());
    assert!(client.is_closed());
    assert!(!server.is_ready());
}

#[tokio::test]
async fn test_unknown_definitions_module_is_rejected() {
    let probes = Probes::default();
    let client_config = ConnectionConfig {
        definitions_module: "no_such_module".to_string(),
        ..ConnectionConfig::default()
    };
    let (client, server, _task) =
        connect_with(&client_config, &ConnectionConfig::default(), &probes).await;

    let result = tokio::time::timeout(TEST_TIMEOUT, echo(&client, Value::Nil))
        .await
        .unwrap();
    assert!(result.is_err());
    tokio::time::timeout(TEST_TIMEOUT, client.connection().closed())
        .await
        .unwrap();
    assert!(!server.is_ready());
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_echo_roundtrip() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let mut map = Kwargs::new();
    map.insert("n".to_string(), Value::Int(1));
    map.insert("bytes".to_string(), Value::Bytes(vec![0, 1, 2]));
    let value = Value::List(vec![Value::from("hello"), Value::Float(1.5), Value::Map(map)]);

    assert_eq!(echo(&client, value.clone()).await.unwrap(), value);
}

#[tokio::test]
async fn test_blocking_call_drives_its_own_reads() {
    let probes = Probes::default();
    let (client, _server, _task) = connect_without_reader(&probes).await;
    assert!(!client.connection().has_reader());

    let result = tokio::time::timeout(TEST_TIMEOUT, echo(&client, Value::from("hello")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from("hello"));
}

#[tokio::test]
async fn test_malformed_request_ends_connection() {
    let probes = Probes::default();
    let (client, server, task) = connect(&probes).await;

    client
        .connection()
        .send_message(MessageType::Request, vec![0xc1, 0xff, 0x00])
        .await
        .unwrap();

    let served = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(served, Err(Error::InvalidRecord(_))));
    assert!(server.is_closed());
    tokio::time::timeout(TEST_TIMEOUT, client.connection().closed())
        .await
        .unwrap();
    assert!(echo(&client, Value::Nil).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_globals() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    client.set_global("answer", Value::Int(42)).await.unwrap();
    assert_eq!(client.get_global("answer").await.unwrap(), Value::Int(42));

    let missing = client.get_global("missing").await.unwrap_err();
    assert_eq!(missing.remote_error().unwrap().kind, "NameError");
}

#[tokio::test]
async fn test_remote_error_is_reported_then_returned() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;
    let reporter = Arc::new(CapturingReporter::default());
    client.set_reporter(reporter.clone());

    let err = client.call("fail", vec![], Kwargs::new()).await.unwrap_err();
    match err {
        Error::Remote(e) => assert_eq!(e, RemoteError::value_error("boom")),
        other => panic!("Expected Error::Remote, got {:?}", other),
    }
    let reports = reporter.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("boom"));
}

#[tokio::test]
async fn test_quiet_and_wrapped_error_modes() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;
    let reporter = Arc::new(CapturingReporter::default());
    client.set_reporter(reporter.clone());

    let quiet = client
        .send_request(0, "call", call_args("fail", vec![]), Kwargs::new(), CallOptions::default())
        .await
        .unwrap()
        .wait_with(ErrorMode::Quiet)
        .await
        .unwrap_err();
    assert!(matches!(quiet, Error::Remote(ref e) if e.kind == "ValueError"));

    let options = CallOptions::default().with_error_mode(ErrorMode::Wrapped);
    let wrapped = client
        .send_request(0, "call", call_args("fail", vec![]), Kwargs::new(), options)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    match wrapped {
        Error::RemoteException(exc) => {
            assert_eq!(exc.error.kind, "ValueError");
            assert!(exc.text().contains("boom"));
        }
        other => panic!("Expected Error::RemoteException, got {:?}", other),
    }

    assert!(reporter.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_nonblocking_calls_correlate_by_id() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let mut pending = Vec::new();
    for i in 0..20 {
        let call = client
            .call_nonblocking("echo", vec![Value::Int(i)], Kwargs::new())
            .await
            .unwrap();
        pending.push((i, call));
    }
    let ids: Vec<u64> = pending.iter().map(|(_, call)| call.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    while let Some((i, call)) = pending.pop() {
        assert_eq!(call.wait().await.unwrap(), Value::Int(i));
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_callback_completion() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .call_with_callback(
            "echo",
            vec![Value::from("via callback")],
            Kwargs::new(),
            move |value| {
                let _ = tx.send(value);
            },
            |err| panic!("unexpected error: {}", err),
        )
        .await
        .unwrap();

    let value = tokio::time::timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(value, Value::from("via callback"));
}

#[tokio::test]
async fn test_json_codec_with_compression() {
    let probes = Probes::default();
    let config = ConnectionConfig {
        codec: CodecKind::Json,
        enable_compression: true,
        ..ConnectionConfig::default()
    };
    let (client, _server, _task) = connect_with(&config, &config, &probes).await;
    client.wait_ready().await.unwrap();

    let big = Value::from("x".repeat(200_000));
    assert_eq!(echo(&client, big.clone()).await.unwrap(), big);
}

// ============================================================================
// Readiness
// ============================================================================

#[tokio::test]
async fn test_calls_queue_until_ready() {
    let probes = Probes::default();
    let config = ConnectionConfig::default();
    let key = SharedKey::generate();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Server::new(server_io, &key, definitions(&probes), &config);
    let client = Client::new(client_io, &key, &config).await.unwrap();
    client.spawn_reader();

    let mut pending = Vec::new();
    for i in 1..=3 {
        let call = client
            .send_request(
                0,
                "call",
                call_args("record", vec![Value::Int(i), Value::Int(0)]),
                Kwargs::new(),
                CallOptions::default(),
            )
            .await
            .unwrap();
        pending.push(call);
    }
    assert!(!client.is_ready());

    let _task = spawn_server(&server);
    for call in pending {
        tokio::time::timeout(TEST_TIMEOUT, call.wait())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(*probes.log.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_not_ready_without_queueing() {
    let probes = Probes::default();
    let config = ConnectionConfig {
        queue_before_ready: false,
        ..ConnectionConfig::default()
    };
    let key = SharedKey::generate();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Server::new(server_io, &key, definitions(&probes), &config);
    let client = Client::new(client_io, &key, &config).await.unwrap();
    client.spawn_reader();

    let err = echo(&client, Value::Nil).await.unwrap_err();
    assert!(matches!(err, Error::NotReady));
    assert_eq!(client.pending_count(), 0);

    let _task = spawn_server(&server);
    client.wait_ready().await.unwrap();
    assert_eq!(echo(&client, Value::Int(1)).await.unwrap(), Value::Int(1));
}

// ============================================================================
// Proxies
// ============================================================================

#[tokio::test]
async fn test_proxy_methods_and_attributes() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let counter = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    assert!(!counter.proxy_type().is_dynamic());

    assert_eq!(counter.call("incr", vec![Value::Int(5)], Kwargs::new()).await.unwrap(), Value::Int(5));
    assert_eq!(counter.get_attr("value").await.unwrap(), Value::Int(5));
    counter.set_attr("value", Value::Int(9)).await.unwrap();
    assert_eq!(counter.call("get", vec![], Kwargs::new()).await.unwrap(), Value::Int(9));

    assert!(counter.has_method("incr").await.unwrap());
    assert!(!counter.has_method("value").await.unwrap());
}

#[tokio::test]
async fn test_cached_attribute_is_fetched_once() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let counter = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    assert_eq!(counter.get_attr("label").await.unwrap(), Value::from("counter"));
    assert_eq!(counter.get_attr("label").await.unwrap(), Value::from("counter"));
    assert_eq!(probes.label_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unexported_members_fail_locally() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let counter = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    let pending_before = client.pending_count();

    let err = counter.call("frobnicate", vec![], Kwargs::new()).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedMember { ref member, .. } if member == "frobnicate"));
    let err = counter.get_attr("secret").await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedMember { .. }));
    assert_eq!(client.pending_count(), pending_before);
}

#[tokio::test]
async fn test_proxy_passed_back_as_argument() {
    let probes = Probes::default();
    let (client, server, _task) = connect(&probes).await;

    let counter = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    let back = echo(&client, Value::Proxy(counter.clone())).await.unwrap();
    assert_eq!(back.as_proxy(), Some(&counter));
    assert_eq!(server.object_count(), 1);
    assert_eq!(client.proxy_count(), 1);
}

#[tokio::test]
async fn test_proxy_from_another_connection_is_rejected() {
    let probes = Probes::default();
    let (first, _first_server, _first_task) = connect(&probes).await;
    let (second, second_server, _second_task) = connect(&probes).await;

    let counter = first
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    let err = echo(&second, Value::Proxy(counter.clone())).await.unwrap_err();
    assert!(matches!(err, Error::ForeignProxy { object_id } if object_id == counter.object_id()));
    assert_eq!(second_server.object_count(), 0);

    // The rejected call leaves the connection usable.
    assert_eq!(echo(&second, Value::from("still here")).await.unwrap(), Value::from("still here"));
}

#[tokio::test]
async fn test_dropped_proxy_is_released_with_next_request() {
    let probes = Probes::default();
    let (client, server, _task) = connect(&probes).await;

    let counter = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    let other = client
        .call("make_counter", vec![], Kwargs::new())
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    assert_ne!(counter.object_id(), other.object_id());
    assert_eq!(server.object_count(), 2);

    drop(counter);
    assert_eq!(server.object_count(), 2);

    echo(&client, Value::Nil).await.unwrap();
    assert_eq!(server.object_count(), 1);
    assert_eq!(client.proxy_count(), 1);

    echo(&client, Value::Nil).await.unwrap();
    assert_eq!(server.object_count(), 1);
}

// ============================================================================
// Logical threads
// ============================================================================

#[tokio::test]
async fn test_same_thread_requests_run_in_order() {
    let probes = Probes::default();
    let (client, server, _task) = connect(&probes).await;

    let thread = CallOptions::on_thread(ThreadTarget::Id(5));
    let mut pending = Vec::new();
    for (n, delay) in [(1, 100), (2, 0), (3, 50)] {
        let call = client
            .send_request(
                0,
                "call",
                call_args("record", vec![Value::Int(n), Value::Int(delay)]),
                Kwargs::new(),
                thread,
            )
            .await
            .unwrap();
        pending.push(call);
    }
    for call in pending {
        call.wait().await.unwrap();
    }
    assert_eq!(*probes.log.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(server.thread_count(), 1);
}

#[tokio::test]
async fn test_single_thread_requests_do_not_wait() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let slow = client
        .send_request(
            0,
            "call",
            call_args("record", vec![Value::Int(1), Value::Int(300)]),
            Kwargs::new(),
            CallOptions::on_thread(ThreadTarget::Id(1)),
        )
        .await
        .unwrap();
    let fast = client
        .send_request(
            0,
            "call",
            call_args("record", vec![Value::Int(2), Value::Int(0)]),
            Kwargs::new(),
            CallOptions::on_thread(ThreadTarget::Single),
        )
        .await
        .unwrap();

    fast.wait().await.unwrap();
    slow.wait().await.unwrap();
    assert_eq!(*probes.log.lock().unwrap(), vec![2, 1]);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let probes = Probes::default();
    let (client, _server, _task) = connect_without_reader(&probes).await;

    let slow = client
        .send_request(
            0,
            "call",
            call_args("record", vec![Value::Int(1), Value::Int(300)]),
            Kwargs::new(),
            CallOptions::on_thread(ThreadTarget::Id(1)),
        )
        .await
        .unwrap();
    let fast = client
        .send_request(
            0,
            "call",
            call_args("echo", vec![Value::from("fast")]),
            Kwargs::new(),
            CallOptions::on_thread(ThreadTarget::Id(2)),
        )
        .await
        .unwrap();
    assert!(slow.id() < fast.id());

    // Waiting on the slow call reads the fast response first.
    let slow_result = tokio::time::timeout(TEST_TIMEOUT, slow.wait()).await.unwrap();
    assert_eq!(slow_result.unwrap(), Value::Nil);
    let fast_result = tokio::time::timeout(TEST_TIMEOUT, fast.wait()).await.unwrap();
    assert_eq!(fast_result.unwrap(), Value::from("fast"));
    assert_eq!(*probes.log.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_stop_remote_thread() {
    let probes = Probes::default();
    let (client, server, _task) = connect(&probes).await;

    client
        .send_request(
            0,
            "call",
            call_args("echo", vec![Value::Nil]),
            Kwargs::new(),
            CallOptions::on_thread(ThreadTarget::Id(3)),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(server.thread_count(), 1);

    client.stop_remote_thread(3).await.unwrap();
    echo(&client, Value::Nil).await.unwrap();
    // Only the default thread 0 remains.
    assert_eq!(server.thread_count(), 1);
}

#[tokio::test]
async fn test_per_os_thread_policy() {
    let probes = Probes::default();
    let (client, server, _task) = connect(&probes).await;
    let policy = Arc::new(PerOsThread::default());
    client.set_thread_policy(policy.clone());

    echo(&client, Value::Nil).await.unwrap();
    echo(&client, Value::Nil).await.unwrap();
    assert_eq!(policy.assigned(), vec![1]);
    assert_eq!(server.thread_count(), 1);
}

// ============================================================================
// Closing
// ============================================================================

#[tokio::test]
async fn test_close_resolves_outstanding_calls_and_proxies() {
    let probes = Probes::default();
    let (client, _server, _task) = connect(&probes).await;

    let mut proxies = Vec::new();
    for _ in 0..3 {
        let proxy = client
            .call("make_counter", vec![], Kwargs::new())
            .await
            .unwrap()
            .into_proxy()
            .unwrap();
        proxies.push(proxy);
    }

    let mut pending = Vec::new();
    for _ in 0..4 {
        let call = client
            .send_request(
                0,
                "call",
                call_args("sleep", vec![Value::Int(200)]),
                Kwargs::new(),
                CallOptions::on_thread(ThreadTarget::Single),
            )
            .await
            .unwrap();
        pending.push(call);
    }
    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .call_with_callback(
            "sleep",
            vec![Value::Int(200)],
            Kwargs::new(),
            |_| panic!("call should not succeed"),
            move |err| {
                let _ = tx.send(err);
            },
        )
        .await
        .unwrap();

    client.close();
    client.close();
    assert!(client.is_closed());
    assert!(!client.connection().close("again"));

    for call in pending {
        let err = call.wait().await.unwrap_err();
        assert!(err.is_closed(), "unexpected error: {:?}", err);
    }
    let err = tokio::time::timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(err.is_closed());

    for proxy in &proxies {
        assert!(!proxy.is_connected());
        let err = proxy.call("incr", vec![], Kwargs::new()).await.unwrap_err();
        assert!(err.is_closed());
    }
    assert_eq!(client.pending_count(), 0);
    assert!(echo(&client, Value::Nil).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_server_close_ends_client() {
    let probes = Probes::default();
    let (client, server, task) = connect(&probes).await;

    server.close();
    tokio::time::timeout(TEST_TIMEOUT, client.connection().closed())
        .await
        .unwrap();
    assert!(client.is_closed());
    assert!(tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap().is_ok());
    assert_eq!(server.object_count(), 0);
}

// ============================================================================
// Keep-alive
// ============================================================================

#[tokio::test]
async fn test_keepalives_hold_idle_connection_open() {
    let probes = Probes::default();
    let config = ConnectionConfig {
        keep_alive_interval_secs: Some(1),
        keep_alive_timeout_secs: 2,
        ..ConnectionConfig::default()
    };
    let (client, _server, _task) = connect_with(&config, &ConnectionConfig::default(), &probes).await;
    client.wait_ready().await.unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!client.is_closed());
    assert!(client.connection().idle_for() < Duration::from_secs(2));
    assert_eq!(echo(&client, Value::Int(7)).await.unwrap(), Value::Int(7));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let config = ConnectionConfig {
        keep_alive_interval_secs: Some(1),
        keep_alive_timeout_secs: 2,
        ..ConnectionConfig::default()
    };
    let (client_io, _silent) = tokio::io::duplex(1 << 16);
    let client = Client::new(client_io, &SharedKey::generate(), &config)
        .await
        .unwrap();
    let pending = client
        .call_nonblocking("echo", vec![Value::Nil], Kwargs::new())
        .await
        .unwrap();
    client.spawn_reader();

    let err = tokio::time::timeout(TEST_TIMEOUT, pending.wait())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        Error::ConnectionClosed(reason) => assert_eq!(reason, "Remote server not responding"),
        other => panic!("Expected ConnectionClosed, got {:?}", other),
    }
    assert!(client.is_closed());
}
