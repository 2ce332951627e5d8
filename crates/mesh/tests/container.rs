use async_trait::async_trait;
use bytes::Bytes;
use mesh::connection::{read_frame, DEFAULT_MAX_FRAME_SIZE};
use mesh::{
    Agent, Container, ContainerOptions, ContainerState, Dispatcher, MemoryNaming, MeshError,
    MeshServer, MessageListener, Naming, OpCode, PlainTcpDialer, Server, ServiceInstance,
    KEY_SERVICE_STATE, STATE_ADULT,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wire::protocol::{META_DEST_CHANNELS, META_DEST_SERVER};
use wire::{LogicPkt, LoginReq, Protocol};

/// Server double: knows a fixed set of channels and records pushes.
struct FakeServer {
    instance: ServiceInstance,
    channels: Vec<String>,
    pushed: Mutex<HashMap<String, Vec<Bytes>>>,
    stop: CancellationToken,
}

impl FakeServer {
    fn new(id: &str, channels: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            instance: ServiceInstance::new(id, "gateway", Protocol::Websocket),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            pushed: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        })
    }

    fn pushed_to(&self, channel: &str) -> Vec<Bytes> {
        self.pushed
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Server for FakeServer {
    fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    async fn start(&self) -> mesh::Result<()> {
        self.stop.cancelled().await;
        Ok(())
    }

    async fn push(&self, id: &str, payload: Bytes) -> mesh::Result<()> {
        if !self.channels.iter().any(|c| c == id) {
            return Err(MeshError::ChannelNotFound(id.to_string()));
        }
        self.pushed
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) -> mesh::Result<()> {
        self.stop.cancel();
        Ok(())
    }
}

/// Raw TCP backend that reports every binary frame it reads.
async fn backend() -> (u16, mpsc::UnboundedReceiver<Bytes>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Ok(frame) = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await {
                    if frame.opcode == OpCode::Binary {
                        let _ = tx.send(frame.payload);
                    }
                }
            });
        }
    });
    (port, rx)
}

fn tcp_instance(id: &str, name: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, name, Protocol::Tcp).with_address("127.0.0.1", port)
}

fn container(
    server: Arc<FakeServer>,
    deps: &[&str],
    naming: Arc<MemoryNaming>,
    grace: Duration,
) -> Container {
    let c = Container::with_options(ContainerOptions {
        grace_delay: grace,
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    c.init(server, deps.iter().copied()).unwrap();
    c.set_naming(naming);
    c.set_dialer(Arc::new(PlainTcpDialer));
    c
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn login_packet(channel: &str) -> LogicPkt {
    LogicPkt::new(wire::protocol::COMMAND_LOGIN_SIGN_IN)
        .with_channel(channel)
        .with_body(&LoginReq {
            token: "t0k3n".into(),
            account: "alice".into(),
            app: "im".into(),
        })
        .unwrap()
}

#[tokio::test]
async fn test_forward_delivers_packet_tagged_with_gateway_id() {
    init_tracing();
    let naming = Arc::new(MemoryNaming::new());
    let (port, mut frames) = backend().await;
    naming
        .register(&tcp_instance("login-1", "login", port))
        .await
        .unwrap();

    let c = container(
        FakeServer::new("gw-a", &["c1"]),
        &["login"],
        naming,
        Duration::from_secs(10),
    );
    c.start().await.unwrap();
    assert_eq!(c.state(), ContainerState::Started);

    let pool = c.pool("login").unwrap();
    eventually("login-1 connected", || pool.contains("login-1")).await;
    // Found by the initial query, so routable at once.
    assert_eq!(
        pool.get("login-1").unwrap().meta().get(KEY_SERVICE_STATE).as_deref(),
        Some(STATE_ADULT)
    );

    let packet = login_packet("c1");
    let mut expected = packet.clone();
    expected.add_meta(META_DEST_SERVER, "gw-a");

    c.forward("login", packet).await.unwrap();
    let received = frames.recv().await.unwrap();
    assert_eq!(received, expected.marshal().unwrap());

    let decoded = LogicPkt::decode(&received).unwrap();
    assert_eq!(decoded.header.meta.last().unwrap().key, META_DEST_SERVER);
    assert_eq!(decoded.get_meta(META_DEST_SERVER), Some("gw-a"));

    c.shutdown().await.unwrap();
    assert_eq!(c.state(), ContainerState::Closed);
}

#[tokio::test]
async fn test_forward_replaces_client_supplied_dest_server() {
    let naming = Arc::new(MemoryNaming::new());
    let (port, mut frames) = backend().await;
    naming
        .register(&tcp_instance("login-1", "login", port))
        .await
        .unwrap();
    let c = container(
        FakeServer::new("gw-real", &["c1"]),
        &["login"],
        naming,
        Duration::from_secs(10),
    );
    c.start().await.unwrap();
    let pool = c.pool("login").unwrap();
    eventually("login-1 connected", || pool.contains("login-1")).await;

    let mut packet = login_packet("c1");
    packet.add_meta(META_DEST_SERVER, "gw-evil");
    packet.add_meta("trace", "t-1");
    c.forward("login", packet).await.unwrap();

    let decoded = LogicPkt::decode(&frames.recv().await.unwrap()).unwrap();
    assert_eq!(decoded.get_meta(META_DEST_SERVER), Some("gw-real"));
    let servers = decoded
        .header
        .meta
        .iter()
        .filter(|m| m.key == META_DEST_SERVER)
        .count();
    assert_eq!(servers, 1);
    assert_eq!(decoded.get_meta("trace"), Some("t-1"));

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovered_instance_is_young_until_grace_delay() {
    init_tracing();
    let naming = Arc::new(MemoryNaming::new());
    let (port, mut frames) = backend().await;
    let c = container(
        FakeServer::new("gw-a", &[]),
        &["chat"],
        naming.clone(),
        Duration::from_millis(800),
    );
    c.start().await.unwrap();

    // Let the subscription land before the instance appears.
    tokio::time::sleep(Duration::from_millis(50)).await;
    naming
        .register(&tcp_instance("chat-1", "chat", port))
        .await
        .unwrap();

    let pool = c.pool("chat").unwrap();
    eventually("chat-1 connected", || pool.contains("chat-1")).await;
    assert_eq!(pool.services(None).len(), 1);
    assert!(pool
        .services(Some((KEY_SERVICE_STATE, STATE_ADULT)))
        .is_empty());

    let err = c.forward("chat", login_packet("c1")).await.unwrap_err();
    assert!(err.is_routing_miss(), "{}", err);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(frames.try_recv().is_err());

    eventually("chat-1 promoted", || {
        pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT))).len() == 1
    })
    .await;
    c.forward("chat", login_packet("c1")).await.unwrap();
    assert!(frames.recv().await.is_some());

    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forward_without_adult_instances_is_routing_miss() {
    let c = container(
        FakeServer::new("gw-a", &[]),
        &["chat"],
        Arc::new(MemoryNaming::new()),
        Duration::from_secs(10),
    );

    let err = c.forward("chat", login_packet("c1")).await.unwrap_err();
    assert!(matches!(err, MeshError::NoAvailableInstance(ref s) if s == "chat"));
    assert!(err.is_routing_miss());

    let err = c.forward("nope", login_packet("c1")).await.unwrap_err();
    assert!(matches!(err, MeshError::ServiceNotFound(_)));

    let err = c
        .forward("chat", LogicPkt::new("chat.user.talk"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidPacket(_)));
}

#[tokio::test]
async fn test_push_message_fans_out_past_missing_channel() {
    let server = FakeServer::new("gw-a", &["c1", "c3"]);
    let c = container(
        server.clone(),
        &[],
        Arc::new(MemoryNaming::new()),
        Duration::from_secs(10),
    );

    let mut packet = LogicPkt::new("chat.user.talk").with_channel("c9");
    packet.add_meta(META_DEST_SERVER, "gw-a");
    packet.add_meta(META_DEST_CHANNELS, "c1,c2,c3");

    assert_eq!(c.push_message(packet).await.unwrap(), 2);
    let delivered = server.pushed_to("c1");
    assert_eq!(delivered.len(), 1);
    assert_eq!(server.pushed_to("c3").len(), 1);

    let decoded = LogicPkt::decode(&delivered[0]).unwrap();
    assert_eq!(decoded.get_meta(META_DEST_SERVER), None);
    assert_eq!(decoded.get_meta(META_DEST_CHANNELS), None);
}

#[tokio::test]
async fn test_push_message_rejects_foreign_or_untagged_packets() {
    let server = FakeServer::new("gw-a", &["c1"]);
    let c = container(
        server.clone(),
        &[],
        Arc::new(MemoryNaming::new()),
        Duration::from_secs(10),
    );

    let mut foreign = LogicPkt::new("chat.user.talk");
    foreign.add_meta(META_DEST_SERVER, "gw-b");
    foreign.add_meta(META_DEST_CHANNELS, "c1");
    assert!(matches!(
        c.push_message(foreign).await,
        Err(MeshError::DestServerMismatch { .. })
    ));

    let mut untagged = LogicPkt::new("chat.user.talk");
    untagged.add_meta(META_DEST_SERVER, "gw-a");
    assert!(matches!(
        c.push_message(untagged).await,
        Err(MeshError::MissingMeta(_))
    ));
    assert!(server.pushed_to("c1").is_empty());
}

#[tokio::test]
async fn test_dispatcher_push_tags_gateway_and_channels() {
    let server = FakeServer::new("login-1", &["gw-a"]);
    let c = container(
        server.clone(),
        &[],
        Arc::new(MemoryNaming::new()),
        Duration::from_secs(10),
    );

    let packet = LogicPkt::new("login.signin").with_channel("c1");
    Dispatcher::push(&c, "gw-a", &["c1".to_string(), "c2".to_string()], packet)
        .await
        .unwrap();

    let pushed = server.pushed_to("gw-a");
    assert_eq!(pushed.len(), 1);
    let decoded = LogicPkt::decode(&pushed[0]).unwrap();
    assert_eq!(decoded.get_meta(META_DEST_SERVER), Some("gw-a"));
    assert_eq!(decoded.get_meta(META_DEST_CHANNELS), Some("c1,c2"));

    assert!(matches!(
        c.push("gw-z", LogicPkt::new("login.signin")).await,
        Err(MeshError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn test_init_twice_keeps_first_configuration() {
    let c = Container::new();
    c.init(FakeServer::new("gw-a", &[]), ["login"]).unwrap();

    let err = c.init(FakeServer::new("gw-b", &[]), ["chat"]).unwrap_err();
    assert!(matches!(err, MeshError::AlreadyInitialized));
    assert!(err.is_lifecycle());
    assert_eq!(c.service_id().unwrap(), "gw-a");
    assert_eq!(c.dependencies(), vec!["login".to_string()]);
    assert!(c.pool("chat").is_none());
    assert_eq!(c.state(), ContainerState::Initialized);
}

#[tokio::test]
async fn test_lifecycle_misuse_is_reported() {
    let c = Container::new();
    c.set_naming(Arc::new(MemoryNaming::new()));
    assert!(matches!(c.start().await, Err(MeshError::NotInitialized)));

    let c = Container::new();
    c.init(FakeServer::new("gw-a", &[]), Vec::<String>::new())
        .unwrap();
    assert!(matches!(c.start().await, Err(MeshError::NamingNotConfigured)));
    assert_eq!(c.state(), ContainerState::Initialized);
    assert!(matches!(c.shutdown().await, Err(MeshError::NotStarted)));

    let c = Container::new();
    c.init(FakeServer::new("gw-a", &[]), ["chat"]).unwrap();
    c.set_naming(Arc::new(MemoryNaming::new()));
    assert!(matches!(c.start().await, Err(MeshError::DialerNotConfigured)));
    c.set_dialer(Arc::new(PlainTcpDialer));
    c.start().await.unwrap();
    assert!(matches!(c.start().await, Err(MeshError::AlreadyStarted)));
    c.shutdown().await.unwrap();
    assert!(matches!(c.shutdown().await, Err(MeshError::AlreadyClosed)));
}

#[tokio::test]
async fn test_websocket_instance_is_never_pooled() {
    let naming = Arc::new(MemoryNaming::new());
    naming
        .register(
            &ServiceInstance::new("chat-ws", "chat", Protocol::Websocket)
                .with_address("127.0.0.1", 1),
        )
        .await
        .unwrap();
    let c = container(
        FakeServer::new("gw-a", &[]),
        &["chat"],
        naming,
        Duration::from_secs(10),
    );
    c.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pool = c.pool("chat").unwrap();
    assert!(pool.is_empty());
    // The slot was released, so a later discovery could try again.
    assert!(pool.reserve("chat-ws"));
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_deregisters_and_unsubscribes() {
    let naming = Arc::new(MemoryNaming::new());
    let server = Arc::new(FakeServer {
        instance: ServiceInstance::new("gw-a", "gateway", Protocol::Websocket)
            .with_address("127.0.0.1", 8000),
        channels: Vec::new(),
        pushed: Mutex::new(HashMap::new()),
        stop: CancellationToken::new(),
    });
    let c = container(server, &["chat"], naming.clone(), Duration::from_secs(10));
    c.start().await.unwrap();
    assert_eq!(naming.find("gateway", &[]).await.unwrap().len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    c.shutdown().await.unwrap();
    assert!(naming.find("gateway", &[]).await.unwrap().is_empty());
    naming
        .subscribe("chat", Arc::new(|_: Vec<ServiceInstance>| {}))
        .await
        .expect("subscription should have been released");
}

/// Backend side answering each forwarded packet with a push to the same channel.
struct Bounce;

#[async_trait]
impl MessageListener for Bounce {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
        let request = LogicPkt::decode(&payload).unwrap();
        let gateway = request.get_meta(META_DEST_SERVER).unwrap().to_string();
        let mut reply = LogicPkt::from_header(&request.header);
        reply.add_meta(META_DEST_SERVER, gateway);
        reply.add_meta(META_DEST_CHANNELS, request.header.channel_id.clone());
        agent.push(reply.marshal().unwrap()).await.unwrap();
    }
}

#[tokio::test]
async fn test_round_trip_through_real_server() {
    init_tracing();
    let naming = Arc::new(MemoryNaming::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let backend = MeshServer::builder(
        "127.0.0.1:0",
        tcp_instance("chat-1", "chat", port),
        Arc::new(Bounce),
    )
    .build();
    let serving = backend.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    naming.register(backend.instance()).await.unwrap();

    let gateway = FakeServer::new("gw-a", &["c7"]);
    let c = container(
        gateway.clone(),
        &["chat"],
        naming,
        Duration::from_secs(10),
    );
    c.start().await.unwrap();
    let pool = c.pool("chat").unwrap();
    eventually("chat-1 connected", || pool.contains("chat-1")).await;

    c.forward("chat", LogicPkt::new("chat.user.talk").with_channel("c7"))
        .await
        .unwrap();
    eventually("reply delivered", || !gateway.pushed_to("c7").is_empty()).await;

    c.shutdown().await.unwrap();
    backend.shutdown(Duration::from_secs(2)).await.unwrap();
}
