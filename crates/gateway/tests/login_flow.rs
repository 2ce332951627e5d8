use async_trait::async_trait;
use bytes::Bytes;
use gateway::{create_router, GatewayHandler, HandshakeDialer};
use mesh::connection::DEFAULT_MAX_FRAME_SIZE;
use mesh::{
    boxed, Acceptor, Agent, Container, FramedConnection, MemoryNaming, MeshError, MeshServer,
    MessageListener, Naming, OpCode, Server, ServiceInstance,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use wire::protocol::{
    COMMAND_LOGIN_SIGN_IN, COMMAND_LOGIN_SIGN_OUT, META_DEST_CHANNELS, META_DEST_SERVER, SN_LOGIN,
};
use wire::{Flag, InnerHandshakeReq, LogicPkt, LoginReq, Protocol, Session, Status};

/// Logic-side acceptor keyed by the dialing gateway's id.
struct HandshakeAcceptor;

#[async_trait]
impl Acceptor for HandshakeAcceptor {
    async fn accept(&self, conn: &mut FramedConnection, wait: Duration) -> mesh::Result<String> {
        let frame = timeout(wait, conn.read_frame())
            .await
            .map_err(|_| MeshError::Timeout("handshake"))??;
        let req: InnerHandshakeReq = serde_json::from_slice(&frame.payload)?;
        Ok(req.service_id)
    }
}

/// Records every request and answers sign-ins.
struct LoginBackend {
    seen: mpsc::UnboundedSender<LogicPkt>,
}

#[async_trait]
impl MessageListener for LoginBackend {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
        let request = LogicPkt::decode(&payload).unwrap();
        let _ = self.seen.send(request.clone());
        if request.command() != COMMAND_LOGIN_SIGN_IN {
            return;
        }
        // The gateway registers the channel only after its acceptor returns.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut resp = LogicPkt::from_header(&request.header);
        resp.header.flag = Flag::Response;
        resp.header.status = Status::Success;
        resp.add_meta(META_DEST_SERVER, agent.id());
        resp.add_meta(META_DEST_CHANNELS, request.header.channel_id.clone());
        agent.push(resp.marshal().unwrap()).await.unwrap();
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn connect_user(port: u16) -> FramedConnection {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            let url = format!("ws://127.0.0.1:{}/", port);
            return FramedConnection::connect_websocket(&url, boxed(stream), DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway never started listening");
}

#[tokio::test]
async fn test_login_round_trip_and_logout_on_disconnect() {
    let naming = Arc::new(MemoryNaming::new());

    // Login backend.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let backend = MeshServer::builder(
        "127.0.0.1:0",
        ServiceInstance::new("login-1", SN_LOGIN, Protocol::Tcp)
            .with_address("127.0.0.1", backend_port),
        Arc::new(LoginBackend { seen: seen_tx }),
    )
    .acceptor(Arc::new(HandshakeAcceptor))
    .build();
    let serving = backend.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    naming.register(backend.instance()).await.unwrap();

    // Gateway.
    let gateway_port = free_port().await;
    let container = Container::new();
    let handler = Arc::new(GatewayHandler::new("gw-1", container.clone()));
    let server = MeshServer::builder(
        format!("127.0.0.1:{}", gateway_port),
        ServiceInstance::new("gw-1", "wgateway", Protocol::Websocket),
        handler.clone(),
    )
    .acceptor(handler.clone())
    .state_listener(handler)
    .build();
    container
        .init(Arc::new(server.clone()), [SN_LOGIN])
        .unwrap();
    container.set_naming(naming);
    container.set_dialer(Arc::new(HandshakeDialer::new("gw-1")));
    container.start().await.unwrap();

    let pool = container.pool(SN_LOGIN).unwrap();
    for _ in 0..300 {
        if pool.contains("login-1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pool.contains("login-1"));

    let health_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let health_addr = health_listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(health_listener, create_router(server)).await });

    // User logs in.
    let mut user = connect_user(gateway_port).await;
    let login = LogicPkt::new(COMMAND_LOGIN_SIGN_IN)
        .with_body(&LoginReq {
            token: "t".into(),
            account: "alice".into(),
            app: "im".into(),
        })
        .unwrap();
    user.write_frame(OpCode::Binary, &login.marshal().unwrap())
        .await
        .unwrap();
    user.flush().await.unwrap();

    let forwarded = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.command(), COMMAND_LOGIN_SIGN_IN);
    assert_eq!(forwarded.get_meta(META_DEST_SERVER), Some("gw-1"));
    let session: Session = forwarded.read_body().unwrap();
    assert_eq!(session.account, "alice");
    assert_eq!(session.gate_id, "gw-1");
    assert_eq!(session.remote_ip, "127.0.0.1");
    assert!(session.channel_id.starts_with("gw-1_alice_"));
    assert_eq!(forwarded.channel_id(), session.channel_id);

    let frame = timeout(Duration::from_secs(5), user.read_frame())
        .await
        .unwrap()
        .unwrap();
    let resp = LogicPkt::decode(&frame.payload).unwrap();
    assert_eq!(resp.header.flag, Flag::Response);
    assert_eq!(resp.channel_id(), session.channel_id);
    assert!(resp.header.meta.is_empty());

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", health_addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["channels"], 1);

    // Disconnect triggers a sign-out for the same channel.
    user.close().await.unwrap();
    drop(user);
    let logout = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logout.command(), COMMAND_LOGIN_SIGN_OUT);
    assert_eq!(logout.channel_id(), session.channel_id);

    container.shutdown().await.unwrap();
    backend.shutdown(Duration::from_secs(2)).await.unwrap();
}
