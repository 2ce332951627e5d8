//! Service container: discovery, client pools, forwarding and pushing.
//!
//! One `Container` is built per process and cloned into whatever needs it
//! (listeners, handlers). It moves through
//! `uninitialized -> initialized -> started -> closed`; each step is a
//! compare-and-swap and stepping from the wrong state is an error.
//!
//! ## Routing
//!
//! ```text
//! gateway channel --forward(service)--> pool[service] (adult only)
//!                                         | selector(channel id)
//!                                         v
//!                                   OutboundClient --tcp--> backend channel
//!
//! backend --push(gateway id)--> server channel (gateway's client)
//!                               --> gateway readloop --push_message--> user channels
//! ```
//!
//! Instances that show up through a discovery notification start `young`
//! and become `adult` after the grace delay; instances found by the initial
//! query are `adult` straight away. Only `adult` members are routed to.

use crate::client::OutboundClient;
use crate::config::ContainerOptions;
use crate::dialer::Dialer;
use crate::error::{MeshError, Result};
use crate::frame::OpCode;
use crate::naming::{
    Naming, ServiceCallback, ServiceInstance, ServiceMeta, KEY_SERVICE_STATE, STATE_ADULT,
    STATE_YOUNG,
};
use crate::pool::ClientPool;
use crate::router::Dispatcher;
use crate::selector::{HashSelector, Selector};
use crate::traits::Server;
use async_trait::async_trait;
use metrics::counter;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wire::protocol::{META_DEST_CHANNELS, META_DEST_SERVER};
use wire::{Header, LogicPkt, Protocol};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerState {
    Uninitialized = 0,
    Initialized = 1,
    Started = 2,
    Closed = 3,
}

impl ContainerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContainerState::Uninitialized,
            1 => ContainerState::Initialized,
            2 => ContainerState::Started,
            _ => ContainerState::Closed,
        }
    }
}

struct ContainerInner {
    state: AtomicU8,
    options: ContainerOptions,
    server: OnceLock<Arc<dyn Server>>,
    dependencies: OnceLock<BTreeSet<String>>,
    pools: RwLock<HashMap<String, Arc<ClientPool>>>,
    naming: RwLock<Option<Arc<dyn Naming>>>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    selector: RwLock<Arc<dyn Selector>>,
    registered: AtomicBool,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Process-wide service container handle. Cheap to clone.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Container {
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                state: AtomicU8::new(ContainerState::Uninitialized as u8),
                options,
                server: OnceLock::new(),
                dependencies: OnceLock::new(),
                pools: RwLock::new(HashMap::new()),
                naming: RwLock::new(None),
                dialer: RwLock::new(None),
                selector: RwLock::new(Arc::new(HashSelector)),
                registered: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    /// Record the owning server and the services this process depends on,
    /// and allocate an empty pool per dependency.
    pub fn init<I, S>(&self, server: Arc<dyn Server>, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transition(ContainerState::Uninitialized, ContainerState::Initialized)?;

        let dependencies: BTreeSet<String> = dependencies
            .into_iter()
            .map(Into::into)
            .filter(|d: &String| !d.is_empty())
            .collect();
        {
            let mut pools = write(&self.inner.pools);
            for dep in &dependencies {
                pools
                    .entry(dep.clone())
                    .or_insert_with(|| Arc::new(ClientPool::new(dep.clone())));
            }
        }
        info!(
            "Container initialized for {} ({}), dependencies: {:?}",
            server.instance().id,
            server.instance().name,
            dependencies
        );
        let _ = self.inner.dependencies.set(dependencies);
        let _ = self.inner.server.set(server);
        Ok(())
    }

    pub fn set_naming(&self, naming: Arc<dyn Naming>) {
        *write(&self.inner.naming) = Some(naming);
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *write(&self.inner.dialer) = Some(dialer);
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *write(&self.inner.selector) = selector;
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.inner
            .dependencies
            .get()
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn server(&self) -> Result<&Arc<dyn Server>> {
        self.inner.server.get().ok_or(MeshError::NotInitialized)
    }

    /// Id of the local server.
    pub fn service_id(&self) -> Result<&str> {
        Ok(self.server()?.instance().id.as_str())
    }

    fn naming(&self) -> Option<Arc<dyn Naming>> {
        read(&self.inner.naming).clone()
    }

    fn selector(&self) -> Arc<dyn Selector> {
        read(&self.inner.selector).clone()
    }

    pub fn pool(&self, service: &str) -> Option<Arc<ClientPool>> {
        read(&self.inner.pools).get(service).cloned()
    }

    fn pool_or_create(&self, service: &str) -> Arc<ClientPool> {
        if let Some(pool) = self.pool(service) {
            return pool;
        }
        write(&self.inner.pools)
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ClientPool::new(service)))
            .clone()
    }

    fn transition(&self, from: ContainerState, to: ContainerState) -> Result<()> {
        match self.inner.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => Err(match ContainerState::from_u8(current) {
                ContainerState::Uninitialized => MeshError::NotInitialized,
                ContainerState::Initialized if to == ContainerState::Closed => {
                    MeshError::NotStarted
                }
                ContainerState::Initialized => MeshError::AlreadyInitialized,
                ContainerState::Started => MeshError::AlreadyStarted,
                ContainerState::Closed => MeshError::AlreadyClosed,
            }),
        }
    }

    /// Start the server, connect to every dependency in the background and
    /// register this instance if it is publicly reachable. Returns without
    /// waiting for any connection.
    pub async fn start(&self) -> Result<()> {
        let naming = self.naming().ok_or(MeshError::NamingNotConfigured)?;
        if !self.dependencies().is_empty() && read(&self.inner.dialer).is_none() {
            return Err(MeshError::DialerNotConfigured);
        }
        self.transition(ContainerState::Initialized, ContainerState::Started)?;
        let server = self.server()?.clone();

        let srv = server.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = srv.start().await {
                error!("Server {} stopped with error: {}", srv.instance().id, e);
            }
        });

        for dep in self.dependencies() {
            let this = self.clone();
            self.inner
                .tasks
                .spawn(async move { this.connect_to_service(dep).await });
        }

        let instance = server.instance();
        if instance.is_public() {
            match naming.register(instance).await {
                Ok(()) => {
                    self.inner.registered.store(true, Ordering::Release);
                    info!("Registered {} at {}", instance.id, instance.dial_url());
                }
                Err(e) => error!("Register {} failed: {}", instance.id, e),
            }
        }
        info!("Container started");
        Ok(())
    }

    /// `start`, wait for `signal`, then `shutdown`.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }

    /// Close the server, deregister from naming and close every client.
    ///
    /// A server shutdown failure is returned first; otherwise the first
    /// naming failure is returned. Both are logged.
    pub async fn shutdown(&self) -> Result<()> {
        self.transition(ContainerState::Started, ContainerState::Closed)?;
        info!("Container shutting down");
        self.inner.cancel.cancel();
        let wait = self.inner.options.shutdown_timeout;

        let server = self.server()?.clone();
        let server_result = server.shutdown(wait).await;
        if let Err(e) = &server_result {
            error!("Server shutdown failed, channel state is undefined: {}", e);
        }

        let mut naming_result = Ok(());
        if let Some(naming) = self.naming() {
            if self.inner.registered.load(Ordering::Acquire) {
                let id = &server.instance().id;
                if let Err(e) = naming.deregister(id).await {
                    warn!("Deregister {} failed: {}", id, e);
                    naming_result = Err(e);
                }
            }
            for dep in self.dependencies() {
                if let Err(e) = naming.unsubscribe(&dep).await {
                    warn!("Unsubscribe {} failed: {}", dep, e);
                    if naming_result.is_ok() {
                        naming_result = Err(e);
                    }
                }
            }
        }

        let pools: Vec<Arc<ClientPool>> = read(&self.inner.pools).values().cloned().collect();
        for pool in pools {
            for client in pool.clients() {
                client.close().await;
            }
        }

        self.inner.tasks.close();
        if timeout(wait, self.inner.tasks.wait()).await.is_err() {
            warn!("Background tasks still running after {:?}", wait);
        }
        info!("Container shut down");
        server_result?;
        naming_result
    }

    async fn connect_to_service(self, name: String) {
        let Some(naming) = self.naming() else {
            return;
        };
        let pool = self.pool_or_create(&name);

        let this = self.clone();
        let watched = pool.clone();
        let callback: ServiceCallback =
            Arc::new(move |members: Vec<ServiceInstance>| this.on_members(&watched, members));
        loop {
            match naming.subscribe(&name, callback.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Subscribe to {} failed: {}", name, e);
                    if !self.backoff().await {
                        return;
                    }
                }
            }
        }

        let existing = loop {
            match naming.find(&name, &[]).await {
                Ok(existing) => break existing,
                Err(e) => {
                    warn!("Find {} failed: {}", name, e);
                    if !self.backoff().await {
                        return;
                    }
                }
            }
        };
        info!("Found {} existing instances of {}", existing.len(), name);
        for instance in existing {
            if !pool.reserve(&instance.id) {
                continue;
            }
            let meta = Arc::new(ServiceMeta::new(instance.meta.clone()));
            meta.set(KEY_SERVICE_STATE, STATE_ADULT);
            let id = instance.id.clone();
            if let Err(e) = self.build_client(&pool, instance, meta).await {
                warn!("Connect to {} failed: {}", id, e);
            }
        }
    }

    /// Sleep before a retry. False if the container is closing.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            _ = sleep(RETRY_DELAY) => true,
        }
    }

    fn on_members(&self, pool: &Arc<ClientPool>, members: Vec<ServiceInstance>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        for instance in members {
            if !pool.reserve(&instance.id) {
                continue;
            }
            info!("Discovered {} ({})", instance.id, instance.name);
            let meta = Arc::new(ServiceMeta::new(instance.meta.clone()));
            meta.set(KEY_SERVICE_STATE, STATE_YOUNG);
            self.schedule_promotion(instance.id.clone(), meta.clone());

            let this = self.clone();
            let pool = pool.clone();
            self.inner.tasks.spawn(async move {
                let id = instance.id.clone();
                if let Err(e) = this.build_client(&pool, instance, meta).await {
                    warn!("Connect to {} failed: {}", id, e);
                }
            });
        }
    }

    fn schedule_promotion(&self, id: String, meta: Arc<ServiceMeta>) {
        let grace = self.inner.options.grace_delay;
        let cancel = self.inner.cancel.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(grace) => {
                    meta.set(KEY_SERVICE_STATE, STATE_ADULT);
                    info!("{} promoted to {}", id, STATE_ADULT);
                }
            }
        });
    }

    /// Connect a client for a reserved pool slot and start its readloop.
    async fn build_client(
        &self,
        pool: &Arc<ClientPool>,
        instance: ServiceInstance,
        meta: Arc<ServiceMeta>,
    ) -> Result<()> {
        let client = match self.connect_client(&instance, meta).await {
            Ok(client) => client,
            Err(e) => {
                pool.release(&instance.id);
                return Err(e);
            }
        };
        if !pool.add(client.clone()) {
            client.close().await;
            return Ok(());
        }
        if self.inner.cancel.is_cancelled() {
            pool.remove_client(&client);
            client.close().await;
            return Err(MeshError::AlreadyClosed);
        }
        counter!("mesh_clients_built_total", "service" => instance.name.clone()).increment(1);

        let this = self.clone();
        let pool = pool.clone();
        self.inner
            .tasks
            .spawn(async move { this.client_readloop(pool, client).await });
        Ok(())
    }

    async fn connect_client(
        &self,
        instance: &ServiceInstance,
        meta: Arc<ServiceMeta>,
    ) -> Result<Arc<OutboundClient>> {
        if instance.protocol != Protocol::Tcp {
            return Err(MeshError::ProtocolMismatch {
                id: instance.id.clone(),
                protocol: instance.protocol.to_string(),
            });
        }
        let dialer = read(&self.inner.dialer)
            .clone()
            .ok_or(MeshError::DialerNotConfigured)?;
        let client = Arc::new(OutboundClient::new(
            instance.id.clone(),
            instance.name.clone(),
            meta,
            self.inner.options.client.clone(),
            dialer,
        )
        .with_tracker(self.inner.tasks.clone()));
        client.connect(&instance.dial_url()).await?;
        Ok(client)
    }

    async fn client_readloop(self, pool: Arc<ClientPool>, client: Arc<OutboundClient>) {
        loop {
            let frame = match client.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    info!("Client {} readloop ended: {}", client.id(), e);
                    break;
                }
            };
            if frame.opcode != OpCode::Binary || frame.payload.is_empty() {
                continue;
            }
            match LogicPkt::decode(&frame.payload) {
                Ok(packet) => {
                    if let Err(e) = self.push_message(packet).await {
                        warn!("Push from {} dropped: {}", client.id(), e);
                    }
                }
                Err(e) => warn!("Undecodable packet from {}: {}", client.id(), e),
            }
        }
        pool.remove_client(&client);
        client.close().await;
    }

    /// Resolve the client `forward` would use for `header`.
    pub fn lookup(&self, service: &str, header: &Header) -> Result<Arc<OutboundClient>> {
        self.lookup_with(service, header, self.selector().as_ref())
    }

    fn lookup_with(
        &self,
        service: &str,
        header: &Header,
        selector: &dyn Selector,
    ) -> Result<Arc<OutboundClient>> {
        let pool = self
            .pool(service)
            .ok_or_else(|| MeshError::ServiceNotFound(service.to_string()))?;
        let candidates = pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT)));
        if candidates.is_empty() {
            return Err(MeshError::NoAvailableInstance(service.to_string()));
        }
        let id = selector
            .lookup(header, &candidates)
            .ok_or_else(|| MeshError::NoAvailableInstance(service.to_string()))?;
        pool.get(&id).ok_or(MeshError::ClientNotFound(id))
    }

    /// Send `packet` to one adult instance of `service`, tagged with this
    /// server's id as `dest.server`.
    pub async fn forward(&self, service: &str, packet: LogicPkt) -> Result<()> {
        let selector = self.selector();
        self.forward_with_selector(service, packet, selector.as_ref())
            .await
    }

    pub async fn forward_with_selector(
        &self,
        service: &str,
        mut packet: LogicPkt,
        selector: &dyn Selector,
    ) -> Result<()> {
        if packet.header.command.is_empty() {
            return Err(MeshError::InvalidPacket("command is empty"));
        }
        if packet.header.channel_id.is_empty() {
            return Err(MeshError::InvalidPacket("channel id is empty"));
        }
        let client = match self.lookup_with(service, &packet.header, selector) {
            Ok(client) => client,
            Err(e) => {
                counter!("mesh_routing_miss_total", "service" => service.to_string())
                    .increment(1);
                return Err(e);
            }
        };
        packet.del_meta(META_DEST_SERVER);
        packet.add_meta(META_DEST_SERVER, self.service_id()?);
        debug!(
            "Forward {} from {} to {}",
            packet.header.command,
            packet.header.channel_id,
            client.id()
        );
        client.send(&packet.marshal()?).await?;
        counter!("mesh_forwarded_total", "service" => service.to_string()).increment(1);
        Ok(())
    }

    /// Push `packet` to the channel `gateway` through the local server,
    /// tagged with `dest.server = gateway`.
    pub async fn push(&self, gateway: &str, mut packet: LogicPkt) -> Result<()> {
        packet.del_meta(META_DEST_SERVER);
        packet.add_meta(META_DEST_SERVER, gateway);
        let payload = packet.marshal()?;
        self.server()?.push(gateway, payload).await?;
        counter!("mesh_pushed_total").increment(1);
        Ok(())
    }

    /// Deliver a packet pushed back by a backend to the local channels
    /// listed in `dest.channels`. Delivery is best effort: a failed channel
    /// is logged and skipped. Returns how many channels got the packet.
    pub async fn push_message(&self, mut packet: LogicPkt) -> Result<usize> {
        let own = self.service_id()?.to_string();
        let dest = packet
            .get_meta(META_DEST_SERVER)
            .ok_or(MeshError::MissingMeta(META_DEST_SERVER))?;
        if dest != own {
            return Err(MeshError::DestServerMismatch {
                expected: own,
                got: dest.to_string(),
            });
        }
        let channels: Vec<String> = packet
            .get_meta(META_DEST_CHANNELS)
            .ok_or(MeshError::MissingMeta(META_DEST_CHANNELS))?
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        packet.del_meta(META_DEST_SERVER);
        packet.del_meta(META_DEST_CHANNELS);
        let payload = packet.marshal()?;

        let server = self.server()?;
        let mut delivered = 0;
        for channel in &channels {
            match server.push(channel, payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Push to channel {} failed: {}", channel, e),
            }
        }
        debug!(
            "Delivered {} to {}/{} channels",
            packet.header.command,
            delivered,
            channels.len()
        );
        Ok(delivered)
    }
}

#[async_trait]
impl Dispatcher for Container {
    async fn push(&self, gateway: &str, channels: &[String], mut packet: LogicPkt) -> Result<()> {
        packet.del_meta(META_DEST_CHANNELS);
        packet.add_meta(META_DEST_CHANNELS, channels.join(","));
        Container::push(self, gateway, packet).await
    }
}
