//! The plugin controller.
//!
//! Owns the local gRPC endpoint, the loader handshake, the per-plugin
//! registration table and the init latch that [`PluginController::wait_for_init`]
//! blocks on.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──▶ start() ──▶ [loader attaches, plugins load & register] ──▶ stop()
//!   │                                                                   │
//!   └── validates names + address eagerly          cancels scope, joins ┘
//! ```
//!
//! `LoadFailed` notifications flow through a bounded channel consumed by a
//! task under the controller's cancellation scope; once the scope is gone
//! the channel fills up and further notifications are dropped on the floor
//! rather than blocking the caller.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::DomainCallbacks;
use crate::error::{PluginError, Result};
use crate::pb;
use crate::pb::domain_message::Payload;
use crate::pb::plugin_controller_server::{
    PluginController as GrpcPluginController, PluginControllerServer,
};
use crate::remote::{Correlations, RemoteDomain};
use crate::transport::ListenAddress;

/// Longest accepted plugin name.
const MAX_PLUGIN_NAME: usize = 64;

/// Buffered `LoadFailed` notifications before drops start.
const LOAD_FAILED_BUFFER: usize = 10;

/// Outbound send-queue depth for loader and domain streams.
const SEND_QUEUE_LEN: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// How a plugin is packaged for the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    /// A C shared library.
    CShared,
    /// A Java archive.
    Jar,
    /// A standalone executable.
    Executable,
}

impl LibraryType {
    fn as_str(self) -> &'static str {
        match self {
            Self::CShared => "c-shared",
            Self::Jar => "jar",
            Self::Executable => "executable",
        }
    }
}

/// Launch configuration for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginConfig {
    /// Packaging flavor.
    #[serde(rename = "type")]
    pub library_type: LibraryType,
    /// Where the loader finds the plugin.
    pub location: String,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct PluginControllerConfig {
    /// Listen address (`unix:<path>`, `tcp4:<host>:<port>`, ...).
    pub address: String,
    /// How long `stop()` waits for the transport to drain.
    pub shutdown_timeout: Duration,
    /// Plugins to load, keyed by name.
    pub domains: BTreeMap<String, PluginConfig>,
}

impl Default for PluginControllerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            shutdown_timeout: Duration::from_secs(5),
            domains: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct PluginRecord {
    name: String,
}

#[derive(Debug, Default)]
struct InitState {
    /// Plugin names that have neither registered nor failed.
    outstanding: HashSet<String>,
    /// First fatal load failure `(plugin, message)`.
    failure: Option<(String, String)>,
}

struct Inner {
    loader_id: Uuid,
    address: ListenAddress,
    shutdown_timeout: Duration,
    callbacks: Arc<dyn DomainCallbacks>,
    cancel: CancellationToken,

    stopped: AtomicBool,

    /// Outbound half of the active loader stream, if one is attached.
    loader: parking_lot::Mutex<Option<mpsc::Sender<std::result::Result<pb::PluginLoad, Status>>>>,
    /// Loads waiting for a loader to attach.
    load_queue: parking_lot::Mutex<Vec<pb::PluginLoad>>,
    /// Plugin instance UUID → record.
    plugins: DashMap<String, PluginRecord>,
    /// Registered domains by plugin name.
    domains: DashMap<String, Arc<RemoteDomain>>,

    init: parking_lot::Mutex<InitState>,
    init_notify: Notify,
    load_failed_tx: mpsc::Sender<pb::PluginLoadFailed>,

    target_url: parking_lot::Mutex<Option<String>>,
    server: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    wait_guard: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginControllerInner")
            .field("loader_id", &self.loader_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Host for out-of-process domain plugins.
#[derive(Debug, Clone)]
pub struct PluginController {
    inner: Arc<Inner>,
}

impl PluginController {
    /// Create a controller.
    ///
    /// Name and address validation happens here, before anything binds.
    pub fn new(
        loader_id: Uuid,
        config: PluginControllerConfig,
        callbacks: Arc<dyn DomainCallbacks>,
    ) -> Result<Self> {
        for name in config.domains.keys() {
            validate_plugin_name(name)?;
        }
        let address = ListenAddress::parse(&config.address)?;

        let (load_failed_tx, load_failed_rx) = mpsc::channel(LOAD_FAILED_BUFFER);
        let inner = Arc::new(Inner {
            loader_id,
            address,
            shutdown_timeout: config.shutdown_timeout,
            callbacks,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            loader: parking_lot::Mutex::new(None),
            load_queue: parking_lot::Mutex::new(Vec::new()),
            plugins: DashMap::new(),
            domains: DashMap::new(),
            init: parking_lot::Mutex::new(InitState::default()),
            init_notify: Notify::new(),
            load_failed_tx,
            target_url: parking_lot::Mutex::new(None),
            server: parking_lot::Mutex::new(None),
            wait_guard: tokio::sync::Mutex::new(()),
        });

        inner.queue_loads(&config.domains);
        inner.clone().spawn_load_failed_consumer(load_failed_rx);

        Ok(Self { inner })
    }

    /// The loader UUID minted for this controller.
    #[must_use]
    pub fn loader_id(&self) -> Uuid {
        self.inner.loader_id
    }

    /// Client target URL for the bound transport; empty before `start`.
    #[must_use]
    pub fn grpc_target_url(&self) -> String {
        self.inner.target_url.lock().clone().unwrap_or_default()
    }

    /// The registered domain for a plugin name, once it has connected.
    #[must_use]
    pub fn domain(&self, name: &str) -> Option<Arc<RemoteDomain>> {
        self.inner.domains.get(name).map(|d| Arc::clone(&d))
    }

    /// Bind the transport and start serving.
    pub async fn start(&self) -> Result<()> {
        let bound = self.inner.address.bind().await?;
        *self.inner.target_url.lock() = Some(bound.target_url.clone());

        let service = PluginControllerServer::new(ControllerGrpc {
            inner: Arc::clone(&self.inner),
        });
        let cancel = self.inner.cancel.clone();
        let incoming = bound.incoming.into_incoming();
        let server = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned());

        let handle = tokio::spawn(async move {
            if let Err(error) = server.await {
                warn!(%error, "plugin controller transport exited");
            }
        });
        *self.inner.server.lock() = Some(handle);
        info!(target_url = %bound.target_url, "plugin controller listening");
        Ok(())
    }

    /// Cancel the scope and wait (bounded) for the transport to drain.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        *self.inner.loader.lock() = None;
        let handle = self.inner.server.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.inner.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("plugin controller did not drain within shutdown timeout");
            }
        }
    }

    /// Block until every configured plugin has connected or fatally failed.
    ///
    /// At most one concurrent caller; a fatal load failure surfaces here
    /// with the loader's message.
    pub async fn wait_for_init(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = tokio::select! {
            guard = self.inner.wait_guard.lock() => guard,
            () = cancel.cancelled() => return Err(PluginError::Cancelled),
        };

        loop {
            let notified = self.inner.init_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let init = self.inner.init.lock();
                if let Some((plugin, message)) = &init.failure {
                    return Err(PluginError::LoadFailed {
                        plugin: plugin.clone(),
                        message: message.clone(),
                    });
                }
                if init.outstanding.is_empty() {
                    return Ok(());
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(PluginError::Cancelled),
            }
        }
    }

    /// Re-drive loading for newly configured plugins.
    ///
    /// Safe before `start` (loads queue until a loader attaches) and after
    /// `stop` (the update is dropped).
    pub async fn plugins_updated(&self, config: &PluginControllerConfig) -> Result<()> {
        for name in config.domains.keys() {
            validate_plugin_name(name)?;
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!("plugin update after stop dropped");
            return Ok(());
        }

        let fresh: BTreeMap<String, PluginConfig> = config
            .domains
            .iter()
            .filter(|(name, _)| !self.inner.knows_plugin(name))
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.inner.queue_loads(&fresh);
        self.inner.flush_load_queue().await;
        Ok(())
    }
}

impl Inner {
    fn knows_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|record| record.name == name)
    }

    /// Mint instance IDs and queue load instructions for these plugins.
    fn queue_loads(&self, domains: &BTreeMap<String, PluginConfig>) {
        if domains.is_empty() {
            return;
        }
        let mut init = self.init.lock();
        let mut queue = self.load_queue.lock();
        for (name, conf) in domains {
            let instance_id = Uuid::new_v4().to_string();
            self.plugins
                .insert(instance_id.clone(), PluginRecord { name: name.clone() });
            init.outstanding.insert(name.clone());
            queue.push(pb::PluginLoad {
                plugin: Some(pb::PluginInfo {
                    id: instance_id,
                    name: name.clone(),
                }),
                library_type: conf.library_type.as_str().to_string(),
                location: conf.location.clone(),
                sys_command: pb::plugin_load::SysCommand::None as i32,
            });
        }
    }

    /// Send queued loads to the active loader, if any.
    async fn flush_load_queue(&self) {
        let sender = self.loader.lock().clone();
        let Some(sender) = sender else { return };
        let pending: Vec<pb::PluginLoad> = std::mem::take(&mut *self.load_queue.lock());
        for load in pending {
            let name = load
                .plugin
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            if sender.send(Ok(load)).await.is_err() {
                warn!(plugin = %name, "loader stream closed while sending load");
                return;
            }
            debug!(plugin = %name, "load instruction sent");
        }
    }

    /// Record a plugin as successfully connected.
    fn complete_init(&self, name: &str) {
        let mut init = self.init.lock();
        init.outstanding.remove(name);
        drop(init);
        self.init_notify.notify_waiters();
    }

    fn spawn_load_failed_consumer(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<pb::PluginLoadFailed>,
    ) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let failed = tokio::select! {
                    msg = receiver.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    () = cancel.cancelled() => break,
                };
                let name = failed
                    .plugin
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                warn!(plugin = %name, message = %failed.error_message, "plugin load failed");
                let mut init = self.init.lock();
                if init.failure.is_none() {
                    init.failure = Some((name.clone(), failed.error_message.clone()));
                }
                init.outstanding.remove(&name);
                drop(init);
                self.init_notify.notify_waiters();
            }
        });
    }
}

fn validate_plugin_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_PLUGIN_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PluginError::NameInvalid(name.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOADER STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Server-streamed loads with a drop guard that releases loader exclusivity.
pub struct LoaderStream {
    inner: ReceiverStream<std::result::Result<pb::PluginLoad, Status>>,
    _guard: LoaderGuard,
}

impl std::fmt::Debug for LoaderStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderStream").finish_non_exhaustive()
    }
}

struct LoaderGuard(Arc<Inner>);

impl Drop for LoaderGuard {
    fn drop(&mut self) {
        *self.0.loader.lock() = None;
        debug!("loader stream detached");
    }
}

impl Stream for LoaderStream {
    type Item = std::result::Result<pb::PluginLoad, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GRPC SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

struct ControllerGrpc {
    inner: Arc<Inner>,
}

#[tonic::async_trait]
impl GrpcPluginController for ControllerGrpc {
    type InitLoaderStream = LoaderStream;

    async fn init_loader(
        &self,
        request: Request<pb::PluginLoaderInit>,
    ) -> std::result::Result<Response<Self::InitLoaderStream>, Status> {
        let claimed = request.into_inner().id;
        if claimed != self.inner.loader_id.to_string() {
            return Err(Status::permission_denied(
                PluginError::LoaderMismatch.to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(SEND_QUEUE_LEN);
        {
            let mut loader = self.inner.loader.lock();
            if loader.is_some() {
                return Err(Status::already_exists(
                    PluginError::LoaderDuplicate.to_string(),
                ));
            }
            *loader = Some(tx);
        }
        info!("loader attached");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.flush_load_queue().await });

        Ok(Response::new(LoaderStream {
            inner: ReceiverStream::new(rx),
            _guard: LoaderGuard(Arc::clone(&self.inner)),
        }))
    }

    async fn load_failed(
        &self,
        request: Request<pb::PluginLoadFailed>,
    ) -> std::result::Result<Response<pb::LoadFailedAck>, Status> {
        // Never block: after shutdown the consumer is gone and the buffer
        // fills, at which point notifications are dropped.
        if self.inner.load_failed_tx.try_send(request.into_inner()).is_err() {
            warn!("load-failed notification dropped (buffer full or stopped)");
        }
        Ok(Response::new(pb::LoadFailedAck {}))
    }

    type ConnectDomainStream = ReceiverStream<std::result::Result<pb::DomainMessage, Status>>;

    async fn connect_domain(
        &self,
        request: Request<Streaming<pb::DomainMessage>>,
    ) -> std::result::Result<Response<Self::ConnectDomainStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_LEN);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_domain_stream(inner, inbound, tx).await;
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Drive one plugin's domain stream until it closes or the scope cancels.
async fn run_domain_stream(
    inner: Arc<Inner>,
    mut inbound: Streaming<pb::DomainMessage>,
    tx: mpsc::Sender<std::result::Result<pb::DomainMessage, Status>>,
) {
    // First message must be the registration
    let first = match inbound.message().await {
        Ok(Some(message)) => message,
        Ok(None) | Err(_) => return,
    };
    let Some(Payload::Register(registration)) = first.payload else {
        warn!("domain stream opened without registration");
        return;
    };
    let Some(name) = inner
        .plugins
        .get(&registration.plugin_id)
        .map(|record| record.name.clone())
    else {
        warn!(plugin_id = %registration.plugin_id, "registration for unknown plugin instance");
        return;
    };

    let correlations: Correlations = Arc::new(DashMap::new());
    let domain = Arc::new(RemoteDomain::new(
        name.clone(),
        tx.clone(),
        Arc::clone(&correlations),
    ));
    inner.domains.insert(name.clone(), domain);
    inner.complete_init(&name);
    info!(plugin = %name, "domain registered");

    loop {
        let message = tokio::select! {
            () = inner.cancel.cancelled() => break,
            message = inbound.message() => match message {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(error) => {
                    warn!(plugin = %name, %error, "domain stream error");
                    break;
                }
            },
        };

        // Responses route to the correlated caller
        if !message.correlation_id.is_empty() {
            if let Some((_, waiter)) = correlations.remove(&message.correlation_id) {
                if let Some(payload) = message.payload {
                    let _ = waiter.send(payload);
                }
            } else {
                warn!(plugin = %name, correlation = %message.correlation_id,
                      "response with unknown correlation ID");
            }
            continue;
        }

        // Requests are domain → engine callbacks
        let Some(payload) = message.payload else { continue };
        let callbacks = Arc::clone(&inner.callbacks);
        let reply_tx = tx.clone();
        let request_id = message.message_id.clone();
        tokio::spawn(async move {
            let result = match payload {
                Payload::FindAvailableStates(request) => callbacks
                    .find_available_states(request)
                    .await
                    .map(Payload::FindAvailableStatesRes),
                Payload::EncodeData(request) => callbacks
                    .encode_data(request)
                    .await
                    .map(Payload::EncodeDataRes),
                Payload::RecoverSigner(request) => callbacks
                    .recover_signer(request)
                    .await
                    .map(Payload::RecoverSignerRes),
                other => {
                    warn!(?other, "unexpected request payload on domain stream");
                    return;
                }
            };
            let payload = match result {
                Ok(payload) => payload,
                Err(error) => Payload::ErrorRes(pb::ErrorResponse {
                    message: error.to_string(),
                }),
            };
            let _ = reply_tx
                .send(Ok(pb::DomainMessage {
                    message_id: Uuid::new_v4().to_string(),
                    correlation_id: request_id,
                    payload: Some(payload),
                }))
                .await;
        });
    }

    inner.domains.remove(&name);
    debug!(plugin = %name, "domain stream closed");
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::plugin_controller_client::PluginControllerClient;
    use crate::transport::connect;
    use async_trait::async_trait;

    /// Callbacks that fail every request; loader tests never reach them.
    #[derive(Debug)]
    struct NoCallbacks;

    #[async_trait]
    impl DomainCallbacks for NoCallbacks {
        async fn find_available_states(
            &self,
            _request: pb::FindAvailableStatesRequest,
        ) -> Result<pb::FindAvailableStatesResponse> {
            Err(PluginError::Transport("not wired".into()))
        }

        async fn encode_data(
            &self,
            _request: pb::EncodeDataRequest,
        ) -> Result<pb::EncodeDataResponse> {
            Err(PluginError::Transport("not wired".into()))
        }

        async fn recover_signer(
            &self,
            _request: pb::RecoverSignerRequest,
        ) -> Result<pb::RecoverSignerResponse> {
            Err(PluginError::Transport("not wired".into()))
        }
    }

    fn temp_uds() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pc.sock");
        (dir, format!("unix:{}", path.display()))
    }

    fn config(address: &str, domains: &[&str]) -> PluginControllerConfig {
        PluginControllerConfig {
            address: address.to_string(),
            shutdown_timeout: Duration::from_millis(1),
            domains: domains
                .iter()
                .map(|name| {
                    (
                        (*name).to_string(),
                        PluginConfig {
                            library_type: LibraryType::CShared,
                            location: "some/where".into(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn controller(config: PluginControllerConfig) -> Result<PluginController> {
        PluginController::new(Uuid::new_v4(), config, Arc::new(NoCallbacks))
    }

    #[tokio::test]
    async fn bad_plugin_name_rejected_eagerly() {
        let (_dir, addr) = temp_uds();
        let err = controller(config(&addr, &["!badname"])).unwrap_err();
        assert!(matches!(err, PluginError::NameInvalid(_)));
    }

    #[tokio::test]
    async fn overlong_socket_path_rejected_eagerly() {
        let long: String = std::iter::repeat('a').take(187).collect();
        let err = controller(config(&long, &[])).unwrap_err();
        assert!(matches!(err, PluginError::SocketPathTooLong { .. }));
    }

    #[tokio::test]
    async fn bind_failure_surfaces_from_start() {
        let dir = tempfile::tempdir().unwrap();
        // a directory is not bindable as a socket
        let pc = controller(config(&dir.path().display().to_string(), &[])).unwrap();
        let err = pc.start().await.unwrap_err();
        assert!(matches!(err, PluginError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn tcp4_and_tcp6_report_dns_targets() {
        for addr in ["tcp4:127.0.0.1:0", "tcp6:[::1]:0"] {
            let pc = controller(config(addr, &[])).unwrap();
            pc.start().await.unwrap();
            assert!(pc.grpc_target_url().starts_with("dns:///"));
            pc.stop().await;
        }
    }

    #[tokio::test]
    async fn wait_for_init_with_no_plugins_returns_immediately() {
        let (_dir, addr) = temp_uds();
        let pc = controller(config(&addr, &[])).unwrap();
        pc.wait_for_init(&CancellationToken::new()).await.unwrap();

        // Updates with nothing new are fine before start and repeatable
        pc.plugins_updated(&config(&addr, &[])).await.unwrap();
        pc.plugins_updated(&config(&addr, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn loader_protocol_end_to_end() {
        let (_dir, addr) = temp_uds();
        let pc = controller(config(&addr, &["domain1"])).unwrap();
        pc.start().await.unwrap();

        let channel = connect(&pc.grpc_target_url()).await.unwrap();
        let mut client = PluginControllerClient::new(channel);

        // Wrong loader ID: rejected at attach (or on first recv, depending
        // on when the transport surfaces the status)
        let rejection = match client
            .init_loader(pb::PluginLoaderInit {
                id: Uuid::new_v4().to_string(),
            })
            .await
        {
            Err(status) => status,
            Ok(response) => response.into_inner().message().await.unwrap_err(),
        };
        assert!(rejection.message().contains("mismatch"), "got: {rejection}");

        // Correct loader receives the load instruction
        let mut loader = client
            .init_loader(pb::PluginLoaderInit {
                id: pc.loader_id().to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        let load = loader.message().await.unwrap().unwrap();
        let plugin = load.plugin.clone().unwrap();
        assert_eq!(plugin.name, "domain1");

        // Loader reports failure; the waiter sees the message
        client
            .load_failed(pb::PluginLoadFailed {
                plugin: Some(plugin),
                error_message: "pop".into(),
            })
            .await
            .unwrap();
        let err = pc
            .wait_for_init(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pop"), "got: {err}");

        // Second loader with the correct ID while one is active: duplicate
        let rejection = match client
            .init_loader(pb::PluginLoaderInit {
                id: pc.loader_id().to_string(),
            })
            .await
        {
            Err(status) => status,
            Ok(response) => response.into_inner().message().await.unwrap_err(),
        };
        assert!(
            rejection.message().contains("already active"),
            "got: {rejection}"
        );

        // Cancelled waiter gets a cancellation error
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = pc.wait_for_init(&cancelled).await.unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));

        drop(loader);
        pc.stop().await;

        // Updates after stop are dropped without error
        pc.plugins_updated(&config(&addr, &["domain2"])).await.unwrap();

        // LoadFailed notifications never block once the consumer is gone
        for _ in 0..20 {
            let _ = pc.inner.load_failed_tx.try_send(pb::PluginLoadFailed {
                plugin: Some(pb::PluginInfo {
                    id: String::new(),
                    name: String::new(),
                }),
                error_message: String::new(),
            });
        }
    }

    #[tokio::test]
    async fn domain_registration_completes_init_and_serves_requests() {
        let (_dir, addr) = temp_uds();
        let pc = controller(config(&addr, &["noto"])).unwrap();
        pc.start().await.unwrap();

        let channel = connect(&pc.grpc_target_url()).await.unwrap();
        let mut client = PluginControllerClient::new(channel);

        let mut loader = client
            .init_loader(pb::PluginLoaderInit {
                id: pc.loader_id().to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        let load = loader.message().await.unwrap().unwrap();
        let instance_id = load.plugin.unwrap().id;

        // The "plugin": registers, then answers ConfigureDomain requests
        let (plugin_tx, plugin_rx) = mpsc::channel::<pb::DomainMessage>(16);
        plugin_tx
            .send(pb::DomainMessage {
                message_id: Uuid::new_v4().to_string(),
                correlation_id: String::new(),
                payload: Some(Payload::Register(pb::DomainRegistration {
                    plugin_id: instance_id,
                })),
            })
            .await
            .unwrap();
        let outbound = ReceiverStream::new(plugin_rx);
        let mut inbound = client.connect_domain(outbound).await.unwrap().into_inner();

        let answer_tx = plugin_tx.clone();
        tokio::spawn(async move {
            while let Ok(Some(message)) = inbound.message().await {
                if let Some(Payload::ConfigureDomain(req)) = message.payload {
                    let _ = answer_tx
                        .send(pb::DomainMessage {
                            message_id: Uuid::new_v4().to_string(),
                            correlation_id: message.message_id,
                            payload: Some(Payload::ConfigureDomainRes(
                                pb::ConfigureDomainResponse {
                                    domain_config: Some(pb::DomainConfig {
                                        abi_state_schemas_json: vec![],
                                        abi_events_json: format!("echo:{}", req.name),
                                        base_ledger_submit_config: None,
                                    }),
                                },
                            )),
                        })
                        .await;
                }
            }
        });

        // Registration unblocks the waiter
        pc.wait_for_init(&CancellationToken::new()).await.unwrap();

        // And the bridge round-trips a request
        let domain = pc.domain("noto").expect("domain registered");
        let response = crate::api::DomainPlugin::configure_domain(
            &*domain,
            pb::ConfigureDomainRequest {
                name: "noto".into(),
                registry_contract_address: String::new(),
                chain_id: 1337,
                config_json: "{}".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            response.domain_config.unwrap().abi_events_json,
            "echo:noto"
        );

        pc.stop().await;
    }
}
