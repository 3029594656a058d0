//! Cached, polled view of the server's running kernels.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{restapi, KernelConnection, KernelModel, KernelOptions, KernelStatus};
use crate::error::ServiceError;
use crate::kernelspec::KernelSpecs;
use crate::manager::{spawn_poll, ManagerBase, ManagerOptions};
use crate::settings::ServerSettings;
use crate::signal::Signal;

#[derive(Default)]
struct KernelState {
    models: Vec<KernelModel>,
    connections: Vec<KernelConnection>,
}

struct ManagerInner {
    base: ManagerBase,
    state: Mutex<KernelState>,
    running_changed: Signal<Vec<KernelModel>>,
}

/// Keeps a local copy of `GET /api/kernels` and the kernelspecs current,
/// and owns the connections it hands out.
///
/// `running_changed` fires only when a refresh actually changes the list.
/// Connections whose kernel vanishes from the list are disposed.
#[derive(Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("KernelManager")
            .field("running", &state.models)
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl KernelManager {
    /// Start the manager: fetches the running kernels and the kernelspecs
    /// right away, then polls them. Must be called inside a tokio runtime.
    pub fn new(settings: Arc<ServerSettings>, options: ManagerOptions) -> Self {
        let inner = Arc::new(ManagerInner {
            base: ManagerBase::new(settings, options, "kernel-manager"),
            state: Mutex::new(KernelState::default()),
            running_changed: Signal::new(),
        });
        start_polling(&inner);
        KernelManager { inner }
    }

    pub fn settings(&self) -> &Arc<ServerSettings> {
        &self.inner.base.settings
    }

    pub fn is_ready(&self) -> bool {
        self.inner.base.is_ready()
    }

    /// Resolves after the first successful fetch of both the running list
    /// and the kernelspecs.
    pub async fn ready(&self) -> Result<(), ServiceError> {
        self.inner.base.ready().await
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.base.is_disposed()
    }

    pub fn running(&self) -> Vec<KernelModel> {
        self.inner.state.lock().models.clone()
    }

    pub fn specs(&self) -> Option<KernelSpecs> {
        self.inner.base.specs()
    }

    pub fn running_changed(&self) -> broadcast::Receiver<Vec<KernelModel>> {
        self.inner.running_changed.subscribe()
    }

    pub fn specs_changed(&self) -> broadcast::Receiver<KernelSpecs> {
        self.inner.base.specs_changed.subscribe()
    }

    /// Errors from background polls.
    pub fn connection_failure(&self) -> broadcast::Receiver<ServiceError> {
        self.inner.base.connection_failure.subscribe()
    }

    pub fn disposed(&self) -> broadcast::Receiver<()> {
        self.inner.base.disposed.subscribe()
    }

    pub async fn refresh_running(&self) -> Result<(), ServiceError> {
        self.inner.refresh_running().await
    }

    pub async fn refresh_specs(&self) -> Result<(), ServiceError> {
        self.inner.base.refresh_specs().await
    }

    /// Start a kernel on the server and connect to it.
    pub async fn start_new(&self, options: &KernelOptions) -> Result<KernelConnection, ServiceError> {
        self.inner.ensure_open()?;
        let model = restapi::start_new(&self.inner.base.settings, options).await?;
        self.connect_to(model)
    }

    /// Connect to a kernel that is already running.
    pub fn connect_to(&self, model: KernelModel) -> Result<KernelConnection, ServiceError> {
        self.inner.ensure_open()?;
        let connection = KernelConnection::connect(
            self.inner.base.settings.clone(),
            model,
            self.inner.base.options.kernel.clone(),
        );
        register(&self.inner, connection.clone());
        Ok(connection)
    }

    /// Look in the cache first, then refresh once from the server.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<KernelModel>, ServiceError> {
        if let Some(model) = self.inner.cached(id) {
            return Ok(Some(model));
        }
        self.inner.refresh_running().await?;
        Ok(self.inner.cached(id))
    }

    /// Shut a kernel down.
    ///
    /// The model leaves the cache and `running_changed` fires before the
    /// REST call is made. A failed call is not rolled back; the next
    /// refresh reconciles. Unknown ids are a no-op.
    pub async fn shutdown(&self, id: &str) -> Result<(), ServiceError> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if self.inner.base.is_disposed() {
                return Err(ServiceError::Disposed);
            }
            let Some(index) = state.models.iter().position(|m| m.id == id) else {
                return Ok(());
            };
            state.models.remove(index);
            state.models.clone()
        };
        self.inner.running_changed.emit(snapshot);

        restapi::shutdown_kernel(&self.inner.base.settings, id).await?;
        for connection in self.inner.take_connections(|c| c.id() == id) {
            connection.dispose();
        }
        Ok(())
    }

    /// Shut down every cached kernel, with the same optimistic update as
    /// [`shutdown`](Self::shutdown). Returns the first failure.
    pub async fn shutdown_all(&self) -> Result<(), ServiceError> {
        let models = {
            let mut state = self.inner.state.lock();
            if self.inner.base.is_disposed() {
                return Err(ServiceError::Disposed);
            }
            std::mem::take(&mut state.models)
        };
        if models.is_empty() {
            return Ok(());
        }
        self.inner.running_changed.emit(Vec::new());

        info!("[kernel-manager] Shutting down {} kernels", models.len());
        let settings = &self.inner.base.settings;
        let results = join_all(
            models
                .iter()
                .map(|model| restapi::shutdown_kernel(settings, &model.id)),
        )
        .await;

        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        for connection in self.inner.take_connections(|c| ids.contains(&c.id())) {
            connection.dispose();
        }
        results.into_iter().collect()
    }

    /// Stop polling and dispose every connection. Idempotent.
    pub fn dispose(&self) {
        if !self.inner.base.dispose() {
            return;
        }
        debug!("[kernel-manager] Disposing");
        let connections = std::mem::take(&mut self.inner.state.lock().connections);
        for connection in connections {
            connection.dispose();
        }
        self.inner.base.disposed.emit(());
    }
}

impl ManagerInner {
    fn ensure_open(&self) -> Result<(), ServiceError> {
        if self.base.is_disposed() {
            return Err(ServiceError::Disposed);
        }
        Ok(())
    }

    fn cached(&self, id: &str) -> Option<KernelModel> {
        self.state.lock().models.iter().find(|m| m.id == id).cloned()
    }

    async fn refresh_running(&self) -> Result<(), ServiceError> {
        self.ensure_open()?;
        let models = restapi::list_running(&self.base.settings).await?;
        self.apply_running(models);
        Ok(())
    }

    fn apply_running(&self, models: Vec<KernelModel>) {
        let (changed, stale) = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.connections)
                .into_iter()
                .partition(|c| !models.iter().any(|m| m.id == c.id()));
            state.connections = live;
            let changed = state.models != models;
            if changed {
                state.models = models.clone();
            }
            (changed, stale)
        };
        self.base.mark_running_loaded();

        for connection in stale {
            info!(
                "[kernel-manager] Kernel {} is gone from the server, disposing connection",
                connection.id()
            );
            connection.dispose();
        }
        if changed {
            debug!("[kernel-manager] Running kernels changed ({})", models.len());
            self.running_changed.emit(models);
        }
    }

    fn take_connections(&self, matches: impl Fn(&KernelConnection) -> bool) -> Vec<KernelConnection> {
        let mut state = self.state.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.connections)
            .into_iter()
            .partition(|c| matches(c));
        state.connections = kept;
        taken
    }

    fn add_model(&self, model: KernelModel) {
        let snapshot = {
            let mut state = self.state.lock();
            if self.base.is_disposed() || state.models.iter().any(|m| m.id == model.id) {
                return;
            }
            state.models.push(model);
            state.models.clone()
        };
        self.running_changed.emit(snapshot);
    }

    /// A connection reported `dead`: drop its kernel from the cache.
    fn on_terminated(&self, id: &str) {
        let snapshot = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            let before = state.models.len();
            state.models.retain(|m| m.id != id);
            if state.models.len() == before {
                return;
            }
            state.models.clone()
        };
        debug!("[kernel-manager] Kernel {} terminated", id);
        self.running_changed.emit(snapshot);
    }

    fn forget(&self, client_id: &str) {
        self.state
            .lock()
            .connections
            .retain(|c| c.client_id() != client_id);
    }
}

/// Track a connection and follow its status: `dead` drops the kernel from
/// the cache, disposal forgets the connection.
fn register(inner: &Arc<ManagerInner>, connection: KernelConnection) {
    let mut status_rx = connection.status_changed();
    let mut disposed_rx = connection.disposed();
    let id = connection.id().to_string();
    let client_id = connection.client_id().to_string();
    let model = connection.model();

    {
        let mut state = inner.state.lock();
        if inner.base.is_disposed() {
            drop(state);
            connection.dispose();
            return;
        }
        state.connections.push(connection);
    }
    inner.add_model(model);

    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                status = status_rx.recv() => match status {
                    Ok(KernelStatus::Dead) => match weak.upgrade() {
                        Some(inner) => inner.on_terminated(&id),
                        None => return,
                    },
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = disposed_rx.recv() => break,
            }
        }
        if let Some(inner) = weak.upgrade() {
            inner.forget(&client_id);
        }
    });
}

fn start_polling(inner: &Arc<ManagerInner>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let (running, specs) = futures::join!(inner.refresh_running(), inner.base.refresh_specs());
        if let Err(e) = running {
            inner.base.report_initial_failure("running kernels", e);
        }
        if let Err(e) = specs {
            inner.base.report_initial_failure("kernelspecs", e);
        }
    });

    let poll = inner.base.options.poll.clone();
    let visibility = inner.base.options.visibility.clone();
    if let Some(period) = poll.running_interval {
        let weak = Arc::downgrade(inner);
        spawn_poll(
            "running kernels",
            period,
            visibility.clone(),
            inner.base.shutdown_rx(),
            move || {
                let inner = weak.upgrade()?;
                Some(async move {
                    if let Err(e) = inner.refresh_running().await {
                        inner.base.report_failure("running kernels", e);
                    }
                })
            },
        );
    }
    if let Some(period) = poll.specs_interval {
        let weak = Arc::downgrade(inner);
        spawn_poll(
            "kernelspecs",
            period,
            visibility,
            inner.base.shutdown_rx(),
            move || {
                let inner = weak.upgrade()?;
                Some(async move {
                    if let Err(e) = inner.base.refresh_specs().await {
                        inner.base.report_failure("kernelspecs", e);
                    }
                })
            },
        );
    }
}
