//! Cached, polled view of the server's sessions.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{restapi, SessionConnection, SessionModel, SessionRequest};
use crate::error::ServiceError;
use crate::kernelspec::KernelSpecs;
use crate::manager::{spawn_poll, ManagerBase, ManagerOptions};
use crate::settings::ServerSettings;
use crate::signal::Signal;

#[derive(Default)]
struct SessionState {
    models: Vec<SessionModel>,
    connections: Vec<SessionConnection>,
}

struct ManagerInner {
    base: ManagerBase,
    state: Mutex<SessionState>,
    running_changed: Signal<Vec<SessionModel>>,
}

/// Keeps a local copy of `GET /api/sessions` current and owns the session
/// connections it hands out. Changes made through a connection (rename,
/// kernel change, shutdown) update the cache without a refresh.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SessionManager")
            .field("running", &state.models)
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl SessionManager {
    /// Start the manager and its polls. Must be called inside a tokio
    /// runtime.
    pub fn new(settings: Arc<ServerSettings>, options: ManagerOptions) -> Self {
        let inner = Arc::new(ManagerInner {
            base: ManagerBase::new(settings, options, "session-manager"),
            state: Mutex::new(SessionState::default()),
            running_changed: Signal::new(),
        });
        start_polling(&inner);
        SessionManager { inner }
    }

    pub fn settings(&self) -> &Arc<ServerSettings> {
        &self.inner.base.settings
    }

    pub fn is_ready(&self) -> bool {
        self.inner.base.is_ready()
    }

    pub async fn ready(&self) -> Result<(), ServiceError> {
        self.inner.base.ready().await
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.base.is_disposed()
    }

    pub fn running(&self) -> Vec<SessionModel> {
        self.inner.state.lock().models.clone()
    }

    pub fn specs(&self) -> Option<KernelSpecs> {
        self.inner.base.specs()
    }

    pub fn running_changed(&self) -> broadcast::Receiver<Vec<SessionModel>> {
        self.inner.running_changed.subscribe()
    }

    pub fn specs_changed(&self) -> broadcast::Receiver<KernelSpecs> {
        self.inner.base.specs_changed.subscribe()
    }

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

    /// Create a session (or reuse the one already open for the path) and
    /// connect to it.
    pub async fn start_new(&self, request: &SessionRequest) -> Result<SessionConnection, ServiceError> {
        self.inner.ensure_open()?;
        let model = restapi::start_session(&self.inner.base.settings, request).await?;
        self.connect_to(model)
    }

    pub fn connect_to(&self, model: SessionModel) -> Result<SessionConnection, ServiceError> {
        self.inner.ensure_open()?;
        let connection = SessionConnection::connect(
            self.inner.base.settings.clone(),
            model,
            self.inner.base.options.kernel.clone(),
        );
        register(&self.inner, connection.clone());
        Ok(connection)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<SessionModel>, ServiceError> {
        if let Some(model) = self.inner.cached(|m| m.id == id) {
            return Ok(Some(model));
        }
        self.inner.refresh_running().await?;
        Ok(self.inner.cached(|m| m.id == id))
    }

    pub async fn find_by_path(&self, path: &str) -> Result<Option<SessionModel>, ServiceError> {
        if let Some(model) = self.inner.cached(|m| m.path == path) {
            return Ok(Some(model));
        }
        self.inner.refresh_running().await?;
        Ok(self.inner.cached(|m| m.path == path))
    }

    /// Shut a session down. Optimistic like
    /// [`KernelManager::shutdown`](crate::KernelManager::shutdown): the
    /// cache changes first and is not rolled back on failure.
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

        restapi::shutdown_session(&self.inner.base.settings, id).await?;
        for connection in self.inner.take_connections(|c| c.id() == id) {
            connection.dispose();
        }
        Ok(())
    }

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

        info!("[session-manager] Shutting down {} sessions", models.len());
        let settings = &self.inner.base.settings;
        let results = join_all(
            models
                .iter()
                .map(|model| restapi::shutdown_session(settings, &model.id)),
        )
        .await;

        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        for connection in self.inner.take_connections(|c| ids.contains(&c.id().as_str())) {
            connection.dispose();
        }
        results.into_iter().collect()
    }

    /// Shut down the session at `path` if exactly one session uses it.
    /// Failures are logged and ignored.
    pub async fn stop_if_needed(&self, path: &str) {
        let sessions = match restapi::list_running(&self.inner.base.settings).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("[session-manager] Could not list sessions for {}: {}", path, e);
                return;
            }
        };
        let matching: Vec<&SessionModel> = sessions.iter().filter(|s| s.path == path).collect();
        let [only] = matching.as_slice() else {
            return;
        };
        let id = only.id.clone();
        self.inner.apply_running(sessions);
        if let Err(e) = self.shutdown(&id).await {
            debug!("[session-manager] Could not stop session {}: {}", id, e);
        }
    }

    /// Stop polling and dispose every session connection. Idempotent.
    pub fn dispose(&self) {
        if !self.inner.base.dispose() {
            return;
        }
        debug!("[session-manager] Disposing");
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

    fn cached(&self, matches: impl Fn(&SessionModel) -> bool) -> Option<SessionModel> {
        self.state.lock().models.iter().find(|m| matches(m)).cloned()
    }

    async fn refresh_running(&self) -> Result<(), ServiceError> {
        self.ensure_open()?;
        let models = restapi::list_running(&self.base.settings).await?;
        self.apply_running(models);
        Ok(())
    }

    /// Replace the cache. Connections whose session is gone are disposed,
    /// the rest get their fresh model.
    fn apply_running(&self, models: Vec<SessionModel>) {
        let (changed, stale, live) = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.connections)
                .into_iter()
                .partition(|c| {
                    let id = c.id();
                    !models.iter().any(|m| m.id == id)
                });
            state.connections = live.clone();
            let changed = state.models != models;
            if changed {
                state.models = models.clone();
            }
            (changed, stale, live)
        };
        self.base.mark_running_loaded();

        for connection in stale {
            info!(
                "[session-manager] Session {} is gone from the server, disposing connection",
                connection.id()
            );
            connection.dispose();
        }
        if changed {
            debug!("[session-manager] Running sessions changed ({})", models.len());
            self.running_changed.emit(models.clone());
        }
        for connection in live {
            let id = connection.id();
            if let Some(model) = models.iter().find(|m| m.id == id) {
                connection.update_model(model.clone());
            }
        }
    }

    fn take_connections(&self, matches: impl Fn(&SessionConnection) -> bool) -> Vec<SessionConnection> {
        let mut state = self.state.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.connections)
            .into_iter()
            .partition(|c| matches(c));
        state.connections = kept;
        taken
    }

    /// Put a connection's current model into the cache, emitting if it
    /// differs from what is cached.
    fn sync_model(&self, model: SessionModel) {
        let snapshot = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            match state.models.iter_mut().find(|m| m.id == model.id) {
                Some(cached) if *cached == model => return,
                Some(cached) => *cached = model,
                None => state.models.push(model),
            }
            state.models.clone()
        };
        self.running_changed.emit(snapshot);
    }

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
        debug!("[session-manager] Session {} terminated", id);
        self.running_changed.emit(snapshot);
    }
}

/// Track a session connection and mirror its changes into the cache.
fn register(inner: &Arc<ManagerInner>, connection: SessionConnection) {
    let mut terminated_rx = connection.terminated();
    let mut property_rx = connection.property_changed();
    let mut kernel_rx = connection.kernel_changed();
    let mut disposed_rx = connection.disposed();
    let model = connection.model();

    {
        let mut state = inner.state.lock();
        if inner.base.is_disposed() {
            drop(state);
            connection.dispose();
            return;
        }
        state.connections.push(connection.clone());
    }
    inner.sync_model(model);

    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let id = connection.id();
    let watched = connection.downgrade();
    drop(connection);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                result = terminated_rx.recv() => match result {
                    Ok(()) => match weak.upgrade() {
                        Some(inner) => inner.on_terminated(&id),
                        None => return,
                    },
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                result = property_rx.recv() => match result {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let (Some(inner), Some(connection)) = (weak.upgrade(), watched.upgrade()) else {
                            return;
                        };
                        inner.sync_model(connection.model());
                    }
                    Err(RecvError::Closed) => break,
                },
                result = kernel_rx.recv() => match result {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let (Some(inner), Some(connection)) = (weak.upgrade(), watched.upgrade()) else {
                            return;
                        };
                        inner.sync_model(connection.model());
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = disposed_rx.recv() => break,
            }
        }
        if let (Some(inner), Some(connection)) = (weak.upgrade(), watched.upgrade()) {
            inner.take_connections(|c| c.ptr_eq(&connection));
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
            inner.base.report_initial_failure("running sessions", e);
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
            "running sessions",
            period,
            visibility.clone(),
            inner.base.shutdown_rx(),
            move || {
                let inner = weak.upgrade()?;
                Some(async move {
                    if let Err(e) = inner.refresh_running().await {
                        inner.base.report_failure("running sessions", e);
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
