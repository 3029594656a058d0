//! Pieces shared by the kernel and session managers: readiness, the
//! kernelspecs cache, polling and disposal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ServiceError;
use crate::kernel::KernelConnectionOptions;
use crate::kernelspec::{self, KernelSpecs};
use crate::settings::ServerSettings;
use crate::signal::Signal;

/// Host capability telling the managers whether anyone is looking.
/// Polls are skipped while not visible.
pub trait Visibility: Send + Sync {
    fn is_visible(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysVisible;

impl Visibility for AlwaysVisible {
    fn is_visible(&self) -> bool {
        true
    }
}

/// Poll periods. `None` disables that poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    pub running_interval: Option<Duration>,
    /// Offset from the running interval so both polls do not line up.
    pub specs_interval: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            running_interval: Some(Duration::from_secs(10)),
            specs_interval: Some(Duration::from_secs(61)),
        }
    }
}

impl PollOptions {
    pub fn disabled() -> Self {
        Self {
            running_interval: None,
            specs_interval: None,
        }
    }
}

/// Options shared by [`KernelManager`](crate::KernelManager) and
/// [`SessionManager`](crate::SessionManager).
#[derive(Clone)]
pub struct ManagerOptions {
    pub poll: PollOptions,
    pub visibility: Arc<dyn Visibility>,
    /// Options for every kernel connection the manager creates.
    pub kernel: KernelConnectionOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            poll: PollOptions::default(),
            visibility: Arc::new(AlwaysVisible),
            kernel: KernelConnectionOptions::default(),
        }
    }
}

impl ManagerOptions {
    pub fn with_poll(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_visibility(mut self, visibility: Arc<dyn Visibility>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_kernel_options(mut self, kernel: KernelConnectionOptions) -> Self {
        self.kernel = kernel;
        self
    }
}

#[derive(Default)]
struct BaseState {
    disposed: bool,
    running_loaded: bool,
    specs_loaded: bool,
    specs: Option<KernelSpecs>,
}

pub(crate) struct ManagerBase {
    pub(crate) settings: Arc<ServerSettings>,
    pub(crate) options: ManagerOptions,
    prefix: &'static str,
    state: Mutex<BaseState>,
    ready_tx: watch::Sender<Option<Result<(), ServiceError>>>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) specs_changed: Signal<KernelSpecs>,
    pub(crate) connection_failure: Signal<ServiceError>,
    pub(crate) disposed: Signal<()>,
}

impl ManagerBase {
    pub(crate) fn new(settings: Arc<ServerSettings>, options: ManagerOptions, prefix: &'static str) -> Self {
        let (ready_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            options,
            prefix,
            state: Mutex::new(BaseState::default()),
            ready_tx,
            shutdown_tx,
            specs_changed: Signal::new(),
            connection_failure: Signal::new(),
            disposed: Signal::new(),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.ready_tx.borrow(), Some(Ok(())))
    }

    /// Resolves once both the running list and the specs were fetched, or
    /// with the error of the first load if it failed.
    pub(crate) async fn ready(&self) -> Result<(), ServiceError> {
        let mut ready_rx = self.ready_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if let Some(outcome) = ready_rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.is_disposed() {
                return Err(ServiceError::Disposed);
            }
            tokio::select! {
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        return Err(ServiceError::Disposed);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    pub(crate) fn mark_running_loaded(&self) {
        let mut state = self.state.lock();
        state.running_loaded = true;
        self.update_ready(&state);
    }

    fn update_ready(&self, state: &BaseState) {
        if state.running_loaded && state.specs_loaded && !self.is_ready() {
            self.ready_tx.send_replace(Some(Ok(())));
        }
    }

    /// Report a failure of the initial load. The first one settles
    /// `ready()` with the error; a later successful load replaces it.
    pub(crate) fn report_initial_failure(&self, what: &str, err: ServiceError) {
        if !matches!(err, ServiceError::Disposed) {
            self.ready_tx.send_if_modified(|outcome| {
                if outcome.is_none() {
                    *outcome = Some(Err(err.clone()));
                    true
                } else {
                    false
                }
            });
        }
        self.report_failure(what, err);
    }

    pub(crate) fn specs(&self) -> Option<KernelSpecs> {
        self.state.lock().specs.clone()
    }

    /// Fetch the kernelspecs; emits `specs_changed` only if they differ.
    pub(crate) async fn refresh_specs(&self) -> Result<(), ServiceError> {
        if self.is_disposed() {
            return Err(ServiceError::Disposed);
        }
        let specs = kernelspec::get_specs(&self.settings).await?;
        let changed = {
            let mut state = self.state.lock();
            if state.disposed {
                return Ok(());
            }
            state.specs_loaded = true;
            self.update_ready(&state);
            if state.specs.as_ref() == Some(&specs) {
                false
            } else {
                state.specs = Some(specs.clone());
                true
            }
        };
        if changed {
            debug!("[{}] Kernelspecs changed", self.prefix);
            self.specs_changed.emit(specs);
        }
        Ok(())
    }

    pub(crate) fn report_failure(&self, what: &str, err: ServiceError) {
        if matches!(err, ServiceError::Disposed) {
            return;
        }
        warn!("[{}] Failed to refresh {}: {}", self.prefix, what, err);
        self.connection_failure.emit(err);
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Mark disposed and stop polls. Returns false if already disposed.
    pub(crate) fn dispose(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
        }
        self.shutdown_tx.send_replace(true);
        true
    }
}

/// Run `tick` every `period` until shutdown or until `tick` returns `None`
/// (its owner is gone). Ticks are skipped while the host is not visible.
pub(crate) fn spawn_poll<F, Fut>(
    name: &'static str,
    period: Duration,
    visibility: Arc<dyn Visibility>,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            if !visibility.is_visible() {
                debug!("[poll] Skipping {} poll while hidden", name);
                continue;
            }
            match tick() {
                Some(refresh) => refresh.await,
                None => return,
            }
        }
    })
}
