//! A live session: its model plus a connection to its kernel.

use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::{restapi, KernelRequest, SessionModel, SessionProperty};
use crate::error::ServiceError;
use crate::kernel::{KernelConnection, KernelConnectionOptions, KernelModel};
use crate::settings::ServerSettings;
use crate::signal::Signal;

struct SessionState {
    model: SessionModel,
    kernel: Option<KernelConnection>,
    disposed: bool,
}

struct SessionInner {
    settings: Arc<ServerSettings>,
    kernel_options: KernelConnectionOptions,
    state: Mutex<SessionState>,
    property_changed: Signal<SessionProperty>,
    kernel_changed: Signal<Option<KernelModel>>,
    terminated: Signal<()>,
    disposed: Signal<()>,
}

/// Handle to a session. Clones share state.
///
/// Property setters PATCH the server and then apply the returned model;
/// when the kernel id changes the old kernel connection is disposed and a
/// new one opened.
#[derive(Clone)]
pub struct SessionConnection {
    inner: Arc<SessionInner>,
}

/// Non-owning handle used by the session manager's watchers.
pub(crate) struct WeakSessionConnection(Weak<SessionInner>);

impl WeakSessionConnection {
    pub(crate) fn upgrade(&self) -> Option<SessionConnection> {
        self.0.upgrade().map(|inner| SessionConnection { inner })
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("model", &self.inner.state.lock().model)
            .finish_non_exhaustive()
    }
}

impl SessionConnection {
    /// Wrap a session model, connecting to its kernel if it has one. Must be
    /// called inside a tokio runtime.
    pub fn connect(
        settings: Arc<ServerSettings>,
        model: SessionModel,
        kernel_options: KernelConnectionOptions,
    ) -> Self {
        let kernel = model.kernel.clone().map(|kernel| {
            KernelConnection::connect(settings.clone(), kernel, kernel_options.clone())
        });
        SessionConnection {
            inner: Arc::new(SessionInner {
                settings,
                kernel_options,
                state: Mutex::new(SessionState {
                    model,
                    kernel,
                    disposed: false,
                }),
                property_changed: Signal::new(),
                kernel_changed: Signal::new(),
                terminated: Signal::new(),
                disposed: Signal::new(),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.inner.state.lock().model.id.clone()
    }

    pub fn path(&self) -> String {
        self.inner.state.lock().model.path.clone()
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().model.name.clone()
    }

    /// The session `type`, such as `notebook` or `console`.
    pub fn kind(&self) -> String {
        self.inner.state.lock().model.kind.clone()
    }

    pub fn model(&self) -> SessionModel {
        self.inner.state.lock().model.clone()
    }

    pub fn kernel(&self) -> Option<KernelConnection> {
        self.inner.state.lock().kernel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn property_changed(&self) -> broadcast::Receiver<SessionProperty> {
        self.inner.property_changed.subscribe()
    }

    pub fn kernel_changed(&self) -> broadcast::Receiver<Option<KernelModel>> {
        self.inner.kernel_changed.subscribe()
    }

    pub fn terminated(&self) -> broadcast::Receiver<()> {
        self.inner.terminated.subscribe()
    }

    pub fn disposed(&self) -> broadcast::Receiver<()> {
        self.inner.disposed.subscribe()
    }

    pub async fn set_path(&self, path: &str) -> Result<(), ServiceError> {
        self.patch(json!({ "path": path })).await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), ServiceError> {
        self.patch(json!({ "name": name })).await
    }

    pub async fn set_type(&self, kind: &str) -> Result<(), ServiceError> {
        self.patch(json!({ "type": kind })).await
    }

    /// Point the session at another kernel, new or existing, and return
    /// the connection to it.
    pub async fn change_kernel(
        &self,
        request: &KernelRequest,
    ) -> Result<Option<KernelConnection>, ServiceError> {
        let kernel = serde_json::to_value(request)
            .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
        self.patch(json!({ "kernel": kernel })).await?;
        Ok(self.kernel())
    }

    /// Delete the session on the server, then dispose.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let id = self.ensure_open()?;
        restapi::shutdown_session(&self.inner.settings, &id).await?;
        info!("[session-connection] Session {} shut down", id);
        self.inner.terminated.emit(());
        self.dispose();
        Ok(())
    }

    /// Dispose the kernel connection and stop emitting. Idempotent.
    pub fn dispose(&self) {
        let kernel = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.kernel.take()
        };
        if let Some(kernel) = kernel {
            kernel.dispose();
        }
        self.inner.disposed.emit(());
    }

    pub(crate) fn downgrade(&self) -> WeakSessionConnection {
        WeakSessionConnection(Arc::downgrade(&self.inner))
    }

    pub(crate) fn ptr_eq(&self, other: &SessionConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply a fresh model for this session, emitting what changed.
    pub(crate) fn update_model(&self, model: SessionModel) {
        let (properties, kernel_change) = {
            let mut state = self.inner.state.lock();
            if state.disposed || state.model.id != model.id || state.model == model {
                return;
            }
            let old = std::mem::replace(&mut state.model, model.clone());
            let mut properties = Vec::new();
            if old.path != model.path {
                properties.push(SessionProperty::Path);
            }
            if old.name != model.name {
                properties.push(SessionProperty::Name);
            }
            if old.kind != model.kind {
                properties.push(SessionProperty::Type);
            }

            let old_kernel = old.kernel.as_ref().map(|k| k.id.as_str());
            let new_kernel = model.kernel.as_ref().map(|k| k.id.as_str());
            let kernel_change = if old_kernel != new_kernel {
                let replacement = model.kernel.clone().map(|kernel| {
                    KernelConnection::connect(
                        self.inner.settings.clone(),
                        kernel,
                        self.inner.kernel_options.clone(),
                    )
                });
                Some(std::mem::replace(&mut state.kernel, replacement))
            } else {
                None
            };
            (properties, kernel_change)
        };

        for property in properties {
            self.inner.property_changed.emit(property);
        }
        if let Some(previous) = kernel_change {
            debug!(
                "[session-connection] Session {} kernel changed to {:?}",
                model.id,
                model.kernel.as_ref().map(|k| &k.id)
            );
            if let Some(previous) = previous {
                previous.dispose();
            }
            self.inner.kernel_changed.emit(model.kernel);
        }
    }

    async fn patch(&self, body: Value) -> Result<(), ServiceError> {
        let id = self.ensure_open()?;
        let model = restapi::update_session(&self.inner.settings, &id, body).await?;
        self.update_model(model);
        Ok(())
    }

    fn ensure_open(&self) -> Result<String, ServiceError> {
        let state = self.inner.state.lock();
        if state.disposed {
            return Err(ServiceError::ConnectionClosed(
                "session connection is disposed".into(),
            ));
        }
        Ok(state.model.id.clone())
    }
}
