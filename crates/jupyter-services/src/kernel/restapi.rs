//! Kernels REST client (`api/kernels`).
//!
//! Stateless functions; every response body is validated before it is
//! returned. Operations that need a live connection's status (restart,
//! interrupt) go through [`KernelConnection`](super::KernelConnection).

use log::warn;

use super::{KernelModel, KernelOptions};
use crate::error::ServiceError;
use crate::settings::ServerSettings;
use crate::transport::{make_request, RequestInit};
use crate::validate::{validate_kernel_model, validate_kernel_models};

pub const KERNEL_SERVICE_URL: &str = "api/kernels";

pub async fn list_running(settings: &ServerSettings) -> Result<Vec<KernelModel>, ServiceError> {
    let url = settings.api_url(&["api", "kernels"])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_kernel_models(&response.body_json()?)
}

pub async fn start_new(
    settings: &ServerSettings,
    options: &KernelOptions,
) -> Result<KernelModel, ServiceError> {
    let url = settings.api_url(&["api", "kernels"])?;
    let body = serde_json::to_value(options)
        .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
    let response = make_request(settings, url, RequestInit::post(Some(body))).await?;
    if response.status != 201 {
        return Err(ServiceError::from_response(&response));
    }
    validate_kernel_model(&response.body_json()?)
}

/// `None` when the server does not know the kernel.
pub async fn get_kernel_model(
    settings: &ServerSettings,
    id: &str,
) -> Result<Option<KernelModel>, ServiceError> {
    let url = settings.api_url(&["api", "kernels", id])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    match response.status {
        200 => Ok(Some(validate_kernel_model(&response.body_json()?)?)),
        404 => Ok(None),
        _ => Err(ServiceError::from_response(&response)),
    }
}

pub async fn restart_kernel(settings: &ServerSettings, id: &str) -> Result<KernelModel, ServiceError> {
    let url = settings.api_url(&["api", "kernels", id, "restart"])?;
    let response = make_request(settings, url, RequestInit::post(None)).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_kernel_model(&response.body_json()?)
}

pub async fn interrupt_kernel(settings: &ServerSettings, id: &str) -> Result<(), ServiceError> {
    let url = settings.api_url(&["api", "kernels", id, "interrupt"])?;
    let response = make_request(settings, url, RequestInit::post(None)).await?;
    if response.status != 204 {
        return Err(ServiceError::from_response(&response));
    }
    Ok(())
}

/// Delete a kernel. A kernel the server no longer knows counts as deleted.
pub async fn shutdown_kernel(settings: &ServerSettings, id: &str) -> Result<(), ServiceError> {
    let url = settings.api_url(&["api", "kernels", id])?;
    let response = make_request(settings, url, RequestInit::delete()).await?;
    match response.status {
        204 => Ok(()),
        404 => {
            warn!("[kernel-rest] The kernel {:?} does not exist on the server", id);
            Ok(())
        }
        _ => Err(ServiceError::from_response(&response)),
    }
}

pub async fn shutdown_all(settings: &ServerSettings) -> Result<(), ServiceError> {
    let running = list_running(settings).await?;
    let results = futures::future::join_all(
        running
            .iter()
            .map(|kernel| shutdown_kernel(settings, &kernel.id)),
    )
    .await;
    results.into_iter().collect()
}
