//! Sessions REST client (`api/sessions`).

use log::warn;
use serde_json::Value;

use super::{SessionModel, SessionRequest};
use crate::error::ServiceError;
use crate::settings::ServerSettings;
use crate::transport::{make_request, RequestInit};
use crate::validate::{validate_session_model, validate_session_models};

pub const SESSION_SERVICE_URL: &str = "api/sessions";

pub async fn list_running(settings: &ServerSettings) -> Result<Vec<SessionModel>, ServiceError> {
    let url = settings.api_url(&["api", "sessions"])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_session_models(&response.body_json()?)
}

/// `None` when the server does not know the session.
pub async fn get_session_model(
    settings: &ServerSettings,
    id: &str,
) -> Result<Option<SessionModel>, ServiceError> {
    let url = settings.api_url(&["api", "sessions", id])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    match response.status {
        200 => Ok(Some(validate_session_model(&response.body_json()?)?)),
        404 => Ok(None),
        _ => Err(ServiceError::from_response(&response)),
    }
}

/// Create a session, or get the existing one if the path already has one.
pub async fn start_session(
    settings: &ServerSettings,
    request: &SessionRequest,
) -> Result<SessionModel, ServiceError> {
    let url = settings.api_url(&["api", "sessions"])?;
    let body = serde_json::to_value(request)
        .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
    let response = make_request(settings, url, RequestInit::post(Some(body))).await?;
    if response.status != 201 {
        return Err(ServiceError::from_response(&response));
    }
    validate_session_model(&response.body_json()?)
}

/// PATCH a session. `patch` is a partial session model, for example
/// `{"path": "new.ipynb"}` or `{"kernel": {"name": "python3"}}`.
pub async fn update_session(
    settings: &ServerSettings,
    id: &str,
    patch: Value,
) -> Result<SessionModel, ServiceError> {
    let url = settings.api_url(&["api", "sessions", id])?;
    let response = make_request(settings, url, RequestInit::patch(patch)).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_session_model(&response.body_json()?)
}

pub async fn shutdown_session(settings: &ServerSettings, id: &str) -> Result<(), ServiceError> {
    let url = settings.api_url(&["api", "sessions", id])?;
    let response = make_request(settings, url, RequestInit::delete()).await?;
    match response.status {
        204 => Ok(()),
        404 => {
            let message = response
                .body_json()
                .ok()
                .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("The session {:?} does not exist on the server", id));
            warn!("[session-rest] {}", message);
            Ok(())
        }
        410 => Err(ServiceError::from_response_with(
            &response,
            Some("The kernel was deleted but the session was not"),
        )),
        _ => Err(ServiceError::from_response(&response)),
    }
}

pub async fn shutdown_all(settings: &ServerSettings) -> Result<(), ServiceError> {
    let running = list_running(settings).await?;
    let results = futures::future::join_all(
        running
            .iter()
            .map(|session| shutdown_session(settings, &session.id)),
    )
    .await;
    results.into_iter().collect()
}

pub async fn find_by_path(
    settings: &ServerSettings,
    path: &str,
) -> Result<Option<SessionModel>, ServiceError> {
    let running = list_running(settings).await?;
    Ok(running.into_iter().find(|session| session.path == path))
}

pub async fn find_by_id(
    settings: &ServerSettings,
    id: &str,
) -> Result<Option<SessionModel>, ServiceError> {
    let running = list_running(settings).await?;
    Ok(running.into_iter().find(|session| session.id == id))
}
