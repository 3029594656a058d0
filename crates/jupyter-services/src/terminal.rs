//! Terminals REST client.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::settings::ServerSettings;
use crate::transport::{make_request, RequestInit};
use crate::validate::{validate_terminal_model, validate_terminal_models};

pub const TERMINAL_SERVICE_URL: &str = "api/terminals";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalModel {
    pub name: String,
}

pub async fn list_running(settings: &ServerSettings) -> Result<Vec<TerminalModel>, ServiceError> {
    let url = settings.api_url(&["api", "terminals"])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_terminal_models(&response.body_json()?)
}

pub async fn start_new(settings: &ServerSettings) -> Result<TerminalModel, ServiceError> {
    let url = settings.api_url(&["api", "terminals"])?;
    let response = make_request(settings, url, RequestInit::post(None)).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_terminal_model(&response.body_json()?)
}

/// `None` when the server does not know the terminal.
pub async fn get_terminal_model(
    settings: &ServerSettings,
    name: &str,
) -> Result<Option<TerminalModel>, ServiceError> {
    let url = settings.api_url(&["api", "terminals", name])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    match response.status {
        200 => Ok(Some(validate_terminal_model(&response.body_json()?)?)),
        404 => Ok(None),
        _ => Err(ServiceError::from_response(&response)),
    }
}

pub async fn shutdown_terminal(settings: &ServerSettings, name: &str) -> Result<(), ServiceError> {
    let url = settings.api_url(&["api", "terminals", name])?;
    let response = make_request(settings, url, RequestInit::delete()).await?;
    match response.status {
        204 => Ok(()),
        404 => {
            warn!("[terminal-rest] Terminal {:?} does not exist on the server", name);
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
            .map(|terminal| shutdown_terminal(settings, &terminal.name)),
    )
    .await;
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_terminal_lifecycle() {
        let server = Arc::new(FakeServer::new());
        let settings = server.settings();

        let terminal = start_new(&settings).await.unwrap();
        assert_eq!(list_running(&settings).await.unwrap(), vec![terminal.clone()]);
        assert_eq!(
            get_terminal_model(&settings, &terminal.name).await.unwrap(),
            Some(terminal.clone())
        );

        shutdown_terminal(&settings, &terminal.name).await.unwrap();
        assert!(list_running(&settings).await.unwrap().is_empty());
        assert_eq!(get_terminal_model(&settings, &terminal.name).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_missing_terminal_succeeds() {
        let server = Arc::new(FakeServer::new());
        shutdown_terminal(&server.settings(), "nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let server = Arc::new(FakeServer::new());
        let settings = server.settings();
        start_new(&settings).await.unwrap();
        start_new(&settings).await.unwrap();
        shutdown_all(&settings).await.unwrap();
        assert!(list_running(&settings).await.unwrap().is_empty());
    }
}
