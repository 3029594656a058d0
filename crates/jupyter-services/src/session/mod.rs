//! Sessions: bindings of a document path to a kernel.

mod connection;
mod manager;
pub mod restapi;

use serde::{Deserialize, Serialize};

use crate::kernel::KernelModel;

pub use connection::SessionConnection;
pub use manager::SessionManager;

/// A session on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub kernel: Option<KernelModel>,
}

/// Which kernel a session should use: an existing one by id, or a new one
/// by kernelspec name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl KernelRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
        }
    }

    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: None,
        }
    }
}

/// Body of a session create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelRequest>,
}

impl SessionRequest {
    pub fn new(path: impl Into<String>, kind: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            path,
            name,
            kind: kind.into(),
            kernel: None,
        }
    }

    pub fn notebook(path: impl Into<String>) -> Self {
        Self::new(path, "notebook")
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kernel(mut self, kernel: KernelRequest) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

/// Session properties that can change in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProperty {
    Path,
    Name,
    Type,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_body() {
        let request = SessionRequest::notebook("work/a.ipynb").with_kernel(KernelRequest::named("python3"));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "path": "work/a.ipynb",
                "name": "a.ipynb",
                "type": "notebook",
                "kernel": {"name": "python3"}
            })
        );
    }

    #[test]
    fn test_model_uses_type_key() {
        let model = SessionModel {
            id: "s".into(),
            path: "a.ipynb".into(),
            name: "a.ipynb".into(),
            kind: "console".into(),
            kernel: None,
        };
        let value = serde_json::to_value(&model).unwrap();
        assert_eq!(value["type"], "console");
        assert!(value["kernel"].is_null());
    }
}
