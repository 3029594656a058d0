//! Kernelspecs: the kernel types a server can start.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ServiceError;
use crate::settings::ServerSettings;
use crate::transport::{make_request, RequestInit};
use crate::validate::validate_specs;

pub const KERNELSPEC_SERVICE_URL: &str = "api/kernelspecs";

/// One kernelspec, with the server's nested `spec` object flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpecModel {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub interrupt_mode: Option<String>,
    pub metadata: Value,
    pub resources: BTreeMap<String, String>,
}

/// Serializes back into the server's `{name, spec, resources}` layout.
impl Serialize for KernelSpecModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Spec<'a> {
            argv: &'a [String],
            env: &'a BTreeMap<String, String>,
            display_name: &'a str,
            language: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            interrupt_mode: Option<&'a str>,
            metadata: &'a Value,
        }

        #[derive(Serialize)]
        struct Entry<'a> {
            name: &'a str,
            spec: Spec<'a>,
            resources: &'a BTreeMap<String, String>,
        }

        Entry {
            name: &self.name,
            spec: Spec {
                argv: &self.argv,
                env: &self.env,
                display_name: &self.display_name,
                language: &self.language,
                interrupt_mode: self.interrupt_mode.as_deref(),
                metadata: &self.metadata,
            },
            resources: &self.resources,
        }
        .serialize(serializer)
    }
}

/// The server's kernelspecs and which one is the default.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelSpecs {
    pub default: String,
    pub kernelspecs: BTreeMap<String, KernelSpecModel>,
}

impl KernelSpecs {
    pub fn default_spec(&self) -> Option<&KernelSpecModel> {
        self.kernelspecs.get(&self.default)
    }
}

/// Fetch all kernelspecs from the server.
pub async fn get_specs(settings: &ServerSettings) -> Result<KernelSpecs, ServiceError> {
    let url = settings.api_url(&["api", "kernelspecs"])?;
    let response = make_request(settings, url, RequestInit::get()).await?;
    if response.status != 200 {
        return Err(ServiceError::from_response(&response));
    }
    validate_specs(&response.body_json()?)
}
