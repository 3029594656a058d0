//! Shape checks for REST payloads.
//!
//! Each check confirms required fields and primitive types before the value
//! is converted, so anything that reaches a cache has a known shape.

use std::collections::BTreeMap;

use log::warn;
use serde_json::{Map, Value};

use crate::error::ServiceError;
use crate::kernel::KernelModel;
use crate::kernelspec::{KernelSpecModel, KernelSpecs};
use crate::session::SessionModel;
use crate::terminal::TerminalModel;

pub fn validate_kernel_model(value: &Value) -> Result<KernelModel, ServiceError> {
    let obj = as_object(value, "kernel model")?;
    Ok(KernelModel {
        id: string_field(obj, "id", "kernel model")?,
        name: string_field(obj, "name", "kernel model")?,
    })
}

pub fn validate_kernel_models(value: &Value) -> Result<Vec<KernelModel>, ServiceError> {
    as_array(value, "kernel list")?
        .iter()
        .map(validate_kernel_model)
        .collect()
}

pub fn validate_session_model(value: &Value) -> Result<SessionModel, ServiceError> {
    let what = "session model";
    let obj = as_object(value, what)?;
    let kernel = match obj.get("kernel") {
        None | Some(Value::Null) => None,
        Some(kernel @ Value::Object(_)) => Some(validate_kernel_model(kernel)?),
        Some(_) => return Err(invalid(format!("{}: kernel is not an object", what))),
    };
    Ok(SessionModel {
        id: string_field(obj, "id", what)?,
        path: string_field(obj, "path", what)?,
        name: string_field(obj, "name", what)?,
        kind: string_field(obj, "type", what)?,
        kernel,
    })
}

pub fn validate_session_models(value: &Value) -> Result<Vec<SessionModel>, ServiceError> {
    as_array(value, "session list")?
        .iter()
        .map(validate_session_model)
        .collect()
}

pub fn validate_terminal_model(value: &Value) -> Result<TerminalModel, ServiceError> {
    let obj = as_object(value, "terminal model")?;
    Ok(TerminalModel {
        name: string_field(obj, "name", "terminal model")?,
    })
}

pub fn validate_terminal_models(value: &Value) -> Result<Vec<TerminalModel>, ServiceError> {
    as_array(value, "terminal list")?
        .iter()
        .map(validate_terminal_model)
        .collect()
}

/// Validate one entry of the `kernelspecs` map.
///
/// The server nests most fields under `spec`; the model flattens them.
pub fn validate_spec_model(value: &Value) -> Result<KernelSpecModel, ServiceError> {
    let what = "kernelspec";
    let obj = as_object(value, what)?;
    let name = string_field(obj, "name", what)?;
    let spec = match obj.get("spec") {
        Some(Value::Object(spec)) => spec,
        _ => return Err(invalid(format!("{} {:?}: spec is not an object", what, name))),
    };

    let argv = match spec.get("argv") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("{} {:?}: argv must be strings", what, name)))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(invalid(format!("{} {:?}: argv is not an array", what, name))),
    };

    Ok(KernelSpecModel {
        display_name: string_field(spec, "display_name", what)?,
        language: string_field(spec, "language", what)?,
        argv,
        env: string_map(spec.get("env"), "env", what)?,
        interrupt_mode: spec
            .get("interrupt_mode")
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata: spec
            .get("metadata")
            .cloned()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new())),
        resources: string_map(obj.get("resources"), "resources", what)?,
        name,
    })
}

/// Validate a `GET api/kernelspecs` body.
///
/// Invalid entries are skipped with a warning. A default naming no valid
/// spec falls back to the first spec by name.
pub fn validate_specs(value: &Value) -> Result<KernelSpecs, ServiceError> {
    let what = "kernelspecs";
    let obj = as_object(value, what)?;
    let default = string_field(obj, "default", what)?;
    let entries = match obj.get("kernelspecs") {
        Some(Value::Object(entries)) => entries,
        _ => return Err(invalid(format!("{}: kernelspecs is not an object", what))),
    };

    let mut kernelspecs = BTreeMap::new();
    for (key, entry) in entries {
        match validate_spec_model(entry) {
            Ok(spec) => {
                kernelspecs.insert(key.clone(), spec);
            }
            Err(e) => warn!("[kernelspec] Removing errant kernel spec {:?}: {}", key, e),
        }
    }

    let default = if kernelspecs.contains_key(&default) {
        default
    } else {
        let Some(first) = kernelspecs.keys().next().cloned() else {
            return Err(invalid("no valid kernelspecs found"));
        };
        warn!(
            "[kernelspec] Default kernel {:?} not found, using {:?}",
            default, first
        );
        first
    };

    Ok(KernelSpecs {
        default,
        kernelspecs,
    })
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ServiceError> {
    value
        .as_object()
        .ok_or_else(|| invalid(format!("{} is not an object", what)))
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>, ServiceError> {
    value
        .as_array()
        .ok_or_else(|| invalid(format!("{} is not an array", what)))
}

fn string_field(obj: &Map<String, Value>, key: &str, what: &str) -> Result<String, ServiceError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(format!("{}: {} is not a string", what, key))),
        None => Err(invalid(format!("{}: missing {}", what, key))),
    }
}

fn string_map(
    value: Option<&Value>,
    key: &str,
    what: &str,
) -> Result<BTreeMap<String, String>, ServiceError> {
    match value {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                _ => Err(invalid(format!("{}: {}.{} is not a string", what, key, k))),
            })
            .collect(),
        Some(_) => Err(invalid(format!("{}: {} is not an object", what, key))),
    }
}

fn invalid(reason: impl Into<String>) -> ServiceError {
    ServiceError::Validation(reason.into())
}
