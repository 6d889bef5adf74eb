//! File-backed api model store.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

use super::ClusterModel;

const API_VERSION_KEY: &str = "apiVersion";

/// Load the model and the api version it was written with.
pub fn load(path: &Path) -> Result<(ClusterModel, String)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read api model {}", path.display()))?;

    let mut value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse api model {}", path.display()))?;

    let Some(object) = value.as_object_mut() else {
        bail!("Api model {} is not a JSON object", path.display());
    };

    let api_version = match object.remove(API_VERSION_KEY) {
        Some(Value::String(v)) => v,
        Some(other) => bail!("Api model {} has a non-string apiVersion: {}", path.display(), other),
        None => bail!("Api model {} has no apiVersion", path.display()),
    };

    let model: ClusterModel = serde_json::from_value(value)
        .with_context(|| format!("Invalid api model {}", path.display()))?;

    debug!(
        "Loaded api model {} (apiVersion {}, orchestrator {})",
        path.display(),
        api_version,
        model.orchestrator_version()
    );

    Ok((model, api_version))
}

/// Write the model back under `api_version`.
///
/// Written to a sibling temp file first and renamed over the target.
pub fn save(path: &Path, model: &ClusterModel, api_version: &str) -> Result<()> {
    let mut value = serde_json::to_value(model).context("Failed to serialize api model")?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            API_VERSION_KEY.to_string(),
            Value::String(api_version.to_string()),
        );
    }

    let mut body = serde_json::to_string_pretty(&value).context("Failed to serialize api model")?;
    body.push('\n');

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace api model {}", path.display()))?;

    debug!("Saved api model {}", path.display());
    Ok(())
}
