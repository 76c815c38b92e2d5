use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, UploadError};

/// Load a sidecar hash file: a flat JSON object mapping the canonical
/// `"<container>/<object>"` key to a lowercase hex MD5.
pub fn load_hashes(path: &Path) -> Result<HashMap<String, String>> {
    let sidecar_err = |message: String| UploadError::Sidecar {
        path: path.display().to_string(),
        message,
    };
    let data = fs::read(path).map_err(|e| sidecar_err(e.to_string()))?;
    serde_json::from_slice(&data).map_err(|e| sidecar_err(format!("not a name→hash map: {e}")))
}

/// Output filename for a sidecar written next to this run:
/// `"<object>-<timestamp>.json"` with spaces in the timestamp replaced so the
/// name needs no quoting.
pub fn sidecar_filename(object: &str, timestamp: &str) -> String {
    format!("{object}-{}.json", timestamp.replace(' ', "-"))
}

/// Persist the hashes observed during this run into `dir`. Returns the path
/// written. Callers treat failure as log-worthy, never fatal.
pub fn save_hashes(
    dir: &Path,
    object: &str,
    hashes: &HashMap<String, String>,
) -> Result<PathBuf> {
    let name = sidecar_filename(object, &chrono::Local::now().to_string());
    let path = dir.join(name);
    let sidecar_err = |message: String| UploadError::Sidecar {
        path: path.display().to_string(),
        message,
    };
    let data = serde_json::to_vec_pretty(hashes).map_err(|e| sidecar_err(e.to_string()))?;
    fs::write(&path, data).map_err(|e| sidecar_err(e.to_string()))?;
    Ok(path)
}
