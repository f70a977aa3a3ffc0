//! Local model directory discovery and safetensors loading.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::ModelConfig;
use crate::error::ModelError;

pub struct ModelFiles {
    pub config: ModelConfig,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Read `config.json` and locate the safetensors shards in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let config_content = std::fs::read_to_string(dir.join("config.json"))?;
        let config = ModelConfig::from_json(&config_content)
            .map_err(|e| ModelError::InvalidConfig(format!("config.json: {e}")))?;
        let weights = safetensor_paths(dir)?;
        info!(
            dir = %dir.display(),
            shards = weights.len(),
            "located model files"
        );
        Ok(Self { config, weights })
    }
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>, ModelError> {
    // SAFETY: the shards are memory-mapped read-only and must not be
    // modified while the model is alive.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        let numeric = first.is_ascii_digit();
        let mut segment = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() == numeric) {
            segment.push(c);
        }
        if numeric {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

fn safetensor_paths(dir: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join("model.safetensors.index.json");
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)
        .map_err(|e| ModelError::InvalidConfig(format!("{}: {e}", index_path.display())))?;

    let weight_map = index["weight_map"].as_object().ok_or_else(|| {
        ModelError::InvalidConfig(format!("missing weight_map in {}", index_path.display()))
    })?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    Ok(filenames.iter().map(|f| dir.join(f)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            "model-00010-of-00020.safetensors".to_string(),
            "model-00002-of-00020.safetensors".to_string(),
            "model-00001-of-00020.safetensors".to_string(),
        ];
        files.sort_by_key(|a| natural_sort_key(a));
        assert_eq!(
            files,
            vec![
                "model-00001-of-00020.safetensors",
                "model-00002-of-00020.safetensors",
                "model-00010-of-00020.safetensors",
            ]
        );
    }

    #[test]
    fn natural_sort_handles_unpadded_numbers() {
        let mut files = vec![
            "shard-10.safetensors".to_string(),
            "shard-2.safetensors".to_string(),
            "shard-1.safetensors".to_string(),
        ];
        files.sort_by_key(|a| natural_sort_key(a));
        assert_eq!(
            files,
            vec![
                "shard-1.safetensors",
                "shard-2.safetensors",
                "shard-10.safetensors"
            ]
        );
    }

    #[test]
    fn missing_directory_is_io_error() {
        let err = ModelFiles::from_dir(Path::new("/nonexistent/model/dir"))
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::Io(_)));
    }
}
