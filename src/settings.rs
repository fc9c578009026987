use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::{ModelDescriptor, PromptSpec};

/// Read-only lookup of prompt texts and the model allow-list.
pub trait AssetCatalog: Send + Sync {
    fn prompt(&self, id: &str) -> Option<PromptSpec>;
    fn models(&self) -> Vec<ModelDescriptor>;
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Ceiling on waiting for a fresh frame.
    pub frame_deadline_ms: u64,
    /// Grab interval of the desktop capture surface.
    pub capture_interval_ms: u64,
    pub screenshot_max_width: u32,
    pub jpeg_quality: u8,
    /// Where allow-listed model files are provisioned.
    pub models_dir: PathBuf,
    /// Base URL of the local inference server.
    pub inference_endpoint: String,
    /// Per-request generation ceiling.
    pub generation_timeout_ms: u64,
    pub prompts: BTreeMap<String, String>,
    pub models: Vec<ModelDescriptor>,
}

impl Default for Settings {
    fn default() -> Self {
        let prompts = [
            (
                "screen_reply",
                "You are a keyboard assistant looking at the user's screen. Suggest one short reply the user could type next. Answer with the reply only.",
            ),
            (
                "rewrite_friendly",
                "Rewrite the following text in a warm, friendly tone. Answer with the rewritten text only.",
            ),
            (
                "rewrite_formal",
                "Rewrite the following text in a polite, formal tone. Answer with the rewritten text only.",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            frame_deadline_ms: 300,
            capture_interval_ms: 33,
            screenshot_max_width: 1024,
            jpeg_quality: 75,
            models_dir: PathBuf::from("models"),
            inference_endpoint: "http://127.0.0.1:8080".into(),
            generation_timeout_ms: 30_000,
            prompts,
            models: vec![
                ModelDescriptor {
                    id: "gemma-3n-e2b-it".into(),
                    filename: "gemma-3n-E2B-it-Q4_K_M.gguf".into(),
                    max_tokens: 1024,
                    max_memory_mb: Some(3072),
                    supports_image: true,
                    is_default: true,
                },
                ModelDescriptor {
                    id: "gemma-3-1b-it".into(),
                    filename: "gemma-3-1b-it-Q4_K_M.gguf".into(),
                    max_tokens: 512,
                    max_memory_mb: Some(1024),
                    supports_image: false,
                    is_default: false,
                },
            ],
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults if it doesn't exist.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            log::info!("No settings at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_err)?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    pub fn frame_deadline(&self) -> Duration {
        Duration::from_millis(self.frame_deadline_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

impl AssetCatalog for Settings {
    fn prompt(&self, id: &str) -> Option<PromptSpec> {
        self.prompts.get(id).map(|text| PromptSpec::new(id, text.clone()))
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("keysight-settings-{}-{}", std::process::id(), name))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(&scratch("missing.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.frame_deadline(), Duration::from_millis(300));
    }

    #[test]
    fn save_then_load_preserves_changes() {
        let dir = scratch("roundtrip");
        let path = dir.join("settings.toml");
        let mut settings = Settings::default();
        settings.generation_timeout_ms = 5_000;
        settings.prompts.insert("shorten".into(), "Shorten this.".into());

        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = scratch("partial");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        fs::write(
            &path,
            r#"
frameDeadlineMs = 150

[[models]]
id = "tiny"
filename = "tiny.gguf"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.frame_deadline_ms, 150);
        assert_eq!(settings.jpeg_quality, 75);
        assert_eq!(settings.models.len(), 1);
        assert_eq!(settings.models[0].max_tokens, 1024);
        assert!(!settings.models[0].supports_image);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = scratch("invalid");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        fs::write(&path, "frameDeadlineMs = \"soon\"").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse(_))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn catalog_resolves_prompts() {
        let settings = Settings::default();
        let prompt = settings.prompt("rewrite_formal").unwrap();
        assert_eq!(prompt.id, "rewrite_formal");
        assert!(prompt.text.contains("formal"));
        assert!(settings.prompt("nope").is_none());
    }
}
