use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.json";

/// Hierarchical settings document with dot-path access.
///
/// Loaded once per process; a missing or malformed file falls back to the
/// built-in defaults instead of failing.
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    doc: Value,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed config, using defaults");
                    default_document()
                }
            },
            Err(_) => default_document(),
        };
        Self { path, doc }
    }

    pub fn defaults() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            doc: default_document(),
        }
    }

    /// Look up a dot-separated key (`"generation.default_steps"`). Returns
    /// `default` when the path is absent at any level or holds a value of
    /// the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let pointer = format!("/{}", key.replace('.', "/"));
        match self.doc.pointer(&pointer) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or(default),
            None => default,
        }
    }

    /// Set a dot-separated key, creating intermediate objects as needed.
    pub fn set(&mut self, key: &str, new: Value) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(last) = parts.pop() else { return };

        let mut node = &mut self.doc;
        for part in parts {
            if !node.is_object() {
                *node = Value::Object(serde_json::Map::new());
            }
            node = match node {
                Value::Object(map) => map.entry(part).or_insert(Value::Null),
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), new);
        }
    }

    /// Persist the document as pretty JSON, defaulting to the load path.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let target = path.unwrap_or(&self.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.doc)?;
        fs::write(target, text).with_context(|| format!("failed to write {}", target.display()))
    }
}

fn default_document() -> Value {
    json!({
        "model_dir": "data/models",
        "output_dir": "data/outputs",
        "cache_dir": "data/cache",
        "temp_dir": "data/temp",

        "generation": {
            "default_width": 1024,
            "default_height": 1024,
            "default_steps": 20,
            "default_guidance_scale": 7.5,
            "max_width": 2048,
            "max_height": 2048,
            "max_steps": 100
        },

        "models": {
            "sdxl_model": "stabilityai/stable-diffusion-xl-base-1.0",
            "controlnet_models": {
                "canny": "diffusers/controlnet-canny-sdxl-1.0",
                "depth": "diffusers/controlnet-depth-sdxl-1.0",
                "pose": "thibaud/controlnet-openpose-sdxl-1.0"
            }
        },

        "ui": {
            "host": "127.0.0.1",
            "port": 8188,
            "auto_launch": true
        },

        "logging": {
            "level": "INFO",
            "file": "logs/atelier.log"
        }
    })
}
