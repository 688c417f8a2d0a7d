use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use hf_hub::api::sync::{Api, ApiBuilder};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::device::{device_label, preferred_dtype, select_device, DevicePreference};
use crate::PipelineLike;

/// Everything a model loader needs: the device picked once for the
/// process, the matching dtype, and the hub handle rooted at `model_dir`.
pub struct LoadContext<'a> {
    pub device: &'a Device,
    pub dtype: DType,
    pub api: &'a Api,
}

/// Keyed cache of loaded pipelines. The cache is a plain owned value;
/// `load`/`unload` take `&mut self`, so there is exactly one owner per
/// process and concurrent loads of the same key cannot race.
pub struct ModelManager {
    device: Device,
    dtype: DType,
    api: Api,
    model_dir: PathBuf,
    models: HashMap<String, Arc<dyn PipelineLike>>,
}

impl ModelManager {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_preference(config, DevicePreference::default())
    }

    pub fn with_preference(config: &Config, preference: DevicePreference) -> Result<Self> {
        let device = select_device(preference)?;
        let dtype = preferred_dtype(&device);
        let model_dir = PathBuf::from(config.get("model_dir", String::from("data/models")));
        std::fs::create_dir_all(&model_dir)
            .with_context(|| format!("failed to create {}", model_dir.display()))?;
        let api = ApiBuilder::new()
            .with_cache_dir(model_dir.clone())
            .build()
            .context("failed to create model hub client")?;
        info!(device = device_label(&device), "model manager ready");
        Ok(Self {
            device,
            dtype,
            api,
            model_dir,
            models: HashMap::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model_dir(&self) -> &std::path::Path {
        &self.model_dir
    }

    /// Return the cached handle for `key`, running `loader` on first use.
    /// A loader failure propagates and leaves no cache entry behind.
    pub fn load<F>(&mut self, key: &str, loader: F) -> Result<Arc<dyn PipelineLike>>
    where
        F: FnOnce(&LoadContext<'_>) -> Result<Arc<dyn PipelineLike>>,
    {
        if let Some(handle) = self.models.get(key) {
            return Ok(handle.clone());
        }
        info!(key, "loading model");
        let ctx = LoadContext {
            device: &self.device,
            dtype: self.dtype,
            api: &self.api,
        };
        let handle = loader(&ctx).with_context(|| format!("failed to load model '{key}'"))?;
        self.models.insert(key.to_string(), handle.clone());
        info!(key, "model loaded");
        Ok(handle)
    }

    /// Drop a cached handle; device memory is released when the last clone
    /// of the handle goes away.
    pub fn unload(&mut self, key: &str) {
        if self.models.remove(key).is_some() {
            info!(key, "model unloaded");
        }
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.models.contains_key(key)
    }

    pub fn loaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.models.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn info(&self) -> ManagerInfo {
        let accelerated = !matches!(self.device, Device::Cpu);
        let approx_weight_bytes = accelerated.then(|| {
            self.models
                .values()
                .filter_map(|model| model.memory_footprint())
                .sum::<u64>()
        });
        ManagerInfo {
            device: device_label(&self.device).to_string(),
            loaded_models: self.loaded_keys(),
            approx_weight_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerInfo {
    pub device: String,
    pub loaded_models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approx_weight_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenerationRequest, PipelineInput};
    use anyhow::bail;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullPipeline;

    impl PipelineLike for NullPipeline {
        fn run(
            &self,
            _request: &GenerationRequest,
            _input: &PipelineInput,
        ) -> Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(1, 1))
        }
    }

    fn manager() -> ModelManager {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::defaults();
        config.set(
            "model_dir",
            serde_json::json!(dir.join("models").to_string_lossy()),
        );
        ModelManager::with_preference(&config, DevicePreference::ForceCpu).unwrap()
    }

    #[test]
    fn second_load_hits_the_cache() {
        let mut manager = manager();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            manager
                .load("sdxl", |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullPipeline) as Arc<dyn PipelineLike>)
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_loaded("sdxl"));
    }

    #[test]
    fn unload_evicts_and_reload_runs_loader_again() {
        let mut manager = manager();
        let calls = AtomicUsize::new(0);
        let load = |manager: &mut ModelManager, calls: &AtomicUsize| {
            manager
                .load("sdxl", |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullPipeline) as Arc<dyn PipelineLike>)
                })
                .unwrap();
        };
        load(&mut manager, &calls);
        manager.unload("sdxl");
        assert!(!manager.is_loaded("sdxl"));
        load(&mut manager, &calls);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_load_leaves_no_cache_entry() {
        let mut manager = manager();
        let result = manager.load("sdxl", |_| bail!("weights not found"));
        assert!(result.is_err());
        assert!(!manager.is_loaded("sdxl"));
        assert!(manager.loaded_keys().is_empty());
    }

    #[test]
    fn info_reports_device_and_keys() {
        let mut manager = manager();
        manager
            .load("controlnet_canny", |_| {
                Ok(Arc::new(NullPipeline) as Arc<dyn PipelineLike>)
            })
            .unwrap();
        let info = manager.info();
        assert_eq!(info.device, "cpu");
        assert_eq!(info.loaded_models, vec!["controlnet_canny".to_string()]);
        // no memory estimate off-accelerator
        assert!(info.approx_weight_bytes.is_none());
    }
}
