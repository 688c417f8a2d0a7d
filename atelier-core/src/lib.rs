pub mod config;
pub mod device;
mod error;
pub mod image_ops;
mod manager;
mod pipeline;
mod sdxl;
mod util;

pub use config::Config;
pub use device::*;
pub use error::{ErrorKind, GenerateError};
use image::DynamicImage;
pub use manager::{LoadContext, ManagerInfo, ModelManager};
pub use pipeline::{GenerationMode, GenerationOutcome, Orchestrator, SDXL_KEY};
pub use sdxl::{SdxlLoader, SdxlModel, SdxlVariant};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Define the request type shared by every front-end.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    pub image_path: Option<PathBuf>,
    pub mask_path: Option<PathBuf>,
    pub strength: Option<f64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Source imagery decoded by the orchestrator before a pipeline runs.
#[derive(Debug, Clone, Default)]
pub enum PipelineInput {
    #[default]
    TextOnly,
    SourceImage(DynamicImage),
    SourceAndMask {
        image: DynamicImage,
        mask: DynamicImage,
    },
}

pub trait PipelineLike: Send + Sync {
    fn run(&self, request: &GenerationRequest, input: &PipelineInput)
        -> anyhow::Result<DynamicImage>;

    /// Rough byte count of resident weights, when known.
    fn memory_footprint(&self) -> Option<u64> {
        None
    }
}

pub trait Loader {
    type Model: PipelineLike;

    fn load(model_id: &str, ctx: &LoadContext<'_>) -> anyhow::Result<Self::Model>
    where
        Self: Sized;
}
