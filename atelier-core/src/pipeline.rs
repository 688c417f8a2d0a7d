use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ErrorKind, GenerateError};
use crate::image_ops;
use crate::manager::{ManagerInfo, ModelManager};
use crate::sdxl::SdxlLoader;
use crate::{GenerationRequest, Loader, PipelineInput, PipelineLike};

/// Logical cache key for the base generation pipeline.
pub const SDXL_KEY: &str = "sdxl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
    Inpaint,
    #[serde(rename = "controlnet")]
    ControlNet,
    #[serde(rename = "instantid")]
    InstantId,
}

serde_plain::derive_fromstr_from_deserialize!(GenerationMode);
serde_plain::derive_display_from_serialize!(GenerationMode);

impl GenerationMode {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Self::TextToImage => "txt2img",
            Self::ImageToImage => "img2img",
            Self::Inpaint => "inpaint",
            Self::ControlNet => "controlnet",
            Self::InstantId => "instantid",
        }
    }
}

/// Structured result of a dispatch: either a saved artifact or a
/// classified failure, always echoing the request parameters.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub parameters: GenerationRequest,
}

struct GenerationDefaults {
    width: usize,
    height: usize,
    steps: usize,
    guidance_scale: f64,
}

/// Drives the generation modes: keeps the model cache, loads source
/// imagery, invokes the pipeline, and persists the result.
pub struct Orchestrator {
    manager: ModelManager,
    model_id: String,
    output_dir: PathBuf,
    defaults: GenerationDefaults,
    artifact_seq: u64,
}

impl Orchestrator {
    pub fn new(manager: ModelManager, config: &Config) -> Self {
        let defaults = GenerationDefaults {
            width: config.get("generation.default_width", 1024),
            height: config.get("generation.default_height", 1024),
            steps: config.get("generation.default_steps", 20),
            guidance_scale: config.get("generation.default_guidance_scale", 7.5),
        };
        let output_dir = PathBuf::from(config.get("output_dir", String::from("data/outputs")));
        let model_id = config.get(
            "models.sdxl_model",
            String::from("stabilityai/stable-diffusion-xl-base-1.0"),
        );
        Self {
            manager,
            model_id,
            output_dir,
            defaults,
            artifact_seq: 0,
        }
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ModelManager {
        &mut self.manager
    }

    pub fn model_info(&self) -> ManagerInfo {
        self.manager.info()
    }

    /// Generate an image from a text prompt.
    pub fn generate(&mut self, request: GenerationRequest) -> GenerationOutcome {
        self.dispatch(GenerationMode::TextToImage, request)
    }

    /// Transform an existing image under a new prompt.
    pub fn transform(
        &mut self,
        image_path: impl Into<PathBuf>,
        mut request: GenerationRequest,
    ) -> GenerationOutcome {
        request.image_path = Some(image_path.into());
        self.dispatch(GenerationMode::ImageToImage, request)
    }

    /// Regenerate the masked region of an image.
    pub fn inpaint(
        &mut self,
        image_path: impl Into<PathBuf>,
        mask_path: impl Into<PathBuf>,
        mut request: GenerationRequest,
    ) -> GenerationOutcome {
        request.image_path = Some(image_path.into());
        request.mask_path = Some(mask_path.into());
        self.dispatch(GenerationMode::Inpaint, request)
    }

    /// Run a mode to completion, folding any failure into the outcome.
    pub fn dispatch(
        &mut self,
        mode: GenerationMode,
        request: GenerationRequest,
    ) -> GenerationOutcome {
        match self.try_dispatch(mode, &request) {
            Ok(path) => {
                info!(%mode, path = %path.display(), "generation complete");
                GenerationOutcome {
                    success: true,
                    image_path: Some(path),
                    error: None,
                    error_kind: None,
                    parameters: request,
                }
            }
            Err(err) => {
                error!(%mode, %err, "generation failed");
                GenerationOutcome {
                    success: false,
                    image_path: None,
                    error_kind: Some(err.kind()),
                    error: Some(err.to_string()),
                    parameters: request,
                }
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch) but surfaces the typed error so
    /// callers can branch on the failure class.
    pub fn try_dispatch(
        &mut self,
        mode: GenerationMode,
        request: &GenerationRequest,
    ) -> Result<PathBuf, GenerateError> {
        if matches!(mode, GenerationMode::ControlNet | GenerationMode::InstantId) {
            return Err(GenerateError::Unsupported(mode));
        }

        let model = self.ensure_model()?;
        let input = self.load_inputs(mode, request)?;
        let resolved = self.resolve(request);

        let image = model
            .run(&resolved, &input)
            .map_err(GenerateError::from_backend)?;

        let path = self.next_artifact_path(mode);
        image_ops::save_image(&image, &path).map_err(|err| {
            match err.downcast::<std::io::Error>() {
                Ok(io) => GenerateError::Io(io),
                Err(other) => GenerateError::Backend(other),
            }
        })?;
        Ok(path)
    }

    fn ensure_model(&mut self) -> Result<Arc<dyn PipelineLike>, GenerateError> {
        let model_id = self.model_id.clone();
        self.manager
            .load(SDXL_KEY, |ctx| {
                let model = SdxlLoader::load(&model_id, ctx)?;
                Ok(Arc::new(model) as Arc<dyn PipelineLike>)
            })
            .map_err(GenerateError::ModelUnavailable)
    }

    fn load_inputs(
        &self,
        mode: GenerationMode,
        request: &GenerationRequest,
    ) -> Result<PipelineInput, GenerateError> {
        match mode {
            GenerationMode::ImageToImage => {
                let path = request
                    .image_path
                    .as_ref()
                    .ok_or_else(|| missing_param("image_path", mode))?;
                Ok(PipelineInput::SourceImage(self.load_source(path)?))
            }
            GenerationMode::Inpaint => {
                let image_path = request
                    .image_path
                    .as_ref()
                    .ok_or_else(|| missing_param("image_path", mode))?;
                let mask_path = request
                    .mask_path
                    .as_ref()
                    .ok_or_else(|| missing_param("mask_path", mode))?;
                Ok(PipelineInput::SourceAndMask {
                    image: self.load_source(image_path)?,
                    mask: self.load_source(mask_path)?,
                })
            }
            _ => Ok(PipelineInput::TextOnly),
        }
    }

    fn load_source(&self, path: &std::path::Path) -> Result<image::DynamicImage, GenerateError> {
        image_ops::load_image(path).map_err(|err| GenerateError::InvalidInput(format!("{err:#}")))
    }

    fn resolve(&self, request: &GenerationRequest) -> GenerationRequest {
        let mut resolved = request.clone();
        resolved.width.get_or_insert(self.defaults.width);
        resolved.height.get_or_insert(self.defaults.height);
        resolved.steps.get_or_insert(self.defaults.steps);
        resolved
            .guidance_scale
            .get_or_insert(self.defaults.guidance_scale);
        resolved
    }

    /// Artifact names carry a wall-clock stamp for scanability and a
    /// per-process sequence number so same-second requests never collide.
    fn next_artifact_path(&mut self, mode: GenerationMode) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let seq = self.artifact_seq;
        self.artifact_seq += 1;
        self.output_dir
            .join(format!("{}_{stamp}_{seq:04}.png", mode.file_prefix()))
    }
}

fn missing_param(name: &str, mode: GenerationMode) -> GenerateError {
    GenerateError::InvalidInput(format!("{name} is required for {mode}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use serde_json::json;
    use std::path::Path;

    struct SeededFill;

    impl PipelineLike for SeededFill {
        fn run(
            &self,
            request: &GenerationRequest,
            _input: &PipelineInput,
        ) -> anyhow::Result<DynamicImage> {
            let width = request.width.unwrap_or(64) as u32;
            let height = request.height.unwrap_or(64) as u32;
            let shade = request.seed.map(|s| (s % 251) as u8).unwrap_or(17);
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                width,
                height,
                Rgb([shade; 3]),
            )))
        }
    }

    fn orchestrator(output_dir: &Path) -> Orchestrator {
        let scratch = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::defaults();
        config.set(
            "model_dir",
            json!(scratch.join("models").to_string_lossy()),
        );
        config.set("output_dir", json!(output_dir.to_string_lossy()));
        let mut manager =
            ModelManager::with_preference(&config, crate::DevicePreference::ForceCpu).unwrap();
        manager
            .load(SDXL_KEY, |_| Ok(Arc::new(SeededFill) as Arc<dyn PipelineLike>))
            .unwrap();
        Orchestrator::new(manager, &config)
    }

    fn output_files(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn text_to_image_saves_a_decodable_artifact() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());
        let mut request = GenerationRequest::new("A red cube on a white background");
        request.width = Some(512);
        request.height = Some(512);
        request.steps = Some(10);

        let outcome = orchestrator.dispatch(GenerationMode::TextToImage, request.clone());
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.parameters, request);

        let path = outcome.image_path.unwrap();
        assert!(path.starts_with(out.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("txt2img_"));
        let decoded = image_ops::load_image(&path).unwrap();
        assert_eq!(decoded.dimensions(), (512, 512));
    }

    #[test]
    fn missing_source_image_fails_without_artifact() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());
        let request = GenerationRequest::new("x");

        let outcome = orchestrator.dispatch(GenerationMode::ImageToImage, request);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidInput));
        assert!(outcome.error.unwrap().contains("image_path"));
        assert!(output_files(out.path()).is_empty());
    }

    #[test]
    fn inpaint_with_nonexistent_files_names_the_missing_file() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());

        let outcome = orchestrator.inpaint(
            "missing.png",
            "missing_mask.png",
            GenerationRequest::new("x"),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidInput));
        assert!(outcome.error.unwrap().contains("missing.png"));
        assert!(output_files(out.path()).is_empty());
    }

    #[test]
    fn stubbed_modes_report_unsupported() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());

        for mode in [GenerationMode::ControlNet, GenerationMode::InstantId] {
            let outcome = orchestrator.dispatch(mode, GenerationRequest::new("x"));
            assert!(!outcome.success);
            assert_eq!(outcome.error_kind, Some(ErrorKind::Unsupported));
        }
        assert!(output_files(out.path()).is_empty());
    }

    #[test]
    fn same_second_dispatches_get_distinct_paths() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());
        let request = GenerationRequest::new("x");

        let first = orchestrator.generate(request.clone());
        let second = orchestrator.generate(request);
        assert!(first.success && second.success);
        assert_ne!(first.image_path, second.image_path);
        assert_eq!(output_files(out.path()).len(), 2);
    }

    #[test]
    fn same_seed_reproduces_the_same_image() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());
        let mut request = GenerationRequest::new("x");
        request.seed = Some(42);

        let first = orchestrator.generate(request.clone());
        let second = orchestrator.generate(request);
        let a = std::fs::read(first.image_path.unwrap()).unwrap();
        let b = std::fs::read(second.image_path.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn transform_runs_against_an_existing_image() {
        let out = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(out.path());

        let source = out.path().join("source.png");
        image_ops::save_image(
            &DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([128; 3]))),
            &source,
        )
        .unwrap();

        let outcome = orchestrator.transform(&source, GenerationRequest::new("repaint it"));
        assert!(outcome.success, "{:?}", outcome.error);
        let name = outcome.image_path.unwrap();
        assert!(name
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("img2img_"));
    }

    #[test]
    fn mode_names_round_trip_as_strings() {
        assert_eq!(GenerationMode::TextToImage.to_string(), "text_to_image");
        assert_eq!(GenerationMode::ControlNet.to_string(), "controlnet");
        assert_eq!(
            "inpaint".parse::<GenerationMode>().unwrap(),
            GenerationMode::Inpaint
        );
    }
}
