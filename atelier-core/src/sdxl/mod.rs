use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use hf_hub::api::sync::ApiRepo;
use image::imageops::FilterType;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::manager::LoadContext;
use crate::util::{image_to_tensor, tensor_to_image};
use crate::{GenerationRequest, Loader, PipelineInput, PipelineLike};

const VAE_SCALE: f64 = 0.13025;
const LATENT_CHANNELS: usize = 4;

const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const TOKENIZER_2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const VAE_FP16_FIX_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

/// Supported SDXL checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdxlVariant {
    Base,
    Turbo,
}

impl SdxlVariant {
    /// Detect the variant from a model id
    pub fn from_name(model_id: &str) -> Option<Self> {
        let name_upper = model_id.to_uppercase();
        if name_upper.contains("TURBO") {
            Some(Self::Turbo)
        } else if name_upper.contains("XL") {
            Some(Self::Base)
        } else {
            None
        }
    }

    fn default_steps(&self) -> usize {
        match self {
            Self::Base => 20,
            Self::Turbo => 4,
        }
    }

    fn default_guidance(&self) -> f64 {
        match self {
            Self::Base => 7.5,
            Self::Turbo => 0.0,
        }
    }
}

pub struct SdxlModel {
    variant: SdxlVariant,
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    text_model: ClipTextTransformer,
    text_model_2: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    weight_bytes: u64,
}

impl PipelineLike for SdxlModel {
    fn run(
        &self,
        request: &GenerationRequest,
        input: &PipelineInput,
    ) -> Result<DynamicImage> {
        // Set defaults.
        let width = request.width.unwrap_or(1024);
        let height = request.height.unwrap_or(1024);
        let steps = request.steps.unwrap_or_else(|| self.variant.default_steps());
        let guidance_scale = request
            .guidance_scale
            .unwrap_or_else(|| self.variant.default_guidance());
        let use_guidance = guidance_scale > 1.0;

        // Optionally set seed for reproducibility.
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let text_embeddings =
            self.text_embeddings(&request.prompt, &request.negative_prompt, use_guidance)?;

        let mut scheduler = self.sd_config.build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let strength = request.strength.unwrap_or(match input {
            PipelineInput::SourceAndMask { .. } => 1.0,
            _ => 0.8,
        });
        let t_start = match input {
            PipelineInput::TextOnly => 0,
            _ => steps.saturating_sub((steps as f64 * strength) as usize),
        };

        let latent_height = height / 8;
        let latent_width = width / 8;

        let (init_latents, latent_mask) = match input {
            PipelineInput::TextOnly => (None, None),
            PipelineInput::SourceImage(image) => {
                (Some(self.encode_image(image, width, height)?), None)
            }
            PipelineInput::SourceAndMask { image, mask } => (
                Some(self.encode_image(image, width, height)?),
                Some(self.mask_to_latent(mask, latent_width, latent_height)?),
            ),
        };

        let mut latents = match &init_latents {
            Some(init) => {
                if t_start < timesteps.len() {
                    let noise = init.randn_like(0f64, 1f64)?;
                    scheduler.add_noise(init, noise, timesteps[t_start])?
                } else {
                    init.clone()
                }
            }
            None => {
                let noise = Tensor::randn(
                    0f32,
                    1f32,
                    (1, LATENT_CHANNELS, latent_height, latent_width),
                    &self.device,
                )?
                .to_dtype(self.dtype)?;
                (noise * scheduler.init_noise_sigma())?
            }
        };

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoised");

            // Pin regions outside the mask to the source image, re-noised
            // to the level the next step expects.
            if let (Some(mask), Some(init)) = (&latent_mask, &init_latents) {
                let reference = if index + 1 < timesteps.len() {
                    let noise = init.randn_like(0f64, 1f64)?;
                    scheduler.add_noise(init, noise, timesteps[index + 1])?
                } else {
                    init.clone()
                };
                let keep = mask.affine(-1.0, 1.0)?;
                latents =
                    (mask.broadcast_mul(&latents)? + keep.broadcast_mul(&reference)?)?;
            }
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&image.i(0)?)
    }

    fn memory_footprint(&self) -> Option<u64> {
        Some(self.weight_bytes)
    }
}

impl SdxlModel {
    /// SDXL conditions on both text encoders, concatenated on the hidden
    /// dimension; guidance batches the negative prompt in front.
    fn text_embeddings(
        &self,
        prompt: &str,
        negative: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let embeddings = encode_prompt(
            &self.tokenizer,
            &self.text_model,
            &self.sd_config.clip,
            prompt,
            negative,
            use_guidance,
            &self.device,
        )?;
        let Some(clip2_config) = self.sd_config.clip2.as_ref() else {
            return Ok(embeddings);
        };
        let embeddings_2 = encode_prompt(
            &self.tokenizer_2,
            &self.text_model_2,
            clip2_config,
            prompt,
            negative,
            use_guidance,
            &self.device,
        )?;
        Ok(Tensor::cat(&[embeddings, embeddings_2], D::Minus1)?)
    }

    fn encode_image(&self, image: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
        let tensor = image_to_tensor(image, width, height, &self.device)?.to_dtype(self.dtype)?;
        let dist = self.vae.encode(&tensor)?;
        Ok((dist.sample()? * VAE_SCALE)?)
    }

    /// Nearest-neighbor downsample of the mask to latent resolution;
    /// white (>127) marks the region to regenerate.
    fn mask_to_latent(
        &self,
        mask: &DynamicImage,
        latent_width: usize,
        latent_height: usize,
    ) -> Result<Tensor> {
        let gray = mask
            .resize_exact(latent_width as u32, latent_height as u32, FilterType::Nearest)
            .to_luma8();
        let values: Vec<f32> = gray
            .into_raw()
            .into_iter()
            .map(|v| if v > 127 { 1.0 } else { 0.0 })
            .collect();
        let tensor = Tensor::from_vec(values, (1, 1, latent_height, latent_width), &self.device)?;
        Ok(tensor.to_dtype(self.dtype)?)
    }
}

fn encode_prompt(
    tokenizer: &Tokenizer,
    text_model: &ClipTextTransformer,
    clip_config: &stable_diffusion::clip::Config,
    prompt: &str,
    negative: &str,
    use_guidance: bool,
    device: &Device,
) -> Result<Tensor> {
    let cond = encode_tokens(tokenizer, text_model, clip_config, prompt, device)?;
    if !use_guidance {
        return Ok(cond);
    }
    let uncond = encode_tokens(tokenizer, text_model, clip_config, negative, device)?;
    Ok(Tensor::cat(&[uncond, cond], 0)?)
}

fn encode_tokens(
    tokenizer: &Tokenizer,
    text_model: &ClipTextTransformer,
    clip_config: &stable_diffusion::clip::Config,
    text: &str,
    device: &Device,
) -> Result<Tensor> {
    let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
    let pad_id = *tokenizer
        .get_vocab(true)
        .get(pad_token)
        .ok_or_else(|| anyhow!("token {pad_token:?} missing from tokenizer vocab"))?;
    let mut tokens = tokenizer
        .encode(text, true)
        .map_err(Error::msg)?
        .get_ids()
        .to_vec();
    if tokens.len() > clip_config.max_position_embeddings {
        bail!(
            "prompt is too long ({} tokens, max {})",
            tokens.len(),
            clip_config.max_position_embeddings
        );
    }
    tokens.resize(clip_config.max_position_embeddings, pad_id);
    let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
    Ok(text_model.forward(&tokens)?)
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    fn load(model_id: &str, ctx: &LoadContext<'_>) -> Result<SdxlModel> {
        let variant = SdxlVariant::from_name(model_id)
            .ok_or_else(|| anyhow!("unsupported model id: {model_id}"))?;
        let device = ctx.device.clone();
        let dtype = ctx.dtype;
        info!(model_id, ?variant, "loading SDXL pipeline");

        let sd_config = match variant {
            SdxlVariant::Base => StableDiffusionConfig::sdxl(None, None, None),
            SdxlVariant::Turbo => StableDiffusionConfig::sdxl_turbo(None, None, None),
        };

        let mut weight_bytes = 0u64;
        let repo = ctx.api.model(model_id.to_string());

        let tokenizer_file = fetch(
            &ctx.api.model(TOKENIZER_REPO.to_string()),
            "tokenizer.json",
            &mut weight_bytes,
        )?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;
        let tokenizer_2_file = fetch(
            &ctx.api.model(TOKENIZER_2_REPO.to_string()),
            "tokenizer.json",
            &mut weight_bytes,
        )?;
        let tokenizer_2 = Tokenizer::from_file(tokenizer_2_file)
            .map_err(Error::msg)
            .context("failed to load second tokenizer")?;

        let clip_weights = fetch_weights(
            &repo,
            "text_encoder/model.fp16.safetensors",
            "text_encoder/model.safetensors",
            dtype,
            &mut weight_bytes,
        )?;
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, &device, dtype)
                .context("failed to build text encoder")?;

        let clip2_config = sd_config
            .clip2
            .as_ref()
            .ok_or_else(|| anyhow!("SDXL config is missing the second text encoder"))?;
        let clip2_weights = fetch_weights(
            &repo,
            "text_encoder_2/model.fp16.safetensors",
            "text_encoder_2/model.safetensors",
            dtype,
            &mut weight_bytes,
        )?;
        let text_model_2 =
            stable_diffusion::build_clip_transformer(clip2_config, clip2_weights, &device, dtype)
                .context("failed to build second text encoder")?;

        // The stock SDXL VAE overflows in half precision; use the fixed
        // weights when running F16.
        let vae_weights = if dtype == DType::F16 {
            fetch(
                &ctx.api.model(VAE_FP16_FIX_REPO.to_string()),
                "diffusion_pytorch_model.safetensors",
                &mut weight_bytes,
            )?
        } else {
            fetch(
                &repo,
                "vae/diffusion_pytorch_model.safetensors",
                &mut weight_bytes,
            )?
        };
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to build VAE")?;

        let unet_weights = fetch_weights(
            &repo,
            "unet/diffusion_pytorch_model.fp16.safetensors",
            "unet/diffusion_pytorch_model.safetensors",
            dtype,
            &mut weight_bytes,
        )?;
        let unet = sd_config
            .build_unet(unet_weights, &device, LATENT_CHANNELS, false, dtype)
            .context("failed to build UNet")?;

        info!(
            gib = weight_bytes as f64 / (1u64 << 30) as f64,
            "SDXL pipeline resident"
        );

        Ok(SdxlModel {
            variant,
            device,
            dtype,
            sd_config,
            tokenizer,
            tokenizer_2,
            text_model,
            text_model_2,
            vae,
            unet,
            weight_bytes,
        })
    }
}

fn fetch(repo: &ApiRepo, filename: &str, total: &mut u64) -> Result<PathBuf> {
    let path = repo
        .get(filename)
        .with_context(|| format!("failed to fetch {filename}"))?;
    if let Ok(meta) = std::fs::metadata(&path) {
        *total += meta.len();
    }
    Ok(path)
}

fn fetch_weights(
    repo: &ApiRepo,
    fp16: &str,
    fp32: &str,
    dtype: DType,
    total: &mut u64,
) -> Result<PathBuf> {
    if dtype == DType::F16 {
        match fetch(repo, fp16, total) {
            Ok(path) => return Ok(path),
            Err(_) => debug!(file = fp16, "fp16 weights not found, falling back to fp32"),
        }
    }
    fetch(repo, fp32, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection_from_model_ids() {
        assert_eq!(
            SdxlVariant::from_name("stabilityai/stable-diffusion-xl-base-1.0"),
            Some(SdxlVariant::Base)
        );
        assert_eq!(
            SdxlVariant::from_name("stabilityai/sdxl-turbo"),
            Some(SdxlVariant::Turbo)
        );
        assert_eq!(SdxlVariant::from_name("black-forest-labs/FLUX.1-schnell"), None);
    }

    #[test]
    fn turbo_runs_unguided_by_default() {
        assert_eq!(SdxlVariant::Turbo.default_guidance(), 0.0);
        assert!(SdxlVariant::Base.default_guidance() > 1.0);
    }
}
