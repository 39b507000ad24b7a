use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use candle_transformers::models::stable_diffusion::uni_pc::UniPCSchedulerConfig;
use candle_transformers::models::stable_diffusion::{self, clip, vae};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod controlnet;
mod unet;

use controlnet::{ControlNetConfig, ControlNetModel};
use unet::{UNet2DConditionModel, UNet2DConditionModelConfig};

use crate::{
    image_to_cond_tensor, model_dtype, select_best_device, tensor_to_image, DeviceMap,
    GenerationParams, Loader, ModelLike,
};

/// Base diffusion weights.
pub const BASE_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";
/// Canny-edge conditioning weights.
pub const CONTROLNET_MODEL_ID: &str = "lllyasviel/sd-controlnet-canny";
/// The CLIP tokenizer ships outside the base repository.
const TOKENIZER_ID: &str = "openai/clip-vit-base-patch32";

/// Style applied when the caller does not supply a prompt.
pub const AVATAR_PROMPT: &str =
    "Notion style avatar, minimalist, vector art, black and white, clean lines, simple, corporate headshot";
pub const NEGATIVE_PROMPT: &str =
    "ugly, disfigured, deformed, noisy, blurry, low quality, watermark, text";

const DEFAULT_STEPS: usize = 20;
const DEFAULT_GUIDANCE: f64 = 7.5;
const CONDITIONING_SCALE: f64 = 1.0;
const RESOLUTION: usize = 512;
const VAE_SCALE: f64 = 0.18215;

pub struct SdControlNetModel {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip_model: clip::ClipTextTransformer,
    vae_model: vae::AutoEncoderKL,
    unet_model: UNet2DConditionModel,
    controlnet_model: ControlNetModel,
}

impl SdControlNetModel {
    /// Encodes a prompt into CLIP hidden states, padded to the context size.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_tokens);
        while tokens.len() < self.max_tokens {
            tokens.push(self.pad_id);
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?)
    }
}

fn effective_prompt(params: &GenerationParams) -> &str {
    match params.prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => prompt,
        _ => AVATAR_PROMPT,
    }
}

impl ModelLike for SdControlNetModel {
    fn run(&self, control_image: &DynamicImage, params: &GenerationParams) -> Result<DynamicImage> {
        let prompt = effective_prompt(params);
        let steps = params.steps.unwrap_or(DEFAULT_STEPS);
        let guidance = params.guidance.unwrap_or(DEFAULT_GUIDANCE);

        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = UniPCSchedulerConfig::default().build(steps)?;

        // --- Encode prompts for classifier-free guidance ---
        let text_emb = self.encode_prompt(prompt)?;
        let uncond_emb = self.encode_prompt(NEGATIVE_PROMPT)?;
        let text_embeddings = Tensor::cat(&[&uncond_emb, &text_emb], 0)?.to_dtype(self.dtype)?;

        // --- Prepare the conditioning tensor from the edge map ---
        let cond = image_to_cond_tensor(control_image, RESOLUTION, RESOLUTION, &self.device)?
            .to_dtype(self.dtype)?;
        let cond = Tensor::cat(&[&cond, &cond], 0)?;

        // --- Initial latents ---
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, RESOLUTION / 8, RESOLUTION / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        // --- Denoising loop ---
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let (down_residuals, mid_residual) = self.controlnet_model.forward(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                &cond,
                CONDITIONING_SCALE,
            )?;
            let noise_pred = self.unet_model.forward_with_residuals(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                Some(&down_residuals),
                Some(&mid_residual),
            )?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoised");
        }

        // --- Decode the latents and convert to an image ---
        let image = self.vae_model.decode(&(latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.clamp(0f32, 1.)?.to_device(&Device::Cpu)?;
        let image = (image * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

pub struct SdControlNetLoader;

impl Loader for SdControlNetLoader {
    type Model = SdControlNetModel;

    async fn load(api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = model_dtype(&device);
        let sd_config =
            stable_diffusion::StableDiffusionConfig::v1_5(None, Some(RESOLUTION), Some(RESOLUTION));

        let base_repo = api.repo(hf_hub::Repo::model(BASE_MODEL_ID.to_string()));
        let controlnet_repo = api.repo(hf_hub::Repo::model(CONTROLNET_MODEL_ID.to_string()));

        // --- Load the CLIP tokenizer ---
        let tokenizer_filename = api
            .model(TOKENIZER_ID.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = match &sd_config.clip.pad_with {
            Some(padding) => padding.clone(),
            None => "<|endoftext|>".to_string(),
        };
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .context("pad token missing from tokenizer vocab")?;

        // --- Load the CLIP text encoder ---
        info!(model = BASE_MODEL_ID, "loading text encoder");
        let clip_weights = base_repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get CLIP weights")?;
        let clip_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, &device, dtype)
                .context("failed to load CLIP text encoder")?;

        // --- Load the autoencoder ---
        info!(model = BASE_MODEL_ID, "loading autoencoder");
        let vae_weights = base_repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get autoencoder weights")?;
        let vae_model = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load autoencoder")?;

        // --- Load the denoising UNet ---
        info!(model = BASE_MODEL_ID, "loading unet");
        let unet_weights = base_repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get unet weights")?;
        let unet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[unet_weights], dtype, &device)
                .context("failed to build unet var builder")?
        };
        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet_model = UNet2DConditionModel::new(
            unet_vb,
            4,
            4,
            use_flash_attn,
            UNet2DConditionModelConfig::default(),
        )
        .context("failed to load unet")?;

        // --- Load the edge-conditioning model ---
        info!(model = CONTROLNET_MODEL_ID, "loading controlnet");
        let controlnet_weights = controlnet_repo
            .get("diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get controlnet weights")?;
        let controlnet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[controlnet_weights], dtype, &device)
                .context("failed to build controlnet var builder")?
        };
        let controlnet_model = ControlNetModel::new(
            controlnet_vb,
            4,
            use_flash_attn,
            ControlNetConfig::default(),
        )
        .context("failed to load controlnet")?;

        info!("pipeline ready");
        Ok(SdControlNetModel {
            device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            clip_model,
            vae_model,
            unet_model,
            controlnet_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_falls_back_to_avatar_style() {
        assert_eq!(effective_prompt(&GenerationParams::default()), AVATAR_PROMPT);
        let blank = GenerationParams {
            prompt: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(effective_prompt(&blank), AVATAR_PROMPT);
    }

    #[test]
    fn caller_prompt_wins() {
        let params = GenerationParams {
            prompt: Some("pencil sketch".to_string()),
            ..Default::default()
        };
        assert_eq!(effective_prompt(&params), "pencil sketch");
    }
}
