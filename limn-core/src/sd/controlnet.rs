//! Edge-conditioning ControlNet.
//!
//! The network mirrors the UNet encoder: a conditioning embedder projects
//! the edge map into the latent space, the down and mid blocks run as in
//! the base model, and zero-initialized 1x1 convolutions project each
//! residual before it is handed back to the UNet. Weight names follow the
//! diffusers checkpoint layout so published ControlNet weights load
//! unmodified.

use candle_core::{DType, Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
    UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
};

use super::unet::BlockConfig;

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
    /// Channels of the conditioning image (an RGB edge map).
    pub conditioning_channels: usize,
    pub conditioning_embedding_out_channels: Vec<usize>,
}

impl Default for ControlNetConfig {
    /// Layout of the SD v1.5 canny ControlNet.
    fn default() -> Self {
        Self {
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks: vec![
                BlockConfig {
                    out_channels: 320,
                    use_cross_attn: true,
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 640,
                    use_cross_attn: true,
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 1280,
                    use_cross_attn: true,
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 1280,
                    use_cross_attn: false,
                    attention_head_dim: 8,
                },
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            sliced_attention_size: None,
            use_linear_projection: false,
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
        }
    }
}

/// Projects the conditioning image into the latent resolution through a
/// small strided convolution stack.
struct ControlNetConditioningEmbedding {
    conv_in: nn::Conv2d,
    blocks: Vec<nn::Conv2d>,
    conv_out: nn::Conv2d,
}

impl ControlNetConditioningEmbedding {
    fn new(
        vs: nn::VarBuilder,
        conditioning_embedding_channels: usize,
        conditioning_channels: usize,
        block_out_channels: &[usize],
    ) -> Result<Self> {
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_cfg_stride = nn::Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = nn::conv2d(
            conditioning_channels,
            block_out_channels[0],
            3,
            conv_cfg,
            vs.pp("conv_in"),
        )?;
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::new();
        for (i, window) in block_out_channels.windows(2).enumerate() {
            let (channel_in, channel_out) = (window[0], window[1]);
            blocks.push(nn::conv2d(
                channel_in,
                channel_in,
                3,
                conv_cfg,
                vs_b.pp((2 * i).to_string()),
            )?);
            blocks.push(nn::conv2d(
                channel_in,
                channel_out,
                3,
                conv_cfg_stride,
                vs_b.pp((2 * i + 1).to_string()),
            )?);
        }
        let conv_out = nn::conv2d(
            *block_out_channels.last().unwrap(),
            conditioning_embedding_channels,
            3,
            conv_cfg,
            vs.pp("conv_out"),
        )?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ControlNetConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in self.blocks.iter() {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum ControlNetDownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

pub struct ControlNetModel {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ControlNetConditioningEmbedding,
    down_blocks: Vec<ControlNetDownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    controlnet_down_blocks: Vec<nn::Conv2d>,
    controlnet_mid_block: nn::Conv2d,
}

impl ControlNetModel {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: ControlNetConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks.last().unwrap().out_channels;
        let bl_attention_head_dim = config.blocks.last().unwrap().attention_head_dim;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let cond_embedding = ControlNetConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            b_channels,
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
        )?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig {
                    out_channels,
                    use_cross_attn,
                    attention_head_dim,
                } = config.blocks[i];
                let in_channels = if i > 0 {
                    config.blocks[i - 1].out_channels
                } else {
                    b_channels
                };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                if use_cross_attn {
                    let attn_cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: config.sliced_attention_size,
                        use_linear_projection: config.use_linear_projection,
                        ..Default::default()
                    };
                    let block = CrossAttnDownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        attn_cfg,
                    )?;
                    Ok(ControlNetDownBlock::CrossAttn(block))
                } else {
                    let block = DownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    )?;
                    Ok(ControlNetDownBlock::Basic(block))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;

        // One zero conv per encoder residual, plus one for the mid block.
        let zero_conv_cfg = nn::Conv2dConfig::default();
        let mut residual_channels = vec![b_channels];
        for (i, block) in config.blocks.iter().enumerate() {
            for _ in 0..config.layers_per_block {
                residual_channels.push(block.out_channels);
            }
            if i < n_blocks - 1 {
                residual_channels.push(block.out_channels);
            }
        }
        let vs_zc = vs.pp("controlnet_down_blocks");
        let controlnet_down_blocks = residual_channels
            .iter()
            .enumerate()
            .map(|(i, &channels)| {
                nn::conv2d(channels, channels, 1, zero_conv_cfg, vs_zc.pp(i.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let controlnet_mid_block = nn::conv2d(
            bl_channels,
            bl_channels,
            1,
            zero_conv_cfg,
            vs.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            controlnet_down_blocks,
            controlnet_mid_block,
        })
    }

    /// Produces the residuals added to the UNet skip connections, scaled by
    /// `conditioning_scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        controlnet_cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let (bsize, _channels, _height, _width) = xs.dims4()?;
        let device = xs.device();

        // 1. time embedding
        let emb = (Tensor::ones(bsize, DType::F32, device)? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb.to_dtype(xs.dtype())?)?;

        // 2. pre-process, then merge in the conditioning signal
        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(controlnet_cond)?;
        let xs = (xs + cond)?;

        // 3. down
        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (block_xs, res_xs) = match down_block {
                ControlNetDownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                ControlNetDownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            down_block_res_xs.extend(res_xs);
            xs = block_xs;
        }

        // 4. mid
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        // 5. zero convs and scaling
        let mut down_samples = Vec::with_capacity(down_block_res_xs.len());
        for (res, zero_conv) in down_block_res_xs
            .iter()
            .zip(self.controlnet_down_blocks.iter())
        {
            down_samples.push((zero_conv.forward(res)? * conditioning_scale)?);
        }
        let mid_sample = (self.controlnet_mid_block.forward(&xs)? * conditioning_scale)?;
        Ok((down_samples, mid_sample))
    }
}
