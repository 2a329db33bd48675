#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle_core::{bail, DType, IndexOp, Result, Tensor};
use candle_nn::{
    conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder,
};

/// Hyperparameters of a timm-layout Vision Transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct VitConfig {
    pub img_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    /// LayerScale initial value; `Some` means `ls1`/`ls2` weights are present
    pub init_values: Option<f64>,
    pub reg_tokens: usize,
    /// Positional embedding covers patch tokens only
    pub no_embed_class: bool,
    /// Accept inputs whose size differs from `img_size`
    pub dynamic_img_size: bool,
    pub layer_norm_eps: f64,
}

impl VitConfig {
    fn base(embed_dim: usize, depth: usize, num_heads: usize, patch_size: usize) -> Self {
        Self {
            img_size: 224,
            patch_size,
            in_chans: 3,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            init_values: None,
            reg_tokens: 0,
            no_embed_class: false,
            dynamic_img_size: false,
            layer_norm_eps: 1e-6,
        }
    }

    pub fn vit_small(patch_size: usize) -> Self {
        Self::base(384, 12, 6, patch_size)
    }

    pub fn vit_base(patch_size: usize) -> Self {
        Self::base(768, 12, 12, patch_size)
    }

    pub fn vit_large(patch_size: usize) -> Self {
        Self::base(1024, 24, 16, patch_size)
    }

    /// UNI: ViT-L/16 with LayerScale and dynamic input size
    pub fn uni() -> Self {
        Self {
            init_values: Some(1e-5),
            dynamic_img_size: true,
            ..Self::vit_large(16)
        }
    }

    /// kaiko.ai variants, keyed by their short name (`vits16`, ..., `vitl14`)
    pub fn kaiko(variant: &str) -> Option<Self> {
        let config = match variant {
            "vits16" => Self::vit_small(16),
            "vits8" => Self::vit_small(8),
            "vitb16" => Self::vit_base(16),
            "vitb8" => Self::vit_base(8),
            "vitl14" => Self {
                init_values: Some(1e-5),
                reg_tokens: 4,
                no_embed_class: true,
                ..Self::vit_large(14)
            },
            _ => return None,
        };
        Some(Self {
            dynamic_img_size: true,
            ..config
        })
    }

    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    pub fn num_prefix_tokens(&self) -> usize {
        1 + self.reg_tokens
    }

    fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }
}

struct LayerScale {
    gamma: Tensor,
}

impl LayerScale {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get(dim, "gamma")?;
        Ok(Self { gamma })
    }
}

impl Module for LayerScale {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&self.gamma)
    }
}

struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = dim / cfg.num_heads;
        Ok(Self {
            qkv: linear(dim, dim * 3, vb.pp("qkv"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        // [3, B, heads, N, head_dim]
        let qkv = xs
            .apply(&self.qkv)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        attn.matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, c))?
            .apply(&self.proj)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.mlp_hidden_dim();
        Ok(Self {
            fc1: linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.gelu_erf()?.apply(&self.fc2)
    }
}

struct Block {
    norm1: LayerNorm,
    attn: Attention,
    ls1: Option<LayerScale>,
    norm2: LayerNorm,
    mlp: Mlp,
    ls2: Option<LayerScale>,
}

impl Block {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let layer_scale = |name: &str| -> Result<Option<LayerScale>> {
            match cfg.init_values {
                Some(_) => Ok(Some(LayerScale::new(dim, vb.pp(name))?)),
                None => Ok(None),
            }
        };
        Ok(Self {
            norm1: layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ls1: layer_scale("ls1")?,
            norm2: layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            ls2: layer_scale("ls2")?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.apply(&self.norm1)?.apply(&self.attn)?;
        let ys = match &self.ls1 {
            Some(ls) => ys.apply(ls)?,
            None => ys,
        };
        let xs = (xs + ys)?;

        let ys = xs.apply(&self.norm2)?.apply(&self.mlp)?;
        let ys = match &self.ls2 {
            Some(ls) => ys.apply(ls)?,
            None => ys,
        };
        xs + ys
    }
}

/// Vision Transformer returning the normalized class token, `[B, embed_dim]`.
pub struct VisionTransformer {
    patch_embed: Conv2d,
    cls_token: Tensor,
    reg_token: Option<Tensor>,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    config: VitConfig,
}

impl VisionTransformer {
    pub fn new(config: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;
        let conv_cfg = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embed = conv2d(
            config.in_chans,
            dim,
            config.patch_size,
            conv_cfg,
            vb.pp("patch_embed").pp("proj"),
        )?;

        let cls_token = vb.get((1, 1, dim), "cls_token")?;
        let reg_token = match config.reg_tokens {
            0 => None,
            n => Some(vb.get((1, n, dim), "reg_token")?),
        };

        let embed_len = config.grid_size() * config.grid_size()
            + if config.no_embed_class {
                0
            } else {
                config.num_prefix_tokens()
            };
        let pos_embed = vb.get((1, embed_len, dim), "pos_embed")?;

        let blocks = (0..config.depth)
            .map(|i| Block::new(config, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(dim, config.layer_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            patch_embed,
            cls_token,
            reg_token,
            pos_embed,
            blocks,
            norm,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    /// Width of the returned embedding
    pub fn num_features(&self) -> usize {
        self.config.embed_dim
    }

    /// Positional embedding for a `grid_h x grid_w` patch grid
    fn pos_embed_for(&self, grid_h: usize, grid_w: usize) -> Result<Tensor> {
        let grid = self.config.grid_size();
        if (grid_h, grid_w) == (grid, grid) {
            return Ok(self.pos_embed.clone());
        }
        let prefix = if self.config.no_embed_class {
            0
        } else {
            self.config.num_prefix_tokens()
        };
        let patch_pos = self.pos_embed.narrow(1, prefix, grid * grid)?;
        let patch_pos = resample_pos_embed(&patch_pos, (grid, grid), (grid_h, grid_w))?;
        if prefix == 0 {
            return Ok(patch_pos);
        }
        let prefix_pos = self.pos_embed.narrow(1, 0, prefix)?;
        Tensor::cat(&[&prefix_pos, &patch_pos], 1)
    }

    fn add_pos_embed(&self, xs: &Tensor, grid_h: usize, grid_w: usize) -> Result<Tensor> {
        let (b, _, dim) = xs.dims3()?;
        let pos_embed = self.pos_embed_for(grid_h, grid_w)?;

        let mut tokens = vec![self.cls_token.expand((b, 1, dim))?];
        if let Some(reg_token) = &self.reg_token {
            tokens.push(reg_token.expand((b, self.config.reg_tokens, dim))?);
        }

        if self.config.no_embed_class {
            tokens.push(xs.broadcast_add(&pos_embed)?);
            Tensor::cat(&tokens, 1)
        } else {
            tokens.push(xs.clone());
            Tensor::cat(&tokens, 1)?.broadcast_add(&pos_embed)
        }
    }
}

impl Module for VisionTransformer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let img_size = self.config.img_size;
        if !self.config.dynamic_img_size && (h, w) != (img_size, img_size) {
            bail!("input size ({h}, {w}) does not match model ({img_size}, {img_size})")
        }

        // [B, D, gh, gw] -> [B, gh * gw, D]
        let xs = xs.apply(&self.patch_embed)?;
        let (_, _, grid_h, grid_w) = xs.dims4()?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?;

        let mut xs = self.add_pos_embed(&xs, grid_h, grid_w)?;
        for block in &self.blocks {
            xs = xs.apply(block)?;
        }
        xs.apply(&self.norm)?.i((.., 0))?.contiguous()
    }
}

/// Antialiased bicubic resampling (a = -0.5, half-pixel centers) of a `[1, h * w, D]`
/// grid of positional embeddings to a new grid size.
///
/// Matches `interpolate(mode="bicubic", antialias=True)`: when shrinking, the kernel
/// is stretched by the scale factor, and taps falling outside the grid are dropped
/// with the remaining weights renormalized.
pub fn resample_pos_embed(
    pos_embed: &Tensor,
    from: (usize, usize),
    to: (usize, usize),
) -> Result<Tensor> {
    let (_, len, dim) = pos_embed.dims3()?;
    if len != from.0 * from.1 {
        bail!("positional embedding holds {len} positions, expected {}", from.0 * from.1)
    }
    let in_dtype = pos_embed.dtype();
    let src = pos_embed
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let (to_h, to_w) = to;
    let col_taps: Vec<_> = (0..to_w).map(|ox| antialias_taps(ox, from.1, to_w)).collect();
    let mut out = vec![0f32; to_h * to_w * dim];
    for oy in 0..to_h {
        let (first_row, row_weights) = antialias_taps(oy, from.0, to_h);
        for (ox, (first_col, col_weights)) in col_taps.iter().enumerate() {
            let dst = &mut out[(oy * to_w + ox) * dim..][..dim];
            for (y, wy) in (first_row..).zip(row_weights.iter()) {
                for (x, wx) in (*first_col..).zip(col_weights.iter()) {
                    let weight = wy * wx;
                    if weight == 0.0 {
                        continue;
                    }
                    let row = &src[(y * from.1 + x) * dim..][..dim];
                    dst.iter_mut()
                        .zip(row)
                        .for_each(|(d, s)| *d += weight * s);
                }
            }
        }
    }

    Tensor::from_vec(out, (1, to_h * to_w, dim), pos_embed.device())?.to_dtype(in_dtype)
}

/// Keys cubic convolution kernel with a = -0.5
fn cubic(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

/// First source index and normalized weights for one output position.
fn antialias_taps(dst: usize, in_len: usize, out_len: usize) -> (usize, Vec<f32>) {
    let scale = in_len as f64 / out_len as f64;
    // downsampling widens the kernel
    let (support, inv_scale) = if scale >= 1.0 {
        (2.0 * scale, 1.0 / scale)
    } else {
        (2.0, 1.0)
    };
    let center = scale * (dst as f64 + 0.5);
    // truncation toward zero, then clamped to the grid
    let first = ((center - support + 0.5) as i64).max(0) as usize;
    let end = ((center + support + 0.5) as i64).min(in_len as i64) as usize;

    let weights: Vec<f64> = (first..end)
        .map(|j| cubic((j as f64 - center + 0.5) * inv_scale))
        .collect();
    let total: f64 = weights.iter().sum();
    let norm = if total != 0.0 { total } else { 1.0 };
    let weights = weights.into_iter().map(|w| (w / norm) as f32).collect();
    (first, weights)
}
