use candle_core::{Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, Module,
    VarBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResNetConfig {
    pub block: BlockKind,
    pub layers: [usize; 4],
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet18() -> Self {
        Self {
            block: BlockKind::Basic,
            layers: [2, 2, 2, 2],
            num_classes: 1000,
        }
    }

    pub fn resnet50() -> Self {
        Self {
            block: BlockKind::Bottleneck,
            layers: [3, 4, 6, 3],
            num_classes: 1000,
        }
    }
}

/// Convolution followed by batch norm in inference mode
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride,
            padding: kernel / 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d_no_bias(c_in, c_out, kernel, cfg, conv_vb)?,
            bn: batch_norm(c_out, 1e-5, bn_vb)?,
        })
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

struct BasicBlock {
    conv1: ConvBn,
    conv2: ConvBn,
    downsample: Option<ConvBn>,
}

struct Bottleneck {
    conv1: ConvBn,
    conv2: ConvBn,
    conv3: ConvBn,
    downsample: Option<ConvBn>,
}

enum Block {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl Block {
    fn new(
        kind: BlockKind,
        c_in: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let c_out = planes * kind.expansion();
        let downsample = if stride != 1 || c_in != c_out {
            let ds = vb.pp("downsample");
            Some(ConvBn::new(c_in, c_out, 1, stride, ds.pp(0), ds.pp(1))?)
        } else {
            None
        };

        let block = match kind {
            BlockKind::Basic => Block::Basic(BasicBlock {
                conv1: ConvBn::new(c_in, planes, 3, stride, vb.pp("conv1"), vb.pp("bn1"))?,
                conv2: ConvBn::new(planes, planes, 3, 1, vb.pp("conv2"), vb.pp("bn2"))?,
                downsample,
            }),
            // stride sits on the 3x3 conv (ResNet v1.5)
            BlockKind::Bottleneck => Block::Bottleneck(Bottleneck {
                conv1: ConvBn::new(c_in, planes, 1, 1, vb.pp("conv1"), vb.pp("bn1"))?,
                conv2: ConvBn::new(planes, planes, 3, stride, vb.pp("conv2"), vb.pp("bn2"))?,
                conv3: ConvBn::new(planes, c_out, 1, 1, vb.pp("conv3"), vb.pp("bn3"))?,
                downsample,
            }),
        };
        Ok(block)
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (ys, downsample) = match self {
            Block::Basic(block) => {
                let ys = xs.apply(&block.conv1)?.relu()?.apply(&block.conv2)?;
                (ys, &block.downsample)
            }
            Block::Bottleneck(block) => {
                let ys = xs
                    .apply(&block.conv1)?
                    .relu()?
                    .apply(&block.conv2)?
                    .relu()?
                    .apply(&block.conv3)?;
                (ys, &block.downsample)
            }
        };
        let identity = match downsample {
            Some(downsample) => xs.apply(downsample)?,
            None => xs.clone(),
        };
        (ys + identity)?.relu()
    }
}

/// Final layer of a [ResNet]
pub enum ClassifierHead {
    /// Pass-through; the network returns pooled features
    Identity,
    Linear(Linear),
}

impl Module for ClassifierHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            ClassifierHead::Identity => Ok(xs.clone()),
            ClassifierHead::Linear(fc) => xs.apply(fc),
        }
    }
}

/// ResNet with torchvision parameter names.
pub struct ResNet {
    stem: ConvBn,
    layers: Vec<Vec<Block>>,
    fc: ClassifierHead,
    num_features: usize,
}

impl ResNet {
    pub fn new(config: &ResNetConfig, vb: VarBuilder) -> Result<Self> {
        let stem = ConvBn::new(3, 64, 7, 2, vb.pp("conv1"), vb.pp("bn1"))?;

        let mut c_in = 64;
        let mut layers = Vec::with_capacity(4);
        for (i, (&planes, &blocks)) in [64, 128, 256, 512]
            .iter()
            .zip(config.layers.iter())
            .enumerate()
        {
            let layer_vb = vb.pp(format!("layer{}", i + 1));
            let stride = if i == 0 { 1 } else { 2 };
            let mut layer = Vec::with_capacity(blocks);
            for j in 0..blocks {
                let block_stride = if j == 0 { stride } else { 1 };
                layer.push(Block::new(
                    config.block,
                    c_in,
                    planes,
                    block_stride,
                    layer_vb.pp(j),
                )?);
                c_in = planes * config.block.expansion();
            }
            layers.push(layer);
        }

        let fc = ClassifierHead::Linear(linear(c_in, config.num_classes, vb.pp("fc"))?);
        Ok(Self {
            stem,
            layers,
            fc,
            num_features: c_in,
        })
    }

    /// Input width of the classification layer
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn fc(&self) -> &ClassifierHead {
        &self.fc
    }

    /// Swap the classification layer for [ClassifierHead::Identity] and return the
    /// width of the features the network now outputs.
    pub fn reset_classifier(&mut self) -> usize {
        self.fc = ClassifierHead::Identity;
        self.num_features
    }
}

impl Module for ResNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // 3x3/2 max pool with padding 1; edge replication equals -inf padding for a max
        let mut xs = xs
            .apply(&self.stem)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for layer in &self.layers {
            for block in layer {
                xs = xs.apply(block)?;
            }
        }
        xs.mean(D::Minus1)?.mean(D::Minus1)?.apply(&self.fc)
    }
}
