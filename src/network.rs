use anyhow::Result;
use std::path::Path;
use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::encoder::{InputPlanes, INPUT_PLANES, INPUT_SIZE, POLICY_SIZE};

/// Bit flags returned alongside a batch of predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PredictStatus(u32);

impl PredictStatus {
    /// The serving weights changed; cached predictions are stale and the
    /// prediction cache should be flushed (rate-limited by the engine).
    pub const UPDATED_NETWORK: PredictStatus = PredictStatus(1);

    pub fn empty() -> Self {
        PredictStatus(0)
    }

    #[inline]
    pub fn contains(self, flag: PredictStatus) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline]
    pub fn with(self, flag: PredictStatus) -> Self {
        PredictStatus(self.0 | flag.0)
    }
}

/// Which head family to serve. The full network plays; the distilled one
/// exists for cheap self-play experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Full,
    Distilled,
}

/// The one capability the search needs. Values come back as win
/// probabilities in [0, 1] for the side to move; policies are raw logits in
/// the fixed move encoding, `POLICY_SIZE` floats per position.
///
/// The batch shape is fixed for a given call site; callers pad short batches.
pub trait Network: Send + Sync {
    fn predict_batch(
        &self,
        kind: NetworkKind,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [f32],
    ) -> Result<PredictStatus>;
}

/// Pay one-time device and kernel setup for every batch size the search will
/// submit, before the clock starts.
pub fn warm_up_predictions(network: &dyn Network, batch_sizes: &[usize]) -> Result<()> {
    for &size in batch_sizes {
        if size == 0 {
            continue;
        }
        let images = vec![[0f32; INPUT_SIZE]; size];
        let mut values = vec![0f32; size];
        let mut policies = vec![0f32; size * POLICY_SIZE];
        network.predict_batch(NetworkKind::Full, &images, &mut values, &mut policies)?;
    }
    Ok(())
}

/// Conv -> batch norm -> relu.
#[derive(Debug)]
struct ConvBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBlock {
    fn new(vs: &nn::Path, input_channels: i64, num_filters: i64) -> Self {
        let conv = nn::conv2d(
            vs,
            input_channels,
            num_filters,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(vs, num_filters, Default::default());
        Self { conv, bn }
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv).apply_t(&self.bn, false).relu()
    }
}

#[derive(Debug)]
struct ResidualBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl ResidualBlock {
    fn new(vs: &nn::Path, num_filters: i64) -> Self {
        let config = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };
        Self {
            conv1: nn::conv2d(vs, num_filters, num_filters, 3, config),
            bn1: nn::batch_norm2d(vs, num_filters, Default::default()),
            conv2: nn::conv2d(vs, num_filters, num_filters, 3, config),
            bn2: nn::batch_norm2d(vs, num_filters, Default::default()),
        }
    }
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let residual = xs.shallow_clone();
        let out = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, false)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, false);
        (out + residual).relu()
    }
}

/// Scalar game-outcome head, tanh output in [-1, 1].
#[derive(Debug)]
struct ValueHead {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl ValueHead {
    fn new(vs: &nn::Path, input_channels: i64) -> Self {
        Self {
            conv: nn::conv2d(vs, input_channels, 1, 1, Default::default()),
            bn: nn::batch_norm2d(vs, 1, Default::default()),
            fc1: nn::linear(vs, 64, 256, Default::default()),
            fc2: nn::linear(vs, 256, 1, Default::default()),
        }
    }
}

impl Module for ValueHead {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let batch_size = xs.size()[0];
        xs.apply(&self.conv)
            .apply_t(&self.bn, false)
            .relu()
            .view([batch_size, 64])
            .apply(&self.fc1)
            .relu()
            .apply(&self.fc2)
            .tanh()
    }
}

/// Move-logit head over the fixed policy planes.
#[derive(Debug)]
struct PolicyHead {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    fc: nn::Linear,
}

impl PolicyHead {
    fn new(vs: &nn::Path, input_channels: i64) -> Self {
        Self {
            conv: nn::conv2d(vs, input_channels, 2, 1, Default::default()),
            bn: nn::batch_norm2d(vs, 2, Default::default()),
            fc: nn::linear(vs, 128, POLICY_SIZE as i64, Default::default()),
        }
    }
}

impl Module for PolicyHead {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let batch_size = xs.size()[0];
        xs.apply(&self.conv)
            .apply_t(&self.bn, false)
            .relu()
            .view([batch_size, 128])
            .apply(&self.fc)
    }
}

/// The serving network: shared residual tower with value and policy heads.
pub struct AlphaZeroNet {
    conv_block: ConvBlock,
    residual_blocks: Vec<ResidualBlock>,
    value_head: ValueHead,
    policy_head: PolicyHead,
    device: Device,
    vs: nn::VarStore,
}

impl AlphaZeroNet {
    pub fn new(device: Device, num_blocks: i64, num_filters: i64) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let conv_block = ConvBlock::new(&root.sub("conv_block"), INPUT_PLANES as i64, num_filters);
        let residual_blocks = (0..num_blocks)
            .map(|i| ResidualBlock::new(&root.sub(format!("res_block_{i}")), num_filters))
            .collect();
        let value_head = ValueHead::new(&root.sub("value_head"), num_filters);
        let policy_head = PolicyHead::new(&root.sub("policy_head"), num_filters);
        Self {
            conv_block,
            residual_blocks,
            value_head,
            policy_head,
            device,
            vs,
        }
    }

    /// Load serving weights from a `.pt` checkpoint with the default
    /// architecture (20 blocks, 256 filters).
    pub fn load_from_file(path: &Path, device: Device) -> Result<Self> {
        let mut net = Self::new(device, 20, 256);
        net.vs.load(path)?;
        net.vs.freeze();
        Ok(net)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    fn forward(&self, input: &Tensor) -> (Tensor, Tensor) {
        let mut x = self.conv_block.forward(input);
        for block in &self.residual_blocks {
            x = block.forward(&x);
        }
        (self.value_head.forward(&x), self.policy_head.forward(&x))
    }
}

impl Network for AlphaZeroNet {
    fn predict_batch(
        &self,
        _kind: NetworkKind,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [f32],
    ) -> Result<PredictStatus> {
        let batch = images.len();
        debug_assert_eq!(values.len(), batch);
        debug_assert_eq!(policies.len(), batch * POLICY_SIZE);

        let mut flat = Vec::with_capacity(batch * INPUT_SIZE);
        for image in images {
            flat.extend_from_slice(image);
        }

        tch::no_grad(|| {
            let input = Tensor::from_slice(&flat)
                .view([batch as i64, INPUT_PLANES as i64, 8, 8])
                .to(self.device);
            let (value, policy) = self.forward(&input);
            // tanh [-1, 1] -> win probability [0, 1].
            let value01 = value.view([batch as i64]) * 0.5 + 0.5;
            value01
                .to(Device::Cpu)
                .to_kind(Kind::Float)
                .copy_data(values, batch);
            policy
                .contiguous()
                .to(Device::Cpu)
                .to_kind(Kind::Float)
                .copy_data(policies, batch * POLICY_SIZE);
        });

        Ok(PredictStatus::empty())
    }
}

/// Test and bring-up network: neutral value, flat policy. Mirrors what the
/// search sees from an untrained model, with no device dependency.
#[derive(Debug, Clone, Default)]
pub struct UniformNetwork;

impl Network for UniformNetwork {
    fn predict_batch(
        &self,
        _kind: NetworkKind,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [f32],
    ) -> Result<PredictStatus> {
        values[..images.len()].fill(0.5);
        policies[..images.len() * POLICY_SIZE].fill(0.0);
        Ok(PredictStatus::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_network_shapes() {
        let net = UniformNetwork;
        let images = vec![[0f32; INPUT_SIZE]; 4];
        let mut values = vec![0f32; 4];
        let mut policies = vec![1f32; 4 * POLICY_SIZE];
        let status = net
            .predict_batch(NetworkKind::Full, &images, &mut values, &mut policies)
            .unwrap();
        assert!(!status.contains(PredictStatus::UPDATED_NETWORK));
        assert!(values.iter().all(|&v| v == 0.5));
        assert!(policies.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn status_flags_compose() {
        let status = PredictStatus::empty().with(PredictStatus::UPDATED_NETWORK);
        assert!(status.contains(PredictStatus::UPDATED_NETWORK));
        assert!(!PredictStatus::empty().contains(PredictStatus::UPDATED_NETWORK));
    }
}
