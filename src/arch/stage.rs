use ndarray::{Array4, ArrayView4};

use super::{
    Phase, Sequential,
    layers::{BasicBlock, Layer, NormUpdate},
};
use crate::{SplitErr, error::Result, params::LayoutBuilder};

/// A residual stage: two `BasicBlock`s, the first one adapting the channels and the extent.
#[derive(Debug, Clone)]
pub struct Stage {
    blocks: Sequential,
    in_channels: usize,
    out_channels: usize,
    output_hw: (usize, usize),
}

/// Builds a residual stage, registering its parameters under `prefix`.
///
/// The first block maps `in_channels` to `out_channels` with the given stride and carries a
/// projection shortcut when the shape changes, the second one keeps the shape.
///
/// # Arguments
/// * `builder` - The layout of the stage being assembled.
/// * `prefix` - The prefix of the parameter names, e.g. `layer2`.
/// * `in_channels` - The channels the stage receives.
/// * `out_channels` - The channels the stage produces.
/// * `stride` - The stride of the first block.
/// * `input_hw` - The spatial extent the stage receives.
///
/// # Returns
/// The stage, or `InvalidArch` if any size is zero or the extent collapses.
pub fn make_stage(
    builder: &mut LayoutBuilder,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    input_hw: (usize, usize),
) -> Result<Stage> {
    if in_channels == 0 || out_channels == 0 || stride == 0 {
        return Err(SplitErr::InvalidArch(format!(
            "{prefix}: a stage needs positive channels and stride, got {in_channels} -> {out_channels} with stride {stride}"
        )));
    }

    let first = BasicBlock::new(
        builder,
        &format!("{prefix}.0"),
        in_channels,
        out_channels,
        stride,
        input_hw,
    )?;
    let second = BasicBlock::new(
        builder,
        &format!("{prefix}.1"),
        out_channels,
        out_channels,
        1,
        first.output_hw(),
    )?;
    let output_hw = second.output_hw();

    Ok(Stage {
        blocks: Sequential::new([Layer::block(first), Layer::block(second)]),
        in_channels,
        out_channels,
        output_hw,
    })
}

impl Stage {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    pub fn blocks(&self) -> &[Layer] {
        self.blocks.layers()
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        self.blocks.forward(params, x, phase)
    }

    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>, phase: Phase) -> Result<Array4<f32>> {
        self.blocks.infer(params, x, phase)
    }

    pub fn infer_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
        updates: &mut Vec<NormUpdate>,
    ) -> Result<Array4<f32>> {
        self.blocks.infer_tracked(params, x, phase, updates)
    }

    pub fn commit<I>(&mut self, updates: &mut I) -> Result<()>
    where
        I: Iterator<Item = NormUpdate>,
    {
        self.blocks.commit(updates)
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        self.blocks.backward(params, grad, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamStore;
    use rand::{SeedableRng, rngs::StdRng};
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn always_two_blocks() {
        let mut builder = LayoutBuilder::new();
        let stage = make_stage(&mut builder, "layer2", 4, 8, 2, (8, 8)).unwrap();

        assert_eq!(stage.blocks().len(), 2);
        assert_eq!(stage.out_channels(), 8);
        assert_eq!(stage.output_hw(), (4, 4));

        let layout = builder.finish();
        assert!(layout.entry("layer2.0.downsample.0.weight").is_some());
        assert!(layout.entry("layer2.0.downsample.1.bias").is_some());
        assert!(layout.entry("layer2.1.downsample.0.weight").is_none());
        assert!(layout.entry("layer2.1.conv2.weight").is_some());
    }

    #[test]
    fn identity_stage_has_no_projection() {
        let mut builder = LayoutBuilder::new();
        make_stage(&mut builder, "layer1", 4, 4, 1, (8, 8)).unwrap();

        let layout = builder.finish();
        assert!(layout.entries().iter().all(|e| !e.name().contains("downsample")));
    }

    #[test]
    fn rejects_degenerate_stages() {
        let mut builder = LayoutBuilder::new();

        assert!(matches!(
            make_stage(&mut builder, "a", 0, 8, 1, (8, 8)),
            Err(SplitErr::InvalidArch(_))
        ));
        assert!(matches!(
            make_stage(&mut builder, "b", 4, 8, 0, (8, 8)),
            Err(SplitErr::InvalidArch(_))
        ));
        assert!(matches!(
            make_stage(&mut builder, "c", 4, 8, 2, (0, 0)),
            Err(SplitErr::InvalidArch(_))
        ));
    }

    #[test]
    fn forward_keeps_batch_and_reaches_declared_shape() {
        let mut builder = LayoutBuilder::new();
        let mut stage = make_stage(&mut builder, "layer2", 3, 6, 2, (6, 6)).unwrap();
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
        let mut store = ParamStore::new(builder.finish(), rng).unwrap();

        let x = Array4::from_shape_fn((2, 3, 6, 6), |(n, c, h, w)| {
            ((n + 2 * c + h * w) % 7) as f32 / 7. - 0.5
        });
        let y = stage.forward(store.values(), x.view(), Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 6, 3, 3));
        assert!(y.iter().all(|v| v.is_finite() && *v >= 0.));

        let (params, grad) = store.split_mut();
        let dx = stage.backward(params, grad, Array4::ones(y.dim()).view()).unwrap();
        assert_eq!(dx.dim(), x.dim());
        assert!(store.grad().iter().any(|&g| g != 0.));
    }
}
