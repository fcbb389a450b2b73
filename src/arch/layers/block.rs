use ndarray::{Array4, ArrayView4};

use super::{BatchNorm2d, Conv2d, NormUpdate, Relu};
use crate::{arch::Phase, error::Result, params::LayoutBuilder};

/// The residual block of the 18 and 34 layer ResNets: two 3x3 convolutions with batch
/// normalization, plus a projection shortcut whenever the block changes the shape.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    conv1: Conv2d,
    norm1: BatchNorm2d,
    relu1: Relu,
    conv2: Conv2d,
    norm2: BatchNorm2d,
    shortcut: Option<(Conv2d, BatchNorm2d)>,
    relu2: Relu,
}

impl BasicBlock {
    /// Creates a new `BasicBlock`.
    ///
    /// # Arguments
    /// * `builder` - The layout of the stage this block belongs to.
    /// * `name` - The prefix of the parameter names.
    /// * `in_channels` - The channels of the input.
    /// * `out_channels` - The channels of the output.
    /// * `stride` - The stride of the first convolution and of the shortcut.
    /// * `input_hw` - The spatial extent of the input.
    pub fn new(
        builder: &mut LayoutBuilder,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        input_hw: (usize, usize),
    ) -> Result<Self> {
        let conv1 = Conv2d::new(
            builder,
            &format!("{name}.conv1"),
            in_channels,
            out_channels,
            3,
            stride,
            1,
            input_hw,
        )?;
        let norm1 = BatchNorm2d::new(builder, &format!("{name}.bn1"), out_channels);
        let conv2 = Conv2d::new(
            builder,
            &format!("{name}.conv2"),
            out_channels,
            out_channels,
            3,
            1,
            1,
            conv1.output_hw(),
        )?;
        let norm2 = BatchNorm2d::new(builder, &format!("{name}.bn2"), out_channels);

        let shortcut = if stride != 1 || in_channels != out_channels {
            let conv = Conv2d::new(
                builder,
                &format!("{name}.downsample.0"),
                in_channels,
                out_channels,
                1,
                stride,
                0,
                input_hw,
            )?;
            let norm = BatchNorm2d::new(builder, &format!("{name}.downsample.1"), out_channels);
            Some((conv, norm))
        } else {
            None
        };

        Ok(Self {
            conv1,
            norm1,
            relu1: Relu::new(),
            conv2,
            norm2,
            shortcut,
            relu2: Relu::new(),
        })
    }

    pub fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.conv2.output_hw()
    }

    pub fn has_shortcut(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        let h = self.conv1.forward(params, x)?;
        let h = self.norm1.forward(params, h.view(), phase)?;
        let h = self.relu1.forward(h.view());
        let h = self.conv2.forward(params, h.view())?;
        let h = self.norm2.forward(params, h.view(), phase)?;

        let residual = match &mut self.shortcut {
            Some((conv, norm)) => {
                let r = conv.forward(params, x)?;
                norm.forward(params, r.view(), phase)?
            }
            None => x.to_owned(),
        };

        Ok(self.relu2.forward((h + &residual).view()))
    }

    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let h = self.conv1.infer(params, x)?;
        let h = self.norm1.infer(params, h.view(), phase)?;
        let h = self.relu1.infer(h.view());
        let h = self.conv2.infer(params, h.view())?;
        let h = self.norm2.infer(params, h.view(), phase)?;

        let residual = match &self.shortcut {
            Some((conv, norm)) => {
                let r = conv.infer(params, x)?;
                norm.infer(params, r.view(), phase)?
            }
            None => x.to_owned(),
        };

        Ok(self.relu2.infer((h + &residual).view()))
    }

    /// Like `infer`, collecting the batch statistics of every normalization in the order
    /// `commit` expects them.
    pub fn infer_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
        updates: &mut Vec<NormUpdate>,
    ) -> Result<Array4<f32>> {
        let h = self.conv1.infer(params, x)?;
        let h = self.norm1.infer_tracked(params, h.view(), phase, updates)?;
        let h = self.relu1.infer(h.view());
        let h = self.conv2.infer(params, h.view())?;
        let h = self.norm2.infer_tracked(params, h.view(), phase, updates)?;

        let residual = match &self.shortcut {
            Some((conv, norm)) => {
                let r = conv.infer(params, x)?;
                norm.infer_tracked(params, r.view(), phase, updates)?
            }
            None => x.to_owned(),
        };

        Ok(self.relu2.infer((h + &residual).view()))
    }

    pub fn commit<I>(&mut self, updates: &mut I) -> Result<()>
    where
        I: Iterator<Item = NormUpdate>,
    {
        self.norm1.commit_next(updates)?;
        self.norm2.commit_next(updates)?;
        if let Some((_, norm)) = &mut self.shortcut {
            norm.commit_next(updates)?;
        }

        Ok(())
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.relu2.backward(d)?;

        let main = self.norm2.backward(params, grad, d.view())?;
        let main = self.conv2.backward(params, grad, main.view())?;
        let main = self.relu1.backward(main.view())?;
        let main = self.norm1.backward(params, grad, main.view())?;
        let mut dx = self.conv1.backward(params, grad, main.view())?;

        match &self.shortcut {
            Some((conv, norm)) => {
                let r = norm.backward(params, grad, d.view())?;
                dx += &conv.backward(params, grad, r.view())?;
            }
            None => dx += &d,
        }

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_only_when_the_shape_changes() {
        let mut builder = LayoutBuilder::new();

        let same = BasicBlock::new(&mut builder, "a", 4, 4, 1, (8, 8)).unwrap();
        let strided = BasicBlock::new(&mut builder, "b", 4, 4, 2, (8, 8)).unwrap();
        let wider = BasicBlock::new(&mut builder, "c", 4, 8, 1, (8, 8)).unwrap();

        assert!(!same.has_shortcut());
        assert!(strided.has_shortcut());
        assert!(wider.has_shortcut());
        assert_eq!(strided.output_hw(), (4, 4));
        assert_eq!(wider.out_channels(), 8);

        let layout = builder.finish();
        assert!(layout.entry("b.downsample.0.weight").is_some());
        assert!(layout.entry("a.downsample.0.weight").is_none());
    }
}
