//! Vision-to-text projector for Gemma 3.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::layers::GemmaRmsNorm;

/// Weight stored input-major, `[in_features, out_features]`, as Gemma 3
/// checkpoints ship `mm_input_projection_weight`. Construction transposes it
/// into a regular `Linear` so nothing multiplies against the stored layout.
pub struct InputMajorWeight {
    linear: Linear,
    in_features: usize,
    out_features: usize,
}

impl InputMajorWeight {
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder, name: &str) -> Result<Self> {
        let stored = vb.get((in_features, out_features), name)?;
        Self::from_stored(stored)
    }

    pub fn from_stored(stored: Tensor) -> Result<Self> {
        let (in_features, out_features) = stored.dims2()?;
        let weight = stored.t()?.contiguous()?;
        Ok(Self {
            linear: Linear::new(weight, None),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for InputMajorWeight {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(xs)
    }
}

/// Soft-embedding norm followed by the input-major projection.
pub struct Gemma3Projector {
    norm: GemmaRmsNorm,
    projection: InputMajorWeight,
}

impl Gemma3Projector {
    pub fn new(
        vision_hidden_size: usize,
        text_hidden_size: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm = GemmaRmsNorm::new(vision_hidden_size, eps, vb.pp("mm_soft_emb_norm"))?;
        let projection = InputMajorWeight::new(
            vision_hidden_size,
            text_hidden_size,
            vb,
            "mm_input_projection_weight",
        )?;
        Ok(Self { norm, projection })
    }

    /// `[.., vision_hidden] -> [.., text_hidden]`, normalized with `eps`.
    pub fn project(&self, embedding: &Tensor, eps: f64) -> Result<Tensor> {
        let xs = self.norm.forward_with_eps(embedding, eps)?;
        self.projection.forward(&xs)
    }

    pub fn output_size(&self) -> usize {
        self.projection.out_features()
    }
}
