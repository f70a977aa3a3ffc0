use candle_core::{Result, Tensor};

/// Projected image embeddings, `[images, 1, tokens_per_image, hidden]`.
///
/// The image-batch axis is the outermost one (dim 0). Cloning shares the
/// underlying storage.
#[derive(Debug, Clone)]
pub struct MultimodalPayload {
    embedding: Tensor,
}

impl MultimodalPayload {
    pub const IMAGE_AXIS: usize = 0;

    pub fn new(embedding: Tensor) -> Result<Self> {
        let dims = embedding.dims();
        if dims.len() != 4 || dims[1] != 1 {
            candle_core::bail!(
                "multimodal payload must be [images, 1, tokens, hidden], got {dims:?}"
            )
        }
        Ok(Self { embedding })
    }

    pub fn embedding(&self) -> &Tensor {
        &self.embedding
    }

    pub fn num_images(&self) -> usize {
        self.embedding.dims()[Self::IMAGE_AXIS]
    }

    /// Append `other`'s images after this payload's images.
    pub fn concat(&self, other: &MultimodalPayload) -> Result<Self> {
        let embedding = Tensor::cat(&[&self.embedding, &other.embedding], Self::IMAGE_AXIS)?;
        Ok(Self { embedding })
    }

    /// Flatten to one row per embedded token: `[images * tokens, hidden]`.
    pub fn rows(&self) -> Result<Tensor> {
        let (images, _, tokens, hidden) = self.embedding.dims4()?;
        self.embedding.reshape((images * tokens, hidden))
    }
}

/// Reference from a forward batch slot to the fused payload that fills it.
#[derive(Debug, Clone)]
pub struct MultimodalIndex {
    pub index: usize,
    pub payload: MultimodalPayload,
}

/// One element of a tokenized prompt: a text token or an image placeholder.
#[derive(Debug, Clone)]
pub struct Input {
    pub token: u32,
    pub multimodal: Option<MultimodalPayload>,
    /// Content fingerprint; meaningful only when `multimodal` is set.
    pub multimodal_hash: u64,
}

impl Input {
    /// Marks an Input for removal during merging.
    pub const DELETED: u32 = u32::MAX;

    pub fn token(id: u32) -> Self {
        Self {
            token: id,
            multimodal: None,
            multimodal_hash: 0,
        }
    }

    pub fn placeholder(payload: MultimodalPayload, hash: u64) -> Self {
        Self {
            token: 0,
            multimodal: Some(payload),
            multimodal_hash: hash,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.multimodal.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.token == Self::DELETED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn payload(images: usize) -> MultimodalPayload {
        let t = Tensor::zeros((images, 1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        MultimodalPayload::new(t).unwrap()
    }

    #[test]
    fn concat_stacks_images() {
        let fused = payload(1).concat(&payload(2)).unwrap();
        assert_eq!(fused.num_images(), 3);
        assert_eq!(fused.embedding().dims(), &[3, 1, 4, 8]);
        assert_eq!(fused.rows().unwrap().dims(), &[12, 8]);
    }

    #[test]
    fn concat_rejects_mismatched_hidden() {
        let other = Tensor::zeros((1, 1, 4, 6), DType::F32, &Device::Cpu).unwrap();
        let other = MultimodalPayload::new(other).unwrap();
        assert!(payload(1).concat(&other).is_err());
    }

    #[test]
    fn rejects_wrong_rank() {
        let t = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(MultimodalPayload::new(t).is_err());
    }

    #[test]
    fn constructors() {
        let text = Input::token(42);
        assert!(!text.is_placeholder());
        assert!(!text.is_deleted());

        let image = Input::placeholder(payload(1), 7);
        assert!(image.is_placeholder());
        assert_eq!(image.multimodal_hash, 7);
    }
}
