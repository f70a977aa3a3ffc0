use crate::multimodal::MultimodalIndex;

/// Everything the decoder needs for one forward call.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    /// Token ids, one per surviving Input.
    pub inputs: Vec<u32>,
    /// Sequence position of each token.
    pub positions: Vec<u32>,
    /// Indices into the batch whose logits are returned.
    pub outputs: Vec<u32>,
    /// Fused payloads and the batch slot each belongs to.
    pub multimodal: Vec<MultimodalIndex>,
}

impl ForwardRequest {
    pub fn text(inputs: Vec<u32>, positions: Vec<u32>, outputs: Vec<u32>) -> Self {
        Self {
            inputs,
            positions,
            outputs,
            multimodal: Vec::new(),
        }
    }

    pub fn with_multimodal(mut self, entry: MultimodalIndex) -> Self {
        self.multimodal.push(entry);
        self
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}
