//! Feature projector: maps encoder outputs to LM input space.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use slm_core::{EncodedFeatures, FeatureEncoder, SlmError, SlmResult};

/// Identity or linear map from encoder width to LM hidden width.
#[derive(Debug, Clone)]
pub struct FeatureProjector {
    proj: Option<Linear>,
    input_dim: usize,
    output_dim: usize,
}

impl FeatureProjector {
    /// Pass-through for encoders that already emit LM-width frames.
    pub fn identity(dim: usize) -> Self {
        Self {
            proj: None,
            input_dim: dim,
            output_dim: dim,
        }
    }

    /// # Arguments
    /// * `encoder_dim` - width of the external encoder output
    /// * `llm_dim` - LM hidden size
    /// * `vb` - weights of the `proj` linear layer's parent
    pub fn new(encoder_dim: usize, llm_dim: usize, vb: VarBuilder) -> SlmResult<Self> {
        if encoder_dim == llm_dim {
            return Ok(Self::identity(llm_dim));
        }
        Ok(Self {
            proj: Some(linear(encoder_dim, llm_dim, vb.pp("proj"))?),
            input_dim: encoder_dim,
            output_dim: llm_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl FeatureEncoder for FeatureProjector {
    fn encode(&self, frames: &Tensor, valid_len: usize) -> SlmResult<EncodedFeatures> {
        let (n, dim) = frames.dims2()?;
        if dim != self.input_dim {
            return Err(SlmError::batch_alignment(format!(
                "features have width {dim}, projector expects {}",
                self.input_dim
            )));
        }
        if valid_len > n {
            return Err(SlmError::batch_alignment(format!(
                "valid length {valid_len} exceeds {n} frames"
            )));
        }
        let data = match &self.proj {
            Some(proj) => proj.forward(frames)?,
            None => frames.clone(),
        };
        Ok(EncodedFeatures::new(data, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_projects_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let p = FeatureProjector::new(6, 4, vb).unwrap();
        let frames = Tensor::ones((5, 6), DType::F32, &Device::Cpu).unwrap();
        let out = p.encode(&frames, 3).unwrap();
        assert_eq!(out.data.dims(), &[5, 4]);
        assert_eq!(out.valid_len, 3);
    }

    #[test]
    fn test_identity_and_width_check() {
        let p = FeatureProjector::identity(4);
        let frames = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(p.encode(&frames, 2).is_err());
    }
}
