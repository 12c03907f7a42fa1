// src/layer.rs
use ndarray::{Array4, ArrayView4};
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("Crop source {input} is smaller than crop target {target}")]
    InvalidShape { input: TensorShape, target: TensorShape },
    #[error("Expected a rank-4 tensor, got dimensions {0:?}")]
    Rank(Vec<i64>),
    #[error("Layer expected at least {expected} inputs, got {actual}")]
    MissingInput { expected: usize, actual: usize },
    #[error("Engine did not provide output {0}")]
    MissingOutput(usize),
    #[error("Buffer holds {actual} values, shape needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Forward called before output shapes were computed")]
    WindowNotComputed,
    #[error("Crop window {window:?} does not fit tensor {shape}")]
    WindowOutOfBounds {
        window: crate::crop_layer::CropWindow,
        shape: TensorShape,
    },
}

/// Dimensions of an NCHW feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    pub fn of(tensor: &ArrayView4<'_, f32>) -> Self {
        let (batch, channels, height, width) = tensor.dim();
        Self::new(batch, channels, height, width)
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    /// Dimensions in the form ONNX Runtime expects when allocating outputs.
    pub fn to_i64(&self) -> Vec<i64> {
        self.dims().iter().map(|&d| d as i64).collect()
    }
}

impl TryFrom<&[i64]> for TensorShape {
    type Error = LayerError;

    fn try_from(dims: &[i64]) -> Result<Self, Self::Error> {
        match dims {
            &[n, c, h, w] if dims.iter().all(|&d| d >= 0) => {
                Ok(Self::new(n as usize, c as usize, h as usize, w as usize))
            }
            _ => Err(LayerError::Rank(dims.to_vec())),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.batch, self.channels, self.height, self.width
        )
    }
}

/// A layer the inference engine calls back into mid-network.
///
/// The engine always calls [`CustomLayer::memory_shapes`] before
/// [`CustomLayer::forward`] for a given execution, and both calls see
/// consistent shapes.
pub trait CustomLayer: Send {
    /// Name the layer is registered under in the engine.
    const NAME: &'static str;

    /// Returns the shapes the engine should allocate for the layer's outputs.
    fn memory_shapes(&mut self, inputs: &[TensorShape]) -> Result<Vec<TensorShape>, LayerError>;

    /// Computes the layer's outputs from the actual input tensors.
    fn forward(&self, inputs: &[ArrayView4<'_, f32>]) -> Result<Vec<Array4<f32>>, LayerError>;
}
