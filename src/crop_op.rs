// src/crop_op.rs
//! Registers [`CropLayer`] with ONNX Runtime as a custom operator.
//!
//! The HED graph is exported with its Caffe `Crop` layers kept as custom
//! nodes in the [`CROP_DOMAIN`] domain: input 0 is the upsampled side output,
//! input 1 is the reference map whose spatial size it must match.
//!
//! ONNX Runtime keeps one kernel per graph node and calls it from every
//! concurrent `Session::run`, so the kernel holds no state: each execution
//! gets its own [`CropLayer`].

use crate::crop_layer::CropLayer;
use crate::layer::{CustomLayer, LayerError, TensorShape};
use ndarray::{Array4, ArrayView4};
use ort::operator::{
    Operator, OperatorDomain,
    io::{OperatorInput, OperatorOutput},
    kernel::{Kernel, KernelAttributes, KernelContext},
};
use ort::tensor::TensorElementType;

pub const CROP_DOMAIN: &str = "hed";

pub struct CropOperator;

pub struct CropKernel;

impl Operator for CropOperator {
    type Kernel = CropKernel;

    fn name() -> &'static str {
        CropLayer::NAME
    }

    fn create_kernel(_: &KernelAttributes) -> ort::Result<Self::Kernel> {
        Ok(CropKernel)
    }

    fn inputs() -> Vec<OperatorInput> {
        vec![
            OperatorInput::required(TensorElementType::Float32),
            OperatorInput::required(TensorElementType::Float32),
        ]
    }

    fn outputs() -> Vec<OperatorOutput> {
        vec![OperatorOutput::required(TensorElementType::Float32)]
    }
}

impl Kernel for CropKernel {
    fn compute(&mut self, ctx: &KernelContext) -> ort::Result<()> {
        let data = ctx.input(0)?.ok_or_else(|| missing_input(0))?;
        let reference = ctx.input(1)?.ok_or_else(|| missing_input(1))?;

        let (data_dims, data_values) = data.try_extract_raw_tensor::<f32>()?;
        let (reference_dims, _) = reference.try_extract_raw_tensor::<f32>()?;

        let (output_shape, cropped) =
            crop_execution(data_dims, data_values, reference_dims).map_err(ort::Error::wrap)?;

        let mut output = ctx
            .output(0, output_shape.to_i64())?
            .ok_or_else(|| ort::Error::wrap(LayerError::MissingOutput(0)))?;
        let (_, output_values) = output.try_extract_raw_tensor_mut::<f32>()?;
        if output_values.len() != cropped.len() {
            return Err(ort::Error::wrap(LayerError::SizeMismatch {
                expected: cropped.len(),
                actual: output_values.len(),
            }));
        }
        for (dst, src) in output_values.iter_mut().zip(cropped.iter()) {
            *dst = *src;
        }

        Ok(())
    }
}

/// One kernel execution: shape inference followed by forward on a layer that
/// lives only for this call. Returns the output shape to allocate and the
/// cropped data in row-major order.
pub fn crop_execution(
    data_dims: &[i64],
    data_values: &[f32],
    reference_dims: &[i64],
) -> Result<(TensorShape, Array4<f32>), LayerError> {
    let data_shape = TensorShape::try_from(data_dims)?;
    let reference_shape = TensorShape::try_from(reference_dims)?;

    let mut layer = CropLayer::new();
    let output_shape = layer
        .memory_shapes(&[data_shape, reference_shape])?
        .remove(0);

    let data_view = ArrayView4::from_shape(data_shape.dims(), data_values).map_err(|_| {
        LayerError::SizeMismatch {
            expected: data_shape.dims().iter().product(),
            actual: data_values.len(),
        }
    })?;
    let cropped = layer.forward(&[data_view])?.remove(0);

    Ok((output_shape, cropped))
}

/// Builds the operator domain handed to the session builder before the graph
/// is loaded.
pub fn crop_domain() -> ort::Result<OperatorDomain> {
    OperatorDomain::new(CROP_DOMAIN)?.add::<CropOperator>()
}

fn missing_input(index: usize) -> ort::Error {
    ort::Error::wrap(LayerError::MissingInput {
        expected: index + 1,
        actual: index,
    })
}
