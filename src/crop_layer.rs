// src/crop_layer.rs
use crate::layer::{CustomLayer, LayerError, TensorShape};
use ndarray::{Array4, ArrayView4, s};

/// Spatial window selected by a center crop, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub start_x: usize,
    pub start_y: usize,
    pub end_x: usize,
    pub end_y: usize,
}

impl CropWindow {
    pub fn width(&self) -> usize {
        self.end_x - self.start_x
    }

    pub fn height(&self) -> usize {
        self.end_y - self.start_y
    }
}

/// Centers a `target`-sized window inside `input` on the height and width axes.
pub fn compute_window(input: TensorShape, target: TensorShape) -> Result<CropWindow, LayerError> {
    if input.height < target.height || input.width < target.width {
        return Err(LayerError::InvalidShape { input, target });
    }

    let start_x = (input.width - target.width) / 2;
    let start_y = (input.height - target.height) / 2;

    Ok(CropWindow {
        start_x,
        start_y,
        end_x: start_x + target.width,
        end_y: start_y + target.height,
    })
}

/// Selects `window` across every batch item and channel of `tensor`.
pub fn apply<'a>(
    tensor: ArrayView4<'a, f32>,
    window: &CropWindow,
) -> Result<ArrayView4<'a, f32>, LayerError> {
    let shape = TensorShape::of(&tensor);
    if window.start_x > window.end_x
        || window.start_y > window.end_y
        || window.end_x > shape.width
        || window.end_y > shape.height
    {
        return Err(LayerError::WindowOutOfBounds {
            window: *window,
            shape,
        });
    }

    Ok(tensor.slice_move(s![
        ..,
        ..,
        window.start_y..window.end_y,
        window.start_x..window.end_x
    ]))
}

/// Aligns a larger feature map with a smaller reference one so the two can be
/// fused element-wise. Inputs are `[data, reference]`; the output keeps the
/// data's batch and channel extents and takes the reference's spatial size.
#[derive(Debug, Default)]
pub struct CropLayer {
    window: Option<CropWindow>,
}

impl CropLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> Option<CropWindow> {
        self.window
    }
}

impl CustomLayer for CropLayer {
    const NAME: &'static str = "Crop";

    fn memory_shapes(&mut self, inputs: &[TensorShape]) -> Result<Vec<TensorShape>, LayerError> {
        let [input, target, ..] = inputs else {
            return Err(LayerError::MissingInput {
                expected: 2,
                actual: inputs.len(),
            });
        };

        let window = compute_window(*input, *target)?;
        self.window = Some(window);

        Ok(vec![TensorShape::new(
            input.batch,
            input.channels,
            target.height,
            target.width,
        )])
    }

    fn forward(&self, inputs: &[ArrayView4<'_, f32>]) -> Result<Vec<Array4<f32>>, LayerError> {
        let window = self.window.as_ref().ok_or(LayerError::WindowNotComputed)?;
        let data = inputs.first().ok_or(LayerError::MissingInput {
            expected: 1,
            actual: 0,
        })?;

        let cropped = apply(data.view(), window)?;
        Ok(vec![cropped.to_owned()])
    }
}
