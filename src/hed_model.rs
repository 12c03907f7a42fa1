use crate::crop_op::{CROP_DOMAIN, crop_domain};
use crate::model_config::PreprocessorConfig;
use image::DynamicImage;
use ndarray::{Array4, Ix4};
use ort::error::Error as OrtError;
use ort::inputs;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use std::path::Path;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] OrtError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Model has no {0}")]
    MissingBinding(&'static str),
    #[error("Model output format unexpected: {0}")]
    OutputFormatUnexpected(String),
    #[error("Invalid path for model files: {0}")]
    InvalidPath(String),
}

/// A network that maps an NCHW input blob to an NCHW edge-probability map.
pub trait EdgeNetwork: Send + Sync {
    fn forward(&self, blob: Array4<f32>) -> Result<Array4<f32>, ModelError>;
}

pub struct HedModel {
    session: Session,
    input_name: String,
    output_name: String,
}

impl HedModel {
    pub const MODEL_FILE: &'static str = "hed.onnx";

    /// Loads `hed.onnx` from `model_dir` with the crop operator registered.
    pub fn new(model_dir: &Path, intra_threads: usize) -> Result<Self, ModelError> {
        let model_path = model_dir.join(Self::MODEL_FILE);
        info!(path = %model_path.display(), "Loading HED model");

        if !model_path.exists() {
            return Err(ModelError::InvalidPath(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        let session = SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .with_operators(crop_domain()?)?
            .commit_from_file(&model_path)?;
        info!(domain = CROP_DOMAIN, "Registered Crop operator");

        let input_name = session
            .inputs
            .first()
            .ok_or(ModelError::MissingBinding("inputs"))?
            .name
            .clone();
        let output_name = session
            .outputs
            .first()
            .ok_or(ModelError::MissingBinding("outputs"))?
            .name
            .clone();

        info!(
            input = %input_name,
            output = %output_name,
            intra_threads,
            "ONNX Runtime session created"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl EdgeNetwork for HedModel {
    fn forward(&self, blob: Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let inputs = inputs![self.input_name.as_str() => blob.view()]?;
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output_value = outputs.get(&self.output_name).ok_or_else(|| {
            ModelError::OutputFormatUnexpected(format!("missing output {}", self.output_name))
        })?;

        let edges = output_value.try_extract_tensor::<f32>()?;
        debug!(shape = ?edges.shape(), "Forward pass complete");

        edges
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::OutputFormatUnexpected(e.to_string()))
    }
}

/// Builds the `[1, 3, H, W]` input blob at the image's own size.
///
/// Channels are laid out B, G, R unless `swap_rb` is set; each value is
/// `(pixel - mean[c]) * scale_factor`.
pub fn blob_from_image(image: &DynamicImage, config: &PreprocessorConfig) -> Array4<f32> {
    let rgb_image = image.to_rgb8();
    let (width, height) = rgb_image.dimensions();

    let channel_order: [usize; 3] = if config.swap_rb { [0, 1, 2] } else { [2, 1, 0] };
    let mut blob = Array4::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb_image.enumerate_pixels() {
        for (c, &src) in channel_order.iter().enumerate() {
            let value = pixel[src] as f32;
            blob[[0, c, y as usize, x as usize]] = (value - config.mean[c]) * config.scale_factor;
        }
    }

    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn blob_keeps_source_size() {
        let blob = blob_from_image(&solid(7, 3, [0, 0, 0]), &PreprocessorConfig::default());
        assert_eq!(blob.dim(), (1, 3, 3, 7));
    }

    #[test]
    fn blob_is_bgr_mean_subtracted_and_scaled() {
        let config = PreprocessorConfig::default();
        let blob = blob_from_image(&solid(2, 2, [200, 150, 100]), &config);

        let expected_b = (100.0 - 105.0) * 0.7;
        let expected_g = (150.0 - 117.0) * 0.7;
        let expected_r = (200.0 - 123.0) * 0.7;
        assert!((blob[[0, 0, 1, 1]] - expected_b).abs() < 1e-5);
        assert!((blob[[0, 1, 0, 1]] - expected_g).abs() < 1e-5);
        assert!((blob[[0, 2, 1, 0]] - expected_r).abs() < 1e-5);
    }

    #[test]
    fn swap_rb_puts_red_first() {
        let config = PreprocessorConfig {
            mean: [0.0; 3],
            scale_factor: 1.0,
            swap_rb: true,
        };
        let blob = blob_from_image(&solid(1, 1, [10, 20, 30]), &config);
        assert_eq!(blob[[0, 0, 0, 0]], 10.0);
        assert_eq!(blob[[0, 2, 0, 0]], 30.0);
    }

    #[test]
    fn grayscale_and_alpha_become_three_channels() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(3, 2, image::Luma([50])));
        let blob = blob_from_image(&gray, &PreprocessorConfig::default());
        assert_eq!(blob.dim(), (1, 3, 2, 3));
        assert!((blob[[0, 0, 0, 0]] - (50.0 - 105.0) * 0.7).abs() < 1e-5);

        let rgba = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            2,
            2,
            image::Rgba([123, 117, 105, 0]),
        ));
        let blob = blob_from_image(&rgba, &PreprocessorConfig::default());
        assert!(blob.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn missing_model_file_is_reported() {
        let dir = std::env::temp_dir().join("hed_edge_server_missing_model");
        let err = HedModel::new(&dir, 1).err().unwrap();
        assert!(matches!(err, ModelError::InvalidPath(_)));
    }
}
