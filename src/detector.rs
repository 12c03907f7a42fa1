// src/detector.rs
use crate::hed_model::{EdgeNetwork, ModelError, blob_from_image};
use crate::model_config::PreprocessorConfig;
use image::{DynamicImage, GrayImage, ImageDecoder, ImageError, ImageFormat, ImageReader};
use ndarray::{Array4, ArrayView2};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("Could not decode the image. Please upload a valid image file. ({0})")]
    Decode(#[source] image::ImageError),
    #[error("Could not encode the image to PNG format: {0}")]
    Encode(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Process-wide edge detection service. Built once before the server starts
/// and shared read-only between requests.
pub struct EdgeDetector {
    network: Arc<dyn EdgeNetwork>,
    preprocessor_config: PreprocessorConfig,
}

impl EdgeDetector {
    pub fn new(network: Arc<dyn EdgeNetwork>, preprocessor_config: PreprocessorConfig) -> Self {
        Self {
            network,
            preprocessor_config,
        }
    }

    /// Runs one uploaded image through the network and returns the edge map
    /// as a single-channel PNG.
    ///
    /// `prompt` is accepted for API compatibility and does not affect the
    /// result.
    pub fn detect(&self, prompt: &str, image_bytes: &[u8]) -> Result<Vec<u8>, DetectError> {
        let image = decode(image_bytes)?;
        debug!(
            width = image.width(),
            height = image.height(),
            prompt_len = prompt.len(),
            "Decoded upload"
        );

        let blob = blob_from_image(&image, &self.preprocessor_config);
        let edges = self.network.forward(blob)?;
        let edge_map = first_channel(&edges)?;

        encode_png(&quantize(edge_map)?)
    }
}

/// Decodes an upload and applies its EXIF orientation, so phone photos come
/// out upright.
pub fn decode(image_bytes: &[u8]) -> Result<DynamicImage, DetectError> {
    let mut decoder = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| DetectError::Decode(ImageError::IoError(e)))?
        .into_decoder()
        .map_err(DetectError::Decode)?;
    let orientation = decoder.orientation().map_err(DetectError::Decode)?;

    let mut image = DynamicImage::from_decoder(decoder).map_err(DetectError::Decode)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn first_channel(edges: &Array4<f32>) -> Result<ArrayView2<'_, f32>, DetectError> {
    let (batch, channels, _, _) = edges.dim();
    if batch == 0 || channels == 0 {
        return Err(ModelError::OutputFormatUnexpected(format!(
            "empty edge map with shape {:?}",
            edges.shape()
        ))
        .into());
    }
    Ok(edges.slice(ndarray::s![0, 0, .., ..]))
}

/// Scales a `[0, 1]` probability map to 8-bit. Values are truncated and
/// saturated to `[0, 255]`; NaN maps to 0.
pub fn quantize(edge_map: ArrayView2<'_, f32>) -> Result<GrayImage, DetectError> {
    let (height, width) = edge_map.dim();
    let pixels: Vec<u8> = edge_map.iter().map(|&v| (v * 255.0) as u8).collect();

    GrayImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        DetectError::Encode(format!("edge map of {width}x{height} does not fit a gray image"))
    })
}

pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, DetectError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| DetectError::Encode(e.to_string()))?;
    Ok(buffer.into_inner())
}
