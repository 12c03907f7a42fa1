//! HED edge detection over HTTP.
//!
//! Uploaded images are run through a holistically-nested edge detection
//! network on ONNX Runtime and returned as single-channel PNG edge maps.

pub mod config;
pub mod crop_layer;
pub mod crop_op;
pub mod detector;
pub mod error;
pub mod hed_model;
pub mod layer;
pub mod model_config;
pub mod routes;

pub use config::ServerConfig;
pub use crop_layer::{CropLayer, CropWindow};
pub use detector::{DetectError, EdgeDetector};
pub use error::{ApiError, ApiResult};
pub use hed_model::{EdgeNetwork, HedModel, ModelError};
pub use layer::{CustomLayer, LayerError, TensorShape};
pub use model_config::PreprocessorConfig;
pub use routes::{AppState, create_router};
