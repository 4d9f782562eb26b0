//! imgshard vision collaborators
//!
//! The classifier and embedder are external models; this crate only defines
//! the seams they plug into and turns a folder of images into index triples.

mod discovery;
mod pipeline;
mod traits;

pub use discovery::{identity_from_path, is_supported_image, scan_images, SUPPORTED_EXTENSIONS};
pub use pipeline::{ImagePipeline, QueryImage};
pub use traits::{Classifier, Embedder};
