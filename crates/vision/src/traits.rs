use async_trait::async_trait;
use imgshard_common::Result;
use std::path::Path;

/// Assigns category labels to an image
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Category labels, most confident first; never empty for a readable image
    async fn classify(&self, image: &Path) -> Result<Vec<String>>;
}

/// Extracts a fixed-length, L2-normalized embedding from an image
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, image: &Path) -> Result<Vec<f32>>;

    /// Embedding length produced by every call
    fn dimension(&self) -> usize;
}
