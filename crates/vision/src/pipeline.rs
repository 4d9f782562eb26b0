use futures::stream::{self, Stream, StreamExt};
use imgshard_common::{ImgShardError, Result};
use imgshard_store::IndexTriple;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::discovery::identity_from_path;
use crate::traits::{Classifier, Embedder};

/// Classified and embedded query image
#[derive(Debug, Clone)]
pub struct QueryImage {
    /// Labels in classifier confidence order
    pub categories: Vec<String>,
    pub embedding: Vec<f32>,
}

/// Runs the external classifier and embedder over image files
///
/// Both models are created once by the caller and shared through this
/// pipeline for every image.
#[derive(Clone)]
pub struct ImagePipeline {
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
}

impl ImagePipeline {
    pub fn new(classifier: Arc<dyn Classifier>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            classifier,
            embedder,
        }
    }

    /// Classify and embed one image
    pub async fn analyze(&self, image: &Path) -> Result<QueryImage> {
        let (categories, embedding) = futures::try_join!(
            self.classifier.classify(image),
            self.embedder.embed(image)
        )?;

        if embedding.len() != self.embedder.dimension() {
            return Err(ImgShardError::collaborator(format!(
                "embedder returned {} values for {}, expected {}",
                embedding.len(),
                image.display(),
                self.embedder.dimension()
            )));
        }

        Ok(QueryImage {
            categories,
            embedding,
        })
    }

    /// Lazily turn image paths into index triples, one image at a time
    ///
    /// Each triple remembers the path it was read from as its source.
    pub fn triples(
        &self,
        images: Vec<PathBuf>,
    ) -> impl Stream<Item = Result<IndexTriple>> + Send {
        let pipeline = self.clone();
        stream::iter(images).then(move |path| {
            let pipeline = pipeline.clone();
            async move {
                let identity = identity_from_path(&path)?;
                let analyzed = pipeline.analyze(&path).await?;
                debug!("{} -> {:?}", identity, analyzed.categories);
                Ok(
                    IndexTriple::new(identity, analyzed.categories, analyzed.embedding)
                        .with_source(path.to_string_lossy()),
                )
            }
        })
    }
}
