//! imgshard category-sharded embedding store
//!
//! Images are filed under every category the classifier assigns them. Each
//! category is one shard of `(identity, embedding)` records; a query only
//! scans the shards of its own categories and ranks them by cosine distance.

mod engine;
mod indexer;
mod shard_store;
mod similarity;
mod types;

pub use engine::RetrievalEngine;
pub use indexer::{Indexer, IndexerOptions};
pub use shard_store::{shard_file_stem, FileShardStore, ShardStore, MANIFEST_FILE, SHARDS_DIR};
pub use similarity::{cosine_distance, l2_norm, ZERO_NORM_DISTANCE};
pub use types::{
    CategoryFailure, EmbeddingRecord, IndexMode, IndexReport, IndexTriple, QueryOutcome,
    SearchHit, Shard,
};

use futures::Stream;
use imgshard_common::Result;
use std::path::Path;
use std::sync::Arc;

/// Run the indexer end-to-end against the store at `store_root`
///
/// The root directory must already exist.
pub async fn build_store<S>(
    triples: S,
    store_root: &Path,
    mode: IndexMode,
    options: IndexerOptions,
) -> Result<IndexReport>
where
    S: Stream<Item = Result<IndexTriple>> + Send,
{
    let store = Arc::new(FileShardStore::open(store_root).await?);
    Indexer::new(store, options).build(triples, mode).await
}

/// Rank the images of `query_categories` in the store at `store_root`
pub async fn query(
    store_root: &Path,
    query_categories: &[String],
    query_embedding: &[f32],
    top_k: usize,
) -> Result<QueryOutcome> {
    let store = Arc::new(FileShardStore::open(store_root).await?);
    RetrievalEngine::new(store)
        .search(query_categories, query_embedding, top_k)
        .await
}
