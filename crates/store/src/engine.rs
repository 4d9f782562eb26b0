use futures::future::join_all;
use imgshard_common::{ImgShardError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::shard_store::ShardStore;
use crate::similarity::cosine_distance;
use crate::types::{CategoryFailure, QueryOutcome, SearchHit, Shard};

/// Exact nearest-neighbor search over the shards of the query's categories
pub struct RetrievalEngine {
    store: Arc<dyn ShardStore>,
}

impl RetrievalEngine {
    /// Create new retrieval engine over a store
    pub fn new(store: Arc<dyn ShardStore>) -> Self {
        Self { store }
    }

    /// Find the `top_k` stored images closest to `query_embedding`
    ///
    /// Only shards of `query_categories` are scanned. An image filed under
    /// several of those categories is ranked once, using its first occurrence
    /// in category order. Equal distances keep that encounter order.
    ///
    /// A shard that fails to load, or holds vectors of another length than
    /// the query, is reported in [`QueryOutcome::failed_categories`] and the
    /// remaining categories are still ranked. A missing store root aborts the
    /// query.
    pub async fn search(
        &self,
        query_categories: &[String],
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<QueryOutcome> {
        self.validate_query(query_embedding, top_k).await?;

        let mut seen_categories = HashSet::new();
        let categories: Vec<&str> = query_categories
            .iter()
            .map(String::as_str)
            .filter(|category| seen_categories.insert(*category))
            .collect();

        debug!(
            "Searching {} categories (top_k={}, dimension={})",
            categories.len(),
            top_k,
            query_embedding.len()
        );

        // Loads run concurrently; join_all keeps category order
        let loaded = join_all(categories.iter().map(|category| self.store.load(category))).await;

        let mut outcome = QueryOutcome::default();
        let mut seen_identities = HashSet::new();
        let mut total_candidates = 0usize;

        for (category, shard) in categories.iter().zip(loaded) {
            let checked =
                shard.and_then(|shard| check_dimension(category, shard, query_embedding.len()));
            let shard = match checked {
                Ok(shard) => shard,
                Err(e) if e.is_category_scoped() => {
                    warn!("Skipping category '{}': {}", category, e);
                    outcome.failed_categories.push(CategoryFailure {
                        category: category.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            total_candidates += shard.len();
            for record in shard {
                if !seen_identities.insert(record.identity.clone()) {
                    continue;
                }
                let distance = cosine_distance(query_embedding, &record.embedding);
                outcome.results.push(SearchHit {
                    identity: record.identity,
                    distance,
                    source: record.source,
                });
            }
        }

        // Stable sort: ties keep encounter order
        outcome
            .results
            .sort_by(|a, b| a.distance.total_cmp(&b.distance));
        outcome.results.truncate(top_k);

        info!(
            "Search completed - {} results ({} unique of {} candidates, {} failed categories)",
            outcome.results.len(),
            seen_identities.len(),
            total_candidates,
            outcome.failed_categories.len()
        );
        Ok(outcome)
    }

    /// Reject malformed queries before touching any shard
    async fn validate_query(&self, query_embedding: &[f32], top_k: usize) -> Result<()> {
        if top_k == 0 {
            return Err(ImgShardError::invalid_query("top_k must be at least 1"));
        }

        if query_embedding.is_empty() {
            return Err(ImgShardError::invalid_query("query embedding is empty"));
        }

        if query_embedding.iter().any(|v| !v.is_finite()) {
            return Err(ImgShardError::invalid_query(
                "query embedding has non-finite values",
            ));
        }

        if let Some(dimension) = self.store.dimension().await? {
            if dimension != query_embedding.len() {
                return Err(ImgShardError::invalid_query(format!(
                    "query dimension {} does not match store dimension {}",
                    query_embedding.len(),
                    dimension
                )));
            }
        }

        Ok(())
    }
}

/// Only shards whose every vector matches the query length can be ranked
fn check_dimension(category: &str, shard: Shard, dimension: usize) -> Result<Shard> {
    if let Some(record) = shard.records().find(|record| record.dimension() != dimension) {
        return Err(ImgShardError::corrupt_shard(
            category,
            format!(
                "record '{}' has dimension {}, query has {}",
                record.identity,
                record.dimension(),
                dimension
            ),
        ));
    }
    Ok(shard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_store::{FileShardStore, MANIFEST_FILE};
    use crate::types::EmbeddingRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Unit vector at cosine distance `d` from `[1, 0]`
    fn at_distance(d: f32) -> Vec<f32> {
        let cos = 1.0 - d;
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    fn shard(records: &[(&str, Vec<f32>)]) -> Shard {
        records
            .iter()
            .map(|(id, v)| EmbeddingRecord::new(*id, v.clone()))
            .collect()
    }

    fn cats(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ids(outcome: &QueryOutcome) -> Vec<&str> {
        outcome.results.iter().map(|h| h.identity.as_str()).collect()
    }

    /// Store without any dimension bookkeeping
    struct LooseStore {
        shards: HashMap<String, Shard>,
    }

    #[async_trait]
    impl ShardStore for LooseStore {
        async fn load(&self, category: &str) -> Result<Shard> {
            Ok(self.shards.get(category).cloned().unwrap_or_default())
        }

        async fn save(&self, _category: &str, _shard: &Shard) -> Result<()> {
            unimplemented!()
        }

        async fn append_if_absent(
            &self,
            _category: &str,
            _records: Vec<EmbeddingRecord>,
        ) -> Result<usize> {
            unimplemented!()
        }

        async fn remove(&self, _category: &str) -> Result<bool> {
            unimplemented!()
        }

        async fn categories(&self) -> Result<Vec<String>> {
            Ok(self.shards.keys().cloned().collect())
        }

        async fn clear(&self) -> Result<()> {
            unimplemented!()
        }

        async fn dimension(&self) -> Result<Option<usize>> {
            Ok(None)
        }
    }

    async fn engine() -> (tempfile::TempDir, Arc<FileShardStore>, RetrievalEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileShardStore::open(dir.path()).await.unwrap());
        let engine = RetrievalEngine::new(store.clone());
        (dir, store, engine)
    }

    #[tokio::test]
    async fn test_ranking_order() {
        let (_dir, store, engine) = engine().await;
        store
            .save(
                "tabby",
                &shard(&[
                    ("v3.jpg", at_distance(0.9)),
                    ("v1.jpg", at_distance(0.1)),
                    ("v2.jpg", at_distance(0.5)),
                ]),
            )
            .await
            .unwrap();

        let outcome = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 2).await.unwrap();

        assert_eq!(ids(&outcome), ["v1.jpg", "v2.jpg"]);
        assert!((outcome.results[0].distance - 0.1).abs() < 1e-5);
        assert!((outcome.results[1].distance - 0.5).abs() < 1e-5);
        assert!(!outcome.has_failures());
    }

    #[tokio::test]
    async fn test_dedup_across_categories() {
        let (_dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("cat.jpg", at_distance(0.2)), ("a.jpg", at_distance(0.4))]))
            .await
            .unwrap();
        store
            .save("tiger_cat", &shard(&[("cat.jpg", at_distance(0.2))]))
            .await
            .unwrap();

        let outcome = engine
            .search(&cats(&["tabby", "tiger_cat"]), &[1.0, 0.0], 10)
            .await
            .unwrap();

        assert_eq!(ids(&outcome), ["cat.jpg", "a.jpg"]);
    }

    #[tokio::test]
    async fn test_tie_keeps_encounter_order() {
        let (_dir, store, engine) = engine().await;
        store
            .save("lynx", &shard(&[("z.jpg", at_distance(0.3))]))
            .await
            .unwrap();
        store
            .save("tabby", &shard(&[("b.jpg", at_distance(0.3)), ("a.jpg", at_distance(0.3))]))
            .await
            .unwrap();

        // lynx first in the query, then tabby in identity order
        let outcome = engine
            .search(&cats(&["lynx", "tabby"]), &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(ids(&outcome), ["z.jpg", "a.jpg", "b.jpg"]);

        let outcome = engine
            .search(&cats(&["tabby", "lynx"]), &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(ids(&outcome), ["a.jpg", "b.jpg", "z.jpg"]);
    }

    #[tokio::test]
    async fn test_empty_categories() {
        let (_dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", at_distance(0.1))]))
            .await
            .unwrap();

        let outcome = engine.search(&[], &[1.0, 0.0], 3).await.unwrap();
        assert!(outcome.is_empty());
        assert!(!outcome.has_failures());

        let outcome = engine.search(&cats(&["unknown"]), &[1.0, 0.0], 3).await.unwrap();
        assert!(outcome.is_empty());
        assert!(!outcome.has_failures());
    }

    #[tokio::test]
    async fn test_zero_vector_ranks_last() {
        let (_dir, store, engine) = engine().await;
        store
            .save(
                "tabby",
                &shard(&[("blank.jpg", vec![0.0, 0.0]), ("a.jpg", at_distance(0.8))]),
            )
            .await
            .unwrap();

        let outcome = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 5).await.unwrap();

        assert_eq!(ids(&outcome), ["a.jpg", "blank.jpg"]);
        assert_eq!(outcome.results[1].distance, 1.0);
        assert!(outcome.results.iter().all(|h| !h.distance.is_nan()));
    }

    #[tokio::test]
    async fn test_top_k_clamp() {
        let (_dir, store, engine) = engine().await;
        store
            .save(
                "tabby",
                &shard(&[
                    ("a.jpg", at_distance(0.1)),
                    ("b.jpg", at_distance(0.2)),
                    ("c.jpg", at_distance(0.3)),
                ]),
            )
            .await
            .unwrap();

        let outcome = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 100).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_shard_is_isolated() {
        let (_dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", at_distance(0.1))]))
            .await
            .unwrap();
        std::fs::write(store.shard_path("lynx"), b"garbage").unwrap();

        let outcome = engine
            .search(&cats(&["lynx", "tabby"]), &[1.0, 0.0], 3)
            .await
            .unwrap();

        assert_eq!(ids(&outcome), ["a.jpg"]);
        assert_eq!(outcome.failed_categories.len(), 1);
        assert_eq!(outcome.failed_categories[0].category, "lynx");
    }

    #[tokio::test]
    async fn test_shard_without_manifest_is_isolated() {
        let (dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", vec![1.0, 0.0, 0.0])]))
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();

        let outcome = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 3).await.unwrap();

        assert!(outcome.is_empty());
        assert_eq!(outcome.failed_categories.len(), 1);
        assert_eq!(outcome.failed_categories[0].category, "tabby");
    }

    #[tokio::test]
    async fn test_shard_of_other_dimension_is_isolated() {
        let (_dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", at_distance(0.1))]))
            .await
            .unwrap();
        let body = serde_json::json!({
            "version": 1,
            "category": "lynx",
            "dimension": 3,
            "records": [{ "identity": "b.jpg", "embedding": [1.0, 0.0, 0.0] }]
        });
        std::fs::write(store.shard_path("lynx"), body.to_string()).unwrap();

        let outcome = engine
            .search(&cats(&["lynx", "tabby"]), &[1.0, 0.0], 3)
            .await
            .unwrap();

        assert_eq!(ids(&outcome), ["a.jpg"]);
        assert_eq!(outcome.failed_categories.len(), 1);
        assert_eq!(outcome.failed_categories[0].category, "lynx");
    }

    #[tokio::test]
    async fn test_mixed_lengths_from_any_store_are_isolated() {
        let mut shards = HashMap::new();
        shards.insert("tabby".to_string(), shard(&[("a.jpg", at_distance(0.2))]));
        shards.insert(
            "lynx".to_string(),
            shard(&[("b.jpg", at_distance(0.1)), ("c.jpg", vec![1.0, 0.0, 0.0])]),
        );
        let engine = RetrievalEngine::new(Arc::new(LooseStore { shards }));

        let outcome = engine
            .search(&cats(&["lynx", "tabby"]), &[1.0, 0.0], 3)
            .await
            .unwrap();

        assert_eq!(ids(&outcome), ["a.jpg"]);
        assert_eq!(outcome.failed_categories[0].category, "lynx");
        assert!(outcome.failed_categories[0].reason.contains("c.jpg"));
    }

    #[tokio::test]
    async fn test_hits_carry_source() {
        let (_dir, store, engine) = engine().await;
        let shard: Shard = vec![
            EmbeddingRecord::new("a.jpg", at_distance(0.1)).with_source("/data/tabby/a.jpg"),
            EmbeddingRecord::new("b.jpg", at_distance(0.2)),
        ]
        .into_iter()
        .collect();
        store.save("tabby", &shard).await.unwrap();

        let outcome = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 3).await.unwrap();

        assert_eq!(outcome.results[0].source.as_deref(), Some("/data/tabby/a.jpg"));
        assert_eq!(outcome.results[1].source, None);
    }

    #[tokio::test]
    async fn test_invalid_queries() {
        let (_dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", at_distance(0.1))]))
            .await
            .unwrap();

        for (embedding, top_k) in [(vec![1.0, 0.0], 0), (vec![], 3), (vec![1.0, 0.0, 0.0], 3)] {
            let result = engine.search(&cats(&["tabby"]), &embedding, top_k).await;
            assert!(matches!(result, Err(ImgShardError::InvalidQuery(_))));
        }
    }

    #[tokio::test]
    async fn test_missing_root_aborts() {
        let (dir, store, engine) = engine().await;
        store
            .save("tabby", &shard(&[("a.jpg", at_distance(0.1))]))
            .await
            .unwrap();
        drop(dir);

        let result = engine.search(&cats(&["tabby"]), &[1.0, 0.0], 3).await;
        assert!(matches!(result, Err(ImgShardError::StoreNotFound(_))));
    }
}
