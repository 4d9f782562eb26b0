use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use imgshard_common::{AppConfig, ImgShardError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::shard_store::ShardStore;
use crate::similarity::l2_norm;
use crate::types::{EmbeddingRecord, IndexMode, IndexReport, IndexTriple, Shard};

/// Indexer tuning
#[derive(Debug, Clone)]
pub struct IndexerOptions {
    /// Shard saves allowed in flight at once
    pub max_concurrent_writes: usize,

    /// Allowed deviation of an embedding norm from 1.0 before a warning is logged
    pub norm_tolerance: f32,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for IndexerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent_writes: config.max_concurrent_writes,
            norm_tolerance: config.norm_tolerance,
        }
    }
}

/// Triples of one run, folded into a relation table
///
/// Each identity keeps exactly one record (the latest one seen), and every
/// category it was assigned to points at that record. Shards built from the
/// table therefore agree on the vector of an image that sits in several
/// categories.
#[derive(Default)]
struct Batch {
    records: HashMap<String, EmbeddingRecord>,
    memberships: BTreeMap<String, BTreeSet<String>>,
    report: IndexReport,
}

impl Batch {
    fn add(&mut self, triple: IndexTriple) {
        let IndexTriple {
            identity,
            categories,
            embedding,
            source,
        } = triple;

        if categories.is_empty() {
            warn!("Skipping '{}': no categories assigned", identity);
            self.report.skipped += 1;
            return;
        }

        for category in categories {
            self.memberships
                .entry(category)
                .or_default()
                .insert(identity.clone());
        }

        let record = EmbeddingRecord {
            identity,
            embedding,
            source,
        };
        if let Some(previous) = self.records.insert(record.identity.clone(), record) {
            debug!("'{}' seen again, later record wins", previous.identity);
            self.report.overwritten += 1;
        }
    }

    fn records_of(&self, identities: &BTreeSet<String>) -> Vec<EmbeddingRecord> {
        identities
            .iter()
            .filter_map(|identity| self.records.get(identity).cloned())
            .collect()
    }
}

/// Builds and updates category shards from classified, embedded images
pub struct Indexer {
    store: Arc<dyn ShardStore>,
    options: IndexerOptions,
}

impl Indexer {
    pub fn new(store: Arc<dyn ShardStore>, options: IndexerOptions) -> Self {
        Self { store, options }
    }

    /// Rebuild shards from a finite stream of triples
    ///
    /// One shard is written per distinct category in the stream. When an
    /// identity shows up more than once the last triple wins, for its vector
    /// and in every category it was listed under. In [`IndexMode::Additive`]
    /// categories absent from the stream keep their shards; in
    /// [`IndexMode::FullReplace`] the store is cleared once the whole stream
    /// has been read and validated.
    pub async fn build<S>(&self, triples: S, mode: IndexMode) -> Result<IndexReport>
    where
        S: Stream<Item = Result<IndexTriple>> + Send,
    {
        let expected_dimension = match mode {
            IndexMode::Additive => self.store.dimension().await?,
            IndexMode::FullReplace => None,
        };
        let mut batch = self.collect(triples, expected_dimension).await?;

        if mode == IndexMode::FullReplace {
            self.store.clear().await?;
        }

        let store = &self.store;
        let batch_ref = &batch;
        let written: Vec<(String, usize)> = stream::iter(&batch.memberships)
            .map(|(category, identities)| async move {
                let shard: Shard = batch_ref.records_of(identities).into_iter().collect();
                let count = shard.len();
                store.save(category, &shard).await?;
                Ok::<_, ImgShardError>((category.clone(), count))
            })
            .buffer_unordered(self.options.max_concurrent_writes.max(1))
            .try_collect()
            .await?;

        batch.report.categories = written.into_iter().collect();

        info!(
            "Index build complete - {} triples, {} categories, {} skipped, {} overwritten",
            batch.report.triples,
            batch.report.categories.len(),
            batch.report.skipped,
            batch.report.overwritten
        );
        Ok(batch.report)
    }

    /// Add images to a live store without touching records already present
    ///
    /// Existing identities in a shard are kept (append-if-absent). The report
    /// counts newly inserted records per category.
    pub async fn append<S>(&self, triples: S) -> Result<IndexReport>
    where
        S: Stream<Item = Result<IndexTriple>> + Send,
    {
        let expected_dimension = self.store.dimension().await?;
        let mut batch = self.collect(triples, expected_dimension).await?;

        let store = &self.store;
        let batch_ref = &batch;
        let inserted: Vec<(String, usize)> = stream::iter(&batch.memberships)
            .map(|(category, identities)| async move {
                let added = store
                    .append_if_absent(category, batch_ref.records_of(identities))
                    .await?;
                Ok::<_, ImgShardError>((category.clone(), added))
            })
            .buffer_unordered(self.options.max_concurrent_writes.max(1))
            .try_collect()
            .await?;

        batch.report.categories = inserted.into_iter().collect();

        info!(
            "Incremental index complete - {} triples, {} records added",
            batch.report.triples,
            batch.report.categories.values().sum::<usize>()
        );
        Ok(batch.report)
    }

    async fn collect<S>(&self, triples: S, mut expected_dimension: Option<usize>) -> Result<Batch>
    where
        S: Stream<Item = Result<IndexTriple>> + Send,
    {
        let mut batch = Batch::default();
        let mut triples = std::pin::pin!(triples);

        while let Some(triple) = triples.next().await {
            let triple = triple?;
            batch.report.triples += 1;
            self.validate(&triple, &mut expected_dimension)?;
            batch.add(triple);
        }

        Ok(batch)
    }

    /// Fail fast on malformed triples; the vector itself is never rewritten
    fn validate(&self, triple: &IndexTriple, expected_dimension: &mut Option<usize>) -> Result<()> {
        if triple.identity.trim().is_empty() {
            return Err(ImgShardError::invalid_input("image identity cannot be empty"));
        }

        if triple.embedding.is_empty() {
            return Err(ImgShardError::invalid_input(format!(
                "'{}' has an empty embedding",
                triple.identity
            )));
        }

        if triple.embedding.iter().any(|v| !v.is_finite()) {
            return Err(ImgShardError::invalid_input(format!(
                "'{}' has non-finite embedding values",
                triple.identity
            )));
        }

        if let Some(blank) = triple.categories.iter().find(|c| c.trim().is_empty()) {
            return Err(ImgShardError::invalid_input(format!(
                "'{}' has a blank category label {:?}",
                triple.identity, blank
            )));
        }

        match *expected_dimension {
            Some(dimension) if dimension != triple.embedding.len() => {
                return Err(ImgShardError::invalid_input(format!(
                    "'{}' has dimension {}, expected {}",
                    triple.identity,
                    triple.embedding.len(),
                    dimension
                )));
            }
            Some(_) => {}
            None => *expected_dimension = Some(triple.embedding.len()),
        }

        let norm = l2_norm(&triple.embedding);
        if (norm - 1.0).abs() > self.options.norm_tolerance {
            warn!(
                "Embedding of '{}' is not unit length (norm {:.4}), storing as-is",
                triple.identity, norm
            );
        }

        Ok(())
    }
}
