use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

/// One indexed image: its identity and its embedding vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Stable image key (file name); equal identities mean the same image
    pub identity: String,

    /// L2-normalized embedding produced by the external extractor
    pub embedding: Vec<f32>,

    /// Where the image can be fetched again (path or URI); not part of its identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EmbeddingRecord {
    pub fn new(identity: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            identity: identity.into(),
            embedding,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Embedding length
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// All records of one category, keyed by identity
///
/// Iteration is ascending by identity, which is the encounter order used for
/// tie-breaks during retrieval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shard {
    records: BTreeMap<String, EmbeddingRecord>,
}

impl Shard {
    /// Create new empty shard
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record (last write wins)
    ///
    /// Returns the record that was replaced, if any.
    pub fn insert(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        self.records.insert(record.identity.clone(), record)
    }

    /// Insert a record only if its identity is not present yet
    pub fn insert_if_absent(&mut self, record: EmbeddingRecord) -> bool {
        match self.records.entry(record.identity.clone()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<&EmbeddingRecord> {
        self.records.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in identity order
    pub fn records(&self) -> impl Iterator<Item = &EmbeddingRecord> {
        self.records.values()
    }

    /// Shared embedding length, `None` for an empty shard
    pub fn dimension(&self) -> Option<usize> {
        self.records.values().next().map(EmbeddingRecord::dimension)
    }
}

impl FromIterator<EmbeddingRecord> for Shard {
    fn from_iter<I: IntoIterator<Item = EmbeddingRecord>>(iter: I) -> Self {
        let mut shard = Shard::new();
        for record in iter {
            shard.insert(record);
        }
        shard
    }
}

impl IntoIterator for Shard {
    type Item = EmbeddingRecord;
    type IntoIter = btree_map::IntoValues<String, EmbeddingRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

/// One classified, embedded image as produced by the external collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTriple {
    pub identity: String,
    pub categories: BTreeSet<String>,
    pub embedding: Vec<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl IndexTriple {
    pub fn new<I, S>(identity: impl Into<String>, categories: I, embedding: Vec<f32>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity: identity.into(),
            categories: categories.into_iter().map(Into::into).collect(),
            embedding,
            source: None,
        }
    }

    /// Attach the location of the original image
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// How a rebuild treats shards that already exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    /// Replace shards for observed categories, keep the rest
    #[default]
    Additive,
    /// Clear the whole store before ingesting
    FullReplace,
}

/// Summary of one indexing run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Triples consumed from the input
    pub triples: usize,

    /// Triples dropped because they carried no category
    pub skipped: usize,

    /// Records written per category
    pub categories: BTreeMap<String, usize>,

    /// Same-category duplicates collapsed by last-write-wins
    pub overwritten: usize,
}

/// One ranked retrieval hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub identity: String,

    /// Cosine distance to the query (0 = same direction, lower is closer)
    pub distance: f32,

    /// Location of the matched image, when it was recorded at indexing time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A category whose shard could not be read during a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryFailure {
    pub category: String,
    pub reason: String,
}

/// Result of a query: ranked hits plus the categories that were skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    /// Most similar first
    pub results: Vec<SearchHit>,

    /// Categories whose shards failed to load
    pub failed_categories: Vec<CategoryFailure>,
}

impl QueryOutcome {
    /// No matching images (not an error)
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_last_write_wins() {
        let mut shard = Shard::new();
        assert!(shard.insert(EmbeddingRecord::new("a.jpg", vec![1.0, 0.0])).is_none());
        let old = shard.insert(EmbeddingRecord::new("a.jpg", vec![0.0, 1.0]));

        assert_eq!(old.map(|r| r.embedding), Some(vec![1.0, 0.0]));
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.get("a.jpg").unwrap().embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn test_shard_insert_if_absent() {
        let mut shard = Shard::new();
        assert!(shard.insert_if_absent(EmbeddingRecord::new("a.jpg", vec![1.0])));
        assert!(!shard.insert_if_absent(EmbeddingRecord::new("a.jpg", vec![2.0])));
        assert_eq!(shard.get("a.jpg").unwrap().embedding, vec![1.0]);
    }

    #[test]
    fn test_shard_iterates_by_identity() {
        let shard: Shard = ["c.png", "a.png", "b.png"]
            .into_iter()
            .map(|id| EmbeddingRecord::new(id, vec![1.0]))
            .collect();

        let ids: Vec<_> = shard.records().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, ["a.png", "b.png", "c.png"]);
        assert_eq!(shard.dimension(), Some(1));
        assert_eq!(Shard::new().dimension(), None);
    }

    #[test]
    fn test_source_is_optional_on_disk() {
        let plain: EmbeddingRecord =
            serde_json::from_str(r#"{"identity": "a.jpg", "embedding": [1.0]}"#).unwrap();
        assert_eq!(plain.source, None);
        assert!(!serde_json::to_string(&plain).unwrap().contains("source"));

        let record = EmbeddingRecord::new("a.jpg", vec![1.0]).with_source("/data/tabby/a.jpg");
        let json = serde_json::to_string(&record).unwrap();
        let back: EmbeddingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source.as_deref(), Some("/data/tabby/a.jpg"));
    }

    #[test]
    fn test_triple_deduplicates_categories() {
        let triple = IndexTriple::new("x.jpg", ["tabby", "tiger_cat", "tabby"], vec![1.0]);
        assert_eq!(triple.categories.len(), 2);
    }
}
