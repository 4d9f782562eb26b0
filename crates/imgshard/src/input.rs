use futures::stream::{self, Stream};
use imgshard_common::{ImgShardError, Result};
use imgshard_store::IndexTriple;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Lazily read index triples from a JSON-lines file
///
/// Each non-blank line is `{"identity": .., "categories": [..], "embedding": [..]}`,
/// optionally with a `"source"` path or URI.
pub async fn read_triples(
    path: &Path,
) -> Result<impl Stream<Item = Result<IndexTriple>> + Send> {
    let file = File::open(path).await.map_err(|e| {
        ImgShardError::invalid_input(format!("cannot open {}: {}", path.display(), e))
    })?;
    let lines = BufReader::new(file).lines();

    Ok(stream::unfold(Some((lines, 0usize)), next_triple))
}

type LineState = Option<(Lines<BufReader<File>>, usize)>;

async fn next_triple(state: LineState) -> Option<(Result<IndexTriple>, LineState)> {
    let (mut lines, mut line_no) = state?;

    loop {
        line_no += 1;
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let triple = serde_json::from_str(&line).map_err(|e| {
                    ImgShardError::invalid_input(format!("line {}: {}", line_no, e))
                });
                return Some((triple, Some((lines, line_no))));
            }
            Ok(None) => return None,
            // Stop after the first read error
            Err(e) => return Some((Err(e.into()), None)),
        }
    }
}

/// Read a query embedding stored as a JSON array of numbers
pub async fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        ImgShardError::invalid_input(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_read_triples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"identity": "cat.jpg", "categories": ["tabby", "tiger_cat"], "#,
                r#""embedding": [1.0, 0.0], "source": "/data/cat.jpg"}"#,
                "\n\n",
                r#"{"identity": "dog.jpg", "categories": ["beagle"], "embedding": [0.0, 1.0]}"#,
                "\n"
            ),
        )
        .unwrap();

        let triples: Vec<IndexTriple> =
            read_triples(&path).await.unwrap().try_collect().await.unwrap();

        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].identity, "cat.jpg");
        assert_eq!(triples[0].source.as_deref(), Some("/data/cat.jpg"));
        assert_eq!(triples[1].embedding, vec![0.0, 1.0]);
        assert_eq!(triples[1].source, None);
    }

    #[tokio::test]
    async fn test_read_triples_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.jsonl");
        std::fs::write(
            &path,
            "{\"identity\": \"a.jpg\", \"categories\": [\"x\"], \"embedding\": [1.0]}\n{oops}\n",
        )
        .unwrap();

        let err = read_triples(&path)
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_read_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.json");
        std::fs::write(&path, "[0.6, 0.8]").unwrap();

        assert_eq!(read_embedding(&path).await.unwrap(), vec![0.6, 0.8]);
    }
}
