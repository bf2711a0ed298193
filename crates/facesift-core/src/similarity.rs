//! Normalizes similarity-engine output into one flat, sorted table.

use crate::search::{EngineOutput, SearchError, SimilarityEngine};
use crate::types::{SimilarityRow, SimilarityTable};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("similarity search of {corpus} failed: {source}")]
    Engine {
        corpus: String,
        #[source]
        source: SearchError,
    },
}

pub struct SimilarityAdapter {
    engine: Box<dyn SimilarityEngine>,
}

impl SimilarityAdapter {
    pub fn new(engine: Box<dyn SimilarityEngine>) -> Self {
        Self { engine }
    }

    /// Search `corpus` for faces like the one in `query`.
    ///
    /// Multi-table results are concatenated. Rows with a non-finite distance
    /// are dropped and negative distances are floored at zero.
    pub fn find(&mut self, query: &Path, corpus: &Path) -> Result<SimilarityTable, SimilarityError> {
        let output = self
            .engine
            .find(query, corpus)
            .map_err(|source| SimilarityError::Engine {
                corpus: corpus.display().to_string(),
                source,
            })?;

        let rows: Vec<SimilarityRow> = match output {
            EngineOutput::Table(rows) => rows,
            EngineOutput::Tables(tables) => {
                if tables.len() > 1 {
                    tracing::debug!(tables = tables.len(), "merging per-face similarity tables");
                }
                tables.into_iter().flatten().collect()
            }
        };

        let total = rows.len();
        let rows: Vec<SimilarityRow> = rows
            .into_iter()
            .filter(|row| row.distance.is_finite())
            .map(|mut row| {
                row.distance = row.distance.max(0.0);
                row
            })
            .collect();
        if rows.len() != total {
            tracing::warn!(dropped = total - rows.len(), "dropped rows with invalid distances");
        }

        Ok(SimilarityTable::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Canned(Option<EngineOutput>);

    impl SimilarityEngine for Canned {
        fn find(&mut self, _query: &Path, corpus: &Path) -> Result<EngineOutput, SearchError> {
            self.0
                .clone()
                .ok_or_else(|| SearchError::EmptyCorpus(corpus.to_path_buf()))
        }
    }

    fn row(p: &str, d: f32) -> SimilarityRow {
        SimilarityRow { candidate: PathBuf::from(p), distance: d, threshold: 0.68, target: None }
    }

    fn paths(table: &SimilarityTable) -> Vec<&str> {
        table.rows().iter().map(|r| r.candidate.to_str().unwrap()).collect()
    }

    #[test]
    fn test_single_table_passthrough() {
        let mut adapter = SimilarityAdapter::new(Box::new(Canned(Some(EngineOutput::Table(vec![
            row("a", 0.1), row("b", 0.4),
        ])))));
        let table = adapter.find(Path::new("q.jpg"), Path::new("c")).unwrap();
        assert_eq!(paths(&table), ["a", "b"]);
    }

    #[test]
    fn test_wrapped_tables_are_flattened_and_sorted() {
        let mut adapter = SimilarityAdapter::new(Box::new(Canned(Some(EngineOutput::Tables(vec![
            vec![row("a", 0.3), row("b", 0.5)],
            vec![row("c", 0.2), row("a", 0.3)],
        ])))));
        let table = adapter.find(Path::new("q.jpg"), Path::new("c")).unwrap();
        assert_eq!(paths(&table), ["c", "a", "a", "b"]);
    }

    #[test]
    fn test_invalid_distances() {
        let mut adapter = SimilarityAdapter::new(Box::new(Canned(Some(EngineOutput::Table(vec![
            row("nan", f32::NAN), row("neg", -0.01), row("ok", 0.2),
        ])))));
        let table = adapter.find(Path::new("q.jpg"), Path::new("c")).unwrap();
        assert_eq!(paths(&table), ["neg", "ok"]);
        assert_eq!(table.rows()[0].distance, 0.0);
    }

    #[test]
    fn test_empty_output_is_empty_table() {
        let mut adapter = SimilarityAdapter::new(Box::new(Canned(Some(EngineOutput::Tables(vec![])))));
        assert!(adapter.find(Path::new("q.jpg"), Path::new("c")).unwrap().is_empty());
    }

    #[test]
    fn test_engine_error() {
        let mut adapter = SimilarityAdapter::new(Box::new(Canned(None)));
        let err = adapter.find(Path::new("q.jpg"), Path::new("c")).unwrap_err();
        assert!(matches!(err, SimilarityError::Engine { source: SearchError::EmptyCorpus(_), .. }));
    }
}
