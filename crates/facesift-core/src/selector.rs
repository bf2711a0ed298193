//! Threshold filtering and per-group deduplication of similarity rows.

use crate::types::{Grouping, MatchResult, SimilarityTable};
use std::collections::HashSet;

/// Default distance cut: rows must be strictly below it.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// Keep rows with `distance < threshold`, then the closest row per grouping key.
///
/// Ties go to the row the engine ranked first. Results come back in ascending
/// distance order.
pub fn select(table: &SimilarityTable, threshold: f32, grouping: Grouping) -> Vec<MatchResult> {
    let mut seen = HashSet::new();

    // The table is already stably sorted by distance, so the first row seen
    // for each key is the group's best.
    table
        .rows()
        .iter()
        .filter(|row| row.distance < threshold)
        .filter(|row| seen.insert(grouping.key(&row.candidate).to_path_buf()))
        .cloned()
        .map(MatchResult::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimilarityRow;
    use std::path::PathBuf;

    fn row(p: &str, d: f32) -> SimilarityRow {
        SimilarityRow { candidate: PathBuf::from(p), distance: d, threshold: 0.68, target: None }
    }

    #[test]
    fn test_empty_table() {
        let table = SimilarityTable::default();
        assert!(select(&table, DEFAULT_SIMILARITY_THRESHOLD, Grouping::PerImage).is_empty());
    }

    #[test]
    fn test_duplicate_rows_keep_closest() {
        let table = SimilarityTable::from_rows(vec![
            row("out/alice/a.jpg/1.png", 0.7),
            row("out/alice/a.jpg/1.png", 0.3),
        ]);
        let matches = select(&table, 0.6, Grouping::PerImage);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].distance, 0.3);
    }

    #[test]
    fn test_threshold_is_strict() {
        let table = SimilarityTable::from_rows(vec![row("a", 0.6), row("b", 0.59)]);
        let matches = select(&table, 0.6, Grouping::PerImage);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, PathBuf::from("b"));
    }

    #[test]
    fn test_per_directory_collapses_crops_of_one_photo() {
        let table = SimilarityTable::from_rows(vec![
            row("out/alice/a.jpg/2.png", 0.40),
            row("out/alice/a.jpg/1.png", 0.20),
            row("out/alice/b.jpg/1.png", 0.35),
            row("out/alice/b.jpg/3.png", 0.50),
        ]);

        let per_dir = select(&table, 0.6, Grouping::PerDirectory);
        let got: Vec<_> = per_dir.iter().map(|m| m.candidate.to_str().unwrap()).collect();
        assert_eq!(got, ["out/alice/a.jpg/1.png", "out/alice/b.jpg/1.png"]);

        let per_image = select(&table, 0.6, Grouping::PerImage);
        assert_eq!(per_image.len(), 4);
    }

    #[test]
    fn test_ties_go_to_first_ranked() {
        let table = SimilarityTable::from_rows(vec![
            row("d/x.jpg/2.png", 0.25),
            row("d/x.jpg/1.png", 0.25),
        ]);
        let matches = select(&table, 0.6, Grouping::PerDirectory);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, PathBuf::from("d/x.jpg/2.png"));
    }

    #[test]
    fn test_invariants_hold_for_mixed_table() {
        let mut rows = Vec::new();
        for i in 0..40u32 {
            let d = (i * 37 % 100) as f32 / 100.0;
            rows.push(row(&format!("c/{}.jpg/{}.png", i % 5, i % 3), d));
        }
        let table = SimilarityTable::from_rows(rows);

        for grouping in [Grouping::PerImage, Grouping::PerDirectory] {
            let matches = select(&table, 0.6, grouping);
            let mut keys = HashSet::new();
            for m in &matches {
                assert!(m.distance < 0.6);
                assert!(keys.insert(grouping.key(&m.candidate).to_path_buf()), "duplicate key");
            }
        }
    }
}
