//! Deterministic combination of per-source row sequences
//!
//! The combined dataset is a fold over immutable per-source sequences: staged
//! files are re-read lazily in canonical order and chained, so nothing is held
//! in memory beyond the current record.

use crate::error::{IngestError, Result};
use crate::output::TableWriter;
use crate::reader::{Provenance, RowIngestor, TypedRow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One ingested file eligible for combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineSource {
    /// Arrival index of the archive the file came from
    pub archive_index: usize,
    pub archive: String,
    pub file: String,
    pub path: PathBuf,
}

impl CombineSource {
    fn sort_key(&self) -> (usize, &str, &str) {
        (self.archive_index, &self.archive, &self.file)
    }
}

/// Sort sources into canonical order: arrival, then archive name, then file name
pub fn canonical_order(mut sources: Vec<CombineSource>) -> Vec<CombineSource> {
    sources.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    sources
}

pub struct Combiner {
    ingestor: RowIngestor,
}

impl Combiner {
    pub fn new(ingestor: RowIngestor) -> Self {
        Self { ingestor }
    }

    /// Lazy combined row sequence over already-ordered sources
    pub fn rows<'a>(&'a self, sources: &'a [CombineSource]) -> impl Iterator<Item = Result<TypedRow>> + 'a {
        sources.iter().flat_map(move |source| -> Box<dyn Iterator<Item = Result<TypedRow>>> {
            let provenance = Provenance::new(source.archive.clone(), source.file.clone());
            match self.ingestor.open(&source.path, provenance) {
                Ok(rows) => Box::new(rows),
                Err(e) => Box::new(std::iter::once(Err(e))),
            }
        })
    }

    /// Stream every source into `writer` in canonical order
    pub fn combine(
        &self,
        sources: Vec<CombineSource>,
        writer: &mut dyn TableWriter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let sources = canonical_order(sources);
        let mut rows = 0u64;
        for row in self.rows(&sources) {
            if cancel.is_cancelled() {
                return Err(IngestError::Interrupted);
            }
            writer.write_row(&row?)?;
            rows += 1;
        }
        info!(sources = sources.len(), rows, path = %writer.path().display(), "Combined sources");
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::output::{create_writer, OutputFormat};
    use crate::reader::{ReadOptions, TypedValue};
    use crate::schema::SchemaDictionaryParser;
    use std::path::Path;
    use std::sync::Arc;

    fn ingestor() -> RowIngestor {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n2 MFR_NAME CHAR(60)\n3 YEARTXT NUMBER(4)\n";
        let spec = SchemaDictionaryParser::default().parse("complaints", doc).unwrap();
        RowIngestor::new(Arc::new(spec), ReadOptions::default())
    }

    fn source(dir: &Path, index: usize, archive: &str, file: &str, rows: usize) -> CombineSource {
        let path = dir.join(format!("{index}_{file}"));
        let body: String = (0..rows).map(|i| format!("{archive}-{i}\tACME\t2020\n")).collect();
        std::fs::write(&path, body).unwrap();
        CombineSource {
            archive_index: index,
            archive: archive.to_string(),
            file: file.to_string(),
            path,
        }
    }

    #[test]
    fn test_canonical_order() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            source(dir.path(), 1, "B.zip", "x.txt", 1),
            source(dir.path(), 0, "A.zip", "z.txt", 1),
            source(dir.path(), 0, "A.zip", "y.txt", 1),
        ];
        let ordered: Vec<(usize, String)> = canonical_order(sources)
            .into_iter()
            .map(|s| (s.archive_index, s.file))
            .collect();
        assert_eq!(ordered, vec![(0, "y.txt".into()), (0, "z.txt".into()), (1, "x.txt".into())]);
    }

    #[test]
    fn test_combined_rows_follow_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = source(dir.path(), 0, "COMPLAINTS_A.zip", "a.txt", 100);
        let b = source(dir.path(), 1, "COMPLAINTS_B.zip", "b.txt", 50);
        let combiner = Combiner::new(ingestor());

        let ordered = canonical_order(vec![b.clone(), a.clone()]);
        let rows: Vec<TypedRow> = combiner.rows(&ordered).collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 150);
        assert!(rows[..100].iter().all(|r| r.provenance().archive == "COMPLAINTS_A.zip"));
        assert!(rows[100..].iter().all(|r| r.provenance().archive == "COMPLAINTS_B.zip"));
        assert_eq!(rows[0].get("CMPLID"), Some(&TypedValue::Text("COMPLAINTS_A.zip-0".into())));
        assert_eq!(rows[100].get("CMPLID"), Some(&TypedValue::Text("COMPLAINTS_B.zip-0".into())));

        // Combining equals concatenating each source on its own
        let single = |s: &CombineSource| -> Vec<Vec<TypedValue>> {
            combiner
                .rows(std::slice::from_ref(s))
                .map(|r| r.unwrap().values().to_vec())
                .collect()
        };
        let mut concatenated = single(&a);
        concatenated.extend(single(&b));
        let combined: Vec<Vec<TypedValue>> = rows.iter().map(|r| r.values().to_vec()).collect();
        assert_eq!(combined, concatenated);
    }

    #[test]
    fn test_combine_writes_and_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(dir.path(), 0, "A.zip", "a.txt", 3), source(dir.path(), 1, "B.zip", "b.txt", 2)];
        let combiner = Combiner::new(ingestor());

        let mut writer =
            create_writer(OutputFormat::Text, &dir.path().join("combined"), combiner.ingestor.schema()).unwrap();
        let rows = combiner.combine(sources.clone(), writer.as_mut(), &CancellationToken::new()).unwrap();
        assert_eq!(rows, 5);
        writer.finish().unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let mut writer =
            create_writer(OutputFormat::Text, &dir.path().join("again"), combiner.ingestor.schema()).unwrap();
        let err = combiner.combine(sources, writer.as_mut(), &cancelled).unwrap_err();
        assert!(matches!(err, IngestError::Interrupted));
    }

    #[test]
    fn test_missing_source_surfaces_read_error() {
        let combiner = Combiner::new(ingestor());
        let sources = vec![CombineSource {
            archive_index: 0,
            archive: "A.zip".into(),
            file: "gone.txt".into(),
            path: PathBuf::from("/nonexistent/gone.txt"),
        }];
        let results: Vec<Result<TypedRow>> = combiner.rows(&sources).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().kind(), "read_error");
    }
}
