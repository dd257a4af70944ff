//! Row validation and violation accounting
//!
//! The [`Validator`] observes typed rows and counts their violations without
//! changing or dropping them. Each worker owns its own validator; reports are
//! merged after the workers join.
//!
//! Besides per-column violations the report carries dataset-level checks:
//! duplicate rows, null and duplicate identifiers, model years outside the
//! plausible range, and records that end before optional trailing columns.
//! These are counted for review and do not mark rows as violating.

use crate::error::{IngestError, Result};
use crate::reader::{TypedRow, TypedValue, ViolationKind};
use crate::schema::SchemaSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Distinct example values kept per column
pub const MAX_EXAMPLES: usize = 5;

/// Identifier columns, by output name, in order of preference
pub const ID_COLUMNS: &[&str] = &["odi_number", "odino", "cmplid", "complaint_number", "record_id"];

/// Model year columns, by output name, in order of preference
pub const MODEL_YEAR_COLUMNS: &[&str] = &["yeartxt", "model_year", "modelyear", "veh_year", "year"];

/// Plausible model years; 9999 marks an unknown year and is also accepted
pub const MODEL_YEAR_RANGE: RangeInclusive<i64> = 1900..=2100;
pub const UNKNOWN_MODEL_YEAR: i64 = 9999;

/// Rows beyond which duplicate-row detection is abandoned
pub const DUPLICATE_ROW_LIMIT: u64 = 500_000;

/// Identifiers beyond which duplicate-identifier detection is abandoned
pub const DUPLICATE_ID_LIMIT: u64 = 1_000_000;

// ============================================================================
// Dataset-level checks
// ============================================================================

/// Duplicate detection over value fingerprints
///
/// Fingerprints are 64-bit hashes, held only until the report is sealed.
/// Once more than the limit of values is seen the set is dropped and
/// `duplicates` becomes `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCount {
    pub values: u64,
    pub duplicates: Option<u64>,
    #[serde(skip)]
    seen: HashSet<u64>,
}

impl Default for DuplicateCount {
    fn default() -> Self {
        Self {
            values: 0,
            duplicates: Some(0),
            seen: HashSet::new(),
        }
    }
}

impl DuplicateCount {
    fn observe(&mut self, fingerprint: u64, limit: u64) {
        self.values += 1;
        if let Some(duplicates) = self.duplicates.as_mut() {
            if !self.seen.insert(fingerprint) {
                *duplicates += 1;
            }
        }
        self.enforce(limit);
    }

    fn merge(&mut self, other: &DuplicateCount, limit: u64) {
        self.values += other.values;
        if self.duplicates.is_some() && other.duplicates.is_some() {
            self.seen.extend(other.seen.iter().copied());
            self.duplicates = Some(self.values - self.seen.len() as u64);
        } else {
            self.duplicates = None;
            self.seen = HashSet::new();
        }
        self.enforce(limit);
    }

    fn enforce(&mut self, limit: u64) {
        if self.values > limit {
            self.duplicates = None;
            self.seen = HashSet::new();
        }
    }
}

fn fingerprint(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Null and duplicate counts of the identifier column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCheck {
    pub column: String,
    pub nulls: u64,
    pub ids: DuplicateCount,
}

/// Model years outside [`MODEL_YEAR_RANGE`] other than [`UNKNOWN_MODEL_YEAR`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelYearCheck {
    pub column: String,
    pub out_of_range: u64,
}

fn model_year(value: &TypedValue) -> Option<i64> {
    match value {
        TypedValue::Integer(n) => Some(*n),
        TypedValue::Text(s) | TypedValue::Code(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_plausible_model_year(year: i64) -> bool {
    year == UNKNOWN_MODEL_YEAR || MODEL_YEAR_RANGE.contains(&year)
}

/// Aggregate violation counts for one dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub dataset: String,
    pub rows_read: u64,
    pub rows_with_violations: u64,
    pub violations_total: u64,
    pub by_kind: BTreeMap<ViolationKind, u64>,
    /// column -> kind -> count
    pub by_column: BTreeMap<String, BTreeMap<ViolationKind, u64>>,
    /// Smallest distinct raw values that produced violations, per column
    pub examples: BTreeMap<String, BTreeSet<String>>,
    /// Date placeholders read as null, per column
    pub placeholder_dates: BTreeMap<String, u64>,
    #[serde(default)]
    pub duplicate_rows: DuplicateCount,
    #[serde(default)]
    pub id_check: Option<IdCheck>,
    #[serde(default)]
    pub model_year: Option<ModelYearCheck>,
    /// Records that ended before an optional trailing column, per column
    #[serde(default)]
    pub missing_optional: BTreeMap<String, u64>,
}

impl ValidationReport {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations_total == 0
    }

    /// Count of one kind across all columns
    pub fn count(&self, kind: ViolationKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Count of one kind in one column
    pub fn column_count(&self, column: &str, kind: ViolationKind) -> u64 {
        self.by_column
            .get(column)
            .and_then(|kinds| kinds.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    /// Add another report's counts into this one
    ///
    /// Summation and sorted example sets make the result independent of the
    /// order in which worker reports arrive.
    pub fn merge(&mut self, other: &ValidationReport) {
        if self.dataset.is_empty() {
            self.dataset = other.dataset.clone();
        }
        self.rows_read += other.rows_read;
        self.rows_with_violations += other.rows_with_violations;
        self.violations_total += other.violations_total;

        for (kind, n) in &other.by_kind {
            *self.by_kind.entry(*kind).or_default() += n;
        }
        for (column, kinds) in &other.by_column {
            let entry = self.by_column.entry(column.clone()).or_default();
            for (kind, n) in kinds {
                *entry.entry(*kind).or_default() += n;
            }
        }
        for (column, values) in &other.examples {
            let entry = self.examples.entry(column.clone()).or_default();
            entry.extend(values.iter().cloned());
            truncate_examples(entry);
        }
        for (column, n) in &other.placeholder_dates {
            *self.placeholder_dates.entry(column.clone()).or_default() += n;
        }
        for (column, n) in &other.missing_optional {
            *self.missing_optional.entry(column.clone()).or_default() += n;
        }

        self.duplicate_rows.merge(&other.duplicate_rows, DUPLICATE_ROW_LIMIT);
        match (&mut self.id_check, &other.id_check) {
            (Some(mine), Some(theirs)) => {
                mine.nulls += theirs.nulls;
                mine.ids.merge(&theirs.ids, DUPLICATE_ID_LIMIT);
            },
            (None, Some(theirs)) => self.id_check = Some(theirs.clone()),
            _ => {},
        }
        match (&mut self.model_year, &other.model_year) {
            (Some(mine), Some(theirs)) => mine.out_of_range += theirs.out_of_range,
            (None, Some(theirs)) => self.model_year = Some(theirs.clone()),
            _ => {},
        }
    }

    /// Release duplicate-detection state once no further merge will happen
    pub fn seal(&mut self) {
        self.duplicate_rows.seen = HashSet::new();
        if let Some(check) = self.id_check.as_mut() {
            check.ids.seen = HashSet::new();
        }
    }

    /// Duplicate rows, or `None` when the dataset was too large to check
    pub fn duplicate_row_count(&self) -> Option<u64> {
        self.duplicate_rows.duplicates
    }

    fn add_example(&mut self, column: &str, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        let entry = self.examples.entry(column.to_string()).or_default();
        if entry.len() < MAX_EXAMPLES || entry.last().is_some_and(|last| raw < last.as_str()) {
            entry.insert(raw.to_string());
            truncate_examples(entry);
        }
    }
}

fn truncate_examples(values: &mut BTreeSet<String>) {
    while values.len() > MAX_EXAMPLES {
        values.pop_last();
    }
}

/// Pure observer that accumulates a [`ValidationReport`]
#[derive(Debug)]
pub struct Validator {
    schema: Arc<SchemaSpec>,
    report: ValidationReport,
    id_position: Option<usize>,
    model_year_position: Option<usize>,
}

impl Validator {
    /// Create a validator; a schema without columns is a configuration error
    pub fn new(schema: Arc<SchemaSpec>) -> Result<Self> {
        if schema.is_empty() {
            return Err(IngestError::configuration(format!(
                "schema for dataset '{}' has no columns",
                schema.dataset()
            )));
        }
        let find = |candidates: &[&str]| {
            candidates.iter().find_map(|name| {
                schema
                    .columns()
                    .iter()
                    .find(|c| c.output_name() == *name)
                    .map(|c| (c.position, c.output_name()))
            })
        };
        let id = find(ID_COLUMNS);
        let year = find(MODEL_YEAR_COLUMNS);

        let mut report = ValidationReport::new(schema.dataset());
        report.id_check = id.as_ref().map(|(_, column)| IdCheck {
            column: column.clone(),
            ..IdCheck::default()
        });
        report.model_year = year.as_ref().map(|(_, column)| ModelYearCheck {
            column: column.clone(),
            out_of_range: 0,
        });

        Ok(Self {
            report,
            id_position: id.map(|(position, _)| position),
            model_year_position: year.map(|(position, _)| position),
            schema,
        })
    }

    pub fn schema(&self) -> &SchemaSpec {
        &self.schema
    }

    /// Record one row's violations
    pub fn observe(&mut self, row: &TypedRow) {
        let report = &mut self.report;
        report.rows_read += 1;

        for &position in row.placeholder_dates() {
            if let Some(column) = self.schema.columns().get(position) {
                *report.placeholder_dates.entry(column.name.clone()).or_default() += 1;
            }
        }
        for &position in row.missing_optional() {
            if let Some(column) = self.schema.columns().get(position) {
                *report.missing_optional.entry(column.name.clone()).or_default() += 1;
            }
        }

        report.duplicate_rows.observe(fingerprint(&row.values()), DUPLICATE_ROW_LIMIT);
        if let (Some(position), Some(check)) = (self.id_position, report.id_check.as_mut()) {
            match row.values().get(position) {
                Some(value) if !value.render().trim().is_empty() => {
                    check.ids.observe(fingerprint(value), DUPLICATE_ID_LIMIT);
                },
                _ => check.nulls += 1,
            }
        }
        if let (Some(position), Some(check)) = (self.model_year_position, report.model_year.as_mut()) {
            let year = row.values().get(position).and_then(model_year);
            if year.is_some_and(|y| !is_plausible_model_year(y)) {
                check.out_of_range += 1;
            }
        }

        if !row.has_violations() {
            return;
        }
        report.rows_with_violations += 1;
        for violation in row.violations() {
            report.violations_total += 1;
            *report.by_kind.entry(violation.kind).or_default() += 1;
            *report
                .by_column
                .entry(violation.column.clone())
                .or_default()
                .entry(violation.kind)
                .or_default() += 1;
            report.add_example(&violation.column, &violation.raw);
        }
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn into_report(self) -> ValidationReport {
        self.report
    }

    /// Wrap a row sequence so every row passing through is observed
    pub fn validate<I>(self, rows: I) -> Validated<I>
    where
        I: Iterator<Item = Result<TypedRow>>,
    {
        Validated {
            rows,
            validator: self,
        }
    }
}

/// Row sequence passing through a [`Validator`] unchanged
pub struct Validated<I> {
    rows: I,
    validator: Validator,
}

impl<I> Validated<I> {
    pub fn report(&self) -> &ValidationReport {
        self.validator.report()
    }

    pub fn into_report(self) -> ValidationReport {
        self.validator.into_report()
    }
}

impl<I> Iterator for Validated<I>
where
    I: Iterator<Item = Result<TypedRow>>,
{
    type Item = Result<TypedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rows.next()?;
        if let Ok(row) = &item {
            self.validator.observe(row);
        }
        Some(item)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::reader::{Provenance, RawRecord, ReadOptions, RowIngestor};
    use crate::schema::SchemaDictionaryParser;

    fn ingestor() -> RowIngestor {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n2 MFR_NAME CHAR(60)\n3 YEARTXT NUMBER(4)\n4 FAILDATE DATE(8) YYYYMMDD\n";
        let spec = SchemaDictionaryParser::default().parse("complaints", doc).unwrap();
        RowIngestor::new(Arc::new(spec), ReadOptions::default())
    }

    fn rows(ingestor: &RowIngestor, records: &[&[&str]]) -> Vec<Result<TypedRow>> {
        let provenance = Arc::new(Provenance::new("a.zip", "a.txt"));
        records
            .iter()
            .enumerate()
            .map(|(i, fields)| {
                let record = RawRecord {
                    line: i as u64 + 1,
                    fields: fields.iter().map(|s| s.to_string()).collect(),
                };
                Ok(ingestor.type_record(record, &provenance))
            })
            .collect()
    }

    #[test]
    fn test_empty_schema_is_configuration_error() {
        let empty = SchemaSpec::new("complaints", vec![], vec![]).unwrap();
        let err = Validator::new(Arc::new(empty)).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_validated_passes_rows_through_unchanged() {
        let ingestor = ingestor();
        let input = rows(
            &ingestor,
            &[
                &["123456789", "ACME MOTORS", "2020", "20200101"],
                &["12345", "ACME MOTORS", "N/A", "20200230"],
                &["1", "ACME"],
                &["2", "ACME", "2021", "00000000"],
            ],
        );
        let validator = Validator::new(Arc::clone(ingestor.schema())).unwrap();
        let mut validated = validator.validate(input.into_iter());
        let passed: Vec<TypedRow> = validated.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(passed.len(), 4);
        assert_eq!(passed[1].violations().len(), 2);

        let report = validated.into_report();
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_with_violations, 2);
        assert_eq!(report.violations_total, 3);
        assert_eq!(report.count(ViolationKind::TypeCoercionFailure), 1);
        assert_eq!(report.count(ViolationKind::DateUnparseable), 1);
        assert_eq!(report.column_count("YEARTXT", ViolationKind::LengthMismatch), 1);
        assert_eq!(report.placeholder_dates.get("FAILDATE"), Some(&1));
        assert!(report.examples["YEARTXT"].contains("N/A"));
    }

    #[test]
    fn test_examples_keep_smallest_distinct_values() {
        let mut report = ValidationReport::new("complaints");
        for raw in ["g", "f", "e", "d", "c", "b", "a", "a"] {
            report.add_example("COL", raw);
        }
        let kept: Vec<&str> = report.examples["COL"].iter().map(String::as_str).collect();
        assert_eq!(kept, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let ingestor = ingestor();
        let observe = |records: &[&[&str]]| {
            let mut validator = Validator::new(Arc::clone(ingestor.schema())).unwrap();
            for row in rows(&ingestor, records) {
                validator.observe(&row.unwrap());
            }
            validator.into_report()
        };
        let a = observe(&[&["1", "X", "ABC", "20200101"], &["2", "Y", "2020", "20200101"]]);
        let b = observe(&[&["3", "Z", "1999", "bad"], &["4"]]);

        let mut ab = ValidationReport::default();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = ValidationReport::default();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.dataset, "complaints");
        assert_eq!(ab.rows_read, 4);
        assert_eq!(ab.rows_with_violations, 3);
    }

    // ========================================================================
    // Dataset-level checks
    // ========================================================================

    fn observe_all(ingestor: &RowIngestor, records: &[&[&str]]) -> ValidationReport {
        let mut validator = Validator::new(Arc::clone(ingestor.schema())).unwrap();
        for row in rows(ingestor, records) {
            validator.observe(&row.unwrap());
        }
        validator.into_report()
    }

    #[test]
    fn test_duplicates_ids_and_model_years_are_counted() {
        let ingestor = ingestor();
        let report = observe_all(
            &ingestor,
            &[
                &["1", "X", "2020", "20200101"],
                &["1", "X", "2020", "20200101"],
                &["1", "Y", "2020", "20200101"],
                &["", "Z", "1850", "20200101"],
                &["5", "Z", "9999", "20200101"],
                &["6", "Z", "2101", "20200101"],
            ],
        );

        assert_eq!(report.rows_with_violations, 0);
        assert_eq!(report.duplicate_rows.values, 6);
        assert_eq!(report.duplicate_row_count(), Some(1));

        let id = report.id_check.as_ref().unwrap();
        assert_eq!(id.column, "cmplid");
        assert_eq!(id.nulls, 1);
        assert_eq!(id.ids.values, 5);
        assert_eq!(id.ids.duplicates, Some(2));

        let year = report.model_year.as_ref().unwrap();
        assert_eq!(year.column, "yeartxt");
        assert_eq!(year.out_of_range, 2);
    }

    #[test]
    fn test_schema_without_id_or_year_skips_those_checks() {
        let spec = SchemaDictionaryParser::default()
            .parse("complaints", "FIELDS:\n1 MFR_NAME CHAR(60)\n")
            .unwrap();
        let ingestor = RowIngestor::new(Arc::new(spec), ReadOptions::default());
        let report = observe_all(&ingestor, &[&["ACME"], &["ACME"]]);
        assert!(report.id_check.is_none());
        assert!(report.model_year.is_none());
        assert_eq!(report.duplicate_row_count(), Some(1));
    }

    #[test]
    fn test_duplicates_across_reports_are_found_on_merge() {
        let ingestor = ingestor();
        let a = observe_all(&ingestor, &[&["1", "X", "2020", "20200101"], &["2", "X", "2020", "20200101"]]);
        let b = observe_all(&ingestor, &[&["1", "X", "2020", "20200101"]]);
        assert_eq!(a.duplicate_row_count(), Some(0));
        assert_eq!(b.duplicate_row_count(), Some(0));

        let mut ab = ValidationReport::default();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = ValidationReport::default();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.duplicate_row_count(), Some(1));
        let id = ab.id_check.as_ref().unwrap();
        assert_eq!(id.ids.values, 3);
        assert_eq!(id.ids.duplicates, Some(1));
    }

    #[test]
    fn test_duplicate_detection_stops_past_limit() {
        let mut count = DuplicateCount::default();
        count.observe(7, 2);
        count.observe(7, 2);
        assert_eq!(count.duplicates, Some(1));
        count.observe(8, 2);
        assert_eq!(count.values, 3);
        assert_eq!(count.duplicates, None);
        assert!(count.seen.is_empty());

        let mut other = DuplicateCount::default();
        other.observe(1, 2);
        other.merge(&count, 10);
        assert_eq!(other.values, 4);
        assert_eq!(other.duplicates, None);
    }

    #[test]
    fn test_missing_optional_columns_are_counted() {
        let spec = SchemaDictionaryParser::default()
            .parse("recalls", "FIELDS:\n1 RECORD_ID NUMBER(9)\n2 DO_NOT_DRIVE CHAR(3)\n3 PARK_OUTSIDE CHAR(3)\n")
            .unwrap();
        let mut columns = spec.columns().to_vec();
        columns[1].optional = true;
        columns[2].optional = true;
        let spec = SchemaSpec::new("recalls", columns, vec!["%Y%m%d".into()]).unwrap();
        let ingestor = RowIngestor::new(Arc::new(spec), ReadOptions::default());

        let report = observe_all(&ingestor, &[&["1"], &["2", "N"], &["3", "N", "N"]]);
        assert_eq!(report.rows_with_violations, 0);
        assert_eq!(report.missing_optional.get("DO_NOT_DRIVE"), Some(&1));
        assert_eq!(report.missing_optional.get("PARK_OUTSIDE"), Some(&2));
        assert_eq!(report.id_check.as_ref().unwrap().column, "record_id");
    }

    #[test]
    fn test_sealed_report_survives_serialization() {
        let ingestor = ingestor();
        let mut report = observe_all(&ingestor, &[&["1", "X", "2020", "20200101"], &["1", "X", "2020", "20200101"]]);
        report.seal();
        let json = serde_json::to_string(&report).unwrap();
        let loaded: ValidationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.duplicate_row_count(), Some(1));
    }
}
