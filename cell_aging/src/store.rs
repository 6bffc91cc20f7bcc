//! Metadata loading: the per-cycle summary table for every unit under test.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AgingError, TestRecord, TestType};

/// Positional layout of the metadata table.
pub const METADATA_COLUMNS: [&str; 10] = [
    "type",
    "start_time",
    "ambient_temperature",
    "unit_id",
    "cycle_id",
    "sample_uid",
    "detail_filename",
    "capacity",
    "re",
    "rct",
];

const COL_TYPE: usize = 0;
const COL_START_TIME: usize = 1;
const COL_AMBIENT: usize = 2;
const COL_UNIT: usize = 3;
const COL_CYCLE: usize = 4;
const COL_UID: usize = 5;
const COL_FILENAME: usize = 6;
const COL_CAPACITY: usize = 7;
const COL_RE: usize = 8;
const COL_RCT: usize = 9;

/// Units of the NASA randomized-usage set whose detail files or metadata are
/// known to be unusable. Callers opt in through [`Denylist::nasa_problem_units`].
pub const NASA_PROBLEM_UNITS: [&str; 9] = [
    "B0038", "B0039", "B0040", "B0041", "B0042", "B0043", "B0044", "B0050", "B0052",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Denylist {
    units: BTreeSet<String>,
}

impl Denylist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nasa_problem_units() -> Self {
        NASA_PROBLEM_UNITS.iter().copied().collect()
    }

    pub fn insert(&mut self, unit: impl Into<String>) -> bool {
        self.units.insert(unit.into())
    }

    pub fn extend(&mut self, other: &Denylist) {
        self.units.extend(other.units.iter().cloned());
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.units.contains(unit)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Denylist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            units: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub found: usize,
    pub expected: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_read: usize,
    pub rows_kept: usize,
    pub dropped_missing_key: usize,
    pub dropped_unknown_type: usize,
    /// Kept rows carrying each measurement.
    pub with_capacity: usize,
    pub with_re: usize,
    pub with_rct: usize,
    pub with_start_time: usize,
    /// Set when the column count differed from the expected layout and the
    /// best-effort positional mapping was used.
    pub degraded: Option<SchemaMismatch>,
}

impl LoadReport {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    fn count_kept(&mut self, record: &TestRecord) {
        self.rows_kept += 1;
        self.with_capacity += usize::from(record.capacity.is_some());
        self.with_re += usize::from(record.re.is_some());
        self.with_rct += usize::from(record.rct.is_some());
        self.with_start_time += usize::from(record.start_time.is_some());
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    units: BTreeMap<String, Vec<TestRecord>>,
    report: LoadReport,
}

impl Dataset {
    pub fn from_records(records: impl IntoIterator<Item = TestRecord>) -> Self {
        let mut units: BTreeMap<String, Vec<TestRecord>> = BTreeMap::new();
        let mut report = LoadReport::default();
        for record in records {
            report.rows_read += 1;
            report.count_kept(&record);
            units.entry(record.unit_id.clone()).or_default().push(record);
        }
        Self { units, report }
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn units(&self) -> &BTreeMap<String, Vec<TestRecord>> {
        &self.units
    }

    /// Every parsed unit, sorted, minus the denylisted ones.
    pub fn available_units(&self, denylist: &Denylist) -> Vec<String> {
        self.units
            .keys()
            .filter(|unit| !denylist.contains(unit))
            .cloned()
            .collect()
    }

    pub fn records_for(&self, unit: &str) -> Result<&[TestRecord], AgingError> {
        self.units
            .get(unit)
            .map(Vec::as_slice)
            .ok_or_else(|| AgingError::UnknownUnit(unit.to_string()))
    }

    pub fn type_counts(&self) -> BTreeMap<TestType, usize> {
        let mut counts = BTreeMap::new();
        for record in self.units.values().flatten() {
            *counts.entry(record.test_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.units.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

pub fn load_metadata_path(path: &Path) -> Result<Dataset, AgingError> {
    let file = File::open(path).map_err(|source| AgingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_metadata(file)
}

/// Parse the metadata table. Only framing errors of the source itself fail;
/// a column count other than [`METADATA_COLUMNS`] switches to a padded
/// positional mapping and is reported through [`LoadReport::degraded`].
pub fn load_metadata<R: Read>(reader: R) -> Result<Dataset, AgingError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let found = csv_reader.headers()?.len();
    let expected = METADATA_COLUMNS.len();
    let mut report = LoadReport::default();
    if found != expected {
        warn!(
            "metadata has {} columns, expected {}; using best-effort positional mapping",
            found, expected
        );
        report.degraded = Some(SchemaMismatch { found, expected });
    }
    let mapped = found.min(expected);

    let mut units: BTreeMap<String, Vec<TestRecord>> = BTreeMap::new();
    for row in csv_reader.records() {
        let row = row?;
        report.rows_read += 1;
        let field = |idx: usize| cell(&row, idx, mapped);

        let (raw_type, unit_id) = match (field(COL_TYPE), field(COL_UNIT)) {
            (Some(t), Some(u)) => (t, u),
            _ => {
                report.dropped_missing_key += 1;
                continue;
            }
        };
        let test_type = match TestType::parse(raw_type) {
            Some(t) => t,
            None => {
                debug!("dropping row with unrecognized test type '{}'", raw_type);
                report.dropped_unknown_type += 1;
                continue;
            }
        };

        let record = TestRecord {
            test_type,
            start_time: field(COL_START_TIME).and_then(parse_start_time),
            ambient_temperature: field(COL_AMBIENT).and_then(parse_number),
            unit_id: unit_id.to_string(),
            cycle_id: field(COL_CYCLE).and_then(parse_cycle_id),
            sample_uid: field(COL_UID).unwrap_or_default().to_string(),
            detail_filename: field(COL_FILENAME).unwrap_or_default().to_string(),
            capacity: field(COL_CAPACITY).and_then(parse_number),
            re: field(COL_RE).and_then(parse_number),
            rct: field(COL_RCT).and_then(parse_number),
        };
        report.count_kept(&record);
        units.entry(record.unit_id.clone()).or_default().push(record);
    }

    debug!(
        "metadata loaded: {} rows read, {} kept, {} units",
        report.rows_read,
        report.rows_kept,
        units.len()
    );
    Ok(Dataset { units, report })
}

fn cell(row: &csv::StringRecord, idx: usize, mapped: usize) -> Option<&str> {
    if idx >= mapped {
        return None;
    }
    row.get(idx).map(str::trim).filter(|s| !s.is_empty())
}

/// Coerce a numeric cell; anything unparsable or non-finite is null.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_cycle_id(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Some(id);
    }
    let value = parse_number(trimmed)?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` and the bracketed date-vector
/// form `[2010. 7. 21. 15. 0. 35.093]`.
pub(crate) fn parse_start_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return parse_date_vector(&trimmed[1..trimmed.len() - 1]);
    }
    None
}

fn parse_date_vector(inner: &str) -> Option<NaiveDateTime> {
    let parts: Vec<f64> = inner
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != 6 || parts.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return None;
    }
    let seconds = parts[5];
    let whole = seconds.trunc();
    let micros = ((seconds - whole) * 1_000_000.0).round().min(999_999.0);
    NaiveDate::from_ymd_opt(parts[0] as i32, parts[1] as u32, parts[2] as u32)?.and_hms_micro_opt(
        parts[3] as u32,
        parts[4] as u32,
        whole as u32,
        micros as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use std::io::Cursor;

    const HEADER: &str =
        "type,start_time,ambient_temperature,battery_id,test_id,uid,filename,Capacity,Re,Rct\n";

    fn load(text: &str) -> Dataset {
        load_metadata(Cursor::new(text.to_string())).unwrap()
    }

    #[test]
    fn loads_well_formed_metadata() {
        let text = format!(
            "{HEADER}\
             discharge,2008-04-02 15:25:41,24,B0005,1,2,00002.csv,1.856,,\n\
             impedance,2008-04-02 16:00:00,24,B0005,2,3,00003.csv,,0.056,0.201\n\
             charge,,24,B0006,0,1,00001.csv,,,\n"
        );
        let dataset = load(&text);
        assert!(!dataset.report().is_degraded());
        assert_eq!(dataset.report().rows_kept, 3);
        let b5 = dataset.records_for("B0005").unwrap();
        assert_eq!(b5.len(), 2);
        assert_eq!(b5[0].test_type, TestType::Discharge);
        assert_eq!(b5[0].capacity, Some(1.856));
        assert_eq!(b5[0].cycle_id, Some(1));
        assert_eq!(b5[0].detail_filename, "00002.csv");
        assert_eq!(b5[1].re, Some(0.056));
        assert_eq!(b5[1].rct, Some(0.201));
        assert_eq!(
            dataset.available_units(&Denylist::new()),
            vec!["B0005".to_string(), "B0006".to_string()]
        );
    }

    #[test]
    fn eight_columns_take_degraded_path_without_error() {
        let text = "type,start_time,ambient_temperature,battery_id,test_id,uid,filename,Capacity\n\
                    discharge,,24,B0005,1,2,00002.csv,1.8\n\
                    impedance,,24,B0005,2,3,00003.csv,\n";
        let dataset = load(text);
        assert_eq!(
            dataset.report().degraded,
            Some(SchemaMismatch {
                found: 8,
                expected: 10
            })
        );
        let rows = dataset.records_for("B0005").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].capacity, Some(1.8));
        assert_eq!(rows[1].re, None);
        assert_eq!(rows[1].rct, None);
    }

    #[test]
    fn short_rows_are_padded_under_full_header() {
        let text = format!(
            "{HEADER}\
             discharge,,24,B0005,1,2,00002.csv,1.8\n\
             impedance,,24,B0005,2,3\n"
        );
        let dataset = load(&text);
        assert!(!dataset.report().is_degraded());
        assert_eq!(dataset.report().rows_kept, 2);
        let rows = dataset.records_for("B0005").unwrap();
        assert_eq!(rows[0].capacity, Some(1.8));
        assert_eq!(rows[0].re, None);
        assert_eq!(rows[1].sample_uid, "3");
        assert_eq!(rows[1].detail_filename, "");
        assert_eq!(rows[1].rct, None);
    }

    #[test]
    fn quality_counters_track_present_measurements() {
        let text = format!(
            "{HEADER}\
             discharge,2008-04-02 15:25:41,24,B0005,1,2,a.csv,1.856,,\n\
             discharge,garbage,24,B0005,3,4,b.csv,n/a,,\n\
             impedance,[2008. 4. 2. 16. 0. 0.],24,B0005,2,3,c.csv,,0.056,0.201\n\
             impedance,,24,B0005,4,5,d.csv,,0.06,\n\
             rest,2008-04-02 15:25:41,24,B0005,5,6,e.csv,1.8,0.1,0.2\n"
        );
        let report = load(&text).report().clone();
        assert_eq!(report.rows_kept, 4);
        assert_eq!(report.with_capacity, 1);
        assert_eq!(report.with_re, 2);
        assert_eq!(report.with_rct, 1);
        assert_eq!(report.with_start_time, 2);

        let built = Dataset::from_records(load(&text).records_for("B0005").unwrap().to_vec());
        assert_eq!(built.report().with_re, 2);
        assert_eq!(built.report().rows_kept, 4);
    }

    #[test]
    fn extra_columns_are_ignored_but_reported() {
        let text = "type,start_time,ambient_temperature,battery_id,test_id,uid,filename,Capacity,Re,Rct,x\n\
                    discharge,,24,B0005,1,2,00002.csv,1.8,,,junk\n";
        let dataset = load(text);
        assert!(dataset.report().is_degraded());
        assert_eq!(dataset.records_for("B0005").unwrap()[0].capacity, Some(1.8));
    }

    #[test]
    fn rows_missing_type_or_unit_are_dropped() {
        let text = format!(
            "{HEADER}\
             ,,24,B0005,1,2,00002.csv,1.8,,\n\
             discharge,,24,,1,2,00002.csv,1.8,,\n\
             rest,,24,B0005,1,2,00002.csv,1.8,,\n\
             discharge,,24,B0005,1,2,00002.csv,1.8,,\n"
        );
        let dataset = load(&text);
        let report = dataset.report();
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.dropped_missing_key, 2);
        assert_eq!(report.dropped_unknown_type, 1);
        assert_eq!(report.rows_kept, 1);
    }

    #[test]
    fn unparsable_numbers_become_null() {
        let text = format!("{HEADER}impedance,,24,B0005,x,3,f.csv,n/a,(0.05+0j),0.2\n");
        let dataset = load(&text);
        let row = &dataset.records_for("B0005").unwrap()[0];
        assert_eq!(row.cycle_id, None);
        assert_eq!(row.capacity, None);
        assert_eq!(row.re, None);
        assert_eq!(row.rct, Some(0.2));
    }

    #[test]
    fn denylisted_unit_is_never_available() {
        let text = format!(
            "{HEADER}\
             discharge,,24,B0038,1,2,a.csv,1.8,,\n\
             discharge,,24,B0005,1,2,b.csv,1.8,,\n"
        );
        let dataset = load(&text);
        assert!(dataset.records_for("B0038").is_ok());
        let available = dataset.available_units(&Denylist::nasa_problem_units());
        assert_eq!(available, vec!["B0005".to_string()]);

        let custom: Denylist = ["B0005"].into_iter().collect();
        assert_eq!(dataset.available_units(&custom), vec!["B0038".to_string()]);
    }

    #[test]
    fn unknown_unit_is_an_error() {
        let dataset = load(HEADER);
        assert!(matches!(
            dataset.records_for("B0099"),
            Err(AgingError::UnknownUnit(_))
        ));
    }

    #[test]
    fn type_counts_cover_all_units() {
        let text = format!(
            "{HEADER}\
             discharge,,24,B0005,1,2,a.csv,1.8,,\n\
             charge,,24,B0005,0,1,b.csv,,,\n\
             discharge,,24,B0006,1,2,c.csv,1.7,,\n"
        );
        let counts = load(&text).type_counts();
        assert_eq!(counts.get(&TestType::Discharge), Some(&2));
        assert_eq!(counts.get(&TestType::Charge), Some(&1));
        assert_eq!(counts.get(&TestType::Impedance), None);
    }

    #[test]
    fn start_time_formats() {
        let vector = parse_start_time("[2010.       7.      21.      15.       0.      35.093]")
            .unwrap();
        assert_eq!((vector.year(), vector.month(), vector.day()), (2010, 7, 21));
        assert_eq!((vector.hour(), vector.minute(), vector.second()), (15, 0, 35));

        let plain = parse_start_time("2008-04-02 15:25:41").unwrap();
        assert_eq!(plain.day(), 2);
        assert!(parse_start_time("2008-04-02T15:25:41Z").is_some());
        assert!(parse_start_time("not a date").is_none());
        assert!(parse_start_time("[2010. 7. 21.]").is_none());
    }
}
