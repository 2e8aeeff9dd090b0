// ABOUTME: Typed appointment records and snapshots keyed by record identifier
// ABOUTME: Validates identifiers at ingestion and flags data-quality issues

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{SyncError, SyncResult};

/// Flat-object key holding the record identifier.
pub const ID_KEY: &str = "Registro";
/// Flat-object key holding the creation-stage marker.
pub const CREATED_KEY: &str = "FechaAlta";
/// Flat-object key holding the last-modification marker.
pub const MODIFIED_KEY: &str = "CitMod";

/// A row as returned by a source: column name to stringified value.
pub type RawRow = HashMap<String, String>;

/// Which source columns carry the identifier and the two markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub id: String,
    pub created: String,
    pub modified: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            id: ID_KEY.to_string(),
            created: CREATED_KEY.to_string(),
            modified: MODIFIED_KEY.to_string(),
        }
    }
}

/// Informational label derived from the two markers.
///
/// Never used to decide novelty or persistence; absence from the previous
/// snapshot is what makes a record new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLabel {
    /// Markers equal: looks like a fresh booking
    Fresh,
    /// Markers differ: edited at least once since creation
    Edited,
}

impl std::fmt::Display for RecordLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordLabel::Fresh => f.write_str("fresh"),
            RecordLabel::Edited => f.write_str("edited"),
        }
    }
}

/// One appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, serde_json::Value>",
    into = "BTreeMap<String, serde_json::Value>"
)]
pub struct Record {
    id: String,
    pub created_marker: String,
    pub modified_marker: String,
    /// Business fields by name (date, time, status, treatment, provider, notes, phone, ...)
    pub fields: BTreeMap<String, String>,
}

impl Record {
    /// Build a record, rejecting an empty identifier.
    pub fn new(
        id: impl Into<String>,
        created_marker: impl Into<String>,
        modified_marker: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> SyncResult<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(SyncError::InvalidRecord(
                "record identifier is empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            created_marker: created_marker.into(),
            modified_marker: modified_marker.into(),
            fields,
        })
    }

    /// Convert a raw source row using the configured column mapping.
    ///
    /// Every column other than the identifier and the markers becomes a
    /// business field under its own name.
    pub fn from_raw(row: &RawRow, columns: &ColumnMapping) -> SyncResult<Self> {
        let id = row.get(&columns.id).map(String::as_str).unwrap_or("");
        if id.trim().is_empty() {
            return Err(SyncError::InvalidRecord(format!(
                "missing identifier column '{}'",
                columns.id
            )));
        }

        let fields = row
            .iter()
            .filter(|(name, _)| {
                **name != columns.id && **name != columns.created && **name != columns.modified
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self::new(
            id,
            row.get(&columns.created).cloned().unwrap_or_default(),
            row.get(&columns.modified).cloned().unwrap_or_default(),
            fields,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> RecordLabel {
        if self.created_marker == self.modified_marker {
            RecordLabel::Fresh
        } else {
            RecordLabel::Edited
        }
    }

    /// Business field value, empty when absent.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    /// Value for a flat column name, resolving the identifier and marker keys.
    pub fn value_for(&self, column: &str) -> &str {
        match column {
            ID_KEY => &self.id,
            CREATED_KEY => &self.created_marker,
            MODIFIED_KEY => &self.modified_marker,
            other => self.field(other),
        }
    }

    /// Short human description used in run logs.
    pub fn summary(&self) -> String {
        let name = format!("{} {}", self.field("Nombre"), self.field("Apellidos"));
        format!(
            "{}: {} - {} {} ({})",
            self.id,
            name.trim(),
            self.field("Fecha"),
            self.field("Hora"),
            self.field("EstadoCita")
        )
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

impl TryFrom<BTreeMap<String, serde_json::Value>> for Record {
    type Error = SyncError;

    fn try_from(mut flat: BTreeMap<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let id = flat.remove(ID_KEY).map(value_to_string).unwrap_or_default();
        let created = flat
            .remove(CREATED_KEY)
            .map(value_to_string)
            .unwrap_or_default();
        let modified = flat
            .remove(MODIFIED_KEY)
            .map(value_to_string)
            .unwrap_or_default();
        let fields = flat
            .into_iter()
            .map(|(k, v)| (k, value_to_string(v)))
            .collect();
        Record::new(id, created, modified, fields)
    }
}

impl From<Record> for BTreeMap<String, serde_json::Value> {
    fn from(record: Record) -> Self {
        let mut flat: BTreeMap<String, serde_json::Value> = record
            .fields
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        flat.insert(ID_KEY.to_string(), record.id.into());
        flat.insert(CREATED_KEY.to_string(), record.created_marker.into());
        flat.insert(MODIFIED_KEY.to_string(), record.modified_marker.into());
        flat
    }
}

/// A data-quality problem found while building a snapshot. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQualityIssue {
    /// The same identifier appeared more than once; the last row won
    DuplicateId(String),
    /// Row at this 0-based position had no identifier and was rejected
    MissingId { row_index: usize },
}

impl std::fmt::Display for DataQualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQualityIssue::DuplicateId(id) => {
                write!(f, "duplicate identifier '{}' (last row wins)", id)
            }
            DataQualityIssue::MissingId { row_index } => {
                write!(f, "row {} has no identifier and was rejected", row_index)
            }
        }
    }
}

/// A point-in-time set of records keyed by identifier, in source order.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: Vec<Record>,
    index: HashMap<String, usize>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            captured_at: chrono::Utc::now(),
        }
    }

    /// Build a snapshot from records, last-seen-wins on duplicate identifiers.
    ///
    /// A replaced record keeps the position of its first occurrence.
    pub fn from_records(
        records: impl IntoIterator<Item = Record>,
    ) -> (Self, Vec<DataQualityIssue>) {
        let mut snapshot = Self::empty();
        let mut issues = Vec::new();
        for record in records {
            if let Some(replaced) = snapshot.insert(record) {
                issues.push(DataQualityIssue::DuplicateId(replaced.id));
            }
        }
        (snapshot, issues)
    }

    /// Ingest raw source rows, rejecting rows without an identifier.
    pub fn from_raw_rows(rows: &[RawRow], columns: &ColumnMapping) -> (Self, Vec<DataQualityIssue>) {
        let mut issues = Vec::new();
        let records: Vec<Record> = rows
            .iter()
            .enumerate()
            .filter_map(|(row_index, row)| match Record::from_raw(row, columns) {
                Ok(record) => Some(record),
                Err(_) => {
                    issues.push(DataQualityIssue::MissingId { row_index });
                    None
                }
            })
            .collect();

        let (snapshot, duplicates) = Self::from_records(records);
        issues.extend(duplicates);
        (snapshot, issues)
    }

    /// Insert a record, returning the record it replaced if the id was present.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        match self.index.get(record.id()) {
            Some(&pos) => Some(std::mem::replace(&mut self.records[pos], record)),
            None => {
                self.index.insert(record.id.clone(), self.records.len());
                self.records.push(record);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(Record::id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn with_captured_at(mut self, captured_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(id: &str, hora: &str) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("Hora".to_string(), hora.to_string());
        Record::new(id, "t1", "t1", fields).unwrap()
    }

    #[test]
    fn test_record_rejects_empty_id() {
        assert!(Record::new("  ", "t1", "t1", BTreeMap::new()).is_err());
        assert!(Record::new("", "t1", "t1", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_record_from_raw() {
        let row = raw(&[
            ("Registro", "42"),
            ("FechaAlta", "2025-01-01 10:00:00"),
            ("CitMod", "2025-01-02 09:00:00"),
            ("Fecha", "2025-02-01"),
            ("Hora", "09:30"),
        ]);
        let rec = Record::from_raw(&row, &ColumnMapping::default()).unwrap();
        assert_eq!(rec.id(), "42");
        assert_eq!(rec.label(), RecordLabel::Edited);
        assert_eq!(rec.field("Hora"), "09:30");
        assert_eq!(rec.fields.len(), 2);
        assert_eq!(rec.value_for("CitMod"), "2025-01-02 09:00:00");
        assert_eq!(rec.value_for("Notas"), "");
    }

    #[test]
    fn test_record_from_raw_custom_mapping() {
        let columns = ColumnMapping {
            id: "IdCita".to_string(),
            created: "FecAlta".to_string(),
            modified: "HorSitCita".to_string(),
        };
        let row = raw(&[("IdCita", "7"), ("FecAlta", "t"), ("HorSitCita", "t")]);
        let rec = Record::from_raw(&row, &columns).unwrap();
        assert_eq!(rec.id(), "7");
        assert_eq!(rec.label(), RecordLabel::Fresh);
        assert!(rec.fields.is_empty());
    }

    #[test]
    fn test_record_from_raw_missing_id() {
        let row = raw(&[("FechaAlta", "t1"), ("CitMod", "t1")]);
        let err = Record::from_raw(&row, &ColumnMapping::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));
    }

    #[test]
    fn test_snapshot_duplicate_last_wins() {
        let (snapshot, issues) =
            Snapshot::from_records(vec![record("1", "09:00"), record("2", "10:00"), record("1", "11:00")]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("1").unwrap().field("Hora"), "11:00");
        // Position of first occurrence is kept
        assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(issues, vec![DataQualityIssue::DuplicateId("1".to_string())]);
    }

    #[test]
    fn test_snapshot_from_raw_rows_flags_missing_id() {
        let rows = vec![
            raw(&[("Registro", "1"), ("FechaAlta", "t"), ("CitMod", "t")]),
            raw(&[("Registro", ""), ("FechaAlta", "t"), ("CitMod", "t")]),
        ];
        let (snapshot, issues) = Snapshot::from_raw_rows(&rows, &ColumnMapping::default());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(issues, vec![DataQualityIssue::MissingId { row_index: 1 }]);
    }

    #[test]
    fn test_record_flat_json() {
        let json = serde_json::json!({
            "Registro": 1234,
            "FechaAlta": "2025-01-01 10:00:00",
            "CitMod": "2025-01-01 10:00:00",
            "Hora": "10:30",
            "Notas": null
        });
        let rec: Record = serde_json::from_value(json).unwrap();
        assert_eq!(rec.id(), "1234");
        assert_eq!(rec.field("Notas"), "");
        assert_eq!(rec.label(), RecordLabel::Fresh);

        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["Registro"], "1234");
        assert_eq!(back["Hora"], "10:30");
    }

    #[test]
    fn test_record_flat_json_without_id_is_rejected() {
        let json = serde_json::json!({ "FechaAlta": "t", "CitMod": "t" });
        assert!(serde_json::from_value::<Record>(json).is_err());
    }
}
