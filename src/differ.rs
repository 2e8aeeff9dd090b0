// ABOUTME: Record differ - classifies current records against the previous snapshot
// ABOUTME: Produces new/updated/unchanged/pruned sets using a fixed comparison field set

use serde::Serialize;
use std::collections::HashSet;

use crate::record::{Record, RecordLabel, Snapshot};

/// Fields compared to decide whether a known record was updated.
///
/// Volatile fields (markers, insertion timestamps, patient number) are left out
/// so that no-op writes in the source do not show up as updates.
pub const DEFAULT_COMPARE_FIELDS: &[&str] = &[
    "Fecha",
    "Hora",
    "EstadoCita",
    "Tratamiento",
    "Odontologo",
    "Notas",
    "TelMovil",
];

/// A classified current record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEntry {
    pub id: String,
    pub label: RecordLabel,
    /// First differing comparison field, set for updated records only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

/// Classification of a current snapshot relative to a previous one.
///
/// The four sets are disjoint. `new`, `updated` and `unchanged` keep the
/// current snapshot's order; `pruned` keeps the previous snapshot's order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub new: Vec<ChangeEntry>,
    pub updated: Vec<ChangeEntry>,
    pub unchanged: Vec<String>,
    pub pruned: Vec<String>,
}

impl ChangeSet {
    pub fn new_ids(&self) -> Vec<&str> {
        self.new.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn updated_ids(&self) -> Vec<&str> {
        self.updated.iter().map(|e| e.id.as_str()).collect()
    }

    /// True when nothing was added, updated or removed.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.pruned.is_empty()
    }

    /// Total number of classified current records.
    pub fn current_count(&self) -> usize {
        self.new.len() + self.updated.len() + self.unchanged.len()
    }
}

/// Compares snapshots over a configurable field set.
#[derive(Debug, Clone)]
pub struct RecordDiffer {
    compare_fields: Vec<String>,
}

impl Default for RecordDiffer {
    fn default() -> Self {
        Self::new(DEFAULT_COMPARE_FIELDS.iter().map(|s| s.to_string()).collect())
    }
}

impl RecordDiffer {
    pub fn new(compare_fields: Vec<String>) -> Self {
        Self { compare_fields }
    }

    pub fn compare_fields(&self) -> &[String] {
        &self.compare_fields
    }

    /// First comparison field whose trimmed values differ.
    pub fn first_difference(&self, previous: &Record, current: &Record) -> Option<FieldChange> {
        self.compare_fields.iter().find_map(|field| {
            let old = previous.field(field).trim();
            let new = current.field(field).trim();
            (old != new).then(|| FieldChange {
                field: field.clone(),
                old: old.to_string(),
                new: new.to_string(),
            })
        })
    }

    /// Classify every current record and collect pruned identifiers.
    ///
    /// Absence from `previous` is the only novelty test; the marker label is
    /// carried along for logging.
    pub fn diff(&self, current: &Snapshot, previous: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for record in current.records() {
            let id = record.id().to_string();
            let label = record.label();

            match previous.get(&id) {
                None => {
                    tracing::debug!("New appointment ({}): {}", label, record.summary());
                    changes.new.push(ChangeEntry {
                        id,
                        label,
                        change: None,
                    });
                }
                Some(prev) => match self.first_difference(prev, record) {
                    Some(change) => {
                        tracing::debug!(
                            "Updated appointment ({}): {} - field '{}' changed: '{}' -> '{}'",
                            label,
                            record.summary(),
                            change.field,
                            change.old,
                            change.new
                        );
                        changes.updated.push(ChangeEntry {
                            id,
                            label,
                            change: Some(change),
                        });
                    }
                    None => changes.unchanged.push(id),
                },
            }
        }

        let current_ids: HashSet<&str> = current.ids().collect();
        changes.pruned = previous
            .ids()
            .filter(|id| !current_ids.contains(id))
            .map(str::to_string)
            .collect();

        if current.is_empty() && !previous.is_empty() {
            tracing::warn!(
                "Source returned no appointments; all {} previous records are pruned",
                previous.len()
            );
        }

        changes
    }
}

/// Diff with the default comparison field set.
pub fn diff(current: &Snapshot, previous: &Snapshot) -> ChangeSet {
    RecordDiffer::default().diff(current, previous)
}
