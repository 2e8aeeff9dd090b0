// ABOUTME: Fixed column layout of the spreadsheet sink
// ABOUTME: Formats records into ordered rows and addresses rows in A1 notation

use crate::record::{Record, ID_KEY};

/// Default record columns, identifier first.
pub const DEFAULT_COLUMNS: &[&str] = &[
    "Registro",
    "CitMod",
    "FechaAlta",
    "NumPac",
    "Apellidos",
    "Nombre",
    "TelMovil",
    "Fecha",
    "Hora",
    "EstadoCita",
    "Tratamiento",
    "Odontologo",
    "Notas",
    "Duracion",
];

/// Synthetic trailing column written by the reconciler.
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "InsertedAt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    columns: Vec<String>,
    timestamp_column: Option<String>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            timestamp_column: Some(DEFAULT_TIMESTAMP_COLUMN.to_string()),
        }
    }
}

impl SheetLayout {
    /// Build a layout; the first column must be the identifier column.
    pub fn new(columns: Vec<String>, timestamp_column: Option<String>) -> Result<Self, String> {
        match columns.first() {
            Some(first) if first == ID_KEY => {}
            Some(first) => {
                return Err(format!(
                    "first sheet column must be '{}', got '{}'",
                    ID_KEY, first
                ))
            }
            None => return Err("sheet layout has no columns".to_string()),
        }
        Ok(Self {
            columns,
            timestamp_column,
        })
    }

    pub fn id_column(&self) -> &str {
        &self.columns[0]
    }

    /// Number of cells in a formatted row.
    pub fn width(&self) -> usize {
        self.columns.len() + usize::from(self.timestamp_column.is_some())
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = self.columns.clone();
        header.extend(self.timestamp_column.iter().cloned());
        header
    }

    /// Whether a scanned first row is this layout's header.
    pub fn is_header(&self, row: &[String]) -> bool {
        row.first().map(|c| c.trim()) == Some(self.id_column())
    }

    pub fn format_row(&self, record: &Record, written_at: &str) -> Vec<String> {
        let mut row: Vec<String> = self
            .columns
            .iter()
            .map(|column| record.value_for(column).to_string())
            .collect();
        if self.timestamp_column.is_some() {
            row.push(written_at.to_string());
        }
        row
    }

    /// A1 range covering one full row, e.g. `A7:O7`.
    pub fn row_range(&self, row: usize) -> String {
        a1_row_range(row, self.width())
    }
}

/// Spreadsheet column letters for a 1-based column number (1 = A, 27 = AA).
pub fn column_letter(mut column: usize) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let rem = (column - 1) % 26;
        letters.push(b'A' + rem as u8);
        column = (column - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

pub fn a1_row_range(row: usize, width: usize) -> String {
    format!("A{}:{}{}", row, column_letter(width.max(1)), row)
}

/// Trimmed first-column key of a scanned row, `None` when empty.
pub fn row_key(row: &[String]) -> Option<&str> {
    row.first().map(|c| c.trim()).filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_column_letter() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(15), "O");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(52), "AZ");
        assert_eq!(column_letter(703), "AAA");
    }

    #[test]
    fn test_default_layout_range() {
        let layout = SheetLayout::default();
        assert_eq!(layout.width(), 15);
        assert_eq!(layout.row_range(7), "A7:O7");
        assert_eq!(layout.header().last().unwrap(), "InsertedAt");
    }

    #[test]
    fn test_layout_requires_id_first() {
        assert!(SheetLayout::new(vec!["Hora".to_string()], None).is_err());
        assert!(SheetLayout::new(vec![], None).is_err());
        assert!(SheetLayout::new(vec!["Registro".to_string()], None).is_ok());
    }

    #[test]
    fn test_format_row() {
        let mut fields = BTreeMap::new();
        fields.insert("Hora".to_string(), "09:00".to_string());
        let record = Record::new("5", "a", "b", fields).unwrap();
        let layout = SheetLayout::new(
            vec![
                "Registro".to_string(),
                "CitMod".to_string(),
                "FechaAlta".to_string(),
                "Hora".to_string(),
                "Notas".to_string(),
            ],
            Some("InsertedAt".to_string()),
        )
        .unwrap();

        assert_eq!(
            layout.format_row(&record, "2025-01-01 12:00:00"),
            vec!["5", "b", "a", "09:00", "", "2025-01-01 12:00:00"]
        );
    }

    #[test]
    fn test_row_key() {
        assert_eq!(row_key(&[" 12 ".to_string()]), Some("12"));
        assert_eq!(row_key(&["  ".to_string()]), None);
        assert_eq!(row_key(&[]), None);
    }
}
