use crate::error::{OmnidexError, OmnidexResult};
use serde::{Deserialize, Serialize};

/// Declared field types recovered at ingestion. Every field is stored as a
/// padded string on disk; the type governs key comparison and literal parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Int,
    Float,
    /// A "lat,lon" coordinate pair in one field.
    Geo2d,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    /// Maximum encoded byte width of the field, margin included.
    pub width: usize,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, width: usize) -> Self {
        Column {
            name: name.into(),
            data_type,
            width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema { columns }
    }

    /// Find the index of the column with the given name (case-insensitive).
    pub fn index_of(&self, name: &str) -> OmnidexResult<usize> {
        self.columns
            .iter()
            .position(|col| col.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| OmnidexError::UnknownField(name.to_string()))
    }

    pub fn column(&self, name: &str) -> OmnidexResult<&Column> {
        let idx = self.index_of(name)?;
        Ok(&self.columns[idx])
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn header_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Total record slot size: one live/tombstone byte plus the field widths.
    pub fn slot_size(&self) -> usize {
        1 + self.columns.iter().map(|c| c.width).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_of_is_case_insensitive() {
        let schema = Schema::new(vec![
            Column::new("Id", DataType::Int, 8),
            Column::new("name", DataType::Text, 20),
        ]);
        assert_eq!(schema.index_of("id").unwrap(), 0);
        assert_eq!(schema.index_of("NAME").unwrap(), 1);
        assert!(matches!(
            schema.index_of("missing"),
            Err(OmnidexError::UnknownField(_))
        ));
    }

    #[test]
    fn slot_size_counts_flag_byte() {
        let schema = Schema::new(vec![
            Column::new("a", DataType::Text, 10),
            Column::new("b", DataType::Text, 5),
        ]);
        assert_eq!(schema.slot_size(), 16);
    }
}
