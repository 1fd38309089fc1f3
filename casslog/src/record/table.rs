//! Column-oriented decoded records.

use serde::Serialize;

/// Values of one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Column {
    /// Integer samples.
    Int(Vec<i64>),
    /// Floating-point samples.
    Float(Vec<f64>),
}

impl Column {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    /// Whether the column has no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&mut self, value: Value) {
        match (self, value) {
            (Self::Int(v), Value::Int(x)) => v.push(x),
            (Self::Float(v), Value::Float(x)) => v.push(x),
            (Self::Float(v), Value::Int(x)) => v.push(x as f64),
            (Self::Int(v), Value::Float(x)) => v.push(x as i64),
        }
    }

    /// Sample `i`.
    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            Self::Int(v) => v.get(i).copied().map(Value::Int),
            Self::Float(v) => v.get(i).copied().map(Value::Float),
        }
    }

    /// Integer samples, if this is an integer column.
    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Int(v) => Some(v.as_slice()),
            Self::Float(_) => None,
        }
    }

    /// Float samples, if this is a float column.
    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Self::Float(v) => Some(v.as_slice()),
            Self::Int(_) => None,
        }
    }
}

/// One sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer sample.
    Int(i64),
    /// Floating-point sample.
    Float(f64),
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedColumn {
    /// Column name.
    pub name: String,
    /// Samples.
    pub values: Column,
}

/// Decoded records, one row per record, columns in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedTable {
    columns: Vec<NamedColumn>,
}

impl DecodedTable {
    pub(crate) fn from_columns(columns: Vec<NamedColumn>) -> Self {
        Self { columns }
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.values)
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// All columns in order.
    pub fn columns(&self) -> &[NamedColumn] {
        &self.columns
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row `i`, in column order.
    pub fn row(&self, i: usize) -> Option<Vec<Value>> {
        if i >= self.len() {
            return None;
        }
        self.columns.iter().map(|c| c.values.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DecodedTable {
        DecodedTable::from_columns(vec![
            NamedColumn {
                name: "tmicros".into(),
                values: Column::Int(vec![0, 1000]),
            },
            NamedColumn {
                name: "t".into(),
                values: Column::Float(vec![0.0, 0.001]),
            },
        ])
    }

    #[test]
    fn test_lookup_and_rows() {
        let table = sample();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column_names(), vec!["tmicros", "t"]);
        assert_eq!(
            table.column("tmicros").and_then(Column::as_ints),
            Some(&[0, 1000][..])
        );
        assert!(table.column("t").and_then(Column::as_ints).is_none());
        assert_eq!(table.row(1), Some(vec![Value::Int(1000), Value::Float(0.001)]));
        assert_eq!(table.row(2), None);
    }

    #[test]
    fn test_empty_table() {
        let table = DecodedTable::default();
        assert!(table.is_empty());
        assert!(table.column_names().is_empty());
        assert_eq!(table.row(0), None);
    }

    #[test]
    fn test_serializes_as_named_columns() {
        let text = toml::to_string(&sample()).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();

        let columns = parsed["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0]["name"].as_str(), Some("tmicros"));
        assert_eq!(columns[0]["values"].as_array().unwrap().len(), 2);
        assert_eq!(columns[1]["values"][1].as_float(), Some(0.001));
    }
}
