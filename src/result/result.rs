use serde::Serialize;

use crate::core::{Row, Value};

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows touched by INSERT / UPDATE / DELETE.
    pub affected_rows: Option<u64>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            affected_rows: None,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: Some(count),
            ..Self::default()
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn affected_rows(&self) -> Option<u64> {
        self.affected_rows
    }

    /// Look up a cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<&Value> {
        (0..self.rows.len())
            .filter_map(|i| self.get(i, column))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| {
                        (
                            name.clone(),
                            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_column() {
        let result = QueryResult::new(
            vec!["id".into(), "name".into()],
            vec![vec![Value::Integer(1), Value::Text("Test".into())]],
        );
        assert_eq!(result.get(0, "NAME"), Some(&Value::Text("Test".into())));
        assert_eq!(result.get(1, "name"), None);
        assert_eq!(result.column_values("id"), vec![&Value::Integer(1)]);
    }

    #[test]
    fn test_to_json() {
        let result = QueryResult::new(
            vec!["name".into()],
            vec![vec![Value::Text("Test".into())], vec![Value::Null]],
        );
        assert_eq!(
            result.to_json(),
            serde_json::json!([{ "name": "Test" }, { "name": null }])
        );
    }
}
