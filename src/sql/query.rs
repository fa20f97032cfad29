use std::fmt;

use super::classifier::{StatementKind, classify};
use crate::core::Value;

/// A statement sent through a connection: SQL text plus positional parameters.
///
/// Statements the sandbox synthesizes itself (SAVEPOINT, RELEASE SAVEPOINT,
/// ROLLBACK TO SAVEPOINT) carry the `virtualized` marker so observers can tell
/// them apart from application SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
    virtualized: bool,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            virtualized: false,
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            virtualized: false,
        }
    }

    /// Append one positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub(crate) fn virtualized(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            virtualized: true,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }

    pub fn kind(&self) -> StatementKind {
        classify(&self.sql)
    }
}

impl AsRef<str> for Query {
    fn as_ref(&self) -> &str {
        &self.sql
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}

impl From<&String> for Query {
    fn from(sql: &String) -> Self {
        Query::new(sql.as_str())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.sql)
        } else {
            write!(f, "{} -- params: {:?}", self.sql, self.params)
        }
    }
}
