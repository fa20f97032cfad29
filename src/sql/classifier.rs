// ============================================================================
// Statement classification
// ============================================================================
//
// Best-effort textual heuristic: the statement is trimmed, upper-cased and
// matched against fixed patterns. Text that merely looks like a control
// statement is classified as one; nothing here parses SQL.
//
// ============================================================================

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref BEGIN_RE: Regex = Regex::new(r"^(BEGIN|START\s+TRANSACTION)\b").unwrap();
    static ref COMMIT_RE: Regex = Regex::new(r"^COMMIT\b").unwrap();
    // Bare ROLLBACK must end the statement; "ROLLBACK TO SAVEPOINT sp_1" must not match.
    static ref ROLLBACK_RE: Regex = Regex::new(r"^ROLLBACK(\s+(WORK|TRANSACTION))?$").unwrap();
    static ref ROLLBACK_TO_RE: Regex =
        Regex::new(r"^ROLLBACK(\s+(WORK|TRANSACTION))?\s+TO\s+(SAVEPOINT\s+)?\S+$").unwrap();
    static ref ISOLATION_RE: Regex = Regex::new(r"TRANSACTION\s+ISOLATION\s+LEVEL").unwrap();
}

/// Kind of an outgoing statement, as far as transaction control is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    RollbackToSavepoint,
    IsolationLevel,
    Other,
}

impl StatementKind {
    /// True for statements that end a transaction (COMMIT or bare ROLLBACK).
    pub fn is_terminator(&self) -> bool {
        matches!(self, StatementKind::Commit | StatementKind::Rollback)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
            StatementKind::RollbackToSavepoint => "ROLLBACK_TO_SAVEPOINT",
            StatementKind::IsolationLevel => "ISOLATION_LEVEL",
            StatementKind::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Trim, drop a trailing `;` and upper-case.
pub fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim_end().to_uppercase()
}

/// Classify a statement given as plain text or as anything exposing its SQL.
pub fn classify(sql: impl AsRef<str>) -> StatementKind {
    let sql = normalize(sql.as_ref());

    if BEGIN_RE.is_match(&sql) {
        StatementKind::Begin
    } else if COMMIT_RE.is_match(&sql) {
        StatementKind::Commit
    } else if ROLLBACK_RE.is_match(&sql) {
        StatementKind::Rollback
    } else if ROLLBACK_TO_RE.is_match(&sql) {
        StatementKind::RollbackToSavepoint
    } else if ISOLATION_RE.is_match(&sql) {
        StatementKind::IsolationLevel
    } else {
        StatementKind::Other
    }
}
