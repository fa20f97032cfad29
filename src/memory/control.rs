// ============================================================================
// Transaction control statements understood by the loopback engine
// ============================================================================

use lazy_static::lazy_static;
use regex::Regex;

use crate::core::Result;
use crate::sql::{StatementKind, classify, normalize};
use crate::transaction::IsolationLevel;

lazy_static! {
    static ref LEVEL_RE: Regex = Regex::new(
        r"ISOLATION\s+LEVEL\s+(READ\s+UNCOMMITTED|READ\s+COMMITTED|REPEATABLE\s+READ|SERIALIZABLE)"
    )
    .unwrap();
    static ref SESSION_SCOPE_RE: Regex = Regex::new(r"^SET\s+SESSION\s+").unwrap();
    static ref SAVEPOINT_RE: Regex = Regex::new(r"^SAVEPOINT\s+(\S+)$").unwrap();
    static ref RELEASE_RE: Regex = Regex::new(r"^RELEASE(?:\s+SAVEPOINT)?\s+(\S+)$").unwrap();
    static ref ROLLBACK_TO_NAME_RE: Regex = Regex::new(r"\s+TO\s+(?:SAVEPOINT\s+)?(\S+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Begin(Option<IsolationLevel>),
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
    SetIsolation {
        level: IsolationLevel,
        session_scope: bool,
    },
}

/// Parse a transaction control statement; `None` for everything else.
pub(crate) fn parse(sql: &str) -> Result<Option<Control>> {
    let normalized = normalize(sql);

    let control = match classify(&normalized) {
        StatementKind::Begin => Some(Control::Begin(level_of(&normalized)?)),
        StatementKind::Commit => Some(Control::Commit),
        StatementKind::Rollback => Some(Control::Rollback),
        StatementKind::RollbackToSavepoint => {
            ROLLBACK_TO_NAME_RE
                .captures(&normalized)
                .map(|caps| Control::RollbackTo(savepoint_name(&caps[1])))
        }
        StatementKind::IsolationLevel => match level_of(&normalized)? {
            Some(level) => Some(Control::SetIsolation {
                level,
                session_scope: SESSION_SCOPE_RE.is_match(&normalized),
            }),
            None => None,
        },
        StatementKind::Other => {
            if let Some(caps) = SAVEPOINT_RE.captures(&normalized) {
                Some(Control::Savepoint(savepoint_name(&caps[1])))
            } else {
                RELEASE_RE
                    .captures(&normalized)
                    .map(|caps| Control::Release(savepoint_name(&caps[1])))
            }
        }
    };

    Ok(control)
}

fn level_of(normalized: &str) -> Result<Option<IsolationLevel>> {
    LEVEL_RE
        .captures(normalized)
        .map(|caps| caps[1].parse::<IsolationLevel>())
        .transpose()
}

fn savepoint_name(raw: &str) -> String {
    raw.trim_matches('"').to_lowercase()
}
