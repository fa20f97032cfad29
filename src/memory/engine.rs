// ============================================================================
// Loopback SQL engine: data statements over persistent tables
// ============================================================================
//
// Supports the statements integration tests typically issue: CREATE / DROP
// TABLE, INSERT ... VALUES, SELECT (single table, WHERE, LIMIT, COUNT(*)),
// UPDATE and DELETE. Tables live in `im` collections so a transaction frame
// and every savepoint snapshot are cheap clones. A frame also logs its row
// changes; COMMIT replays the log onto the committed tables, so rows other
// connections committed in the meantime survive.
//
// ============================================================================

use im::{HashMap as ImHashMap, Vector};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicU64};

use crate::core::{DbError, Result, Row, Value};
use crate::result::QueryResult;
use crate::sql::Query;

static NEXT_ROW_ID: AtomicU64 = AtomicU64::new(1);

fn next_row_id() -> u64 {
    NEXT_ROW_ID.fetch_add(1, atomic::Ordering::SeqCst)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub columns: Vec<String>,
    pub rows: Vector<Row>,
    /// Row identities, parallel to `rows`.
    ids: Vector<u64>,
}

impl Table {
    fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vector::new(),
            ids: Vector::new(),
        }
    }

    fn position(&self, table: &str, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DbError::ColumnNotFound(column.to_string(), table.to_string()))
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.ids.iter().position(|existing| *existing == id)
    }

    fn push(&mut self, id: u64, row: Row) {
        self.ids.push_back(id);
        self.rows.push_back(row);
    }
}

pub(crate) type Tables = ImHashMap<String, Table>;

/// One logged modification, replayed at COMMIT.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    CreateTable { name: String, columns: Vec<String> },
    DropTable { name: String },
    Insert { table: String, id: u64, row: Row },
    Update { table: String, id: u64, row: Row },
    Delete { table: String, id: u64 },
}

impl Change {
    /// Apply to `tables`. Rows or tables that vanished meanwhile are skipped.
    fn apply(&self, tables: &mut Tables) {
        match self {
            Change::CreateTable { name, columns } => {
                if !tables.contains_key(name) {
                    tables.insert(name.clone(), Table::new(columns.clone()));
                }
            }
            Change::DropTable { name } => {
                tables.remove(name);
            }
            Change::Insert { table, id, row } => {
                if let Some(t) = tables.get_mut(table) {
                    if t.columns.len() == row.len() && t.index_of(*id).is_none() {
                        t.push(*id, row.clone());
                    }
                }
            }
            Change::Update { table, id, row } => {
                if let Some(t) = tables.get_mut(table) {
                    if let Some(i) = t.index_of(*id) {
                        t.rows.set(i, row.clone());
                    }
                }
            }
            Change::Delete { table, id } => {
                if let Some(t) = tables.get_mut(table) {
                    if let Some(i) = t.index_of(*id) {
                        t.rows.remove(i);
                        t.ids.remove(i);
                    }
                }
            }
        }
    }
}

/// A working copy of the database plus the changes made to it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Frame {
    pub tables: Tables,
    pub changes: Vector<Change>,
}

impl Frame {
    pub fn from_committed(tables: &Tables) -> Self {
        Self {
            tables: tables.clone(),
            changes: Vector::new(),
        }
    }

    /// Replay this frame's changes onto the current `committed` tables.
    pub fn publish(&self, committed: &mut Tables) {
        for change in self.changes.iter() {
            change.apply(committed);
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }
}

/// Execute one data statement against `frame`.
pub(crate) fn execute(frame: &mut Frame, query: &Query) -> Result<QueryResult> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, query.sql())
        .map_err(|e| DbError::ParseError(e.to_string()))?;

    if statements.len() != 1 {
        return Err(DbError::UnsupportedOperation(format!(
            "Expected exactly one statement, got {}",
            statements.len()
        )));
    }

    let mut binder = Binder::new(query.params());
    match statements.remove(0) {
        sql_ast::Statement::CreateTable(create) => create_table(frame, create),
        sql_ast::Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if let sql_ast::ObjectType::Table = object_type {
                drop_tables(frame, names, if_exists)
            } else {
                Err(DbError::UnsupportedOperation(format!(
                    "Only DROP TABLE supported, got: {:?}",
                    object_type
                )))
            }
        }
        sql_ast::Statement::Insert(insert) => insert_rows(frame, insert, &mut binder),
        sql_ast::Statement::Query(query) => select(frame, *query, &mut binder),
        sql_ast::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => update_rows(frame, table, assignments, selection, &mut binder),
        sql_ast::Statement::Delete(delete) => delete_rows(frame, delete, &mut binder),
        other => Err(DbError::UnsupportedOperation(format!(
            "Statement type not supported: {}",
            other
        ))),
    }
}

// ============================================================================
// DDL
// ============================================================================

fn create_table(frame: &mut Frame, create: sql_ast::CreateTable) -> Result<QueryResult> {
    let name = object_name(&create.name.to_string());
    if frame.tables.contains_key(&name) {
        if create.if_not_exists {
            return Ok(QueryResult::empty());
        }
        return Err(DbError::TableExists(name));
    }

    let columns: Vec<String> = create
        .columns
        .iter()
        .map(|col| col.name.value.to_lowercase())
        .collect();

    frame
        .tables
        .insert(name.clone(), Table::new(columns.clone()));
    frame.changes.push_back(Change::CreateTable { name, columns });
    Ok(QueryResult::empty())
}

fn drop_tables(
    frame: &mut Frame,
    names: Vec<sql_ast::ObjectName>,
    if_exists: bool,
) -> Result<QueryResult> {
    for name in names {
        let name = object_name(&name.to_string());
        if frame.tables.remove(&name).is_none() {
            if if_exists {
                continue;
            }
            return Err(DbError::TableNotFound(name));
        }
        frame.changes.push_back(Change::DropTable { name });
    }
    Ok(QueryResult::empty())
}

// ============================================================================
// DML
// ============================================================================

fn insert_rows(
    frame: &mut Frame,
    insert: sql_ast::Insert,
    binder: &mut Binder<'_>,
) -> Result<QueryResult> {
    let table_name = object_name(&insert.table.to_string());
    let table = frame.table(&table_name)?;
    let width = table.columns.len();

    let positions = if insert.columns.is_empty() {
        (0..width).collect::<Vec<_>>()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| table.position(&table_name, &ident.value.to_lowercase()))
            .collect::<Result<Vec<_>>>()?
    };

    let Some(source) = insert.source else {
        return Err(DbError::UnsupportedOperation(
            "INSERT requires a VALUES clause".into(),
        ));
    };
    let sql_ast::SetExpr::Values(values) = *source.body else {
        return Err(DbError::UnsupportedOperation(
            "Only VALUES clause supported".into(),
        ));
    };

    let mut new_rows = Vec::with_capacity(values.rows.len());
    for exprs in values.rows {
        if exprs.len() != positions.len() {
            return Err(DbError::ExecutionError(format!(
                "INSERT has {} expressions but {} target columns",
                exprs.len(),
                positions.len()
            )));
        }
        let mut row = vec![Value::Null; width];
        for (expr, &pos) in exprs.into_iter().zip(positions.iter()) {
            row[pos] = value_expr(expr, binder)?.eval(&RowContext::constant())?;
        }
        new_rows.push(row);
    }

    let count = new_rows.len() as u64;
    let table = frame.table_mut(&table_name)?;
    let mut log = Vec::with_capacity(new_rows.len());
    for row in new_rows {
        let id = next_row_id();
        table.push(id, row.clone());
        log.push(Change::Insert {
            table: table_name.clone(),
            id,
            row,
        });
    }
    frame.changes.extend(log);
    Ok(QueryResult::affected(count))
}

fn update_rows(
    frame: &mut Frame,
    target: sql_ast::TableWithJoins,
    assignments: Vec<sql_ast::Assignment>,
    selection: Option<sql_ast::Expr>,
    binder: &mut Binder<'_>,
) -> Result<QueryResult> {
    let table_name = match target.relation {
        sql_ast::TableFactor::Table { name, .. } => object_name(&name.to_string()),
        _ => {
            return Err(DbError::UnsupportedOperation(
                "Complex table references not supported in UPDATE".into(),
            ));
        }
    };
    let table = frame.table(&table_name)?;

    let sets = assignments
        .into_iter()
        .map(|assign| {
            let column = match assign.target {
                sql_ast::AssignmentTarget::ColumnName(col_name) => {
                    object_name(&col_name.to_string())
                }
                _ => {
                    return Err(DbError::UnsupportedOperation(
                        "Only simple column names supported in UPDATE".into(),
                    ));
                }
            };
            let pos = table.position(&table_name, &column)?;
            Ok((pos, value_expr(assign.value, binder)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let filter = selection.map(|expr| condition(expr, binder)).transpose()?;
    let columns = table.columns.clone();

    let mut updated = Vector::new();
    let mut log = Vec::new();
    for (id, row) in table.ids.iter().zip(table.rows.iter()) {
        let ctx = RowContext::new(&table_name, &columns, row);
        if !matches_filter(filter.as_ref(), &ctx)? {
            updated.push_back(row.clone());
            continue;
        }
        let mut new_row = row.clone();
        for (pos, expr) in &sets {
            new_row[*pos] = expr.eval(&ctx)?;
        }
        log.push(Change::Update {
            table: table_name.clone(),
            id: *id,
            row: new_row.clone(),
        });
        updated.push_back(new_row);
    }

    let count = log.len() as u64;
    frame.table_mut(&table_name)?.rows = updated;
    frame.changes.extend(log);
    Ok(QueryResult::affected(count))
}

fn delete_rows(
    frame: &mut Frame,
    delete: sql_ast::Delete,
    binder: &mut Binder<'_>,
) -> Result<QueryResult> {
    let tables = match delete.from {
        sql_ast::FromTable::WithFromKeyword(tables) | sql_ast::FromTable::WithoutKeyword(tables) => {
            tables
        }
    };
    let Some(first) = tables.into_iter().next() else {
        return Err(DbError::ParseError("DELETE requires a table name".into()));
    };
    let table_name = match first.relation {
        sql_ast::TableFactor::Table { name, .. } => object_name(&name.to_string()),
        _ => {
            return Err(DbError::UnsupportedOperation(
                "Complex table references not supported in DELETE".into(),
            ));
        }
    };

    let filter = delete
        .selection
        .map(|expr| condition(expr, binder))
        .transpose()?;
    let table = frame.table(&table_name)?;

    let mut kept = Vector::new();
    let mut kept_ids = Vector::new();
    let mut log = Vec::new();
    for (id, row) in table.ids.iter().zip(table.rows.iter()) {
        let ctx = RowContext::new(&table_name, &table.columns, row);
        if matches_filter(filter.as_ref(), &ctx)? {
            log.push(Change::Delete {
                table: table_name.clone(),
                id: *id,
            });
        } else {
            kept.push_back(row.clone());
            kept_ids.push_back(*id);
        }
    }

    let count = log.len() as u64;
    let table = frame.table_mut(&table_name)?;
    table.rows = kept;
    table.ids = kept_ids;
    frame.changes.extend(log);
    Ok(QueryResult::affected(count))
}

// ============================================================================
// SELECT
// ============================================================================

enum Projection {
    Column(usize),
    Count,
}

fn select(frame: &Frame, query: sql_ast::Query, binder: &mut Binder<'_>) -> Result<QueryResult> {
    if query.order_by.is_some() {
        return Err(DbError::UnsupportedOperation(
            "ORDER BY is not supported".into(),
        ));
    }
    let limit = limit_of(&query.limit_clause)?;

    let sql_ast::SetExpr::Select(select) = *query.body else {
        return Err(DbError::UnsupportedOperation(
            "Only SELECT queries supported".into(),
        ));
    };
    let select = *select;

    if select.from.is_empty() {
        return select_constants(select.projection, binder);
    }
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(DbError::UnsupportedOperation("Joins are not supported".into()));
    }

    let table_name = match &select.from[0].relation {
        sql_ast::TableFactor::Table { name, .. } => object_name(&name.to_string()),
        _ => {
            return Err(DbError::UnsupportedOperation(
                "Complex table references not supported".into(),
            ));
        }
    };
    let table = frame.table(&table_name)?;

    let mut names = Vec::new();
    let mut projection = Vec::new();
    for item in select.projection {
        match item {
            sql_ast::SelectItem::Wildcard(_) => {
                for (i, column) in table.columns.iter().enumerate() {
                    names.push(column.clone());
                    projection.push(Projection::Column(i));
                }
            }
            sql_ast::SelectItem::UnnamedExpr(expr) => {
                let (name, proj) = projection_of(&table_name, table, &expr)?;
                names.push(name);
                projection.push(proj);
            }
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => {
                let (_, proj) = projection_of(&table_name, table, &expr)?;
                names.push(alias.value);
                projection.push(proj);
            }
            other => {
                return Err(DbError::UnsupportedOperation(format!(
                    "Unsupported select item: {}",
                    other
                )));
            }
        }
    }

    let counting = projection.iter().any(|p| matches!(p, Projection::Count));
    if counting && projection.len() != 1 {
        return Err(DbError::UnsupportedOperation(
            "COUNT(*) cannot be combined with other columns".into(),
        ));
    }

    let filter = select
        .selection
        .map(|expr| condition(expr, binder))
        .transpose()?;

    let mut matched = Vec::new();
    for row in table.rows.iter() {
        let ctx = RowContext::new(&table_name, &table.columns, row);
        if matches_filter(filter.as_ref(), &ctx)? {
            matched.push(row);
        }
    }

    if counting {
        return Ok(QueryResult::new(
            names,
            vec![vec![Value::Integer(matched.len() as i64)]],
        ));
    }

    let rows = matched
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|row| {
            projection
                .iter()
                .map(|p| match p {
                    Projection::Column(i) => row[*i].clone(),
                    Projection::Count => Value::Null,
                })
                .collect()
        })
        .collect();

    Ok(QueryResult::new(names, rows))
}

fn projection_of(
    table_name: &str,
    table: &Table,
    expr: &sql_ast::Expr,
) -> Result<(String, Projection)> {
    match expr {
        sql_ast::Expr::Identifier(ident) => {
            let column = ident.value.to_lowercase();
            let pos = table.position(table_name, &column)?;
            Ok((column, Projection::Column(pos)))
        }
        sql_ast::Expr::CompoundIdentifier(idents) => {
            let column = idents
                .last()
                .map(|ident| ident.value.to_lowercase())
                .ok_or_else(|| DbError::ParseError("Empty column reference".into()))?;
            let pos = table.position(table_name, &column)?;
            Ok((column, Projection::Column(pos)))
        }
        sql_ast::Expr::Function(func) if func.name.to_string().eq_ignore_ascii_case("count") => {
            Ok(("count".to_string(), Projection::Count))
        }
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported projection: {}",
            other
        ))),
    }
}

fn select_constants(
    items: Vec<sql_ast::SelectItem>,
    binder: &mut Binder<'_>,
) -> Result<QueryResult> {
    let mut names = Vec::new();
    let mut row = Vec::new();
    for item in items {
        let (name, expr) = match item {
            sql_ast::SelectItem::UnnamedExpr(expr) => ("?column?".to_string(), expr),
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => (alias.value, expr),
            other => {
                return Err(DbError::UnsupportedOperation(format!(
                    "Unsupported select item without FROM: {}",
                    other
                )));
            }
        };
        names.push(name);
        row.push(value_expr(expr, binder)?.eval(&RowContext::constant())?);
    }
    Ok(QueryResult::new(names, vec![row]))
}

fn limit_of(limit_clause: &Option<sql_ast::LimitClause>) -> Result<Option<usize>> {
    let Some(clause) = limit_clause else {
        return Ok(None);
    };

    let limit = match clause {
        sql_ast::LimitClause::LimitOffset { limit, offset, .. } => {
            if offset.is_some() {
                return Err(DbError::UnsupportedOperation("OFFSET is not supported".into()));
            }
            match limit {
                Some(expr) => expr,
                None => return Ok(None),
            }
        }
        sql_ast::LimitClause::OffsetCommaLimit { .. } => {
            return Err(DbError::UnsupportedOperation("OFFSET is not supported".into()));
        }
    };

    match limit {
        sql_ast::Expr::Value(value_with_span) => match &value_with_span.value {
            sql_ast::Value::Number(n, _) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| DbError::ParseError(format!("Invalid LIMIT value: {}", n))),
            other => Err(DbError::UnsupportedOperation(format!(
                "Only numeric LIMIT supported, got: {}",
                other
            ))),
        },
        _ => Err(DbError::UnsupportedOperation(
            "Only numeric LIMIT supported".into(),
        )),
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Resolves `$n` and `?` placeholders against the query's parameters.
struct Binder<'a> {
    params: &'a [Value],
    next: usize,
}

impl<'a> Binder<'a> {
    fn new(params: &'a [Value]) -> Self {
        Self { params, next: 0 }
    }

    fn placeholder(&mut self, token: &str) -> Result<Value> {
        let index = if token == "?" {
            let index = self.next;
            self.next += 1;
            index
        } else {
            token
                .trim_start_matches('$')
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| DbError::ParseError(format!("Invalid placeholder: {}", token)))?
        };

        self.params.get(index).cloned().ok_or_else(|| {
            DbError::ExecutionError(format!("No value bound for parameter {}", token))
        })
    }
}

#[derive(Debug, Clone)]
enum ValueExpr {
    Column(String),
    Literal(Value),
    Arith(Box<ValueExpr>, ArithOp, Box<ValueExpr>),
}

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone)]
enum Condition {
    Compare(ValueExpr, CmpOp, ValueExpr),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    IsNull(ValueExpr, bool),
}

struct RowContext<'r> {
    table: &'r str,
    columns: &'r [String],
    row: Option<&'r Row>,
}

impl<'r> RowContext<'r> {
    fn new(table: &'r str, columns: &'r [String], row: &'r Row) -> Self {
        Self {
            table,
            columns,
            row: Some(row),
        }
    }

    fn constant() -> Self {
        Self {
            table: "",
            columns: &[],
            row: None,
        }
    }

    fn column(&self, name: &str) -> Result<Value> {
        let value = self
            .columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.row.and_then(|row| row.get(i)));
        value
            .cloned()
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string(), self.table.to_string()))
    }
}

fn literal(value: &sql_ast::Value, binder: &mut Binder<'_>) -> Result<Value> {
    match value {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Integer(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(DbError::TypeMismatch(format!("Invalid number: {}", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        sql_ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        sql_ast::Value::Null => Ok(Value::Null),
        sql_ast::Value::Placeholder(token) => binder.placeholder(token),
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported value: {}",
            other
        ))),
    }
}

fn value_expr(expr: sql_ast::Expr, binder: &mut Binder<'_>) -> Result<ValueExpr> {
    match expr {
        sql_ast::Expr::Identifier(ident) => Ok(ValueExpr::Column(ident.value.to_lowercase())),
        sql_ast::Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| ValueExpr::Column(ident.value.to_lowercase()))
            .ok_or_else(|| DbError::ParseError("Empty column reference".into())),
        sql_ast::Expr::Value(value_with_span) => {
            Ok(ValueExpr::Literal(literal(&value_with_span.value, binder)?))
        }
        sql_ast::Expr::Nested(inner) => value_expr(*inner, binder),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match value_expr(*expr, binder)? {
            ValueExpr::Literal(Value::Integer(i)) => Ok(ValueExpr::Literal(Value::Integer(-i))),
            ValueExpr::Literal(Value::Float(f)) => Ok(ValueExpr::Literal(Value::Float(-f))),
            other => Ok(ValueExpr::Arith(
                Box::new(ValueExpr::Literal(Value::Integer(0))),
                ArithOp::Sub,
                Box::new(other),
            )),
        },
        sql_ast::Expr::BinaryOp { left, op, right } => {
            let op = match op {
                sql_ast::BinaryOperator::Plus => ArithOp::Add,
                sql_ast::BinaryOperator::Minus => ArithOp::Sub,
                sql_ast::BinaryOperator::Multiply => ArithOp::Mul,
                other => {
                    return Err(DbError::UnsupportedOperation(format!(
                        "Unsupported operator in value expression: {}",
                        other
                    )));
                }
            };
            Ok(ValueExpr::Arith(
                Box::new(value_expr(*left, binder)?),
                op,
                Box::new(value_expr(*right, binder)?),
            ))
        }
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported expression: {}",
            other
        ))),
    }
}

fn condition(expr: sql_ast::Expr, binder: &mut Binder<'_>) -> Result<Condition> {
    match expr {
        sql_ast::Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                sql_ast::BinaryOperator::And => {
                    return Ok(Condition::And(
                        Box::new(condition(*left, binder)?),
                        Box::new(condition(*right, binder)?),
                    ));
                }
                sql_ast::BinaryOperator::Or => {
                    return Ok(Condition::Or(
                        Box::new(condition(*left, binder)?),
                        Box::new(condition(*right, binder)?),
                    ));
                }
                sql_ast::BinaryOperator::Eq => CmpOp::Eq,
                sql_ast::BinaryOperator::NotEq => CmpOp::NotEq,
                sql_ast::BinaryOperator::Lt => CmpOp::Lt,
                sql_ast::BinaryOperator::LtEq => CmpOp::LtEq,
                sql_ast::BinaryOperator::Gt => CmpOp::Gt,
                sql_ast::BinaryOperator::GtEq => CmpOp::GtEq,
                other => {
                    return Err(DbError::UnsupportedOperation(format!(
                        "Unsupported operator in WHERE: {}",
                        other
                    )));
                }
            };
            Ok(Condition::Compare(
                value_expr(*left, binder)?,
                cmp,
                value_expr(*right, binder)?,
            ))
        }
        sql_ast::Expr::Nested(inner) => condition(*inner, binder),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Not,
            expr,
        } => Ok(Condition::Not(Box::new(condition(*expr, binder)?))),
        sql_ast::Expr::IsNull(inner) => Ok(Condition::IsNull(value_expr(*inner, binder)?, true)),
        sql_ast::Expr::IsNotNull(inner) => {
            Ok(Condition::IsNull(value_expr(*inner, binder)?, false))
        }
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported WHERE expression: {}",
            other
        ))),
    }
}

impl ValueExpr {
    fn eval(&self, ctx: &RowContext<'_>) -> Result<Value> {
        match self {
            ValueExpr::Column(name) => ctx.column(name),
            ValueExpr::Literal(value) => Ok(value.clone()),
            ValueExpr::Arith(left, op, right) => arith(left.eval(ctx)?, *op, right.eval(ctx)?),
        }
    }
}

fn arith(left: Value, op: ArithOp, right: Value) -> Result<Value> {
    match (&left, &right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Integer(a), Value::Integer(b)) => {
            let result = match op {
                ArithOp::Add => a.checked_add(*b),
                ArithOp::Sub => a.checked_sub(*b),
                ArithOp::Mul => a.checked_mul(*b),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| DbError::ExecutionError("Integer overflow".into()))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let a = as_f64(&left);
            let b = as_f64(&right);
            Ok(Value::Float(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
            }))
        }
        _ => Err(DbError::TypeMismatch(format!(
            "Cannot apply arithmetic to {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

impl Condition {
    fn eval(&self, ctx: &RowContext<'_>) -> Result<bool> {
        match self {
            Condition::Compare(left, op, right) => {
                let left = left.eval(ctx)?;
                let right = right.eval(ctx)?;
                if left.is_null() || right.is_null() {
                    return Ok(false);
                }
                let ordering = left.compare(&right)?;
                Ok(match op {
                    CmpOp::Eq => ordering == Ordering::Equal,
                    CmpOp::NotEq => ordering != Ordering::Equal,
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::LtEq => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::GtEq => ordering != Ordering::Less,
                })
            }
            Condition::And(a, b) => Ok(a.eval(ctx)? && b.eval(ctx)?),
            Condition::Or(a, b) => Ok(a.eval(ctx)? || b.eval(ctx)?),
            Condition::Not(inner) => Ok(!inner.eval(ctx)?),
            Condition::IsNull(expr, want_null) => Ok(expr.eval(ctx)?.is_null() == *want_null),
        }
    }
}

fn matches_filter(filter: Option<&Condition>, ctx: &RowContext<'_>) -> Result<bool> {
    match filter {
        Some(condition) => condition.eval(ctx),
        None => Ok(true),
    }
}

/// Last segment of a possibly qualified name, unquoted and case-folded.
fn object_name(raw: &str) -> String {
    raw.rsplit('.')
        .next()
        .unwrap_or(raw)
        .trim_matches('"')
        .trim_matches('`')
        .to_lowercase()
}
