use chrono::DateTime;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertShift {
        user_id: String,
        device: String,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    UpdateShift {
        id: Ulid,
        patch: ShiftPatch,
    },
    DeleteShift {
        id: Ulid,
    },
    SelectShift {
        id: Ulid,
    },
    SelectShiftsOnDevice {
        device: String,
    },
    /// Day identifier as written by the client; validated by the service.
    SelectBlocksByDay {
        raw: String,
    },
    SelectBlocksByMonth {
        raw: String,
    },
    SelectDevices,
}

/// Column order for `INSERT INTO shifts` without a column list.
const SHIFT_COLUMNS: [&str; 4] = ["user_id", "device", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "shifts" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        SHIFT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("shifts", columns.len(), values.len()));
    }

    let (mut user_id, mut device, mut start, mut end) = (None, None, None, None);
    for (col, value) in columns.iter().zip(&values) {
        match col.as_str() {
            "user_id" => user_id = Some(parse_string(value)?),
            "device" => device = Some(parse_string(value)?),
            "start" => start = Some(parse_instant(value)?),
            "end" => end = Some(parse_instant(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::InsertShift {
        user_id: user_id.ok_or(SqlError::MissingColumn("user_id"))?,
        device: device.ok_or(SqlError::MissingColumn("device"))?,
        start: start.ok_or(SqlError::MissingColumn("start"))?,
        end: end.ok_or(SqlError::MissingColumn("end"))?,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "shifts" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_eq(selection, "id", parse_ulid_expr)?;

    let mut patch = ShiftPatch::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match col.as_str() {
            "user_id" => patch.user_id = Some(parse_string(value)?),
            "device" => patch.device = Some(parse_string(value)?),
            "start" => patch.start = Some(parse_instant(value)?),
            "end" => patch.end = Some(parse_instant(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::UpdateShift { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "shifts" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_eq(&delete.selection, "id", parse_ulid_expr)?;
    Ok(Command::DeleteShift { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "devices" => Ok(Command::SelectDevices),
        "shifts" => {
            let (col, value) = single_eq_filter(&select.selection, &["id", "device"])?;
            match col.as_str() {
                "id" => Ok(Command::SelectShift {
                    id: parse_ulid_expr(value)?,
                }),
                _ => Ok(Command::SelectShiftsOnDevice {
                    device: parse_string(value)?,
                }),
            }
        }
        "shift_blocks" => {
            let (col, value) = single_eq_filter(&select.selection, &["day", "month"])?;
            let raw = parse_string(value)?;
            match col.as_str() {
                "day" => Ok(Command::SelectBlocksByDay { raw }),
                _ => Ok(Command::SelectBlocksByMonth { raw }),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `WHERE <col> = <value>` with `col` one of `allowed`.
fn single_eq_filter<'a>(
    selection: &'a Option<Expr>,
    allowed: &[&'static str],
) -> Result<(String, &'a Expr), SqlError> {
    let missing = || SqlError::MissingFilter(allowed[0]);
    match selection.as_ref().ok_or_else(missing)? {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left) {
            Some(col) if allowed.contains(&col.as_str()) => Ok((col, right.as_ref())),
            _ => Err(missing()),
        },
        _ => Err(missing()),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_eq<T>(
    selection: &Option<Expr>,
    column: &'static str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<T, SqlError> {
    let (_, value) = single_eq_filter(selection, &[column])?;
    parse(value)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// An instant is Unix milliseconds, either as a number or as an RFC 3339
/// string such as `'2024-02-03T09:00:00+09:00'`.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}"))),
            Value::SingleQuotedString(s) => match s.parse::<i64>() {
                Ok(ms) => Ok(ms),
                Err(_) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}"))),
            },
            _ => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_instant(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("timestamp out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
