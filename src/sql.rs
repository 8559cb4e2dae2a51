use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::TableId;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    ProvisionTable {
        table_id: TableId,
        capacity: u32,
    },
    Reserve {
        name: String,
        table_id: TableId,
        accompanying_guests: u32,
    },
    Arrive {
        name: String,
        accompanying_guests: u32,
    },
    Depart {
        name: String,
    },
    SelectGuestList,
    SelectGuest {
        name: String,
    },
    SelectArrivedGuests,
    SelectSeatsEmpty,
    SelectTables,
    SelectInvariantViolations,
}

// Column order assumed when an INSERT has no column list.
const TABLES_COLUMNS: &[&str] = &["table_id", "capacity"];
const GUEST_LIST_COLUMNS: &[&str] = &["name", "table_id", "accompanying_guests"];
const GUESTS_COLUMNS: &[&str] = &["name", "accompanying_guests"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let relation = insert_table_name(insert)?;
    match relation.as_str() {
        "tables" => {
            let row = insert_row(insert, TABLES_COLUMNS)?;
            Ok(Command::ProvisionTable {
                table_id: parse_u32(required(&row, "table_id")?)?,
                capacity: parse_u32(required(&row, "capacity")?)?,
            })
        }
        "guest_list" => {
            let row = insert_row(insert, GUEST_LIST_COLUMNS)?;
            Ok(Command::Reserve {
                name: parse_string(required(&row, "name")?)?,
                table_id: parse_u32(required(&row, "table_id")?)?,
                accompanying_guests: optional_u32(&row, "accompanying_guests")?,
            })
        }
        "guests" => {
            let row = insert_row(insert, GUESTS_COLUMNS)?;
            Ok(Command::Arrive {
                name: parse_string(required(&row, "name")?)?,
                accompanying_guests: optional_u32(&row, "accompanying_guests")?,
            })
        }
        _ => Err(SqlError::UnknownRelation(relation)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let relation = delete_table_name(delete)?;
    match relation.as_str() {
        "guests" => Ok(Command::Depart {
            name: extract_where_name(&delete.selection)?,
        }),
        "tables" | "guest_list" => Err(SqlError::Unsupported(format!(
            "DELETE FROM {relation}: rows are never removed"
        ))),
        _ => Err(SqlError::UnknownRelation(relation)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let relation = table_factor_name(&select.from[0].relation)?;

    if relation == "guest_list" && select.selection.is_some() {
        return Ok(Command::SelectGuest {
            name: extract_where_name(&select.selection)?,
        });
    }
    if select.selection.is_some() {
        return Err(SqlError::Unsupported(format!("WHERE on {relation}")));
    }

    match relation.as_str() {
        "guest_list" => Ok(Command::SelectGuestList),
        "guests" => Ok(Command::SelectArrivedGuests),
        "seats_empty" => Ok(Command::SelectSeatsEmpty),
        "tables" => Ok(Command::SelectTables),
        "invariant_violations" => Ok(Command::SelectInvariantViolations),
        _ => Err(SqlError::UnknownRelation(relation)),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// The single VALUES row of an INSERT, keyed by column name. Without a
/// column list, values are matched to `positional` in order.
fn insert_row(insert: &ast::Insert, positional: &[&str]) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        if row.len() > positional.len() {
            return Err(SqlError::WrongArity(positional.len(), row.len()));
        }
        positional.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != row.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    if let Some(unknown) = columns.iter().find(|c| !positional.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }

    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn column<'a>(row: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    row.iter().find(|(name, _)| name == col).map(|(_, expr)| expr)
}

fn required<'a>(row: &'a [(String, Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    column(row, col).ok_or(SqlError::MissingColumn(col))
}

/// Missing or NULL reads as 0.
fn optional_u32(row: &[(String, Expr)], col: &'static str) -> Result<u32, SqlError> {
    match column(row, col) {
        None => Ok(0),
        Some(expr) if matches!(extract_value(expr), Some(Value::Null)) => Ok(0),
        Some(expr) => parse_u32(expr),
    }
}

fn extract_where_name(selection: &Option<Expr>) -> Result<String, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("name"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("name") => parse_string(right),
        _ => Err(SqlError::MissingFilter("name")),
    }
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::OutOfRange(v))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown relation: {0}")]
    UnknownRelation(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0} is out of range for a non-negative count")]
    OutOfRange(i64),
}
