use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Column order assumed by `INSERT INTO bookings VALUES (...)` without a column list.
const INSERT_POSITIONAL: [&str; 8] = [
    "id",
    "resident_id",
    "resident_name",
    "resident_email",
    "amenity_id",
    "booking_date",
    "start_time",
    "end_time",
];

/// Unvalidated booking filter from a SELECT's WHERE clause. Dates stay raw
/// so the admission parser reports malformed ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectFilter {
    pub id: Option<Ulid>,
    pub resident_id: Option<String>,
    pub amenity_id: Option<String>,
    pub booking_date: Option<String>,
    pub status: Option<BookingStatus>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        id: Option<Ulid>,
        resident_id: String,
        resident_name: String,
        resident_email: String,
        amenity_id: String,
        booking_date: String,
        time: TimeRange,
    },
    UpdateBooking {
        id: Ulid,
        status: Option<BookingStatus>,
        time: Option<TimeRange>,
        resident_name: Option<String>,
        resident_email: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: SelectFilter,
    },
}

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

fn expect_bookings(table: String) -> Result<(), SqlError> {
    if table == "bookings" {
        Ok(())
    } else {
        Err(SqlError::UnknownTable(table))
    }
}

/// Time fields as they appear in a column list or SET clause.
#[derive(Default)]
struct TimeColumns {
    start_time: Option<String>,
    end_time: Option<String>,
    booking_time: Option<String>,
}

impl TimeColumns {
    fn set(&mut self, column: &str, value: String) -> bool {
        match column {
            "start_time" => self.start_time = Some(value),
            "end_time" => self.end_time = Some(value),
            "booking_time" => self.booking_time = Some(value),
            _ => return false,
        }
        true
    }

    /// Separate start/end win over the legacy combined string.
    fn into_range(self) -> Result<Option<TimeRange>, SqlError> {
        match (self.start_time, self.end_time, self.booking_time) {
            (Some(start), Some(end), _) => Ok(Some(TimeRange::Split { start, end })),
            (None, None, Some(combined)) => Ok(Some(TimeRange::Combined(combined))),
            (None, None, None) => Ok(None),
            (Some(_), None, _) => Err(SqlError::MissingColumn("end_time")),
            (None, Some(_), _) => Err(SqlError::MissingColumn("start_time")),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    expect_bookings(insert_table_name(insert)?)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_POSITIONAL.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let mut id = None;
    let (mut resident_id, mut amenity_id, mut booking_date) = (None, None, None);
    let (mut resident_name, mut resident_email) = (None, None);
    let mut time = TimeColumns::default();
    for (column, expr) in columns.iter().zip(&values) {
        match column.as_str() {
            "id" => id = parse_ulid_or_null(expr)?,
            "resident_id" => resident_id = Some(parse_string(expr)?),
            "resident_name" => resident_name = Some(parse_string(expr)?),
            "resident_email" => resident_email = Some(parse_string(expr)?),
            "amenity_id" => amenity_id = Some(parse_string(expr)?),
            "booking_date" | "date" => booking_date = Some(parse_string(expr)?),
            other => {
                if !time.set(other, parse_string(expr)?) {
                    return Err(SqlError::UnknownColumn(other.to_string()));
                }
            }
        }
    }

    Ok(Command::InsertBooking {
        id,
        resident_id: resident_id.ok_or(SqlError::MissingColumn("resident_id"))?,
        resident_name: resident_name.ok_or(SqlError::MissingColumn("resident_name"))?,
        resident_email: resident_email.ok_or(SqlError::MissingColumn("resident_email"))?,
        amenity_id: amenity_id.ok_or(SqlError::MissingColumn("amenity_id"))?,
        booking_date: booking_date.ok_or(SqlError::MissingColumn("booking_date"))?,
        time: time.into_range()?.ok_or(SqlError::MissingColumn("start_time"))?,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    expect_bookings(table_factor_name(relation)?)?;
    let id = extract_where_id(selection)?;

    let mut status = None;
    let (mut resident_name, mut resident_email) = (None, None);
    let mut time = TimeColumns::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = parse_string(&assignment.value)?;
        match column.as_str() {
            "status" => status = Some(parse_status(&value)?),
            "resident_name" => resident_name = Some(value),
            "resident_email" => resident_email = Some(value),
            other => {
                // Only status, time and contact may change after creation.
                if !time.set(other, value) {
                    return Err(SqlError::UnknownColumn(other.to_string()));
                }
            }
        }
    }

    let time = time.into_range()?;
    if status.is_none() && time.is_none() && resident_name.is_none() && resident_email.is_none() {
        return Err(SqlError::Parse("UPDATE sets nothing".into()));
    }
    Ok(Command::UpdateBooking {
        id,
        status,
        time,
        resident_name,
        resident_email,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    expect_bookings(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBooking { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    expect_bookings(table_factor_name(&select.from[0].relation)?)?;

    let mut filter = SelectFilter::default();
    if let Some(selection) = &select.selection {
        extract_booking_filters(selection, &mut filter)?;
    }
    Ok(Command::SelectBookings { filter })
}

/// Walk an AND-chain of `column = value` terms.
fn extract_booking_filters(expr: &Expr, filter: &mut SelectFilter) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_booking_filters(left, filter)?;
            extract_booking_filters(right, filter)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            match column.as_str() {
                "id" => filter.id = Some(parse_ulid_expr(right)?),
                "resident_id" => filter.resident_id = Some(parse_string(right)?),
                "amenity_id" => filter.amenity_id = Some(parse_string(right)?),
                "booking_date" => filter.booking_date = Some(parse_string(right)?),
                "status" => filter.status = Some(parse_status(&parse_string(right)?)?),
                _ => return Err(SqlError::UnknownColumn(column)),
            }
            Ok(())
        }
        Expr::Nested(inner) => extract_booking_filters(inner, filter),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
            _ => Err(SqlError::Unsupported("multi-row INSERT; admit bookings one at a time".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected value, got {expr}"))),
    }
}

fn parse_status(s: &str) -> Result<BookingStatus, SqlError> {
    BookingStatus::parse(s).ok_or_else(|| SqlError::InvalidValue(format!("unknown status '{s}'")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown or read-only column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
