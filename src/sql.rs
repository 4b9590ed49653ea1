use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::clock::TimeInput;
use crate::model::*;

const AREA_COLUMNS: &[&str] = &[
    "id",
    "name",
    "capacity",
    "price_per_hour",
    "min_booking_hours",
    "max_booking_hours",
    "monthly_limit_per_unit",
    "auto_approve",
];
const RESERVATION_COLUMNS: &[&str] = &["id", "area_id", "owner_id", "start", "end", "reason"];
const BLOCK_COLUMNS: &[&str] = &["area_id", "day", "reason"];

/// How a `SELECT ... FROM reservations` narrows its rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationFilter {
    Id(Ulid),
    Owner(Ulid),
    /// Records of the area overlapping `[start, end)`.
    Area {
        area_id: Ulid,
        start: TimeInput,
        end: TimeInput,
    },
}

/// Parsed command from SQL input. Times are left as [`TimeInput`]; the wire
/// layer normalizes them with the condominium's clock.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertArea {
        id: Ulid,
        spec: AreaSpec,
    },
    UpdateArea {
        id: Ulid,
        patch: AreaPatch,
    },
    DeleteArea {
        id: Ulid,
    },
    SelectAreas {
        id: Option<Ulid>,
    },
    InsertReservation {
        id: Ulid,
        area_id: Ulid,
        owner_id: Option<Ulid>,
        start: TimeInput,
        end: TimeInput,
        reason: Option<String>,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: Status,
        note: Option<String>,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    InsertBlocks {
        area_ids: Vec<Ulid>,
        day: NaiveDate,
        reason: String,
    },
    DeleteBlocks {
        area_id: Ulid,
        day: NaiveDate,
    },
    SelectAvailability {
        area_id: Ulid,
        day: NaiveDate,
    },
    SelectCalendar {
        area_id: Ulid,
        day: NaiveDate,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').trim().to_string();
        return Ok(Command::Listen { channel });
    }

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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "areas" => {
            let row = single_row(insert, "areas", AREA_COLUMNS)?;
            let name = parse_string(row.required("name")?)?;
            let mut spec = AreaSpec::named(name);
            if let Some(e) = row.get("capacity") {
                spec.capacity = parse_u32(e)?;
            }
            if let Some(e) = row.get("price_per_hour") {
                spec.price_per_hour = parse_decimal(e)?;
            }
            if let Some(e) = row.get("min_booking_hours") {
                spec.min_booking_hours = parse_u32(e)?;
            }
            if let Some(e) = row.get("max_booking_hours") {
                spec.max_booking_hours = parse_u32(e)?;
            }
            if let Some(e) = row.get("monthly_limit_per_unit") {
                spec.monthly_limit_per_unit = parse_u32(e)?;
            }
            if let Some(e) = row.get("auto_approve") {
                spec.auto_approve = parse_bool(e)?;
            }
            Ok(Command::InsertArea {
                id: parse_ulid(row.required("id")?)?,
                spec,
            })
        }
        "reservations" => {
            let row = single_row(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("id")?)?,
                area_id: parse_ulid(row.required("area_id")?)?,
                owner_id: row.get("owner_id").map(parse_ulid_or_null).transpose()?.flatten(),
                start: parse_time(row.required("start")?)?,
                end: parse_time(row.required("end")?)?,
                reason: row.get("reason").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "blocks" => {
            let rows = named_rows(insert, "blocks", BLOCK_COLUMNS)?;
            let mut area_ids = Vec::with_capacity(rows.len());
            let mut shared: Option<(NaiveDate, String)> = None;
            for (i, row) in rows.iter().enumerate() {
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                area_ids.push(parse_ulid(row.required("area_id")?).map_err(at_row)?);
                let day = parse_day(row.required("day")?).map_err(at_row)?;
                let reason = parse_string(row.required("reason")?).map_err(at_row)?;
                if let Some((d, r)) = &shared {
                    if *d != day || *r != reason {
                        return Err(SqlError::Unsupported(
                            "all rows of a block must share day and reason".into(),
                        ));
                    }
                } else {
                    shared = Some((day, reason));
                }
            }
            let (day, reason) = shared.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertBlocks {
                area_ids,
                day,
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = Filters::from_selection(selection)?;
    let id = parse_ulid(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?;

    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &a.value));
    }

    match table.as_str() {
        "areas" => {
            let mut patch = AreaPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "price_per_hour" => patch.price_per_hour = Some(parse_decimal(value)?),
                    "min_booking_hours" => patch.min_booking_hours = Some(parse_u32(value)?),
                    "max_booking_hours" => patch.max_booking_hours = Some(parse_u32(value)?),
                    "monthly_limit_per_unit" => {
                        patch.monthly_limit_per_unit = Some(parse_u32(value)?)
                    }
                    "auto_approve" => patch.auto_approve = Some(parse_bool(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("areas", column)),
                }
            }
            Ok(Command::UpdateArea { id, patch })
        }
        "reservations" => {
            let (mut status, mut note) = (None, None);
            for (column, value) in set {
                match column.as_str() {
                    "status" => status = Some(parse_status(value)?),
                    "note" => note = parse_string_or_null(value)?,
                    _ => return Err(SqlError::UnknownColumn("reservations", column)),
                }
            }
            let status = status.ok_or(SqlError::MissingColumn("status"))?;
            if !matches!(status, Status::Confirmed | Status::Rejected | Status::Cancelled) {
                return Err(SqlError::Unsupported(format!("cannot set status to {status}")));
            }
            Ok(Command::UpdateReservationStatus { id, status, note })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;

    match table.as_str() {
        "areas" => Ok(Command::DeleteArea {
            id: parse_ulid(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "blocks" => Ok(Command::DeleteBlocks {
            area_id: parse_ulid(filters.eq("area_id").ok_or(SqlError::MissingFilter("area_id"))?)?,
            day: parse_day(filters.eq("day").ok_or(SqlError::MissingFilter("day"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "areas" => Ok(Command::SelectAreas {
            id: filters.eq("id").map(parse_ulid).transpose()?,
        }),
        "reservations" => {
            let filter = if let Some(id) = filters.eq("id") {
                ReservationFilter::Id(parse_ulid(id)?)
            } else if let Some(owner) = filters.eq("owner_id") {
                ReservationFilter::Owner(parse_ulid(owner)?)
            } else if let Some(area) = filters.eq("area_id") {
                let start = filters
                    .cmp("start", &[BinaryOperator::GtEq, BinaryOperator::Gt])
                    .ok_or(SqlError::MissingFilter("start"))?;
                let end = filters
                    .cmp("end", &[BinaryOperator::LtEq, BinaryOperator::Lt])
                    .ok_or(SqlError::MissingFilter("end"))?;
                ReservationFilter::Area {
                    area_id: parse_ulid(area)?,
                    start: parse_time(start)?,
                    end: parse_time(end)?,
                }
            } else {
                return Err(SqlError::MissingFilter("id, owner_id or area_id"));
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" | "calendar" => {
            let area_id =
                parse_ulid(filters.eq("area_id").ok_or(SqlError::MissingFilter("area_id"))?)?;
            let day = parse_day(filters.eq("day").ok_or(SqlError::MissingFilter("day"))?)?;
            if table == "availability" {
                Ok(Command::SelectAvailability { area_id, day })
            } else {
                Ok(Command::SelectCalendar { area_id, day })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Conjunction of `column <op> value` terms.
struct Filters<'a>(Vec<(String, BinaryOperator, &'a Expr)>);

impl<'a> Filters<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self(terms))
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.cmp(column, &[BinaryOperator::Eq])
    }

    fn cmp(&self, column: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, v)| *v)
    }
}

fn collect_terms<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_terms(left, out)?;
            collect_terms(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter: {expr}")))?;
            out.push((column, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_terms(inner, out),
        other => Err(SqlError::Unsupported(format!("filter: {other}"))),
    }
}

// ── VALUES rows ───────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// Rows with their column names: explicit `(a, b, ...)` in any order, or the
/// table's declared order when omitted.
fn named_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        let named: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
        if let Some(bad) = named.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, bad.clone()));
        }
        named
    };

    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    values
        .rows
        .iter()
        .map(|row| {
            let fits = if insert.columns.is_empty() {
                row.len() <= columns.len()
            } else {
                row.len() == columns.len()
            };
            if !fits {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            Ok(Row {
                cells: columns.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn single_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Row<'a>, SqlError> {
    let mut rows = named_rows(insert, table, known)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "{table}: one row per INSERT, got {}",
            rows.len()
        )));
    }
    Ok(rows.remove(0))
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Decimal::from_str(s.trim())
            .map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected decimal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Integer → UTC ms; string → RFC 3339 instant or local wall-clock time.
fn parse_time(expr: &Expr) -> Result<TimeInput, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            if let Ok(ms) = s.trim().parse::<Ms>() {
                return Ok(TimeInput::Instant(ms));
            }
            TimeInput::parse(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
        }
        _ => parse_i64(expr).map(TimeInput::Instant),
    }
}

fn parse_day(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_status(expr: &Expr) -> Result<Status, SqlError> {
    let s = parse_string(expr)?;
    Status::from_str(&s).map_err(SqlError::Parse)
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
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
