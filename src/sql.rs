use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// One row of `INSERT INTO bookings`. `user_id` defaults to the connected user.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRow {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub user_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub purpose: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        role: Role,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertAsset {
        id: Ulid,
        name: String,
        number_plate: Option<String>,
        category: AssetCategory,
    },
    UpdateAsset {
        id: Ulid,
        patch: AssetPatch,
    },
    DeleteAsset {
        id: Ulid,
    },
    InsertBooking {
        booking: BookingRow,
    },
    BatchInsertBookings {
        bookings: Vec<BookingRow>,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DecideBooking {
        id: Ulid,
        approve: bool,
        rejection_reason: Option<String>,
    },
    CancelBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertDowntime {
        downtime: Downtime,
    },
    UpdateDowntime {
        id: Ulid,
        patch: DowntimePatch,
    },
    DeleteDowntime {
        id: Ulid,
    },
    SelectUsers,
    SelectAssets,
    SelectBookings {
        asset_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectCalendar {
        asset_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        asset_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectDowntimes {
        asset_id: Option<Ulid>,
    },
    SelectFleetStats,
    SelectFleetCategories,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if let Some(channel) = keyword_arg(trimmed, &upper, "LISTEN ") {
        return Ok(Command::Listen { channel });
    }
    if let Some(channel) = keyword_arg(trimmed, &upper, "UNLISTEN ") {
        return Ok(Command::Unlisten { channel });
    }

    let stmts =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
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

fn keyword_arg(trimmed: &str, upper: &str, keyword: &str) -> Option<String> {
    if !upper.starts_with(keyword) {
        return None;
    }
    trimmed
        .get(keyword.len()..)
        .map(|rest| rest.trim().trim_matches('"').to_string())
}

/// Table named in the FROM clause of a SELECT, used to describe result columns
/// before execution. `None` for anything that is not a plain SELECT.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

const USER_COLUMNS: &[&str] = &["id", "name", "role"];
const ASSET_COLUMNS: &[&str] = &["id", "name", "number_plate", "category"];
const BOOKING_COLUMNS: &[&str] = &["id", "asset_id", "user_id", "start", "end", "purpose"];
const DOWNTIME_COLUMNS: &[&str] =
    &["id", "asset_id", "reason", "description", "start", "end", "cost_cents"];

/// A VALUES row addressed by column name. Without an explicit column list the
/// table's declared column order applies.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "users" => ("users", USER_COLUMNS),
        "assets" => ("assets", ASSET_COLUMNS),
        "bookings" => ("bookings", BOOKING_COLUMNS),
        "downtimes" => ("downtimes", DOWNTIME_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = insert_rows(insert)?;
    for values in rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
    }
    let rows: Vec<Row> = rows
        .iter()
        .map(|values| Row { table, columns: &columns, values })
        .collect();

    match table {
        "bookings" if rows.len() > 1 => {
            let bookings = rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    booking_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))
                })
                .collect::<Result<_, _>>()?;
            Ok(Command::BatchInsertBookings { bookings })
        }
        _ if rows.len() > 1 => Err(SqlError::Unsupported(format!("multi-row insert into {table}"))),
        "users" => {
            let row = &rows[0];
            let role = parse_string(row.required("role")?)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                role: Role::parse(&role).ok_or(SqlError::BadEnum("role", role))?,
            })
        }
        "assets" => {
            let row = &rows[0];
            let category = match row.get("category") {
                Some(expr) => parse_category(expr)?,
                None => AssetCategory::Other,
            };
            Ok(Command::InsertAsset {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                number_plate: row.get("number_plate").map(parse_string_or_null).transpose()?.flatten(),
                category,
            })
        }
        "bookings" => Ok(Command::InsertBooking {
            booking: booking_row(&rows[0])?,
        }),
        _ => {
            let row = &rows[0];
            let downtime = Downtime {
                id: parse_ulid(row.required("id")?)?,
                asset_id: parse_ulid(row.required("asset_id")?)?,
                reason: match row.get("reason") {
                    Some(expr) => parse_reason(expr)?,
                    None => DowntimeReason::Other,
                },
                description: row
                    .get("description")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
                start: parse_i64(row.required("start")?)?,
                end: row.get("end").map(parse_i64_or_null).transpose()?.flatten(),
                cost_cents: row.get("cost_cents").map(parse_i64_or_null).transpose()?.flatten(),
            };
            Ok(Command::InsertDowntime { downtime })
        }
    }
}

fn booking_row(row: &Row) -> Result<BookingRow, SqlError> {
    Ok(BookingRow {
        id: parse_ulid(row.required("id")?)?,
        asset_id: parse_ulid(row.required("asset_id")?)?,
        user_id: row.get("user_id").map(parse_ulid_or_null).transpose()?.flatten(),
        start: parse_i64(row.required("start")?)?,
        end: parse_i64(row.required("end")?)?,
        purpose: row.get("purpose").map(parse_string_or_null).transpose()?.flatten(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn assignment_column(assignment: &Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        set.push((assignment_column(a)?, &a.value));
    }

    match table.as_str() {
        "assets" => {
            let mut patch = AssetPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "number_plate" => patch.number_plate = Some(parse_string_or_null(value)?),
                    "category" => patch.category = Some(parse_category(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("assets", column)),
                }
            }
            Ok(Command::UpdateAsset { id, patch })
        }
        "bookings" => parse_booking_update(id, set),
        "downtimes" => {
            let mut patch = DowntimePatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "reason" => patch.reason = Some(parse_reason(value)?),
                    "description" => patch.description = Some(parse_string(value)?),
                    "start" => patch.start = Some(parse_i64(value)?),
                    "end" => patch.end = Some(parse_i64_or_null(value)?),
                    "cost_cents" => patch.cost_cents = Some(parse_i64_or_null(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("downtimes", column)),
                }
            }
            Ok(Command::UpdateDowntime { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SET status = ...` drives the approval workflow and can't be combined with
/// edits to the interval or purpose.
fn parse_booking_update(id: Ulid, set: Vec<(String, &Expr)>) -> Result<Command, SqlError> {
    let mut patch = BookingPatch::default();
    let mut status = None;
    let mut rejection_reason = None;
    for (column, value) in set {
        match column.as_str() {
            "start" => patch.start = Some(parse_i64(value)?),
            "end" => patch.end = Some(parse_i64(value)?),
            "purpose" => patch.purpose = Some(parse_string_or_null(value)?),
            "status" => {
                let s = parse_string(value)?;
                status = Some(BookingStatus::parse(&s).ok_or(SqlError::BadEnum("status", s))?);
            }
            "rejection_reason" => rejection_reason = parse_string_or_null(value)?,
            _ => return Err(SqlError::ReadOnlyColumn("bookings", column)),
        }
    }

    let Some(status) = status else {
        if rejection_reason.is_some() {
            return Err(SqlError::Unsupported("rejection_reason without status".into()));
        }
        return Ok(Command::UpdateBooking { id, patch });
    };
    if patch != BookingPatch::default() {
        return Err(SqlError::Unsupported(
            "status can't be changed together with other columns".into(),
        ));
    }
    match status {
        BookingStatus::Approved => Ok(Command::DecideBooking { id, approve: true, rejection_reason: None }),
        BookingStatus::Rejected => Ok(Command::DecideBooking { id, approve: false, rejection_reason }),
        BookingStatus::Cancelled => Ok(Command::CancelBooking { id }),
        other => Err(SqlError::Unsupported(format!(
            "bookings can't be set to {}",
            other.as_str()
        ))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "assets" => Ok(Command::DeleteAsset { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "downtimes" => Ok(Command::DeleteDowntime { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    asset_id: Option<Ulid>,
    exclude_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
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

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "users" => Ok(Command::SelectUsers),
        "assets" => Ok(Command::SelectAssets),
        "bookings" => Ok(Command::SelectBookings {
            asset_id: f.asset_id,
            start: f.start,
            end: f.end,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            asset_id: f.asset_id,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            asset_id: f.asset_id.ok_or(SqlError::MissingFilter("asset_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_id: f.exclude_id,
        }),
        "downtimes" => Ok(Command::SelectDowntimes { asset_id: f.asset_id }),
        "fleet_stats" => Ok(Command::SelectFleetStats),
        "fleet_categories" => Ok(Command::SelectFleetCategories),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Err(SqlError::Unsupported(format!("filter {expr}")));
    };
    let column = expr_column_name(left);
    match (op, column.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, f)?;
            extract_filters(right, f)?;
        }
        (ast::BinaryOperator::Eq, Some("asset_id")) => f.asset_id = Some(parse_ulid(right)?),
        (ast::BinaryOperator::Eq, Some("exclude_id")) => f.exclude_id = Some(parse_ulid(right)?),
        (ast::BinaryOperator::GtEq, Some("start")) => f.start = Some(parse_i64(right)?),
        (ast::BinaryOperator::LtEq, Some("end")) => f.end = Some(parse_i64(right)?),
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
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
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

/// Millisecond timestamps and amounts. Quoted numbers are accepted for
/// clients that bind every parameter as text.
fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected integer, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_category(expr: &Expr) -> Result<AssetCategory, SqlError> {
    let s = parse_string(expr)?;
    AssetCategory::parse(&s).ok_or(SqlError::BadEnum("category", s))
}

fn parse_reason(expr: &Expr) -> Result<DowntimeReason, SqlError> {
    let s = parse_string(expr)?;
    DowntimeReason::parse(&s).ok_or(SqlError::BadEnum("reason", s))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    ReadOnlyColumn(&'static str, String),
    BadEnum(&'static str, String),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::ReadOnlyColumn(t, c) => write!(f, "{t}: column {c} can't be updated"),
            SqlError::BadEnum(what, v) => write!(f, "invalid {what}: {v}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
