use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_QUERY_LEN;
use crate::model::*;

const PAGE_COLUMNS: &[&str] = &[
    "id",
    "org_id",
    "slug",
    "business_name",
    "timezone",
    "business_hours",
    "slot_duration",
    "buffer_time",
    "booking_notice_hours",
    "max_days_advance",
    "auto_confirm",
    "is_active",
];

const BOOKING_COLUMNS: &[&str] = &[
    "page",
    "start_time",
    "end_time",
    "name",
    "phone",
    "email",
    "notes",
    "custom_fields",
];

const STATUS_COLUMNS: &[&str] = &["booking_id", "status"];

const DEFAULT_MAX_DAYS_ADVANCE: u32 = 60;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreatePage {
        config: BookingPageConfig,
    },
    UpdatePage {
        config: BookingPageConfig,
    },
    InsertBooking {
        page: String,
        start: Ms,
        end: Ms,
        customer: CustomerInfo,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectAvailability {
        page: String,
        date: NaiveDate,
    },
    SelectBookings {
        page: String,
    },
    Listen {
        channel: String,
    },
}

impl Command {
    /// Commands open to the public booking role.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Command::SelectAvailability { .. } | Command::InsertBooking { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_QUERY_LEN {
        return Err(SqlError::Parse("query too long".into()));
    }
    let trimmed = sql.trim();
    if let Some(keyword) = trimmed.get(..7)
        && keyword.eq_ignore_ascii_case("LISTEN ")
    {
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Values of a single-row INSERT keyed by column name. Without an explicit
/// column list, values bind positionally to the table's default columns.
struct Row<'a> {
    table: &'static str,
    values: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn bind(
        table: &'static str,
        defaults: &[&str],
        insert: &'a ast::Insert,
    ) -> Result<Self, SqlError> {
        let exprs = extract_single_row(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if exprs.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), exprs.len()));
        }
        for name in &names {
            if !defaults.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name.clone()));
            }
        }
        Ok(Self {
            table,
            values: names.into_iter().zip(exprs.iter()).collect(),
        })
    }

    /// Present and not NULL.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
            .filter(|expr| !is_null(expr))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "pages" => {
            let row = Row::bind("pages", PAGE_COLUMNS, insert)?;
            Ok(Command::CreatePage {
                config: parse_page_config(&row)?,
            })
        }
        "page_updates" => {
            let row = Row::bind("page_updates", PAGE_COLUMNS, insert)?;
            Ok(Command::UpdatePage {
                config: parse_page_config(&row)?,
            })
        }
        "bookings" => {
            let row = Row::bind("bookings", BOOKING_COLUMNS, insert)?;
            let customer = CustomerInfo {
                name: parse_string_expr(row.require("name")?)?,
                phone: parse_string_expr(row.require("phone")?)?,
                email: row.get("email").map(parse_string_expr).transpose()?,
                notes: row.get("notes").map(parse_string_expr).transpose()?,
                custom_fields: row
                    .get("custom_fields")
                    .map(parse_custom_fields)
                    .transpose()?
                    .unwrap_or_default(),
            };
            Ok(Command::InsertBooking {
                page: parse_string_expr(row.require("page")?)?,
                start: parse_timestamp_expr(row.require("start_time")?)?,
                end: parse_timestamp_expr(row.require("end_time")?)?,
                customer,
            })
        }
        "booking_status" => {
            let row = Row::bind("booking_status", STATUS_COLUMNS, insert)?;
            let status = parse_string_expr(row.require("status")?)?;
            Ok(Command::SetBookingStatus {
                id: parse_ulid_expr(row.require("booking_id")?)?,
                status: status.parse().map_err(SqlError::InvalidValue)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_page_config(row: &Row) -> Result<BookingPageConfig, SqlError> {
    let slug = parse_string_expr(row.require("slug")?)?;
    let hours = parse_string_expr(row.require("business_hours")?)?;
    Ok(BookingPageConfig {
        id: parse_ulid_expr(row.require("id")?)?,
        org_id: parse_ulid_expr(row.require("org_id")?)?,
        business_name: row
            .get("business_name")
            .map(parse_string_expr)
            .transpose()?
            .unwrap_or_else(|| slug.clone()),
        slug,
        business_hours: BusinessHours::from_json(&hours).map_err(SqlError::InvalidValue)?,
        slot_duration_minutes: parse_u32(row.require("slot_duration")?)?,
        buffer_time_minutes: row.get("buffer_time").map(parse_u32).transpose()?.unwrap_or(0),
        booking_notice_hours: row
            .get("booking_notice_hours")
            .map(parse_u32)
            .transpose()?
            .unwrap_or(0),
        max_days_advance: row
            .get("max_days_advance")
            .map(parse_u32)
            .transpose()?
            .unwrap_or(DEFAULT_MAX_DAYS_ADVANCE),
        timezone: row
            .get("timezone")
            .map(parse_string_expr)
            .transpose()?
            .unwrap_or_else(|| "UTC".into()),
        auto_confirm: row.get("auto_confirm").map(parse_bool).transpose()?.unwrap_or(false),
        is_active: row.get("is_active").map(parse_bool).transpose()?.unwrap_or(true),
    })
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }
    let filter = |column: &str| {
        filters
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    };

    match table.as_str() {
        "availability" => {
            let page = filter("page").ok_or(SqlError::MissingFilter("page"))?;
            let date = filter("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectAvailability {
                page: parse_string_expr(page)?,
                date: parse_date_expr(date)?,
            })
        }
        "bookings" => {
            let page = filter("page").ok_or(SqlError::MissingFilter("page"))?;
            Ok(Command::SelectBookings {
                page: parse_string_expr(page)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs from a conjunction. Other predicates are ignored.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right.as_ref()));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
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

fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters);
    match filters.iter().find(|(name, _)| name == "id") {
        Some((_, expr)) => parse_ulid_expr(expr),
        None => Err(SqlError::MissingFilter("id")),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID '{s}': {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer '{s}': {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// RFC 3339 text (any offset) or integer Unix milliseconds.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::InvalidValue(format!("bad timestamp '{s}': {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(format!("bad date '{s}': {e}")))
}

/// JSON object of question → answer. Non-string answers keep their JSON text.
fn parse_custom_fields(expr: &Expr) -> Result<Vec<(String, String)>, SqlError> {
    let text = parse_string_expr(expr)?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
        .map_err(|e| SqlError::InvalidValue(format!("custom_fields: {e}")))?;
    Ok(map
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the engine cannot accept.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
