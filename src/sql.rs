use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{parse_date, parse_instant};
use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

/// One weekly rule as written in an `availability` insert; the owner is
/// carried by the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRow {
    pub day_of_week: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub available: bool,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        date: NaiveDate,
        studio_id: Option<Ulid>,
        coach_id: Option<Ulid>,
        room_id: Option<Ulid>,
    },
    SelectSessions {
        id: Option<Ulid>,
        studio_id: Option<Ulid>,
        client_id: Option<Ulid>,
        coach_id: Option<Ulid>,
        status: Option<SessionStatus>,
        /// Local calendar day, resolved in the tenant's timezone.
        date: Option<NaiveDate>,
    },
    SelectWaitlist {
        id: Option<Ulid>,
        client_id: Option<Ulid>,
        studio_id: Option<Ulid>,
        status: Option<WaitlistStatus>,
        preferred_date: Option<NaiveDate>,
    },
    SelectPackages {
        client_id: Option<Ulid>,
    },
    SelectTimeOff {
        coach_id: Option<Ulid>,
    },
    SelectAvailability {
        owner_id: Ulid,
    },
    SelectSettings,
    InsertSession {
        id: Option<Ulid>,
        client_id: Ulid,
        studio_id: Option<Ulid>,
        room_id: Option<Ulid>,
        coach_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    },
    InsertCancellation {
        session_id: Ulid,
        reason: Option<String>,
    },
    InsertAttendance {
        session_id: Ulid,
        status: SessionStatus,
    },
    InsertWaitlist {
        id: Option<Ulid>,
        client_id: Ulid,
        studio_id: Option<Ulid>,
        preferred_date: NaiveDate,
        preferred_time_slot: TimeOfDay,
        notes: Option<String>,
    },
    DeleteWaitlist {
        id: Ulid,
    },
    InsertWaitlistConfirmation {
        entry_id: Ulid,
    },
    /// Replaces every rule of the owner.
    InsertAvailability {
        owner_id: Ulid,
        rules: Vec<RuleRow>,
    },
    DeleteAvailability {
        owner_id: Ulid,
    },
    InsertTimeOff {
        id: Option<Ulid>,
        coach_id: Ulid,
        start: Ms,
        end: Ms,
        notes: Option<String>,
    },
    InsertTimeOffReview {
        request_id: Ulid,
        decision: TimeOffStatus,
    },
    InsertStudio {
        id: Option<Ulid>,
        name: Option<String>,
        capacity: u32,
    },
    InsertRoom {
        id: Option<Ulid>,
        studio_id: Ulid,
        name: Option<String>,
        capacity: u32,
    },
    InsertCoach {
        id: Option<Ulid>,
        name: Option<String>,
    },
    InsertPackage {
        id: Option<Ulid>,
        client_id: Ulid,
        package_id: Option<Ulid>,
        sessions: u32,
        expires_at: Option<Ms>,
    },
    InsertSetting {
        key: String,
        value: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Columns of each writable table. Their order is also the positional
/// order used when an INSERT omits the column list.
fn table_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "sessions" => &["client_id", "start", "end", "id", "studio_id", "room_id", "coach_id"],
        "cancellations" => &["session_id", "reason"],
        "attendance" => &["session_id", "status"],
        "waitlist" => &["client_id", "preferred_date", "preferred_time_slot", "id", "studio_id", "notes"],
        "waitlist_confirmations" => &["entry_id"],
        "availability" => &["owner_id", "day_of_week", "start_time", "end_time", "available"],
        "time_off" => &["coach_id", "start", "end", "id", "notes"],
        "time_off_reviews" => &["request_id", "decision"],
        "studios" => &["id", "name", "capacity"],
        "rooms" => &["studio_id", "id", "name", "capacity"],
        "coaches" => &["id", "name"],
        "packages" => &["client_id", "sessions", "id", "package_id", "expires_at"],
        "settings" => &["key", "value"],
        _ => return None,
    })
}

/// Split a simple-query string on `;` outside quotes. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ';') => {
                out.push(&sql[start..i]);
                start = i + 1;
            }
            (None, _) => {}
        }
    }
    out.push(&sql[start..]);
    out.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
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

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, e)| *e)
            .filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_expr).transpose()
    }

    fn instant(&self, column: &'static str) -> Result<Ms, SqlError> {
        parse_instant_expr(self.required(column)?)
    }

    fn opt_instant(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.get(column).map(parse_instant_expr).transpose()
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.required(column)?)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_expr).transpose()
    }

    fn u32_or(&self, column: &str, default: u32) -> Result<u32, SqlError> {
        self.get(column).map(parse_u32).transpose().map(|v| v.unwrap_or(default))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = table_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let table: &'static str = columns_owner(&table);
    let rows = extract_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::TooManyRows(rows.len()));
    }
    let rows: Vec<Row> = rows
        .iter()
        .map(|values| bind_row(table, columns, &insert.columns, values))
        .collect::<Result<_, _>>()?;

    if table == "availability" {
        return parse_availability_rows(&rows);
    }
    let [row] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    };

    match table {
        "sessions" => Ok(Command::InsertSession {
            id: row.opt_ulid("id")?,
            client_id: row.ulid("client_id")?,
            studio_id: row.opt_ulid("studio_id")?,
            room_id: row.opt_ulid("room_id")?,
            coach_id: row.opt_ulid("coach_id")?,
            start: row.instant("start")?,
            end: row.instant("end")?,
        }),
        "cancellations" => Ok(Command::InsertCancellation {
            session_id: row.ulid("session_id")?,
            reason: row.opt_text("reason")?,
        }),
        "attendance" => Ok(Command::InsertAttendance {
            session_id: row.ulid("session_id")?,
            status: row.text("status")?.parse().map_err(SqlError::Parse)?,
        }),
        "waitlist" => Ok(Command::InsertWaitlist {
            id: row.opt_ulid("id")?,
            client_id: row.ulid("client_id")?,
            studio_id: row.opt_ulid("studio_id")?,
            preferred_date: parse_date(&row.text("preferred_date")?).map_err(SqlError::Parse)?,
            preferred_time_slot: row.text("preferred_time_slot")?.parse().map_err(SqlError::Parse)?,
            notes: row.opt_text("notes")?,
        }),
        "waitlist_confirmations" => Ok(Command::InsertWaitlistConfirmation {
            entry_id: row.ulid("entry_id")?,
        }),
        "time_off" => Ok(Command::InsertTimeOff {
            id: row.opt_ulid("id")?,
            coach_id: row.ulid("coach_id")?,
            start: row.instant("start")?,
            end: row.instant("end")?,
            notes: row.opt_text("notes")?,
        }),
        "time_off_reviews" => Ok(Command::InsertTimeOffReview {
            request_id: row.ulid("request_id")?,
            decision: parse_decision(&row.text("decision")?)?,
        }),
        "studios" => Ok(Command::InsertStudio {
            id: row.opt_ulid("id")?,
            name: row.opt_text("name")?,
            capacity: row.u32_or("capacity", 1)?,
        }),
        "rooms" => Ok(Command::InsertRoom {
            id: row.opt_ulid("id")?,
            studio_id: row.ulid("studio_id")?,
            name: row.opt_text("name")?,
            capacity: row.u32_or("capacity", 1)?,
        }),
        "coaches" => Ok(Command::InsertCoach {
            id: row.opt_ulid("id")?,
            name: row.opt_text("name")?,
        }),
        "packages" => Ok(Command::InsertPackage {
            id: row.opt_ulid("id")?,
            client_id: row.ulid("client_id")?,
            package_id: row.opt_ulid("package_id")?,
            sessions: parse_u32(row.required("sessions")?)?,
            expires_at: row.opt_instant("expires_at")?,
        }),
        "settings" => Ok(Command::InsertSetting {
            key: row.text("key")?.to_lowercase(),
            // An empty value (or NULL) clears optional settings.
            value: row.opt_text("value")?.unwrap_or_default(),
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// The static name for a known table, so rows can borrow it.
fn columns_owner(table: &str) -> &'static str {
    const TABLES: [&str; 13] = [
        "sessions",
        "cancellations",
        "attendance",
        "waitlist",
        "waitlist_confirmations",
        "availability",
        "time_off",
        "time_off_reviews",
        "studios",
        "rooms",
        "coaches",
        "packages",
        "settings",
    ];
    TABLES.into_iter().find(|t| *t == table).unwrap_or("unknown")
}

fn bind_row<'a>(
    table: &'static str,
    columns: &'static [&'static str],
    named: &[ast::Ident],
    values: &'a [Expr],
) -> Result<Row<'a>, SqlError> {
    let mut cells = Vec::with_capacity(values.len());
    if named.is_empty() {
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        cells.extend(columns.iter().copied().zip(values.iter()));
    } else {
        if named.len() != values.len() {
            return Err(SqlError::WrongArity(table, named.len(), values.len()));
        }
        for (ident, value) in named.iter().zip(values) {
            let name = ident.value.to_lowercase();
            let column = columns
                .iter()
                .copied()
                .find(|c| *c == name)
                .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
            cells.push((column, value));
        }
    }
    Ok(Row { table, cells })
}

fn parse_availability_rows(rows: &[Row]) -> Result<Command, SqlError> {
    let mut owner_id = None;
    let mut rules = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let owner = row.ulid("owner_id")?;
        if owner_id.is_some_and(|o| o != owner) {
            return Err(SqlError::Parse(format!("row {i}: all rows must share one owner_id")));
        }
        owner_id = Some(owner);
        rules.push(RuleRow {
            day_of_week: parse_day_of_week(row.required("day_of_week")?)
                .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
            start_time: row.text("start_time")?.parse().map_err(SqlError::Parse)?,
            end_time: row.text("end_time")?.parse().map_err(SqlError::Parse)?,
            available: row.get("available").map(parse_bool).transpose()?.unwrap_or(true),
        });
    }
    Ok(Command::InsertAvailability {
        owner_id: owner_id.ok_or(SqlError::MissingColumn("availability", "owner_id"))?,
        rules,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = match &delete.selection {
        Some(expr) => extract_eq_filters(expr)?,
        None => Vec::new(),
    };
    let find = |col: &'static str| {
        filters
            .iter()
            .find(|(c, _)| c == col)
            .ok_or(SqlError::MissingFilter(col))
            .and_then(|(_, e)| parse_ulid_expr(e))
    };

    match table.as_str() {
        "waitlist" => Ok(Command::DeleteWaitlist { id: find("id")? }),
        "availability" => Ok(Command::DeleteAvailability { owner_id: find("owner_id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = match &select.selection {
        Some(expr) => extract_eq_filters(expr)?,
        None => Vec::new(),
    };
    let f = Filters { table: columns_or_self(&table), filters: &filters };

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: parse_date(&parse_text_expr(f.required("date")?)?).map_err(SqlError::Parse)?,
            studio_id: f.ulid("studio_id")?,
            coach_id: f.ulid("coach_id")?,
            room_id: f.ulid("room_id")?,
        }),
        "sessions" => Ok(Command::SelectSessions {
            id: f.ulid("id")?,
            studio_id: f.ulid("studio_id")?,
            client_id: f.ulid("client_id")?,
            coach_id: f.ulid("coach_id")?,
            status: f.text("status")?.map(|s| s.parse()).transpose().map_err(SqlError::Parse)?,
            date: f.date("date")?,
        }),
        "waitlist" => Ok(Command::SelectWaitlist {
            id: f.ulid("id")?,
            client_id: f.ulid("client_id")?,
            studio_id: f.ulid("studio_id")?,
            status: f.text("status")?.map(|s| parse_waitlist_status(&s)).transpose()?,
            preferred_date: f.date("preferred_date")?,
        }),
        "packages" => Ok(Command::SelectPackages { client_id: f.ulid("client_id")? }),
        "time_off" => Ok(Command::SelectTimeOff { coach_id: f.ulid("coach_id")? }),
        "availability" => Ok(Command::SelectAvailability {
            owner_id: parse_ulid_expr(f.required("owner_id")?)?,
        }),
        "settings" => Ok(Command::SelectSettings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn columns_or_self(table: &str) -> &'static str {
    match table {
        "slots" => "slots",
        other => columns_owner(other),
    }
}

/// `col = value` conditions of a WHERE clause joined by AND.
struct Filters<'a> {
    table: &'static str,
    filters: &'a [(String, Expr)],
}

impl Filters<'_> {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.filters.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_expr).transpose()
    }

    fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_expr).transpose()
    }

    fn date(&self, column: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.text(column)?
            .map(|s| parse_date(&s).map_err(|e| SqlError::Parse(format!("{}: {e}", self.table))))
            .transpose()
    }
}

fn extract_eq_filters(expr: &Expr) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    collect_eq_filters(expr, &mut out)?;
    Ok(out)
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, (**right).clone()));
            Ok(())
        }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => Err(SqlError::Parse("empty VALUES".into())),
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Boolean(b)) => Ok(b.to_string()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text_expr(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = parse_text_expr(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

/// Integer milliseconds or an RFC 3339 string.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp { .. } = expr {
        return parse_i64_expr(expr);
    }
    parse_instant(&parse_text_expr(expr)?).map_err(SqlError::Parse)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(Value::Boolean(b)) = extract_value(expr) {
        return Ok(*b);
    }
    let s = parse_text_expr(expr)?;
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
    }
}

/// `0`..`6` (Sunday first) or an English day name.
fn parse_day_of_week(expr: &Expr) -> Result<u8, SqlError> {
    let s = parse_text_expr(expr)?.to_lowercase();
    if let Ok(n) = s.parse::<u8>() {
        return Ok(n);
    }
    const DAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
    DAYS.iter()
        .position(|d| s.starts_with(d))
        .map(|i| i as u8)
        .ok_or_else(|| SqlError::Parse(format!("bad day of week: {s}")))
}

fn parse_decision(s: &str) -> Result<TimeOffStatus, SqlError> {
    match s.to_lowercase().as_str() {
        "approved" => Ok(TimeOffStatus::Approved),
        "rejected" => Ok(TimeOffStatus::Rejected),
        other => Err(SqlError::Parse(format!("decision must be approved or rejected, got {other}"))),
    }
}

fn parse_waitlist_status(s: &str) -> Result<WaitlistStatus, SqlError> {
    use WaitlistStatus::*;
    [Pending, Notified, Approved, Booked, Cancelled, Expired]
        .into_iter()
        .find(|st| st.as_str() == s)
        .ok_or_else(|| SqlError::Parse(format!("unknown waitlist status: {s}")))
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("too many rows: {0}")]
    TooManyRows(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn split_respects_quotes() {
        let parts = split_statements("INSERT INTO coaches (name) VALUES ('a;b'); LISTEN \"x;y\";;  ");
        assert_eq!(parts, vec!["INSERT INTO coaches (name) VALUES ('a;b')", "LISTEN \"x;y\""]);
        assert!(split_statements(" ; ").is_empty());
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!("SELECT * FROM slots WHERE date = '2025-06-10' AND studio_id = '{A}'");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectSlots {
                date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
                studio_id: Some(ulid(A)),
                coach_id: None,
                room_id: None,
            }
        );
    }

    #[test]
    fn parse_select_slots_requires_date() {
        let sql = format!("SELECT * FROM slots WHERE coach_id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_insert_session_by_column_name() {
        let sql = format!(
            r#"INSERT INTO sessions (coach_id, client_id, start, "end") VALUES ('{B}', '{A}', 1749549600000, '2025-06-10T10:20:00Z')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSession { id, client_id, coach_id, studio_id, start, end, .. } => {
                assert_eq!(id, None);
                assert_eq!(client_id, ulid(A));
                assert_eq!(coach_id, Some(ulid(B)));
                assert_eq!(studio_id, None);
                assert_eq!(start, 1_749_549_600_000);
                assert_eq!(end, 1_749_550_800_000);
            }
            cmd => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_session_positional() {
        let sql = format!("INSERT INTO sessions VALUES ('{A}', 1000, 2000)");
        match parse_sql(&sql).unwrap() {
            Command::InsertSession { client_id, start, end, .. } => {
                assert_eq!(client_id, ulid(A));
                assert_eq!((start, end), (1000, 2000));
            }
            cmd => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_session_missing_client() {
        let sql = r#"INSERT INTO sessions (start, "end") VALUES (1000, 2000)"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("sessions", "client_id"))));
    }

    #[test]
    fn parse_unknown_column_errors() {
        let sql = format!("INSERT INTO cancellations (session_id, colour) VALUES ('{A}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("cancellations", _))));
    }

    #[test]
    fn parse_cancellation_with_reason() {
        let sql = format!("INSERT INTO cancellations (session_id, reason) VALUES ('{A}', 'sick')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCancellation { session_id: ulid(A), reason: Some("sick".into()) }
        );
    }

    #[test]
    fn parse_attendance() {
        let sql = format!("INSERT INTO attendance (session_id, status) VALUES ('{A}', 'no_show')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAttendance { session_id: ulid(A), status: SessionStatus::NoShow }
        );
    }

    #[test]
    fn parse_insert_waitlist() {
        let sql = format!(
            "INSERT INTO waitlist (client_id, preferred_date, preferred_time_slot, studio_id, notes) \
             VALUES ('{A}', '2025-06-10', '10:00', NULL, 'any coach')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertWaitlist {
                id: None,
                client_id: ulid(A),
                studio_id: None,
                preferred_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
                preferred_time_slot: TimeOfDay::from_hm(10, 0).unwrap(),
                notes: Some("any coach".into()),
            }
        );
    }

    #[test]
    fn parse_delete_waitlist() {
        let sql = format!("DELETE FROM waitlist WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteWaitlist { id: ulid(A) });
    }

    #[test]
    fn parse_waitlist_confirmation() {
        let sql = format!("INSERT INTO waitlist_confirmations (entry_id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::InsertWaitlistConfirmation { entry_id: ulid(A) });
    }

    #[test]
    fn parse_multi_row_availability() {
        let sql = format!(
            "INSERT INTO availability (owner_id, day_of_week, start_time, end_time, available) VALUES \
             ('{A}', 2, '09:00', '17:00', true), ('{A}', 'tuesday', '12:00', '13:00', false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAvailability { owner_id, rules } => {
                assert_eq!(owner_id, ulid(A));
                assert_eq!(rules.len(), 2);
                assert_eq!(rules[0].day_of_week, 2);
                assert_eq!(rules[1].day_of_week, 2);
                assert!(rules[0].available);
                assert!(!rules[1].available);
                assert_eq!(rules[0].end_time, TimeOfDay::from_hm(17, 0).unwrap());
            }
            cmd => panic!("expected InsertAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_availability_rejects_mixed_owners() {
        let sql = format!(
            "INSERT INTO availability (owner_id, day_of_week, start_time, end_time) VALUES \
             ('{A}', 1, '09:00', '17:00'), ('{B}', 1, '09:00', '17:00')"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_delete_availability() {
        let sql = format!("DELETE FROM availability WHERE owner_id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteAvailability { owner_id: ulid(A) });
    }

    #[test]
    fn parse_time_off_and_review() {
        let sql = format!(
            r#"INSERT INTO time_off (coach_id, start, "end", notes) VALUES ('{A}', '2025-06-10T00:00:00Z', '2025-06-12T00:00:00Z', 'holiday')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertTimeOff { coach_id, start, end, notes, .. } => {
                assert_eq!(coach_id, ulid(A));
                assert_eq!(end - start, 2 * 86_400_000);
                assert_eq!(notes.as_deref(), Some("holiday"));
            }
            cmd => panic!("expected InsertTimeOff, got {cmd:?}"),
        }

        let sql = format!("INSERT INTO time_off_reviews (request_id, decision) VALUES ('{A}', 'rejected')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertTimeOffReview { request_id: ulid(A), decision: TimeOffStatus::Rejected }
        );
        let sql = format!("INSERT INTO time_off_reviews (request_id, decision) VALUES ('{A}', 'pending')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_setup_tables() {
        let sql = format!("INSERT INTO studios (id, name, capacity) VALUES ('{A}', 'Main', 3)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertStudio { id: Some(ulid(A)), name: Some("Main".into()), capacity: 3 }
        );
        let sql = format!("INSERT INTO rooms (studio_id, name) VALUES ('{A}', 'Reformer')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertRoom { id: None, studio_id: ulid(A), name: Some("Reformer".into()), capacity: 1 }
        );
        let sql = "INSERT INTO coaches (name) VALUES ('Sam')";
        assert_eq!(parse_sql(sql).unwrap(), Command::InsertCoach { id: None, name: Some("Sam".into()) });
    }

    #[test]
    fn parse_insert_package() {
        let sql = format!("INSERT INTO packages (client_id, sessions, expires_at) VALUES ('{A}', 10, 1800000000000)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPackage {
                id: None,
                client_id: ulid(A),
                package_id: None,
                sessions: 10,
                expires_at: Some(1_800_000_000_000),
            }
        );
    }

    #[test]
    fn parse_insert_setting() {
        let sql = "INSERT INTO settings (key, value) VALUES ('Refund_Policy', 'notice_window:1440')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSetting { key: "refund_policy".into(), value: "notice_window:1440".into() }
        );
        let sql = "INSERT INTO settings (key, value) VALUES ('default_studio', NULL)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSetting { key: "default_studio".into(), value: String::new() }
        );
    }

    #[test]
    fn parse_select_read_models() {
        let sql = format!("SELECT * FROM sessions WHERE client_id = '{A}' AND status = 'scheduled'");
        match parse_sql(&sql).unwrap() {
            Command::SelectSessions { client_id, status, date, .. } => {
                assert_eq!(client_id, Some(ulid(A)));
                assert_eq!(status, Some(SessionStatus::Scheduled));
                assert_eq!(date, None);
            }
            cmd => panic!("expected SelectSessions, got {cmd:?}"),
        }
        let sql = "SELECT * FROM waitlist WHERE status = 'notified'";
        match parse_sql(sql).unwrap() {
            Command::SelectWaitlist { status, .. } => assert_eq!(status, Some(WaitlistStatus::Notified)),
            cmd => panic!("expected SelectWaitlist, got {cmd:?}"),
        }
        assert_eq!(parse_sql("SELECT * FROM packages").unwrap(), Command::SelectPackages { client_id: None });
        assert_eq!(parse_sql("SELECT * FROM time_off").unwrap(), Command::SelectTimeOff { coach_id: None });
        assert_eq!(parse_sql("SELECT * FROM settings").unwrap(), Command::SelectSettings);
    }

    #[test]
    fn parse_select_rejects_range_filters() {
        let sql = "SELECT * FROM sessions WHERE start > 1000";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_listen_and_unlisten() {
        let channel = format!("studio_{A}");
        assert_eq!(parse_sql(&format!("LISTEN {channel}")).unwrap(), Command::Listen { channel: channel.clone() });
        assert_eq!(parse_sql(&format!("UNLISTEN {channel};")).unwrap(), Command::Unlisten { channel });
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_multi_row_rejected_outside_availability() {
        let sql = format!("INSERT INTO cancellations (session_id) VALUES ('{A}'), ('{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
