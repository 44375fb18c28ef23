use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        room: NewRoom,
        returning: bool,
    },
    UpdateRoom {
        id: Ulid,
        changes: RoomChanges,
        returning: bool,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertGuest {
        guest: NewGuest,
        returning: bool,
    },
    UpdateGuest {
        id: Ulid,
        changes: GuestChanges,
        returning: bool,
    },
    DeleteGuest {
        id: Ulid,
    },
    InsertReservation {
        reservation: NewReservation,
        returning: bool,
    },
    UpdateReservation {
        id: Ulid,
        changes: ReservationChanges,
        returning: bool,
    },
    DeleteReservation {
        id: Ulid,
        returning: bool,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    SelectGuests {
        id: Option<Ulid>,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    /// Free windows of one room.
    SelectAvailability {
        room_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectAvailableRooms {
        start: NaiveDate,
        end: NaiveDate,
    },
    /// Single-row yes/no: is the room free for exactly this stay?
    SelectVacancy {
        room_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        exclude: Option<Ulid>,
    },
}

/// Column assignments of an `UPDATE rooms`. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomChanges {
    pub code: Option<String>,
    pub price_per_night: Option<u32>,
    pub description: Option<Option<String>>,
    pub status: Option<RoomStatus>,
}

impl RoomChanges {
    pub fn apply(self, mut room: Room) -> Room {
        if let Some(code) = self.code {
            room.code = code;
        }
        if let Some(price) = self.price_per_night {
            room.price_per_night = price;
        }
        if let Some(description) = self.description {
            room.description = description;
        }
        if let Some(status) = self.status {
            room.status = status;
        }
        room
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
}

impl GuestChanges {
    pub fn apply(self, mut guest: Guest) -> Guest {
        if let Some(first_name) = self.first_name {
            guest.first_name = first_name;
        }
        if let Some(last_name) = self.last_name {
            guest.last_name = last_name;
        }
        if let Some(email) = self.email {
            guest.email = email;
        }
        if let Some(phone) = self.phone {
            guest.phone = phone;
        }
        guest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationChanges {
    pub room_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub check_in_at: Option<Option<NaiveDateTime>>,
    pub check_out_at: Option<Option<NaiveDateTime>>,
}

impl ReservationChanges {
    pub fn apply(self, mut r: Reservation) -> Reservation {
        if let Some(room_id) = self.room_id {
            r.room_id = room_id;
        }
        if let Some(guest_id) = self.guest_id {
            r.guest_id = guest_id;
        }
        if let Some(start) = self.start_date {
            r.start_date = start;
        }
        if let Some(end) = self.end_date {
            r.end_date = end;
        }
        if let Some(status) = self.status {
            r.status = status;
        }
        if let Some(at) = self.check_in_at {
            r.check_in_at = at;
        }
        if let Some(at) = self.check_out_at {
            r.check_out_at = at;
        }
        r
    }
}

const ROOM_COLUMNS: &[&str] = &["code", "price_per_night", "description", "status"];
const GUEST_COLUMNS: &[&str] = &["first_name", "last_name", "email", "phone"];
const RESERVATION_COLUMNS: &[&str] = &["room_id", "guest_id", "start_date", "end_date"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(&table.relation, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One row of INSERT values, addressable by column name.
///
/// Without a column list the values are positional in the table's declared order.
struct InsertRow<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn new(insert: &ast::Insert, declared: &[&str], values: &'a [Expr]) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity("INSERT", columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingValue(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "rooms" => {
            let row = InsertRow::new(insert, ROOM_COLUMNS, &values)?;
            let room = NewRoom {
                code: parse_text(row.require("code")?)?,
                price_per_night: parse_u32(row.require("price_per_night")?)?,
                description: row.get("description").map(parse_text_or_null).transpose()?.flatten(),
                status: match row.get("status") {
                    Some(expr) => parse_room_status(expr)?,
                    None => RoomStatus::Available,
                },
            };
            Ok(Command::InsertRoom { room, returning })
        }
        "guests" => {
            let row = InsertRow::new(insert, GUEST_COLUMNS, &values)?;
            let guest = NewGuest {
                first_name: parse_text(row.require("first_name")?)?,
                last_name: parse_text(row.require("last_name")?)?,
                email: row.get("email").map(parse_text_or_null).transpose()?.flatten(),
                phone: row.get("phone").map(parse_text_or_null).transpose()?.flatten(),
            };
            Ok(Command::InsertGuest { guest, returning })
        }
        "reservations" => {
            let row = InsertRow::new(insert, RESERVATION_COLUMNS, &values)?;
            let reservation = NewReservation {
                room_id: parse_ulid(row.require("room_id")?)?,
                guest_id: parse_ulid(row.require("guest_id")?)?,
                start_date: parse_date(row.require("start_date")?)?,
                end_date: parse_date(row.require("end_date")?)?,
            };
            Ok(Command::InsertReservation { reservation, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        sets.push((column, &a.value));
    }

    match table.as_str() {
        "rooms" => {
            let mut changes = RoomChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "code" => changes.code = Some(parse_text(value)?),
                    "price_per_night" => changes.price_per_night = Some(parse_u32(value)?),
                    "description" => changes.description = Some(parse_text_or_null(value)?),
                    "status" => changes.status = Some(parse_room_status(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateRoom { id, changes, returning })
        }
        "guests" => {
            let mut changes = GuestChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "first_name" => changes.first_name = Some(parse_text(value)?),
                    "last_name" => changes.last_name = Some(parse_text(value)?),
                    "email" => changes.email = Some(parse_text_or_null(value)?),
                    "phone" => changes.phone = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateGuest { id, changes, returning })
        }
        "reservations" => {
            let mut changes = ReservationChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "room_id" => changes.room_id = Some(parse_ulid(value)?),
                    "guest_id" => changes.guest_id = Some(parse_ulid(value)?),
                    "start_date" => changes.start_date = Some(parse_date(value)?),
                    "end_date" => changes.end_date = Some(parse_date(value)?),
                    "status" => changes.status = Some(parse_reservation_status(value)?),
                    "check_in_at" => changes.check_in_at = Some(parse_timestamp_or_null(value)?),
                    "check_out_at" => changes.check_out_at = Some(parse_timestamp_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateReservation { id, changes, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "guests" => Ok(Command::DeleteGuest { id }),
        "reservations" => Ok(Command::DeleteReservation {
            id,
            returning: delete.returning.is_some(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let table = table_factor_name(&select.from[0].relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }
    let filters = Filters { predicates };

    match table.as_str() {
        "rooms" => {
            filters.only(&["id"])?;
            Ok(Command::SelectRooms { id: filters.ulid("id", Op::Eq)? })
        }
        "guests" => {
            filters.only(&["id"])?;
            Ok(Command::SelectGuests { id: filters.ulid("id", Op::Eq)? })
        }
        "reservations" => {
            filters.only(&["id", "room_id", "guest_id", "status", "start_date", "end_date"])?;
            let filter = ReservationFilter {
                room_id: filters.ulid("room_id", Op::Eq)?,
                guest_id: filters.ulid("guest_id", Op::Eq)?,
                starts_on_or_after: filters.date("start_date", Op::GtEq)?,
                ends_on_or_before: filters.date("end_date", Op::LtEq)?,
                status: filters
                    .find("status", Op::Eq)
                    .map(parse_reservation_status)
                    .transpose()?,
            };
            Ok(Command::SelectReservations {
                id: filters.ulid("id", Op::Eq)?,
                filter,
            })
        }
        "availability" => {
            filters.only(&["room_id", "start_date", "end_date"])?;
            Ok(Command::SelectAvailability {
                room_id: filters.ulid("room_id", Op::Eq)?.ok_or(SqlError::MissingFilter("room_id"))?,
                start: filters.date("start_date", Op::GtEq)?.ok_or(SqlError::MissingFilter("start_date"))?,
                end: filters.date("end_date", Op::LtEq)?.ok_or(SqlError::MissingFilter("end_date"))?,
            })
        }
        "available_rooms" => {
            filters.only(&["start_date", "end_date"])?;
            Ok(Command::SelectAvailableRooms {
                start: filters.date("start_date", Op::GtEq)?.ok_or(SqlError::MissingFilter("start_date"))?,
                end: filters.date("end_date", Op::LtEq)?.ok_or(SqlError::MissingFilter("end_date"))?,
            })
        }
        "vacancy" => {
            filters.only(&["room_id", "start_date", "end_date", "exclude_id"])?;
            Ok(Command::SelectVacancy {
                room_id: filters.ulid("room_id", Op::Eq)?.ok_or(SqlError::MissingFilter("room_id"))?,
                start: filters.date("start_date", Op::Eq)?.ok_or(SqlError::MissingFilter("start_date"))?,
                end: filters.date("end_date", Op::Eq)?.ok_or(SqlError::MissingFilter("end_date"))?,
                exclude: filters.ulid("exclude_id", Op::Eq)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

struct Predicate<'a> {
    column: String,
    op: Op,
    value: &'a Expr,
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column on the left of {op:?}")))?;
            out.push(Predicate { column, op, value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

struct Filters<'a> {
    predicates: Vec<Predicate<'a>>,
}

impl<'a> Filters<'a> {
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.predicates.iter().find(|p| !allowed.contains(&p.column.as_str())) {
            Some(p) => Err(SqlError::UnknownColumn(p.column.clone())),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str, op: Op) -> Option<&'a Expr> {
        self.predicates
            .iter()
            .find(|p| p.column == column && p.op == op)
            .map(|p| p.value)
    }

    fn ulid(&self, column: &str, op: Op) -> Result<Option<Ulid>, SqlError> {
        self.find(column, op).map(parse_ulid).transpose()
    }

    fn date(&self, column: &str, op: Op) -> Result<Option<NaiveDate>, SqlError> {
        self.find(column, op).map(parse_date).transpose()
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let text = parse_text(expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::Parse(format!("bad ULID {text}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {text}: {e}")))
}

/// `'YYYY-MM-DD HH:MM:SS'` (a `T` separator is accepted too) or NULL.
fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<NaiveDateTime>, SqlError> {
    let Some(text) = parse_text_or_null(expr)? else {
        return Ok(None);
    };
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
        .map(Some)
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {text}")))
}

fn parse_room_status(expr: &Expr) -> Result<RoomStatus, SqlError> {
    let text = parse_text(expr)?;
    RoomStatus::from_label(&text).ok_or_else(|| SqlError::Parse(format!("bad room status {text}")))
}

fn parse_reservation_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let text = parse_text(expr)?;
    ReservationStatus::from_label(&text).ok_or_else(|| SqlError::Parse(format!("bad reservation status {text}")))
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
    MissingValue(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
