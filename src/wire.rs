use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{EngineError, Scheduler};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct InnkeepHandler {
    scheduler: Arc<Scheduler>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let scheduler = &self.scheduler;
        match cmd {
            Command::InsertRoom { room, returning } => {
                let room = scheduler.create_room(room).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", returning, || room_rows(&[room]))?])
            }
            Command::UpdateRoom { id, changes, returning } => {
                let room = scheduler
                    .modify_room(id, |current| changes.apply(current))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("UPDATE", returning, || room_rows(&[room]))?])
            }
            Command::DeleteRoom { id } => {
                scheduler.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertGuest { guest, returning } => {
                let guest = scheduler.create_guest(guest).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", returning, || guest_rows(&[guest]))?])
            }
            Command::UpdateGuest { id, changes, returning } => {
                let current = scheduler.get_guest(id).await.map_err(engine_err)?;
                let guest = scheduler.update_guest(changes.apply(current)).await.map_err(engine_err)?;
                Ok(vec![written("UPDATE", returning, || guest_rows(&[guest]))?])
            }
            Command::DeleteGuest { id } => {
                scheduler.delete_guest(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation { reservation, returning } => {
                let reservation = scheduler.create_reservation(reservation).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", returning, || reservation_rows(&[reservation]))?])
            }
            Command::UpdateReservation { id, changes, returning } => {
                let reservation = scheduler
                    .modify_reservation(id, move |current| changes.clone().apply(current.clone()))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("UPDATE", returning, || reservation_rows(&[reservation]))?])
            }
            Command::DeleteReservation { id, returning } => {
                let removed = scheduler.delete_reservation(id).await.map_err(engine_err)?;
                Ok(vec![written("DELETE", returning, || reservation_rows(&[removed]))?])
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => found(scheduler.get_room(id).await)?,
                    None => scheduler.list_rooms().await.map_err(engine_err)?,
                };
                Ok(vec![room_rows(&rooms)?])
            }
            Command::SelectGuests { id } => {
                let guests = match id {
                    Some(id) => found(scheduler.get_guest(id).await)?,
                    None => scheduler.list_guests().await.map_err(engine_err)?,
                };
                Ok(vec![guest_rows(&guests)?])
            }
            Command::SelectReservations { id, filter } => {
                let reservations = match id {
                    Some(id) => found(scheduler.get_reservation(id).await)?
                        .into_iter()
                        .filter(|r| filter.matches(r))
                        .collect(),
                    None => scheduler.list_reservations(&filter).await.map_err(engine_err)?,
                };
                Ok(vec![reservation_rows(&reservations)?])
            }
            Command::SelectAvailability { room_id, start, end } => {
                let windows = scheduler
                    .free_windows(room_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid_str = room_id.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|window| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&window.start.to_string())?;
                        encoder.encode_field(&window.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailableRooms { start, end } => {
                let rooms = scheduler.available_rooms(start, end).await.map_err(engine_err)?;
                Ok(vec![room_rows(&rooms)?])
            }
            Command::SelectVacancy {
                room_id,
                start,
                end,
                exclude,
            } => {
                let available = scheduler
                    .is_available(room_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(vacancy_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&available)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

/// Command tag, or the written row when the statement had RETURNING.
fn written(
    tag: &str,
    returning: bool,
    rows: impl FnOnce() -> PgWireResult<Response>,
) -> PgWireResult<Response> {
    if returning {
        rows()
    } else {
        Ok(Response::Execution(Tag::new(tag).with_rows(1)))
    }
}

/// A lookup by id yields zero or one row rather than an error.
fn found<T>(result: Result<T, EngineError>) -> PgWireResult<Vec<T>> {
    match result {
        Ok(row) => Ok(vec![row]),
        Err(e) if e.is_not_found() => Ok(vec![]),
        Err(e) => Err(engine_err(e)),
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("code"),
        FieldInfo::new("price_per_night".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("description"),
        text_field("status"),
    ]
}

fn guest_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("first_name"),
        text_field("last_name"),
        text_field("email"),
        text_field("phone"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("guest_id"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("status"),
        text_field("check_in_at"),
        text_field("check_out_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("room_id"), text_field("start_date"), text_field("end_date")]
}

fn vacancy_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text)]
}

fn room_rows(rooms: &[Room]) -> PgWireResult<Response> {
    let schema = Arc::new(room_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.code)?;
            encoder.encode_field(&i64::from(room.price_per_night))?;
            encoder.encode_field(&room.description)?;
            encoder.encode_field(&room.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn guest_rows(guests: &[Guest]) -> PgWireResult<Response> {
    let schema = Arc::new(guest_schema());
    let rows: Vec<PgWireResult<_>> = guests
        .iter()
        .map(|guest| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&guest.id.to_string())?;
            encoder.encode_field(&guest.first_name)?;
            encoder.encode_field(&guest.last_name)?;
            encoder.encode_field(&guest.email)?;
            encoder.encode_field(&guest.phone)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&r.guest_id.to_string())?;
            encoder.encode_field(&r.start_date.to_string())?;
            encoder.encode_field(&r.end_date.to_string())?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.check_in_at.map(|t| t.to_string()))?;
            encoder.encode_field(&r.check_out_at.map(|t| t.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Columns a statement will return, judged from its text alone so that
/// statements with unbound `$N` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let is_select = words.first() == Some(&"select");
    if !is_select && !words.contains(&"returning") {
        return vec![];
    }
    let table = words
        .windows(2)
        .find(|pair| matches!(pair[0], "from" | "into" | "update"))
        .map(|pair| pair[1].trim_matches('"'));
    match table {
        Some("rooms") | Some("available_rooms") => room_schema(),
        Some("guests") => guest_schema(),
        Some("reservations") => reservation_schema(),
        Some("availability") if is_select => availability_schema(),
        Some("vacancy") if is_select => vacancy_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
///
/// Runs from the highest index down so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// The front desk shares one password; the user name is not checked.
#[derive(Debug)]
struct FrontDeskPassword(Vec<u8>);

#[async_trait]
impl AuthSource for FrontDeskPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.0.clone()))
    }
}

type FrontDeskStartup = CleartextPasswordAuthStartupHandler<FrontDeskPassword, DefaultServerParameterProvider>;

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    startup: Arc<FrontDeskStartup>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(scheduler: Arc<Scheduler>, password: String) -> Self {
        let startup = CleartextPasswordAuthStartupHandler::new(
            FrontDeskPassword(password.into_bytes()),
            DefaultServerParameterProvider::default(),
        );
        Self {
            handler: Arc::new(InnkeepHandler::new(scheduler)),
            startup: Arc::new(startup),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.startup.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    scheduler: Arc<Scheduler>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(InnkeepFactory::new(scheduler, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
