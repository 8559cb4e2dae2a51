use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
use pgwire::api::auth::noop::NoopStartupHandler;
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
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS, REJECTIONS_TOTAL};
use crate::sql::{self, Command, SqlError};

pub struct GuestbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<GuestbookQueryParser>,
}

impl GuestbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(GuestbookQueryParser),
        }
    }

    async fn execute_sql(&self, sql: &str) -> PgWireResult<Response> {
        debug!("query: {sql}");
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => "ok").increment(1);
                Ok(response)
            }
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => "error")
                    .increment(1);
                metrics::counter!(REJECTIONS_TOTAL, "kind" => e.kind()).increment(1);
                debug!("{label} rejected: {e}");
                Err(engine_err(e))
            }
        }
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::ProvisionTable { table_id, capacity } => {
                engine.provision_table(table_id, capacity).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Reserve {
                name,
                table_id,
                accompanying_guests,
            } => {
                engine.reserve(&name, table_id, accompanying_guests).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Arrive {
                name,
                accompanying_guests,
            } => {
                engine.arrive(&name, accompanying_guests).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Depart { name } => {
                engine.depart(&name).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectGuestList => {
                let guests = engine.all_guests().await;
                Ok(rows(guest_list_schema(), guests, |enc, g| {
                    enc.encode_field(&g.name)?;
                    enc.encode_field(&i64::from(g.table_id))?;
                    enc.encode_field(&i64::from(g.accompanying_guests))
                }))
            }
            Command::SelectGuest { name } => {
                let guest = engine.get_guest(&name).await;
                Ok(rows(guest_schema(), guest, |enc, g| {
                    enc.encode_field(&g.name)?;
                    enc.encode_field(&i64::from(g.table_id))?;
                    enc.encode_field(&i64::from(g.accompanying_guests))?;
                    enc.encode_field(&g.status().label())?;
                    enc.encode_field(&i64::from(g.num_arrived))?;
                    enc.encode_field(&g.time_arrived)
                }))
            }
            Command::SelectArrivedGuests => {
                let arrived = engine.arrived_guests().await;
                Ok(rows(arrived_schema(), arrived, |enc, g| {
                    enc.encode_field(&g.name)?;
                    enc.encode_field(&i64::from(g.accompanying_guests))?;
                    enc.encode_field(&g.time_arrived)
                }))
            }
            Command::SelectSeatsEmpty => {
                let empty = engine.empty_seats().await;
                Ok(rows(seats_empty_schema(), [clamp_i64(empty)], |enc, n| {
                    enc.encode_field(&n)
                }))
            }
            Command::SelectTables => {
                let tables = engine.list_tables().await;
                Ok(rows(tables_schema(), tables, |enc, t| {
                    enc.encode_field(&i64::from(t.table_id))?;
                    enc.encode_field(&i64::from(t.capacity))?;
                    enc.encode_field(&i64::from(t.num_reserved))?;
                    enc.encode_field(&i64::from(t.num_occupied))?;
                    enc.encode_field(&i64::from(t.capacity.saturating_sub(t.num_occupied)))
                }))
            }
            Command::SelectInvariantViolations => {
                let violations = engine.check_invariants().await;
                Ok(rows(violations_schema(), violations, |enc, v| {
                    enc.encode_field(&i64::from(v.table_id))?;
                    enc.encode_field(&v.kind.label())?;
                    enc.encode_field(&clamp_i64(v.expected))?;
                    enc.encode_field(&clamp_i64(v.actual))
                }))
            }
        }
    }
}

/// Encode every item as one data row of `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ── Result schemas ───────────────────────────────────────────────

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn guest_list_schema() -> Vec<FieldInfo> {
    vec![varchar("name"), int8("table_id"), int8("accompanying_guests")]
}

fn guest_schema() -> Vec<FieldInfo> {
    vec![
        varchar("name"),
        int8("table_id"),
        int8("accompanying_guests"),
        varchar("status"),
        int8("num_arrived"),
        int8("time_arrived"),
    ]
}

fn arrived_schema() -> Vec<FieldInfo> {
    vec![varchar("name"), int8("accompanying_guests"), int8("time_arrived")]
}

fn seats_empty_schema() -> Vec<FieldInfo> {
    vec![int8("seats_empty")]
}

fn tables_schema() -> Vec<FieldInfo> {
    vec![
        int8("table_id"),
        int8("capacity"),
        int8("num_reserved"),
        int8("num_occupied"),
        int8("empty_seats"),
    ]
}

fn violations_schema() -> Vec<FieldInfo> {
    vec![
        int8("table_id"),
        varchar("kind"),
        int8("expected"),
        int8("actual"),
    ]
}

/// Result columns a statement will produce. Placeholders are bound to a
/// dummy literal so `WHERE name = $1` resolves like its bound form.
fn schema_for_statement(stmt: &str) -> Vec<FieldInfo> {
    let bound = bind_placeholders(stmt, |_| Some("'0'".to_string()));
    match sql::parse_sql(&bound) {
        Ok(Command::SelectGuestList) => guest_list_schema(),
        Ok(Command::SelectGuest { .. }) => guest_schema(),
        Ok(Command::SelectArrivedGuests) => arrived_schema(),
        Ok(Command::SelectSeatsEmpty) => seats_empty_schema(),
        Ok(Command::SelectTables) => tables_schema(),
        Ok(Command::SelectInvariantViolations) => violations_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for GuestbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute_sql(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GuestbookQueryParser;

#[async_trait]
impl QueryParser for GuestbookQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GuestbookHandler {
    type Statement = String;
    type QueryParser = GuestbookQueryParser;

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
        self.execute_sql(&sql).await
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges and indexes of every `$N` placeholder outside single-quoted
/// literals. A doubled `''` inside a literal toggles twice and stays quoted.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Rewrite placeholders in a single left-to-right pass over the original
/// text, so bound values are never scanned again. A placeholder `value`
/// returns `None` for is left as written.
fn bind_placeholders(sql: &str, value: impl Fn(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        if let Some(text) = value(n) {
            out.push_str(&sql[copied..range.start]);
            out.push_str(&text);
            copied = range.end;
        }
    }
    out.push_str(&sql[copied..]);
    out
}

/// Text-format parameter as a SQL literal.
fn param_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_placeholders(&portal.statement.statement, |n| {
        let param = portal.parameters.get(n.checked_sub(1)?)?;
        Some(param_literal(param.as_deref()))
    })
}

// ── Startup / factory ────────────────────────────────────────────

/// Trust-mode startup: every client is accepted without a password.
pub struct GuestbookStartupHandler;

impl NoopStartupHandler for GuestbookStartupHandler {}

pub struct GuestbookFactory {
    handler: Arc<GuestbookHandler>,
    startup: Arc<GuestbookStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl GuestbookFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(GuestbookHandler::new(engine)),
            startup: Arc::new(GuestbookStartupHandler),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GuestbookFactory {
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
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let factory = Arc::new(GuestbookFactory::new(engine));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::AlreadyReserved(_) | EngineError::TableExists(_) => "23505",
        EngineError::CapacityExceeded { .. } => "53400",
        EngineError::UnknownTable(_) | EngineError::NoReservation(_) => "P0002",
        EngineError::AlreadyArrived(_) | EngineError::NotArrived(_) => "55000",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownRelation(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::OutOfRange(_) => "22003",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
