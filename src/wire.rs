use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use tracing::error;

use crate::auth::DirectoryAuthSource;
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::service::{parse_day, parse_month, CalendarService};
use crate::sql::{self, Command, SqlError};
use crate::view::ShiftBlock;

pub struct ShiftboardHandler {
    service: CalendarService,
    query_parser: Arc<ShiftboardQueryParser>,
}

impl ShiftboardHandler {
    pub fn new(service: CalendarService) -> Self {
        Self {
            service,
            query_parser: Arc::new(ShiftboardQueryParser),
        }
    }

    /// The login name is the caller's email; map it to an actor.
    async fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let email = client.metadata().get("user").cloned().unwrap_or_default();
        self.service.resolve_actor(&email).await.map_err(engine_err)
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(client, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command<C: ClientInfo>(&self, client: &C, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertShift {
                user_id,
                device,
                start,
                end,
                returning,
            } => {
                let actor = self.resolve_actor(client).await?;
                let shift = self
                    .service
                    .create(&actor, &user_id, &device, start, end)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    shift_rows(vec![shift])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateShift { id, patch } => {
                let actor = self.resolve_actor(client).await?;
                self.service
                    .update(&actor, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteShift { id } => {
                let actor = self.resolve_actor(client).await?;
                self.service.delete(&actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectShift { id } => {
                let shift = self.service.engine().get_shift(id).await.map_err(engine_err)?;
                shift_rows(vec![shift])
            }
            Command::SelectShiftsOnDevice { device } => {
                let engine = self.service.engine();
                let device = engine.registry().resolve(&device).map_err(engine_err)?;
                let shifts = engine.shifts_on_device(&device).await.map_err(engine_err)?;
                shift_rows(shifts)
            }
            Command::SelectBlocksByDay { raw } => {
                let (y, m, d) = parse_day(&raw).map_err(engine_err)?;
                let blocks = self.service.day_view(y, m, d).await.map_err(engine_err)?;
                block_rows(blocks)
            }
            Command::SelectBlocksByMonth { raw } => {
                let (y, m) = parse_month(&raw).map_err(engine_err)?;
                let blocks = self.service.month_view(y, m).await.map_err(engine_err)?;
                block_rows(blocks)
            }
            Command::SelectDevices => {
                let registry = self.service.engine().registry();
                let schema = Arc::new(devices_schema());
                let rows: Vec<PgWireResult<_>> = registry
                    .list_devices()
                    .into_iter()
                    .map(|id| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id.as_str())?;
                        encoder.encode_field(&registry.label(&id).map_err(engine_err)?)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn join_ids(ids: impl IntoIterator<Item = ShiftId>) -> String {
    ids.into_iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn shift_rows(shifts: Vec<Shift>) -> PgWireResult<Response> {
    let schema = Arc::new(shifts_schema());
    let rows: Vec<PgWireResult<_>> = shifts
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.user_id)?;
            encoder.encode_field(&s.device.as_str())?;
            encoder.encode_field(&s.span.start)?;
            encoder.encode_field(&s.span.end)?;
            encoder.encode_field(&join_ids(s.overlaps))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn block_rows(blocks: Vec<ShiftBlock>) -> PgWireResult<Response> {
    let schema = Arc::new(blocks_schema());
    let rows: Vec<PgWireResult<_>> = blocks
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.name)?;
            encoder.encode_field(&b.color)?;
            encoder.encode_field(&b.selected_device.as_str())?;
            encoder.encode_field(&b.start_time)?;
            encoder.encode_field(&b.end_time)?;
            encoder.encode_field(&join_ids(b.overlap_ids))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn shifts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("device", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("overlap_ids", Type::VARCHAR),
    ]
}

fn blocks_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("color", Type::VARCHAR),
        text_field("selected_device", Type::VARCHAR),
        text_field("start_time", Type::INT8),
        text_field("end_time", Type::INT8),
        text_field("overlap_ids", Type::VARCHAR),
    ]
}

fn devices_schema() -> Vec<FieldInfo> {
    vec![text_field("id", Type::VARCHAR), text_field("label", Type::VARCHAR)]
}

/// Result columns a statement will produce, judged from its text since
/// placeholders are still unbound at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SHIFT_BLOCKS") {
        blocks_schema()
    } else if upper.contains("DEVICES") && upper.trim_start().starts_with("SELECT") {
        devices_schema()
    } else if upper.trim_start().starts_with("SELECT") || upper.contains("RETURNING") {
        shifts_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ShiftboardHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShiftboardQueryParser;

#[async_trait]
impl QueryParser for ShiftboardQueryParser {
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
impl ExtendedQueryHandler for ShiftboardHandler {
    type Statement = String;
    type QueryParser = ShiftboardQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
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
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement text. Bound values are emitted
/// quoted and never rescanned, and `$N` inside a string literal of the
/// statement is left alone. Placeholders with no bound value stay as written.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        if c == '\'' {
            in_literal = !in_literal;
        } else if c == '$' && !in_literal {
            let digits = rest.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(rest.len());
            let bound = rest[..digits]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| params.get(i));
            if let Some(param) = bound {
                out.push_str(&quote_param(param));
                rest = &rest[digits..];
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn quote_param<B: AsRef<[u8]>>(param: &Option<B>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes.as_ref());
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ShiftboardFactory {
    handler: Arc<ShiftboardHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DirectoryAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ShiftboardFactory {
    pub fn new(service: CalendarService, password: String) -> Self {
        let auth_source = DirectoryAuthSource::new(password, service.identity().clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ShiftboardHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShiftboardFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: CalendarService,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ShiftboardFactory::new(service, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRange { .. }
        | EngineError::InvalidDevice(_)
        | EngineError::InvalidDate(_)
        | EngineError::InvalidUser(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::NotFound(_) | EngineError::UnknownDevice(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Unauthorized(_) => "28000",
        EngineError::UnknownUser(_) | EngineError::Storage(_) | EngineError::IdentityUnavailable(_) => "XX000",
    }
}

/// Internal failures are logged here and reach the client without detail.
fn client_message(e: &EngineError) -> String {
    if !e.is_client_error() {
        error!("internal error: {e}");
        "internal error".to_string()
    } else {
        e.to_string()
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        client_message(&e),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
