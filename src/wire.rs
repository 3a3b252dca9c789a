use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

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
use tokio::net::TcpStream;
use tracing::warn;
use ulid::Ulid;

use crate::auth::SlotwardAuthSource;
use crate::engine::{format_instant, page_timezone, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotwardHandler {
    engine: Arc<Engine>,
    admin_user: String,
    request_timeout: Duration,
    query_parser: Arc<SlotwardQueryParser>,
}

impl SlotwardHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String, request_timeout: Duration) -> Self {
        Self {
            engine,
            admin_user,
            request_timeout,
            query_parser: Arc::new(SlotwardQueryParser),
        }
    }

    /// Public logins may only read availability and book.
    fn authorize<C: ClientInfo>(&self, client: &C, cmd: &Command) -> PgWireResult<()> {
        if cmd.is_public() {
            return Ok(());
        }
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        if user == self.admin_user {
            return Ok(());
        }
        warn!("user '{user}' attempted {}", observability::command_label(cmd));
        Err(user_error(
            "42501",
            format!("permission denied for {}", observability::command_label(cmd)),
        ))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.authorize(client, &cmd)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::CreatePage { config } => {
                engine.create_page(config).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdatePage { config } => {
                engine.update_page(config).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking {
                page,
                start,
                end,
                customer,
            } => {
                let page_id = resolve_slug(engine, &page)?;
                let tz = page_tz(engine, page_id).await?;
                let booking = engine
                    .reserve(page_id, Span { start, end }, customer)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(booking_row_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking.id.to_string())?;
                encoder.encode_field(&booking.status.to_string())?;
                encoder.encode_field(&format_instant(booking.span.start, &tz))?;
                encoder.encode_field(&format_instant(booking.span.end, &tz))?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SetBookingStatus { id, status } => {
                engine
                    .transition_booking(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { page, date } => {
                let page_id = resolve_slug(engine, &page)?;
                let tz = page_tz(engine, page_id).await?;
                let slots = tokio::time::timeout(
                    self.request_timeout,
                    engine.get_or_compute(page_id, date),
                )
                .await
                .map_err(|_| {
                    user_error("57014", format!("availability for {page} on {date} timed out"))
                })?
                .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_instant(slot.start, &tz))?;
                        encoder.encode_field(&format_instant(slot.end, &tz))?;
                        encoder.encode_field(&slot.is_available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { page } => {
                let page_id = resolve_slug(engine, &page)?;
                let tz = page_tz(engine, page_id).await?;
                let mut bookings = engine.list_bookings(page_id).await.map_err(engine_err)?;
                bookings.sort_by_key(|b| (b.span.start, b.id));

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.status.to_string())?;
                        encoder.encode_field(&format_instant(b.span.start, &tz))?;
                        encoder.encode_field(&format_instant(b.span.end, &tz))?;
                        encoder.encode_field(&b.customer.name)?;
                        encoder.encode_field(&b.customer.phone)?;
                        encoder.encode_field(&b.customer.email)?;
                        encoder.encode_field(&b.customer.notes)?;
                        encoder.encode_field(&b.calendar_event_id)?;
                        encoder.encode_field(&format_instant(b.created_at, &tz))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Listen { channel } => {
                let page_id_str = channel.strip_prefix("page_").ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected page_{{id}})"),
                    )
                })?;
                let page_id = Ulid::from_string(page_id_str)
                    .map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))?;
                if engine.get_page(&page_id).is_none() {
                    return Err(engine_err(EngineError::NotFound(format!("page {page_id}"))));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

fn resolve_slug(engine: &Engine, slug: &str) -> PgWireResult<Ulid> {
    engine
        .page_id_for_slug(slug)
        .ok_or_else(|| engine_err(EngineError::NotFound(format!("page '{slug}'"))))
}

async fn page_tz(engine: &Engine, page_id: Ulid) -> PgWireResult<chrono_tz::Tz> {
    let config = engine.page_config(page_id).await.map_err(engine_err)?;
    page_timezone(&config).map_err(engine_err)
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("is_available", Type::BOOL),
    ]
}

fn booking_row_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    let mut fields = booking_row_schema();
    for name in ["name", "phone", "email", "notes", "calendar_event_id", "created_at"] {
        fields.push(text_field(name, Type::VARCHAR));
    }
    fields
}

/// Row shape a statement will produce, judged from its text so that
/// statements carrying `$N` placeholders can be described before binding.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BOOKINGS") && upper.trim_start().starts_with("INSERT") {
        booking_row_schema()
    } else if upper.contains("BOOKINGS") && upper.trim_start().starts_with("SELECT") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwardHandler {
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
pub struct SlotwardQueryParser;

#[async_trait]
impl QueryParser for SlotwardQueryParser {
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
impl ExtendedQueryHandler for SlotwardHandler {
    type Statement = String;
    type QueryParser = SlotwardQueryParser;

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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
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

/// Inline bound text parameters as quoted literals. Replaces from the
/// highest index down so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwardFactory {
    handler: Arc<SlotwardHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotwardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwardFactory {
    pub fn new(
        engine: Arc<Engine>,
        auth_source: SlotwardAuthSource,
        admin_user: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            handler: Arc::new(SlotwardHandler::new(engine, admin_user, request_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwardFactory {
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
pub async fn process_connection(socket: TcpStream, factory: Arc<SlotwardFactory>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
