use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use ulid::Ulid;

use crate::auth::{self, CondoAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ReservationFilter};
use crate::tenant::CondoManager;

pub struct CondoHandler {
    condos: Arc<CondoManager>,
    admin_user: String,
    query_parser: Arc<CondoQueryParser>,
}

impl CondoHandler {
    pub fn new(condos: Arc<CondoManager>, admin_user: String) -> Self {
        Self {
            condos,
            admin_user,
            query_parser: Arc::new(CondoQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.condos
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("condominium error: {e}")))
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        auth::actor_for_user(user, &self.admin_user).ok_or_else(|| auth::unknown_user(user))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                tracing::debug!(query, "rejected statement: {e}");
                return Err(sql_err(e));
            }
        };

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertArea { id, spec } => {
                require_admin(actor)?;
                engine.create_area(id, spec).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateArea { id, patch } => {
                require_admin(actor)?;
                engine.update_area(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteArea { id } => {
                require_admin(actor)?;
                engine.deactivate_area(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAreas { id } => {
                let areas = match id {
                    Some(id) => vec![engine.get_area(id).await.map_err(engine_err)?],
                    None => engine.list_areas().await,
                };
                Ok(rows(area_schema(), areas, encode_area))
            }
            Command::InsertReservation {
                id,
                area_id,
                owner_id,
                start,
                end,
                reason,
            } => {
                let span = engine.clock().interval(start, end).map_err(engine_err)?;
                let request = ReservationRequest {
                    area_id,
                    span,
                    owner: owner_id,
                    reason,
                };
                engine
                    .request_reservation(id, request, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateReservationStatus { id, status, note } => {
                let outcome = match status {
                    Status::Confirmed => engine.decide(id, Decision::Approve, note, actor).await,
                    Status::Rejected => engine.decide(id, Decision::Reject, note, actor).await,
                    Status::Cancelled => engine.cancel(id, actor).await,
                    other => {
                        return Err(user_error(
                            "22023",
                            format!("status cannot be set to {other}"),
                        ));
                    }
                };
                outcome.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.cancel(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { filter } => {
                let records = match filter {
                    ReservationFilter::Id(id) => {
                        vec![engine.get_reservation(id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::Owner(owner) => {
                        if let Actor::Resident(unit) = actor
                            && unit != owner
                        {
                            return Err(engine_err(EngineError::Forbidden(
                                "residents can only list their own reservations",
                            )));
                        }
                        engine.list_for_owner(owner).await
                    }
                    ReservationFilter::Area {
                        area_id,
                        start,
                        end,
                    } => {
                        let window = engine.clock().interval(start, end).map_err(engine_err)?;
                        engine
                            .list_for_area(area_id, window)
                            .await
                            .map_err(engine_err)?
                    }
                };
                Ok(rows(reservation_schema(), records, encode_reservation))
            }
            Command::InsertBlocks {
                area_ids,
                day,
                reason,
            } => {
                let blocks = engine
                    .create_block(&area_ids, day, reason, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(blocks.len()),
                ))
            }
            Command::DeleteBlocks { area_id, day } => {
                let lifted = engine
                    .unblock_day(area_id, day, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(lifted.len()),
                ))
            }
            Command::SelectAvailability { area_id, day } => {
                let windows = engine
                    .free_windows(area_id, day)
                    .await
                    .map_err(engine_err)?;
                let area = area_id.to_string();
                Ok(rows(availability_schema(), windows, |encoder, slot| {
                    encoder.encode_field(&area)?;
                    encoder.encode_field(&slot.start)?;
                    encoder.encode_field(&slot.end)
                }))
            }
            Command::SelectCalendar { area_id, day } => {
                let status = engine.day_status(area_id, day).await.map_err(engine_err)?;
                let (label, reason) = match status {
                    DayStatus::Free => ("FREE", None),
                    DayStatus::Partial => ("PARTIAL", None),
                    DayStatus::Blocked { reason } => ("BLOCKED", Some(reason)),
                };
                let area = area_id.to_string();
                let day = day.to_string();
                Ok(rows(calendar_schema(), vec![reason], |encoder, reason| {
                    encoder.encode_field(&area)?;
                    encoder.encode_field(&day)?;
                    encoder.encode_field(&label.to_string())?;
                    encoder.encode_field(&reason)
                }))
            }
            Command::Listen { channel } => {
                let area_id = channel
                    .strip_prefix("area_")
                    .and_then(|id| Ulid::from_string(id).ok())
                    .ok_or_else(|| {
                        user_error(
                            "42000",
                            format!("invalid channel: {channel} (expected area_{{id}})"),
                        )
                    })?;
                engine.get_area(area_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

fn require_admin(actor: Actor) -> PgWireResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(engine_err(EngineError::Forbidden(
            "only administrators manage areas",
        )))
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn area_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("price_per_hour", Type::VARCHAR),
        field("min_booking_hours", Type::INT8),
        field("max_booking_hours", Type::INT8),
        field("monthly_limit_per_unit", Type::INT8),
        field("auto_approve", Type::BOOL),
        field("active", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("area_id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("occupying", Type::BOOL),
        field("reason", Type::VARCHAR),
        field("note", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("area_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("area_id", Type::VARCHAR),
        field("day", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

fn encode_area(encoder: &mut DataRowEncoder, area: Area) -> PgWireResult<()> {
    encoder.encode_field(&area.id.to_string())?;
    encoder.encode_field(&area.name)?;
    encoder.encode_field(&i64::from(area.capacity))?;
    encoder.encode_field(&area.price_per_hour.to_string())?;
    encoder.encode_field(&i64::from(area.min_booking_hours))?;
    encoder.encode_field(&i64::from(area.max_booking_hours))?;
    encoder.encode_field(&i64::from(area.monthly_limit_per_unit))?;
    encoder.encode_field(&area.auto_approve)?;
    encoder.encode_field(&area.active)?;
    encoder.encode_field(&area.created_at)
}

fn encode_reservation(encoder: &mut DataRowEncoder, r: ReservationInfo) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.area_id.to_string())?;
    encoder.encode_field(&r.owner_id.map(|o| o.to_string()))?;
    encoder.encode_field(&r.kind.to_string())?;
    encoder.encode_field(&r.start)?;
    encoder.encode_field(&r.end)?;
    encoder.encode_field(&r.status.as_str().to_string())?;
    encoder.encode_field(&r.occupying)?;
    encoder.encode_field(&r.reason)?;
    encoder.encode_field(&r.note)?;
    encoder.encode_field(&r.created_at)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
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

/// Result columns of a statement, judged from its FROM table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower.split_once(" from ").and_then(|(_, rest)| {
        rest.trim_start()
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
    });
    match table {
        Some("areas") => area_schema(),
        Some("reservations") => reservation_schema(),
        Some("availability") => availability_schema(),
        Some("calendar") => calendar_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CondoHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct CondoQueryParser;

#[async_trait]
impl QueryParser for CondoQueryParser {
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
impl ExtendedQueryHandler for CondoHandler {
    type Statement = String;
    type QueryParser = CondoQueryParser;

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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: substituted values are never rescanned, and the
/// full digit run is read so `$1` never matches the prefix of `$10`.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            result.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CondoFactory {
    handler: Arc<CondoHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CondoAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CondoFactory {
    pub fn new(condos: Arc<CondoManager>, password: String, admin_user: String) -> Self {
        let auth_source = CondoAuthSource::new(password, admin_user.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CondoHandler::new(condos, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CondoFactory {
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
    factory: Arc<CondoFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_expected() {
        tracing::debug!(code = e.sqlstate(), "{e}");
    } else {
        tracing::info!(code = e.sqlstate(), "request refused: {e}");
    }
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
