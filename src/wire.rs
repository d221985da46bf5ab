use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::FleetAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability;
use crate::sql::{self, BookingRow, Command, SqlError};
use crate::tenant::TenantManager;

/// Serves one client connection. Holds the connection's LISTEN subscriptions.
pub struct FleetHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetQueryParser>,
    listening: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl FleetHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one statement, recording its latency and outcome, then hand any
    /// pending notifications to the client.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = Actor::from_login(client.metadata().get("user").map_or("", String::as_str));
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        self.deliver_notifications(client).await?;
        result
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = self.drain_notifications().await;
        let pid = std::process::id() as i32;
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    /// Everything received on subscribed channels since the last call, as
    /// (channel, JSON payload). Channels of deleted assets are dropped.
    async fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut listening = self.listening.lock().await;
        let mut pending = Vec::new();
        let mut closed = Vec::new();
        for (channel, rx) in listening.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => pending.push((channel.clone(), payload)),
                        Err(e) => tracing::warn!("unencodable event on {channel}: {e}"),
                    },
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        tracing::warn!("{channel}: listener lagged, {n} events dropped");
                    }
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Closed) => {
                        closed.push(channel.clone());
                        break;
                    }
                }
            }
        }
        for channel in closed {
            listening.remove(&channel);
        }
        pending
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, name, role } => {
                engine.create_user(actor, id, name, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAsset { id, name, number_plate, category } => {
                engine
                    .create_asset(actor, id, name, number_plate, category)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateAsset { id, patch } => {
                engine.update_asset(actor, id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAsset { id } => {
                engine.delete_asset(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking { booking } => {
                let new = new_booking(actor, booking)?;
                engine.create_booking(actor, new).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertBookings { bookings } => {
                let batch = bookings
                    .into_iter()
                    .map(|row| new_booking(actor, row))
                    .collect::<PgWireResult<Vec<_>>>()?;
                let created = engine
                    .batch_create_bookings(actor, batch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(actor, id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DecideBooking { id, approve, rejection_reason } => {
                engine
                    .decide_booking(actor, id, approve, rejection_reason)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertDowntime { downtime } => {
                engine.record_downtime(actor, downtime).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateDowntime { id, patch } => {
                engine.update_downtime(actor, id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteDowntime { id } => {
                engine.delete_downtime(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers => {
                engine.role_of(actor).map_err(engine_err)?;
                Ok(query_response(users_schema(), engine.list_users(), |enc, u| {
                    enc.encode_field(&u.id.to_string())?;
                    enc.encode_field(&u.name)?;
                    enc.encode_field(&u.role.as_str())
                }))
            }
            Command::SelectAssets => {
                engine.role_of(actor).map_err(engine_err)?;
                let assets = engine.list_assets(now_ms()).await.map_err(engine_err)?;
                Ok(query_response(assets_schema(), assets, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.name)?;
                    enc.encode_field(&a.number_plate)?;
                    enc.encode_field(&a.category.as_str())?;
                    enc.encode_field(&a.status.as_str())?;
                    enc.encode_field(&a.in_downtime)
                }))
            }
            Command::SelectBookings { asset_id, start, end } => {
                let mut bookings = engine
                    .list_bookings(actor, asset_id)
                    .await
                    .map_err(engine_err)?;
                bookings.retain(|b| {
                    start.is_none_or(|s| b.span.end > s) && end.is_none_or(|e| b.span.start < e)
                });
                Ok(bookings_response(bookings))
            }
            Command::SelectCalendar { asset_id, start, end } => {
                let window = Span::try_new(start, end).map_err(|e| engine_err(e.into()))?;
                let bookings = engine
                    .calendar(actor, asset_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(bookings))
            }
            Command::SelectConflicts { asset_id, start, end, exclude_id } => {
                engine.role_of(actor).map_err(engine_err)?;
                let span = Span::try_new(start, end).map_err(|e| engine_err(e.into()))?;
                let hit = engine
                    .check_conflict(asset_id, span, exclude_id)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(hit.into_iter().collect()))
            }
            Command::SelectDowntimes { asset_id } => {
                engine.role_of(actor).map_err(engine_err)?;
                let downtimes = engine.list_downtimes(asset_id).await;
                Ok(query_response(downtimes_schema(), downtimes, |enc, d| {
                    enc.encode_field(&d.id.to_string())?;
                    enc.encode_field(&d.asset_id.to_string())?;
                    enc.encode_field(&d.reason.as_str())?;
                    enc.encode_field(&d.description)?;
                    enc.encode_field(&d.start)?;
                    enc.encode_field(&d.end)?;
                    enc.encode_field(&d.cost_cents)
                }))
            }
            Command::SelectFleetStats => {
                engine.role_of(actor).map_err(engine_err)?;
                let stats = engine.fleet_stats(now_ms()).await.map_err(engine_err)?;
                Ok(query_response(fleet_stats_schema(), vec![stats], |enc, s| {
                    enc.encode_field(&(s.total as i64))?;
                    enc.encode_field(&(s.available as i64))?;
                    enc.encode_field(&(s.booked_soon as i64))?;
                    enc.encode_field(&(s.booked_now as i64))?;
                    enc.encode_field(&(s.in_downtime as i64))
                }))
            }
            Command::SelectFleetCategories => {
                engine.role_of(actor).map_err(engine_err)?;
                let counts = engine.fleet_categories().await;
                Ok(query_response(fleet_categories_schema(), counts, |enc, (cat, n)| {
                    enc.encode_field(&cat.as_str())?;
                    enc.encode_field(&(n as i64))
                }))
            }
            Command::Listen { channel } => {
                let asset_id = notify::parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected asset_{{id}})"),
                    )
                })?;
                let mut listening = self.listening.lock().await;
                if !listening.contains_key(&channel) {
                    listening.insert(channel, engine.notify.subscribe(asset_id));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listening.lock().await.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

/// A booking row without `user_id` is made for the connected user.
fn new_booking(actor: Actor, row: BookingRow) -> PgWireResult<NewBooking> {
    let user_id = match (row.user_id, actor) {
        (Some(id), _) => id,
        (None, Actor::User(id)) => id,
        (None, Actor::System) => {
            return Err(sql_err(SqlError::MissingColumn("bookings", "user_id")));
        }
    };
    Ok(NewBooking {
        id: row.id,
        asset_id: row.asset_id,
        user_id,
        span: Span { start: row.start, end: row.end },
        purpose: row.purpose,
    })
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
    ]
}

fn assets_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("number_plate", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("in_downtime", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("asset_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("purpose", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("decided_by", Type::VARCHAR),
        field("decided_at", Type::INT8),
        field("rejection_reason", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn downtimes_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("asset_id", Type::VARCHAR),
        field("reason", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("cost_cents", Type::INT8),
    ]
}

fn fleet_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("total", Type::INT8),
        field("available", Type::INT8),
        field("booked_soon", Type::INT8),
        field("booked_now", Type::INT8),
        field("in_downtime", Type::INT8),
    ]
}

fn fleet_categories_schema() -> Vec<FieldInfo> {
    vec![field("category", Type::VARCHAR), field("count", Type::INT8)]
}

/// Result columns of a SELECT on `table`, for Describe.
fn schema_for_table(table: &str) -> Vec<FieldInfo> {
    match table {
        "users" => users_schema(),
        "assets" => assets_schema(),
        "bookings" | "calendar" | "conflicts" => bookings_schema(),
        "downtimes" => downtimes_schema(),
        "fleet_stats" => fleet_stats_schema(),
        "fleet_categories" => fleet_categories_schema(),
        _ => vec![],
    }
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql).map_or_else(Vec::new, |t| schema_for_table(&t))
}

fn query_response<T>(
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

fn bookings_response(bookings: Vec<Booking>) -> Response {
    query_response(bookings_schema(), bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.asset_id.to_string())?;
        enc.encode_field(&b.user_id.to_string())?;
        enc.encode_field(&b.span.start)?;
        enc.encode_field(&b.span.end)?;
        enc.encode_field(&b.purpose)?;
        enc.encode_field(&b.status.as_str())?;
        enc.encode_field(&b.decided_by.map(|u| u.to_string()))?;
        enc.encode_field(&b.decided_at)?;
        enc.encode_field(&b.rejection_reason)?;
        enc.encode_field(&b.created_at)
    })
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
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
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Inline bound text parameters as quoted literals in one left-to-right pass.
/// Inlined text is never rescanned, so a value containing `$1` stays literal.
/// Placeholders without a bound value are left as written.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(FleetHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                FleetAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
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

/// Serve one client until it disconnects. Each connection gets its own
/// handler, so LISTEN subscriptions end with the connection.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FleetFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::AssetDown(_) | EngineError::InvalidState { .. } => "55000",
        EngineError::InvalidSpan(_) => "22023",
        EngineError::Forbidden(_) | EngineError::UnknownActor(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
