use std::collections::HashMap;
use std::fmt::Debug;
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

use crate::auth::{actor_for_user, SharedPasswordAuth};
use crate::calendar::day_span;
use crate::engine::{
    setting_values, BookingRequest, EngineError, SessionFilter, SlotQuery, WaitlistFilter,
    WaitlistRequest,
};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::{Tenant, TenantManager};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StudioSlotFactory::new(tenants, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Query handler for one connection. LISTEN subscriptions live here and
/// are delivered to the client after each statement.
pub struct StudioSlotHandler {
    tenants: Arc<TenantManager>,
    query_parser: Arc<StudioSlotQueryParser>,
    listening: Mutex<HashMap<String, broadcast::Receiver<DomainEvent>>>,
}

impl StudioSlotHandler {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            query_parser: Arc::new(StudioSlotQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    /// Tenant from the database name, actor from the user name.
    fn session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Tenant, Actor)> {
        let metadata = client.metadata();
        let db = metadata.get("database").map(String::as_str).unwrap_or("default");
        let actor = actor_for_user(metadata.get("user").map(String::as_str));
        let tenant = self.tenants.get_or_create(db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })?;
        Ok((tenant, actor))
    }

    async fn run<C>(&self, client: &mut C, sql: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (tenant, actor) = self.session(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&tenant, actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        self.deliver_notifications(client).await?;
        result
    }

    /// Send every event buffered on this connection's channels.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for (channel, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel.clone(), event.payload())),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            tracing::warn!("channel {channel}: dropped {n} notifications");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        actor: Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let engine = &tenant.engine;
        match cmd {
            Command::SelectSlots { date, studio_id, coach_id, room_id } => {
                let slots = engine
                    .get_slots(SlotQuery { date, studio_id, coach_id, room_id })
                    .await
                    .map_err(engine_err)?;
                rows_response(slots_schema(), slots, |enc, slot| {
                    enc.encode_field(&slot.time.to_string())?;
                    enc.encode_field(&slot.span.start)?;
                    enc.encode_field(&slot.span.end)?;
                    enc.encode_field(&slot.status.as_str())
                })
            }
            Command::SelectSessions { id, studio_id, client_id, coach_id, status, date } => {
                let mut filter = SessionFilter { id, studio_id, client_id, coach_id, status, ..Default::default() };
                if let Some(date) = date {
                    let day = day_span(date, engine.settings().await.timezone);
                    filter.from = Some(day.start);
                    filter.to = Some(day.end);
                }
                let sessions = engine.list_sessions(&filter).await;
                rows_response(sessions_schema(), sessions, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.studio_id.to_string())?;
                    enc.encode_field(&s.room_id.map(|id| id.to_string()))?;
                    enc.encode_field(&s.coach_id.map(|id| id.to_string()))?;
                    enc.encode_field(&s.client_id.to_string())?;
                    enc.encode_field(&s.package_id.to_string())?;
                    enc.encode_field(&s.span.start)?;
                    enc.encode_field(&s.span.end)?;
                    enc.encode_field(&s.status.as_str())?;
                    enc.encode_field(&s.cancellation_reason)
                })
            }
            Command::SelectWaitlist { id, client_id, studio_id, status, preferred_date } => {
                let filter = WaitlistFilter { id, client_id, studio_id, status, preferred_date };
                let entries = engine.list_waitlist(&filter).await;
                rows_response(waitlist_schema(), entries, |enc, (e, position)| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.client_id.to_string())?;
                    enc.encode_field(&e.studio_id.map(|id| id.to_string()))?;
                    enc.encode_field(&e.preferred_date.to_string())?;
                    enc.encode_field(&e.preferred_time_slot.to_string())?;
                    enc.encode_field(&e.status.as_str())?;
                    enc.encode_field(&position.map(|p| p as i64))?;
                    enc.encode_field(&e.created_at)?;
                    enc.encode_field(&e.notified_at)?;
                    enc.encode_field(&e.offer.as_ref().and_then(|o| o.respond_by))?;
                    enc.encode_field(&e.session_id.map(|id| id.to_string()))?;
                    enc.encode_field(&e.notes)
                })
            }
            Command::SelectPackages { client_id } => {
                let packages = engine.list_packages(client_id).await;
                rows_response(packages_schema(), packages, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.client_id.to_string())?;
                    enc.encode_field(&p.package_id.map(|id| id.to_string()))?;
                    enc.encode_field(&(p.sessions_used as i64))?;
                    enc.encode_field(&(p.sessions_remaining as i64))?;
                    enc.encode_field(&p.expiry_date)?;
                    enc.encode_field(&p.status.as_str())
                })
            }
            Command::SelectTimeOff { coach_id } => {
                let requests = engine.list_time_off(coach_id).await;
                rows_response(time_off_schema(), requests, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.coach_id.to_string())?;
                    enc.encode_field(&t.span.start)?;
                    enc.encode_field(&t.span.end)?;
                    enc.encode_field(&t.status.as_str())?;
                    enc.encode_field(&t.notes)?;
                    enc.encode_field(&t.requested_at)?;
                    enc.encode_field(&t.reviewed_at)
                })
            }
            Command::SelectAvailability { owner_id } => {
                let rules = engine.list_rules(owner_id).await.map_err(engine_err)?;
                rows_response(availability_schema(), rules, |enc, r| {
                    enc.encode_field(&r.owner.id().to_string())?;
                    enc.encode_field(&(r.day_of_week as i32))?;
                    enc.encode_field(&r.start_time.to_string())?;
                    enc.encode_field(&r.end_time.to_string())?;
                    enc.encode_field(&r.available)
                })
            }
            Command::SelectSettings => {
                let values = setting_values(&engine.settings().await);
                rows_response(settings_schema(), values, |enc, (key, value)| {
                    enc.encode_field(key)?;
                    enc.encode_field(value)
                })
            }
            Command::InsertSession { id, client_id, studio_id, room_id, coach_id, start, end } => {
                let request = BookingRequest {
                    id: id.unwrap_or_else(Ulid::new),
                    client_id,
                    studio_id,
                    room_id,
                    coach_id,
                    span: Span { start, end },
                };
                engine.create_booking(request).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertCancellation { session_id, reason } => {
                engine.cancel_booking(session_id, reason).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAttendance { session_id, status } => {
                engine.mark_attendance(actor, session_id, status).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertWaitlist { id, client_id, studio_id, preferred_date, preferred_time_slot, notes } => {
                engine
                    .join_waitlist(WaitlistRequest {
                        id: id.unwrap_or_else(Ulid::new),
                        client_id,
                        studio_id,
                        preferred_date,
                        preferred_time_slot,
                        notes,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteWaitlist { id } => {
                engine.cancel_waitlist_entry(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertWaitlistConfirmation { entry_id } => {
                engine.confirm_waitlist_offer(entry_id).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAvailability { owner_id, rules } => {
                let owner = engine.schedule_owner(owner_id).map_err(engine_err)?;
                let count = rules.len();
                let rules = rules
                    .into_iter()
                    .map(|r| AvailabilityRule {
                        owner,
                        day_of_week: r.day_of_week,
                        start_time: r.start_time,
                        end_time: r.end_time,
                        available: r.available,
                    })
                    .collect();
                engine.update_availability(actor, owner, rules).await.map_err(engine_err)?;
                Ok(inserted(count))
            }
            Command::DeleteAvailability { owner_id } => {
                let owner = engine.schedule_owner(owner_id).map_err(engine_err)?;
                let count = engine.list_rules(owner_id).await.map_err(engine_err)?.len();
                engine.update_availability(actor, owner, Vec::new()).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(count)))
            }
            Command::InsertTimeOff { id, coach_id, start, end, notes } => {
                engine
                    .submit_time_off(actor, id.unwrap_or_else(Ulid::new), coach_id, Span { start, end }, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTimeOffReview { request_id, decision } => {
                engine.review_time_off(actor, request_id, decision).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertStudio { id, name, capacity } => {
                engine
                    .create_studio(actor, id.unwrap_or_else(Ulid::new), name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertRoom { id, studio_id, name, capacity } => {
                engine
                    .create_room(actor, id.unwrap_or_else(Ulid::new), studio_id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertCoach { id, name } => {
                engine
                    .create_coach(actor, id.unwrap_or_else(Ulid::new), name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertPackage { id, client_id, package_id, sessions, expires_at } => {
                engine
                    .grant_package(actor, id.unwrap_or_else(Ulid::new), client_id, package_id, sessions, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSetting { key, value } => {
                engine.set_setting(actor, &key, &value).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::Listen { channel } => {
                let studio_id = parse_channel(&channel)?;
                let rx = tenant.hub.subscribe(studio_id);
                self.listening.lock().await.insert(channel, rx);
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

/// `studio_<ulid>`
fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("studio_").ok_or_else(|| {
        user_error("42000", format!("invalid channel: {channel} (expected studio_{{id}})"))
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("time", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("studio_id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("coach_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("package_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("cancellation_reason", Type::VARCHAR),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("studio_id", Type::VARCHAR),
        field("preferred_date", Type::VARCHAR),
        field("preferred_time_slot", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("position", Type::INT8),
        field("created_at", Type::INT8),
        field("notified_at", Type::INT8),
        field("respond_by", Type::INT8),
        field("session_id", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn packages_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("package_id", Type::VARCHAR),
        field("sessions_used", Type::INT8),
        field("sessions_remaining", Type::INT8),
        field("expires_at", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn time_off_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("coach_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("requested_at", Type::INT8),
        field("reviewed_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("owner_id", Type::VARCHAR),
        field("day_of_week", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("available", Type::BOOL),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![field("key", Type::VARCHAR), field("value", Type::VARCHAR)]
}

/// Result columns of a statement, by the table a SELECT reads.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("slots") => slots_schema(),
        Some("sessions") => sessions_schema(),
        Some("waitlist") => waitlist_schema(),
        Some("packages") => packages_schema(),
        Some("time_off") => time_off_schema(),
        Some("availability") => availability_schema(),
        Some("settings") => settings_schema(),
        _ => vec![],
    }
}

fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    words.skip_while(|w| *w != "from").nth(1).map(|t| {
        t.trim_matches(|c: char| c == '"' || c == ';').to_string()
    })
}

#[async_trait]
impl SimpleQueryHandler for StudioSlotHandler {
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
        let statements = sql::split_statements(query);
        if statements.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        let mut responses = Vec::with_capacity(statements.len());
        for statement in statements {
            responses.push(self.run(client, statement).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StudioSlotQueryParser;

#[async_trait]
impl QueryParser for StudioSlotQueryParser {
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
impl ExtendedQueryHandler for StudioSlotHandler {
    type Statement = String;
    type QueryParser = StudioSlotQueryParser;

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

/// Inline bound parameters as quoted text literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// One pass over `sql`: each `$N` outside a string literal is replaced by
/// parameter N exactly once, so bound text is never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StudioSlotFactory {
    handler: Arc<StudioSlotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StudioSlotFactory {
    pub fn new(tenants: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(StudioSlotHandler::new(tenants)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StudioSlotFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::QuotaExceeded { .. } => "53400",
        EngineError::NoSessionCredit { .. } => "53401",
        EngineError::SlotFull { .. } => "53402",
        EngineError::CoachConflict { .. } => "23P01",
        EngineError::InvalidTimeRange(_) => "22023",
        EngineError::NotFound(..) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::DuplicateWaitlistEntry(_) => "23505",
        EngineError::StudioRequired(_) => "23502",
        // response window elapsed
        EngineError::OfferLapsed(_) => "25P03",
        EngineError::InvalidState { .. } => "55000",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM sessions"), 0);
        assert_eq!(count_params("INSERT INTO sessions VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM slots WHERE date = $2 AND studio_id = $10"), 10);
    }

    #[test]
    fn params_are_inlined_once() {
        let params = [Some("cost $2".as_bytes()), Some("O'Neil".as_bytes()), None];
        assert_eq!(
            inline_params("INSERT INTO t VALUES ($1, $2, $3)", &params),
            "INSERT INTO t VALUES ('cost $2', 'O''Neil', NULL)"
        );
        let many: Vec<Option<&[u8]>> = (1..=10).map(|_| Some("x".as_bytes())).collect();
        assert_eq!(inline_params("$10 $1", &many), "'x' 'x'");
        // Unbound or quoted placeholders stay as written
        assert_eq!(inline_params("SELECT '$1', $4", &params), "SELECT '$1', $4");
    }

    #[test]
    fn select_table_picks_from_clause() {
        assert_eq!(select_table("SELECT * FROM slots WHERE date = $1").as_deref(), Some("slots"));
        assert_eq!(select_table("select time, status from \"waitlist\";").as_deref(), Some("waitlist"));
        assert_eq!(select_table("INSERT INTO sessions VALUES ($1)"), None);
    }

    #[test]
    fn result_schema_per_table() {
        assert_eq!(result_schema("SELECT * FROM slots").len(), 4);
        assert_eq!(result_schema("SELECT * FROM settings").len(), 2);
        assert!(result_schema("INSERT INTO settings VALUES ('a', 'b')").is_empty());
    }

    #[test]
    fn channel_must_name_a_studio() {
        let id = Ulid::new();
        assert_eq!(parse_channel(&format!("studio_{id}")).unwrap(), id);
        assert!(parse_channel(&format!("resource_{id}")).is_err());
        assert!(parse_channel("studio_nope").is_err());
    }

    #[test]
    fn sqlstates_are_distinct() {
        let id = Ulid::nil();
        let errors = [
            EngineError::QuotaExceeded { reason: String::new(), usage: None },
            EngineError::NoSessionCredit { remaining: 0 },
            EngineError::SlotFull { capacity: 1, booked: 1 },
            EngineError::CoachConflict { coach_id: id, session_id: id },
            EngineError::InvalidTimeRange(String::new()),
            EngineError::NotFound("session", id),
            EngineError::Forbidden(String::new()),
            EngineError::DuplicateWaitlistEntry(id),
            EngineError::StudioRequired(2),
            EngineError::OfferLapsed(id),
            EngineError::InvalidState { from: "a", to: "b" },
            EngineError::AlreadyExists(id),
            EngineError::LimitExceeded("x"),
            EngineError::WalError(String::new()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(sqlstate).collect();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(sqlstate(&errors[0]), "53400");
        assert_eq!(sqlstate(&errors[1]), "53401");
    }
}
