use std::fmt::Debug;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::KitbookAuthSource;
use crate::engine::{CartRejection, Clearance, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct KitbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<KitbookQueryParser>,
}

/// Who is running the statement, taken from the startup metadata.
struct Session {
    engine: Arc<Engine>,
    user: String,
}

impl KitbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(KitbookQueryParser),
        }
    }

    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })?;
        let user = metadata.get("user").cloned().unwrap_or_default();
        Ok(Session { engine, user })
    }

    async fn run(&self, session: &Session, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(session, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        session: &Session,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &*session.engine;
        match cmd {
            Command::InsertProduct(product) => {
                engine.create_product(product).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertStudio(studio) => {
                engine.create_studio(studio).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertStaff(staff) => {
                engine.create_staff(staff).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertEquipment(unit) => {
                engine.create_equipment(unit).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::SetEquipmentStatus { id, status } => {
                engine.set_equipment_status(id, status).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::SetStaffActive { id, active } => {
                engine.set_staff_active(id, active).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::StockUnits { product_id, prefix } => {
                let created = engine.stock_units(product_id, &prefix).await.map_err(engine_err)?;
                Ok(vec![inserted(created.len())])
            }
            Command::PlaceBooking { id, customer, start, end, lines } => {
                let rows = lines.len();
                let request = self
                    .booking_request(session, id, customer, start, end, lines)
                    .await?;
                // Pre-check like the storefront does, then commit against
                // the revision that check saw.
                let revision = engine.revision();
                engine
                    .validate_cart(&request.lines, Some(start), Some(end))
                    .await
                    .map_err(cart_err)?;
                engine
                    .place_booking(request, Some(revision))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(rows)])
            }
            Command::Transition { booking_id, status } => {
                engine
                    .transition_booking(booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::Reschedule { booking_id, start, end } => {
                engine
                    .reschedule_booking(booking_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::Assign { booking_id, resource_id } => {
                engine
                    .assign_resource(booking_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::Release { booking_id, resource_id } => {
                engine
                    .release_resource(booking_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAvailability { product_id, start, end, exclude } => {
                let level = engine
                    .stock_level(product_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&product_id.to_string())?;
                encoder.encode_field(&i64::from(level.total))?;
                encoder.encode_field(&i64::from(level.booked))?;
                encoder.encode_field(&i64::from(level.available))?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectConflicts { resource_id, kind, start, end, exclude } => {
                let kind = match kind {
                    Some(kind) => kind,
                    None => engine
                        .resource_kind(resource_id)
                        .await
                        .ok_or(EngineError::NotFound(resource_id))
                        .map_err(engine_err)?,
                };
                let clearance = engine
                    .check_resource_overlap(kind, resource_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(conflicts_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resource_id.to_string())?;
                match &clearance {
                    Clearance::Free => {
                        encoder.encode_field(&"free")?;
                        encode_nulls(&mut encoder, 4)?;
                    }
                    Clearance::OutOfService(status) => {
                        encoder.encode_field(&status.as_str())?;
                        encode_nulls(&mut encoder, 4)?;
                    }
                    Clearance::Booked(booking) => {
                        encoder.encode_field(&"booked")?;
                        encoder.encode_field(&Some(booking.id.to_string()))?;
                        encoder.encode_field(&Some(booking.customer.name.as_str()))?;
                        encoder.encode_field(&Some(booking.span.start))?;
                        encoder.encode_field(&Some(booking.span.end))?;
                    }
                }
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectSoldOut { product_id, start, end } => {
                let spans = engine
                    .sold_out_spans(product_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(sold_out_schema());
                let rid = product_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectInventory { start, end } => {
                let report = engine.inventory_report(start, end).await.map_err(engine_err)?;
                let schema = Arc::new(inventory_schema());
                let rows: Vec<PgWireResult<DataRow>> = report
                    .into_iter()
                    .map(|row| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&row.product_id.to_string())?;
                        encoder.encode_field(&row.name)?;
                        encoder.encode_field(&row.category.as_str())?;
                        encoder.encode_field(&i64::from(row.total))?;
                        encoder.encode_field(&i64::from(row.booked))?;
                        encoder.encode_field(&i64::from(row.available))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBookings { start, end } => {
                let bookings = engine.list_bookings(start, end).await.map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<DataRow>> = bookings
                    .into_iter()
                    .map(|booking| {
                        let items = serde_json::to_string(&booking.items).map_err(json_err)?;
                        let resources =
                            serde_json::to_string(&booking.resources).map_err(json_err)?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&booking.id.to_string())?;
                        encoder.encode_field(&booking.customer.name)?;
                        encoder.encode_field(&booking.status.as_str())?;
                        encoder.encode_field(&booking.span.start)?;
                        encoder.encode_field(&booking.span.end)?;
                        encoder.encode_field(&booking.created_by)?;
                        encoder.encode_field(&items)?;
                        encoder.encode_field(&resources)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectIssues { booking_id } => {
                let issues = engine.booking_issues(booking_id).await.map_err(engine_err)?;
                let schema = Arc::new(issues_schema());
                let bid = booking_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = issues
                    .into_iter()
                    .map(|issue| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&issue.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectQuote { booking_id } => {
                let quote = engine.quote_booking(booking_id).await.map_err(engine_err)?;
                let schema = Arc::new(quote_schema());
                let money = |v: Minor| i64::try_from(v).unwrap_or(i64::MAX);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking_id.to_string())?;
                encoder.encode_field(&i64::from(quote.days))?;
                encoder.encode_field(&money(quote.items_per_day))?;
                encoder.encode_field(&money(quote.studios_per_day))?;
                encoder.encode_field(&money(quote.per_day))?;
                encoder.encode_field(&money(quote.total))?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
        }
    }

    /// Split `item_id` rows into product lines and exclusive resources.
    async fn booking_request(
        &self,
        session: &Session,
        id: Ulid,
        customer: Customer,
        start: Ms,
        end: Ms,
        rows: Vec<(Ulid, u32)>,
    ) -> PgWireResult<NewBooking> {
        let span = Span::try_new(start, end)
            .ok_or(EngineError::InvalidWindow { start, end })
            .map_err(engine_err)?;
        let mut lines = Vec::new();
        let mut resources = Vec::new();
        for (item_id, quantity) in rows {
            match session.engine.resource_kind(item_id).await {
                Some(_) if quantity != 1 => {
                    return Err(user_error(
                        "22023",
                        format!("{item_id} is an exclusive resource, quantity must be 1"),
                    ));
                }
                Some(_) => resources.push(item_id),
                None => lines.push(CartLine::new(item_id, quantity)),
            }
        }
        Ok(NewBooking {
            id,
            customer,
            span,
            created_by: booked_by(&session.user),
            lines,
            resources,
        })
    }
}

/// The login recorded on a booking. Anonymous sessions record nothing.
fn booked_by(user: &str) -> Option<String> {
    (!user.is_empty()).then(|| user.to_string())
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_nulls(encoder: &mut DataRowEncoder, n: usize) -> PgWireResult<()> {
    for _ in 0..n {
        encoder.encode_field(&None::<String>)?;
    }
    Ok(())
}

// ── Result schemas ───────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        column("product_id", Type::VARCHAR),
        column("total", Type::INT8),
        column("booked", Type::INT8),
        column("available", Type::INT8),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        column("resource_id", Type::VARCHAR),
        column("clearance", Type::VARCHAR),
        column("booking_id", Type::VARCHAR),
        column("customer_name", Type::VARCHAR),
        column("start", Type::INT8),
        column("end", Type::INT8),
    ]
}

fn sold_out_schema() -> Vec<FieldInfo> {
    vec![
        column("product_id", Type::VARCHAR),
        column("start", Type::INT8),
        column("end", Type::INT8),
    ]
}

fn inventory_schema() -> Vec<FieldInfo> {
    vec![
        column("product_id", Type::VARCHAR),
        column("name", Type::VARCHAR),
        column("category", Type::VARCHAR),
        column("total", Type::INT8),
        column("booked", Type::INT8),
        column("available", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("customer_name", Type::VARCHAR),
        column("status", Type::VARCHAR),
        column("start", Type::INT8),
        column("end", Type::INT8),
        column("created_by", Type::VARCHAR),
        column("items", Type::VARCHAR),
        column("resources", Type::VARCHAR),
    ]
}

fn issues_schema() -> Vec<FieldInfo> {
    vec![column("booking_id", Type::VARCHAR), column("issue", Type::VARCHAR)]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        column("booking_id", Type::VARCHAR),
        column("days", Type::INT8),
        column("items_per_day", Type::INT8),
        column("studios_per_day", Type::INT8),
        column("per_day", Type::INT8),
        column("total", Type::INT8),
    ]
}

/// Result columns of a statement, judged from the table after FROM.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("availability") => availability_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("sold_out") => sold_out_schema(),
        Some("inventory") => inventory_schema(),
        Some("bookings") => bookings_schema(),
        Some("booking_issues") => issues_schema(),
        Some("quotes") => quote_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for KitbookHandler {
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
        let session = self.resolve_session(client)?;
        self.run(&session, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct KitbookQueryParser;

#[async_trait]
impl QueryParser for KitbookQueryParser {
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
impl ExtendedQueryHandler for KitbookHandler {
    type Statement = String;
    type QueryParser = KitbookQueryParser;

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
        let session = self.resolve_session(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&session, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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

/// Highest $N parameter placeholder in the SQL string.
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
/// Highest index first so `$1` never eats the prefix of `$10`.
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

pub struct KitbookFactory {
    handler: Arc<KitbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<KitbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl KitbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = KitbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(KitbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for KitbookFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = KitbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match e {
        // serialization_failure: clients retry after re-checking.
        EngineError::ConcurrentConflict => "40001",
        _ => "P0001",
    };
    user_error(code, e.to_string())
}

fn cart_err(e: CartRejection) -> PgWireError {
    user_error("P0001", e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn json_err(e: serde_json::Error) -> PgWireError {
    user_error("XX000", format!("encoding error: {e}"))
}
