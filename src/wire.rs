use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{BookingFilter, Engine, EngineError, Rejection, parse_date};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SelectFilter, SqlError};

const BOOKING_COLUMNS: [&str; 12] = [
    "id",
    "resident_id",
    "resident_name",
    "resident_email",
    "amenity_id",
    "booking_date",
    "start_time",
    "end_time",
    "booking_time",
    "status",
    "starts_at",
    "ends_at",
];

pub struct ConciergeHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ConciergeQueryParser>,
}

impl ConciergeHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ConciergeQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertBooking {
                id,
                resident_id,
                resident_name,
                resident_email,
                amenity_id,
                booking_date,
                time,
            } => {
                let date = parse_date(&booking_date).map_err(date_err)?;
                let request = BookingRequest {
                    resident_id,
                    resident_name,
                    resident_email,
                    amenity_id,
                    date,
                    time,
                };
                self.engine
                    .request_booking(id.unwrap_or_else(Ulid::new), request)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBooking {
                id,
                status,
                time,
                resident_name,
                resident_email,
            } => {
                let patch = BookingPatch {
                    status,
                    time,
                    resident_name,
                    resident_email,
                };
                self.engine.update_booking(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                self.engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let filter = booking_filter(filter).map_err(date_err)?;
                let bookings = self.engine.list_bookings(&filter).await;

                let schema = Arc::new(booking_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        for value in booking_row(b) {
                            encoder.encode_field(&value)?;
                        }
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn booking_filter(raw: SelectFilter) -> Result<BookingFilter, Rejection> {
    let date = raw.booking_date.as_deref().map(parse_date).transpose()?;
    Ok(BookingFilter {
        id: raw.id,
        resident_id: raw.resident_id,
        amenity_id: raw.amenity_id,
        date,
        status: raw.status,
    })
}

fn booking_row(b: &BookingRecord) -> [String; 12] {
    [
        b.id.to_string(),
        b.resident_id.clone(),
        b.resident_name.clone(),
        b.resident_email.clone(),
        b.amenity_id.clone(),
        b.date.format("%Y-%m-%d").to_string(),
        b.slot.start.to_string(),
        b.slot.end.to_string(),
        b.slot.label(),
        b.status.to_string(),
        b.starts_at().format("%Y-%m-%dT%H:%M:%S").to_string(),
        b.ends_at().format("%Y-%m-%dT%H:%M:%S").to_string(),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    BOOKING_COLUMNS
        .iter()
        .map(|name| FieldInfo::new(name.to_string(), None, None, Type::VARCHAR, FieldFormat::Text))
        .collect()
}

fn is_select(sql: &str) -> bool {
    sql.trim_start().to_uppercase().starts_with("SELECT")
}

#[async_trait]
impl SimpleQueryHandler for ConciergeHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ConciergeQueryParser;

#[async_trait]
impl QueryParser for ConciergeQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        if is_select(stmt) {
            Ok(booking_schema())
        } else {
            Ok(vec![])
        }
    }
}

#[async_trait]
impl ExtendedQueryHandler for ConciergeHandler {
    type Statement = String;
    type QueryParser = ConciergeQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
        let fields = if is_select(&target.statement) { booking_schema() } else { vec![] };
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        if is_select(&target.statement.statement) {
            Ok(DescribePortalResponse::new(booking_schema()))
        } else {
            Ok(DescribePortalResponse::new(vec![]))
        }
    }
}

/// Byte spans and numbers of the `$N` placeholders in `sql`. Text inside
/// single-quoted literals and double-quoted identifiers is skipped.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote closes and reopens, so it needs no special case.
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute `$N` placeholders with bound parameter values (text format) as
/// quoted literals, in one pass. Substituted text is never rescanned.
/// Placeholders without a bound value are left for the parser to reject.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ConciergeFactory {
    handler: Arc<ConciergeHandler>,
    noop: Arc<NoopHandler>,
}

impl ConciergeFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(ConciergeHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ConciergeFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let factory = Arc::new(ConciergeFactory::new(engine));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(Rejection::InvalidInput(_)) => "22023",
        EngineError::Rejected(Rejection::SlotOverlap(_)) => "23P01",
        EngineError::Rejected(Rejection::ConsecutiveDayLimitExceeded) => "23514",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } | EngineError::NotActive(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

/// Malformed booking dates get `invalid_datetime_format` rather than the
/// generic invalid-parameter code.
fn date_err(r: Rejection) -> PgWireError {
    user_error("22007", EngineError::from(r).to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::InvalidValue(_) => "22023",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("UPDATE bookings SET status = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("VALUES ($1, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM bookings WHERE resident_id = 'cost$9' AND id = $1"), 1);
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings (resident_id, amenity_id) VALUES ($1, $2)";
        assert_eq!(
            substitute_params(sql, &[Some("unit$2"), Some("pool$1")]),
            "INSERT INTO bookings (resident_id, amenity_id) VALUES ('unit$2', 'pool$1')"
        );
    }

    #[test]
    fn substitution_quotes_and_skips_literals() {
        assert_eq!(
            substitute_params("SELECT '$1', $1, $2", &[Some("O'Brien"), None]),
            "SELECT '$1', 'O''Brien', NULL"
        );
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(format!("v{i}"))).collect();
        assert_eq!(substitute_params("VALUES ($10, $1)", &params), "VALUES ('v10', 'v1')");
        // Unbound placeholders stay put.
        assert_eq!(substitute_params("VALUES ($1, $3)", &[Some("a")]), "VALUES ('a', $3)");
    }

    #[test]
    fn rejections_map_to_distinct_sqlstates() {
        assert_eq!(engine_sqlstate(&Rejection::InvalidInput("x".into()).into()), "22023");
        assert_eq!(engine_sqlstate(&Rejection::SlotOverlap(Ulid::nil()).into()), "23P01");
        assert_eq!(engine_sqlstate(&Rejection::ConsecutiveDayLimitExceeded.into()), "23514");
    }

    #[test]
    fn booking_row_formats_times() {
        let record = BookingRecord {
            id: Ulid::nil(),
            resident_id: "r1".into(),
            resident_name: "Ruth".into(),
            resident_email: "ruth@example.com".into(),
            amenity_id: "pool".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            slot: TimeSlot::new(
                TimeOfDay::from_hm(9, 5).unwrap(),
                TimeOfDay::from_hm(10, 0).unwrap(),
            ),
            status: BookingStatus::Pending,
            created_at: 0,
        };
        let row = booking_row(&record);
        assert_eq!(row.len(), BOOKING_COLUMNS.len());
        let col = |name: &str| {
            let i = BOOKING_COLUMNS.iter().position(|c| *c == name).unwrap();
            row[i].as_str()
        };
        assert_eq!(col("resident_email"), "ruth@example.com");
        assert_eq!(col("booking_date"), "2024-03-10");
        assert_eq!(col("start_time"), "09:05");
        assert_eq!(col("booking_time"), "09:05-10:00");
        assert_eq!(col("status"), "Pending");
        assert_eq!(col("starts_at"), "2024-03-10T09:05:00");
        assert_eq!(col("ends_at"), "2024-03-10T10:00:00");
    }

    #[test]
    fn filter_with_bad_date_is_invalid_input() {
        let raw = SelectFilter {
            booking_date: Some("10/03/2024".into()),
            ..Default::default()
        };
        assert!(matches!(booking_filter(raw), Err(Rejection::InvalidInput(_))));
    }
}
