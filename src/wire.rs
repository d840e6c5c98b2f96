use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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

use crate::admission::{AdmissionController, AdmissionError};
use crate::cache::Counters;
use crate::grid::GridAdapter;
use crate::ledger::{Ledger, LedgerError, LedgerStore};
use crate::observability::{QUERIES_TOTAL, command_label};
use crate::sql::{self, Command, SqlError};

/// The controller as the server runs it.
pub type Controller = AdmissionController<Ledger, Counters>;

pub struct SlotgateHandler {
    controller: Arc<Controller>,
    query_parser: Arc<SlotgateQueryParser>,
}

impl SlotgateHandler {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            query_parser: Arc::new(SlotgateQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let ctl = &self.controller;
        match cmd {
            Command::RegisterUser { user_id } => {
                let added = ctl.register_user(user_id).await.map_err(admission_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(added as usize)))
            }
            Command::Claim {
                user_id,
                resource_id,
            } => {
                let outcome = ctl
                    .request_claim(user_id, &resource_id)
                    .await
                    .map_err(admission_err)?;
                let schema = Arc::new(outcome_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.label())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Release { user_id, pool_id } => {
                let released = ctl
                    .release_claim(user_id, &pool_id)
                    .await
                    .map_err(admission_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(released as usize)))
            }
            Command::SelectClaims { user_id } => {
                let claims = ctl
                    .ledger()
                    .claims_of(user_id)
                    .await
                    .map_err(ledger_err)?;
                let schema = Arc::new(claims_schema());
                let rows: Vec<PgWireResult<_>> = claims
                    .into_iter()
                    .map(|claim| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&claim.user_id)?;
                        encoder.encode_field(&claim.resource_id)?;
                        encoder.encode_field(&claim.pool_id)?;
                        encoder.encode_field(&claim.claimed_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRemaining { pool_id } => {
                let pools: Vec<(String, u32)> = match pool_id {
                    Some(id) => {
                        let capacity = ctl.model().capacity_of(&id).map_err(|e| admission_err(e.into()))?;
                        vec![(id, capacity)]
                    }
                    None => ctl.model().pools().map(|p| (p.id.clone(), p.capacity)).collect(),
                };
                let schema = Arc::new(remaining_schema());
                let mut rows = Vec::with_capacity(pools.len());
                for (id, capacity) in pools {
                    let remaining = ctl.get_remaining(&id).await.map_err(admission_err)?;
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&id)?;
                    encoder.encode_field(&(capacity as i64))?;
                    encoder.encode_field(&(remaining as i64))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots { room, grid } => {
                let model = ctl.model();
                let grid = match &grid {
                    Some(name) => model.grid(name),
                    None => model.grids().iter().find(|g| g.rooms().iter().any(|r| *r == room)),
                }
                .ok_or_else(|| {
                    user_err(
                        "42704",
                        format!("no grid {} with room {room}", grid.as_deref().unwrap_or("*")),
                    )
                })?;
                let adapter = GridAdapter::new(ctl.clone(), grid.clone());
                let slots = adapter.availability(&room).await.map_err(admission_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.resource_id)?;
                        encoder.encode_field(&slot.room)?;
                        encoder.encode_field(&slot.time)?;
                        encoder.encode_field(&slot.taken)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Resync { pool_id } => {
                let pools = match pool_id {
                    Some(id) => {
                        ctl.resync(&id).await.map_err(admission_err)?;
                        1
                    }
                    None => {
                        ctl.resync_all().await.map_err(admission_err)?;
                        ctl.model().pool_ids().count()
                    }
                };
                Ok(Response::Execution(Tag::new("RESYNC").with_rows(pools)))
            }
        }
    }
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn outcome_schema() -> Vec<FieldInfo> {
    vec![varchar("outcome")]
}

fn claims_schema() -> Vec<FieldInfo> {
    vec![
        int8("user_id"),
        varchar("resource_id"),
        varchar("pool_id"),
        int8("claimed_at"),
    ]
}

fn remaining_schema() -> Vec<FieldInfo> {
    vec![varchar("pool_id"), int8("capacity"), int8("remaining")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("resource_id"),
        varchar("room"),
        varchar("time"),
        FieldInfo::new("taken".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

/// Row shape of a statement, decided from its target table so that it works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let tokens: Vec<String> = sql
        .split_whitespace()
        .map(|t| t.trim_end_matches(';').to_lowercase())
        .collect();
    let after = |keyword: &str| {
        tokens
            .iter()
            .position(|t| t == keyword)
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.split('(').next().unwrap_or_default().to_string())
    };
    match tokens.first().map(String::as_str) {
        Some("insert") if after("into").as_deref() == Some("claims") => outcome_schema(),
        Some("select") => match after("from").as_deref() {
            Some("claims") => claims_schema(),
            Some("remaining") => remaining_schema(),
            Some("slots") => slots_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotgateHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotgateQueryParser;

#[async_trait]
impl QueryParser for SlotgateQueryParser {
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
impl ExtendedQueryHandler for SlotgateHandler {
    type Statement = String;
    type QueryParser = SlotgateQueryParser;

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
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 does not clobber the prefix of $10.
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

/// The bot and the admin tools share one password; logins are only told apart in the log.
#[derive(Debug)]
struct SharedPassword(String);

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            "login user={} host={}",
            login.user().unwrap_or("-"),
            login.host()
        );
        Ok(Password::new(None, self.0.as_bytes().to_vec()))
    }
}

pub struct SlotgateFactory {
    handler: Arc<SlotgateHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotgateFactory {
    pub fn new(controller: Arc<Controller>, password: String) -> Self {
        let auth_source = SharedPassword(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotgateHandler::new(controller)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotgateFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotgateFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_err(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn admission_err(e: AdmissionError) -> PgWireError {
    let code = match &e {
        AdmissionError::UnknownResource(_) | AdmissionError::UnknownPool(_) => "42704",
        AdmissionError::Config(_) => "22023",
        // Retryable: nothing was applied.
        AdmissionError::Ledger(_) => "40001",
        AdmissionError::Cache(_) => "58000",
    };
    user_err(code, e.to_string())
}

fn ledger_err(e: LedgerError) -> PgWireError {
    admission_err(AdmissionError::Ledger(e))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_follows_target_table() {
        assert_eq!(
            result_schema("INSERT INTO claims (user_id, resource_id) VALUES ($1, $2)").len(),
            1
        );
        assert!(result_schema("INSERT INTO users VALUES ($1)").is_empty());
        assert_eq!(result_schema("select * from claims where user_id = $1").len(), 4);
        assert_eq!(result_schema("SELECT * FROM remaining;").len(), 3);
        assert_eq!(result_schema("SELECT * FROM slots WHERE room = 'vr1'").len(), 4);
        assert!(result_schema("DELETE FROM claims WHERE user_id = 1").is_empty());
        assert!(result_schema("RESYNC").is_empty());
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(
            count_params("INSERT INTO claims (user_id, resource_id) VALUES ($1, $2)"),
            2
        );
        assert_eq!(count_params("x = $10 AND y = $3"), 10);
    }

    #[test]
    fn admission_errors_map_to_sqlstate() {
        let err = admission_err(AdmissionError::UnknownResource("x".into()));
        assert!(format!("{err:?}").contains("42704"));
        let err = admission_err(AdmissionError::Ledger(LedgerError::Wal("disk".into())));
        assert!(format!("{err:?}").contains("40001"));
    }
}
