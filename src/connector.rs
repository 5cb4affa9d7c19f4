//! A single physical connection to PostgreSQL.
//!
//! This module provides the connector type that handles:
//! - TCP connection establishment, startup and authentication
//! - Pipelined extended-protocol batches driven by the statement cache
//! - Simple queries, explicit prepare/unprepare, transactions
//! - Session reset before reuse and out-of-band cancellation
//!
//! Only one send/receive cycle may be in flight on a connector. Exclusive
//! access is enforced by `&mut self`; a cycle abandoned half way (its
//! future dropped) leaves the connector in `Executing`, and the next user
//! action breaks it instead of reading a desynchronized stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::cache::{StatementCache, StatementKey};
use crate::command::{Command, QueryResult, Transaction};
use crate::error::{PgError, PgResult, ServerError};
use crate::metrics::COUNTERS;
use crate::protocol::*;
use crate::scram::{md5_password, ScramClient, SCRAM_SHA_256};
use crate::settings::ConnectionSettings;
use crate::statement::{ExecutionPlan, StatementPlan};
use crate::types::{Oid, Parameter, PgValue, TypeMapper};

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Query sent before reuse when nothing is prepared.
const RESET_ALL: &str = "DISCARD ALL";
/// Reset that keeps prepared statements alive.
const RESET_KEEP_PREPARED: &str =
    "UNLISTEN *; SELECT pg_advisory_unlock_all(); DISCARD SEQUENCES; DISCARD TEMP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Ready,
    /// A send/receive cycle is in progress.
    Executing,
    Broken,
    Closed,
}

/// Reply expected for one written message, in write order.
#[derive(Debug)]
enum Expect {
    Reset,
    CloseComplete,
    ParseComplete { named: Option<StatementKey> },
    BindComplete,
    /// Describe of the unnamed portal; caches columns for named statements.
    Describe { key: Option<StatementKey> },
    /// Describe of a named statement during an explicit prepare.
    ParameterDescription,
    StatementDescription { key: StatementKey },
    Rows { columns: Option<SharedColumns> },
    SimpleQuery,
    ReadyForQuery,
}

// ============================================================================
// Connector
// ============================================================================

pub struct Connector {
    id: u64,
    settings: Arc<ConnectionSettings>,
    reader: ReadBuffer,
    /// Taken while a writer task finishes a batch.
    writer: Option<WriteBuffer>,
    state: ConnectorState,
    /// Pool epoch at open time.
    clear_counter: u64,
    release_timestamp: Instant,
    backend_pid: i32,
    backend_secret_key: i32,
    transaction_status: TransactionStatus,
    transaction: Option<Transaction>,
    parameters: HashMap<String, String>,
    cache: StatementCache,
    type_mapper: Arc<dyn TypeMapper>,
    /// Queries pipelined ahead of the next user action.
    pending_reset: Vec<String>,
}

impl Connector {
    /// Connect and authenticate, bounded by the settings' `timeout`.
    pub async fn open(
        settings: Arc<ConnectionSettings>,
        clear_counter: u64,
        type_mapper: Arc<dyn TypeMapper>,
    ) -> PgResult<Self> {
        let limit = settings.timeout_opt();
        bounded(limit, Self::connect(settings, clear_counter, type_mapper)).await
    }

    async fn connect(
        settings: Arc<ConnectionSettings>,
        clear_counter: u64,
        type_mapper: Arc<dyn TypeMapper>,
    ) -> PgResult<Self> {
        let id = NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connector_id = id, host = %settings.host, port = settings.port, "opening connector");

        let stream = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let cache = StatementCache::new(settings.max_auto_prepare, settings.auto_prepare_min_usages);
        let mut conn = Self {
            id,
            settings,
            reader: ReadBuffer::new(read_half),
            writer: Some(WriteBuffer::new(write_half)),
            state: ConnectorState::Ready,
            clear_counter,
            release_timestamp: Instant::now(),
            backend_pid: 0,
            backend_secret_key: 0,
            transaction_status: TransactionStatus::Idle,
            transaction: None,
            parameters: HashMap::new(),
            cache,
            type_mapper,
            pending_reset: Vec::new(),
        };

        conn.startup().await?;
        debug!(connector_id = id, backend_pid = conn.backend_pid, "connector opened");
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> PgResult<()> {
        let mut params = vec![
            ("user".to_string(), self.settings.user.clone()),
            ("database".to_string(), self.settings.database.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(name) = &self.settings.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        self.send(&StartupMessage { params }).await?;

        loop {
            match self.reader.read_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    self.send(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&self.settings.user, self.password()?, &salt);
                    self.send(&PasswordMessage { password: hash }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram().await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ServerError::from_fields(&fields).into());
                }
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self) -> PgResult<()> {
        let mut scram = ScramClient::new(&self.settings.user, self.password()?);
        self.send(&SaslInitialResponseMessage {
            mechanism: SCRAM_SHA_256.to_string(),
            data: scram.client_first_message(),
        })
        .await?;

        loop {
            match self.reader.read_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram.process_server_first(&data)?;
                    self.send(&SaslResponseMessage { data: client_final }).await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram.verify_server_final(&data)?;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ServerError::from_fields(&fields).into());
                }
                _ => {}
            }
        }
    }

    fn password(&self) -> PgResult<&str> {
        self.settings
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    // ========================================================================
    // User actions
    // ========================================================================

    fn start_user_action(&mut self) -> PgResult<()> {
        match self.state {
            ConnectorState::Ready => {
                self.state = ConnectorState::Executing;
                Ok(())
            }
            ConnectorState::Executing => {
                self.mark_broken("previous operation never completed");
                Err(PgError::OperationInProgress(
                    "a previous operation on this connector did not complete".to_string(),
                ))
            }
            ConnectorState::Broken => Err(PgError::ConnectorBroken),
            ConnectorState::Closed => Err(PgError::ConnectionClosed),
        }
    }

    fn end_user_action<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        match &result {
            Err(e) if e.is_fatal() => self.mark_broken(&e.to_string()),
            _ if self.state == ConnectorState::Executing => self.state = ConnectorState::Ready,
            _ => {}
        }
        result
    }

    fn mark_broken(&mut self, reason: &str) {
        if self.state != ConnectorState::Broken && self.state != ConnectorState::Closed {
            warn!(connector_id = self.id, reason, "breaking connector");
            self.state = ConnectorState::Broken;
        }
    }

    /// Execute one command; one result per statement.
    pub async fn execute(&mut self, command: &Command) -> PgResult<Vec<QueryResult>> {
        let mut batch = self.execute_batch(std::slice::from_ref(command)).await?;
        Ok(batch.pop().unwrap_or_default())
    }

    /// Execute a parameterized query and return its last statement's result.
    pub async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut command = Command::new(sql);
        command.parameters = params.iter().cloned().map(Parameter::new).collect();
        let mut results = self.execute(&command).await?;
        results
            .pop()
            .ok_or_else(|| PgError::protocol("Command produced no result"))
    }

    /// Pipeline several commands in one round trip.
    pub async fn execute_batch(&mut self, commands: &[Command]) -> PgResult<Vec<Vec<QueryResult>>> {
        for command in commands {
            command.check_transaction(self.id)?;
        }
        self.start_user_action()?;
        let limit = self.settings.command_timeout_opt();
        let result = bounded(limit, self.run_batch(commands)).await;
        self.end_user_action(result)
    }

    async fn run_batch(&mut self, commands: &[Command]) -> PgResult<Vec<Vec<QueryResult>>> {
        let mut plans = Vec::with_capacity(commands.len());
        let (outbound, expects) = match self.build_batch(commands, &mut plans) {
            Ok(batch) => batch,
            Err(e) => {
                for plan in &plans {
                    self.cache.release(plan);
                }
                self.cache.abort_in_flight();
                return Err(e);
            }
        };

        let _in_flight: Vec<_> = plans
            .iter()
            .map(|plan| COUNTERS.command_started(plan.runs_prepared()))
            .collect();
        let result = self.exchange(outbound, expects, &plans).await;
        for plan in &plans {
            self.cache.release(plan);
        }
        if result.is_err() {
            for _ in &plans {
                COUNTERS.record_command_failed();
            }
        }

        let mut flat = result?.into_iter();
        Ok(plans
            .iter()
            .map(|plan| flat.by_ref().take(plan.statements.len()).collect())
            .collect())
    }

    fn build_batch(
        &mut self,
        commands: &[Command],
        plans: &mut Vec<ExecutionPlan>,
    ) -> PgResult<(Vec<Outbound>, Vec<Expect>)> {
        let raw = self.settings.raw_sql_mode;
        let mut body = Vec::new();
        let mut body_expects = Vec::new();

        for command in commands {
            let fingerprint = self.fingerprint(command)?;
            let plan = self
                .cache
                .plan(&command.sql, &command.parameters, &fingerprint, raw)?;
            plans.push(plan);
            let plan = &plans[plans.len() - 1];

            for (i, step) in plan.steps.iter().enumerate() {
                let statement = &plan.statements[i];
                let key = || (statement.sql.clone(), plan.param_types[i].clone());
                let named = !matches!(step, StatementPlan::Unprepared);

                if !matches!(step, StatementPlan::Prepared { .. }) {
                    body.push(Outbound::Parse(ParseMessage {
                        name: step.statement_name().to_string(),
                        query: statement.sql.clone(),
                        param_types: plan.param_oids(i),
                    }));
                    body_expects.push(Expect::ParseComplete {
                        named: named.then(key),
                    });
                }

                body.push(Outbound::Bind(self.bind_message(command, plan, i)?));
                body_expects.push(Expect::BindComplete);

                if step.describes() {
                    body.push(Outbound::Describe(DescribeMessage {
                        target: Target::Portal,
                        name: String::new(),
                    }));
                    body_expects.push(Expect::Describe {
                        key: named.then(key),
                    });
                }

                body.push(Outbound::Execute(ExecuteMessage::all()));
                body_expects.push(Expect::Rows {
                    columns: match step {
                        StatementPlan::Prepared {
                            description: Some(columns),
                            ..
                        } => Some(columns.clone()),
                        _ => None,
                    },
                });
            }
        }

        let (mut outbound, mut expects) = self.take_reset();
        for name in self.cache.take_closes() {
            trace!(connector_id = self.id, name = %name, "closing statement");
            outbound.push(Outbound::Close(CloseMessage {
                target: Target::Statement,
                name,
            }));
            expects.push(Expect::CloseComplete);
        }
        outbound.extend(body);
        expects.extend(body_expects);
        outbound.push(Outbound::Sync);
        expects.push(Expect::ReadyForQuery);

        for plan in plans.iter() {
            for (i, step) in plan.steps.iter().enumerate() {
                if let StatementPlan::Prepare { .. } = step {
                    self.cache
                        .mark_sent(&plan.statements[i].sql, &plan.param_types[i]);
                }
            }
        }

        Ok((outbound, expects))
    }

    fn fingerprint(&self, command: &Command) -> PgResult<SmallVec<[Oid; 8]>> {
        if command.parameters.len() > MAX_PARAMETERS {
            return Err(PgError::Usage(format!(
                "A command cannot have more than {} parameters, got {}",
                MAX_PARAMETERS,
                command.parameters.len()
            )));
        }
        command
            .parameters
            .iter()
            .map(|p| self.type_mapper.resolve(p))
            .collect()
    }

    fn bind_message(&self, command: &Command, plan: &ExecutionPlan, i: usize) -> PgResult<BindMessage> {
        let types = &plan.param_types[i];
        let mut params = Vec::with_capacity(plan.bindings[i].len());
        for (k, index) in plan.bindings[i].iter().enumerate() {
            let param = command.parameters.get(*index).ok_or_else(|| {
                PgError::Usage(format!("Parameter {} is out of range", index))
            })?;
            params.push(self.encode_param(param, types[k])?);
        }

        Ok(BindMessage {
            portal: String::new(),
            statement: plan.steps[i].statement_name().to_string(),
            param_formats: vec![Format::Binary; params.len()],
            params,
            result_formats: vec![Format::Binary],
        })
    }

    fn encode_param(&self, param: &Parameter, oid: Oid) -> PgResult<Option<Bytes>> {
        let Some(len) = self.type_mapper.validate_and_get_length(param, oid)? else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(len);
        self.type_mapper.write(param, oid, &mut buf)?;
        if buf.len() != len {
            return Err(PgError::Type(format!(
                "Type mapper wrote {} bytes for a value validated at {} bytes",
                buf.len(),
                len
            )));
        }
        Ok(Some(buf.freeze()))
    }

    /// Execute SQL with the simple query protocol (text results).
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.start_user_action()?;
        let limit = self.settings.command_timeout_opt();
        let result = bounded(limit, self.run_simple_query(sql)).await;
        self.end_user_action(result)
    }

    async fn run_simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let (mut outbound, mut expects) = self.take_reset();
        outbound.push(Outbound::Query(QueryMessage {
            query: sql.to_string(),
        }));
        expects.push(Expect::SimpleQuery);
        self.exchange(outbound, expects, &[]).await
    }

    // ========================================================================
    // Explicit preparation
    // ========================================================================

    /// Prepare the command's statements under `_p{n}` names.
    pub async fn prepare(&mut self, command: &Command) -> PgResult<()> {
        command.check_transaction(self.id)?;
        self.start_user_action()?;
        let limit = self.settings.command_timeout_opt();
        let result = bounded(limit, self.run_prepare(command)).await;
        self.end_user_action(result)
    }

    async fn run_prepare(&mut self, command: &Command) -> PgResult<()> {
        let fingerprint = self.fingerprint(command)?;
        let plan = self.cache.prepare_explicit(
            &command.sql,
            &command.parameters,
            &fingerprint,
            self.settings.raw_sql_mode,
        )?;
        if plan.to_prepare.is_empty() {
            return Ok(());
        }

        let (mut outbound, mut expects) = self.take_reset();
        for (i, name) in &plan.to_prepare {
            let key = (plan.statements[*i].sql.clone(), plan.param_types[*i].clone());
            outbound.push(Outbound::Parse(ParseMessage {
                name: name.clone(),
                query: key.0.clone(),
                param_types: key.1.to_vec(),
            }));
            outbound.push(Outbound::Describe(DescribeMessage {
                target: Target::Statement,
                name: name.clone(),
            }));
            self.cache.mark_sent(&key.0, &key.1);
            expects.push(Expect::ParseComplete {
                named: Some(key.clone()),
            });
            expects.push(Expect::ParameterDescription);
            expects.push(Expect::StatementDescription { key });
        }
        outbound.push(Outbound::Sync);
        expects.push(Expect::ReadyForQuery);

        debug!(connector_id = self.id, sql = %command.sql, "preparing command");
        self.exchange(outbound, expects, &[]).await.map(|_| ())
    }

    /// Close the command's explicitly prepared statements.
    pub async fn unprepare(&mut self, command: &Command) -> PgResult<()> {
        self.start_user_action()?;
        let limit = self.settings.command_timeout_opt();
        let result = bounded(limit, self.run_unprepare(command)).await;
        self.end_user_action(result)
    }

    async fn run_unprepare(&mut self, command: &Command) -> PgResult<()> {
        if !self.cache.unprepare_explicit(&command.sql) {
            return Ok(());
        }
        let (mut outbound, mut expects) = self.take_reset();
        for name in self.cache.take_closes() {
            outbound.push(Outbound::Close(CloseMessage {
                target: Target::Statement,
                name,
            }));
            expects.push(Expect::CloseComplete);
        }
        outbound.push(Outbound::Sync);
        expects.push(Expect::ReadyForQuery);
        self.exchange(outbound, expects, &[]).await.map(|_| ())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self) -> PgResult<Transaction> {
        if self.transaction.as_ref().is_some_and(Transaction::is_open) {
            return Err(PgError::Usage(
                "A transaction is already in progress on this connection".to_string(),
            ));
        }
        self.simple_query("BEGIN").await?;
        let tx = Transaction::new(self.id);
        self.transaction = Some(tx.clone());
        Ok(tx)
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.simple_query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await.map(|_| ())
    }

    fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        if status == TransactionStatus::Idle {
            if let Some(tx) = self.transaction.take() {
                tx.complete();
            }
        }
    }

    // ========================================================================
    // Reset, cancel, close
    // ========================================================================

    /// Queue the session reset pipelined ahead of the next user action.
    pub(crate) fn schedule_reset(&mut self) {
        self.pending_reset.clear();
        if let Some(tx) = self.transaction.take() {
            tx.complete();
        }
        if self.transaction_status != TransactionStatus::Idle {
            self.pending_reset.push("ROLLBACK".to_string());
        }
        if !self.settings.no_reset_on_close {
            let reset = if self.cache.has_prepared() {
                RESET_KEEP_PREPARED
            } else {
                RESET_ALL
            };
            self.pending_reset.push(reset.to_string());
        }
    }

    fn take_reset(&mut self) -> (Vec<Outbound>, Vec<Expect>) {
        let mut outbound = Vec::new();
        let mut expects = Vec::new();
        for query in self.pending_reset.drain(..) {
            outbound.push(Outbound::Query(QueryMessage { query }));
            expects.push(Expect::Reset);
        }
        (outbound, expects)
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            host: self.settings.host.clone(),
            port: self.settings.port,
            process_id: self.backend_pid,
            secret_key: self.backend_secret_key,
            timeout: self.settings.timeout_opt(),
        }
    }

    /// Send Terminate and shut the socket down. Errors are ignored.
    pub async fn close(&mut self) {
        if self.state == ConnectorState::Closed {
            return;
        }
        debug!(connector_id = self.id, "closing connector");
        self.state = ConnectorState::Closed;
        if let Some(writer) = self.writer.as_mut() {
            if writer.write_message(&TerminateMessage).await.is_ok() && writer.flush().await.is_ok() {
                let _ = writer.shutdown().await;
            }
        }
        self.writer = None;
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    /// Write a batch and read every reply.
    async fn exchange(
        &mut self,
        outbound: Vec<Outbound>,
        expects: Vec<Expect>,
        plans: &[ExecutionPlan],
    ) -> PgResult<Vec<QueryResult>> {
        let pending_write = self.write_batch(outbound).await?;
        let read = self.read_replies(expects).await;

        if read.is_err() {
            self.cache.abort_in_flight();
        }
        let write = match pending_write {
            None => Ok(()),
            Some(handle) if read.as_ref().is_err_and(PgError::is_fatal) => {
                handle.abort();
                Ok(())
            }
            Some(handle) => match handle.await {
                Ok(Ok(writer)) => {
                    self.writer = Some(writer);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(PgError::protocol(format!("Writer task failed: {}", e))),
            },
        };

        if !plans.is_empty() {
            trace!(connector_id = self.id, commands = plans.len(), "batch complete");
        }
        let results = read?;
        write?;
        Ok(results)
    }

    /// Write messages, handing the rest of the batch to a separate task once
    /// the buffer had to be flushed mid-batch. The reader can then drain
    /// results while large parameters are still being sent.
    async fn write_batch(
        &mut self,
        outbound: Vec<Outbound>,
    ) -> PgResult<Option<JoinHandle<PgResult<WriteBuffer>>>> {
        let mut writer = self.writer.take().ok_or(PgError::ConnectorBroken)?;
        writer.begin_batch();

        let mut messages = outbound.into_iter();
        while let Some(msg) = messages.next() {
            writer.write_message(&msg).await?;
            if writer.flush_occurred() && messages.len() > 0 {
                let rest: Vec<Outbound> = messages.collect();
                trace!(
                    connector_id = self.id,
                    remaining = rest.len(),
                    "buffer flushed mid-batch, finishing writes on a separate task"
                );
                return Ok(Some(tokio::spawn(async move {
                    for msg in &rest {
                        writer.write_message(msg).await?;
                    }
                    writer.flush().await?;
                    Ok(writer)
                })));
            }
        }

        writer.flush().await?;
        self.writer = Some(writer);
        Ok(None)
    }

    async fn read_replies(&mut self, expects: Vec<Expect>) -> PgResult<Vec<QueryResult>> {
        let mut results = Vec::new();
        let mut described: Option<SharedColumns> = None;

        for expect in expects {
            match expect {
                Expect::Reset => loop {
                    match self.next_message().await? {
                        BackendMessage::ReadyForQuery { status } => {
                            self.set_transaction_status(status);
                            break;
                        }
                        BackendMessage::ErrorResponse { fields } => {
                            return Err(PgError::protocol(format!(
                                "Session reset failed: {}",
                                ServerError::from_fields(&fields)
                            )));
                        }
                        _ => {}
                    }
                },
                Expect::CloseComplete => match self.expect_message().await? {
                    BackendMessage::CloseComplete => self.cache.complete_close(),
                    m => return Err(unexpected("CloseComplete", &m)),
                },
                Expect::ParseComplete { named } => match self.expect_message().await? {
                    BackendMessage::ParseComplete => {
                        if let Some((sql, types)) = named {
                            self.cache.complete_prepare(&sql, &types);
                        }
                    }
                    m => return Err(unexpected("ParseComplete", &m)),
                },
                Expect::BindComplete => match self.expect_message().await? {
                    BackendMessage::BindComplete => {}
                    m => return Err(unexpected("BindComplete", &m)),
                },
                Expect::Describe { key } => {
                    let columns = match self.expect_message().await? {
                        BackendMessage::RowDescription { fields } => Arc::new(fields),
                        BackendMessage::NoData => SharedColumns::default(),
                        m => return Err(unexpected("RowDescription or NoData", &m)),
                    };
                    if let Some((sql, types)) = key {
                        self.cache.set_description(&sql, &types, columns.clone());
                    }
                    described = Some(columns);
                }
                Expect::ParameterDescription => match self.expect_message().await? {
                    BackendMessage::ParameterDescription { .. } => {}
                    m => return Err(unexpected("ParameterDescription", &m)),
                },
                Expect::StatementDescription { key } => {
                    let columns = match self.expect_message().await? {
                        // Later Binds request binary results
                        BackendMessage::RowDescription { fields } => fields
                            .into_iter()
                            .map(|mut f| {
                                f.format = Format::Binary;
                                f
                            })
                            .collect(),
                        BackendMessage::NoData => Vec::new(),
                        m => return Err(unexpected("RowDescription or NoData", &m)),
                    };
                    self.cache.set_description(&key.0, &key.1, Arc::new(columns));
                }
                Expect::Rows { columns } => {
                    let columns = columns.or_else(|| described.take()).unwrap_or_default();
                    let mut result = QueryResult::new(columns);
                    loop {
                        match self.expect_message().await? {
                            BackendMessage::DataRow { values } => {
                                let row = decode_row(&result.columns, &values)?;
                                result.rows.push(row);
                            }
                            BackendMessage::CommandComplete { tag } => {
                                result.command_tag = tag;
                                break;
                            }
                            BackendMessage::EmptyQueryResponse
                            | BackendMessage::PortalSuspended => break,
                            m => return Err(unexpected("DataRow or CommandComplete", &m)),
                        }
                    }
                    results.push(result);
                }
                Expect::SimpleQuery => {
                    let mut current: Option<QueryResult> = None;
                    loop {
                        match self.expect_message().await? {
                            BackendMessage::RowDescription { fields } => {
                                current = Some(QueryResult::new(Arc::new(fields)));
                            }
                            BackendMessage::DataRow { values } => {
                                let result = current
                                    .get_or_insert_with(|| QueryResult::new(SharedColumns::default()));
                                let row = decode_row(&result.columns, &values)?;
                                result.rows.push(row);
                            }
                            BackendMessage::CommandComplete { tag } => {
                                let mut result = current
                                    .take()
                                    .unwrap_or_else(|| QueryResult::new(SharedColumns::default()));
                                result.command_tag = tag;
                                results.push(result);
                            }
                            BackendMessage::EmptyQueryResponse => {
                                results.push(QueryResult::new(SharedColumns::default()));
                            }
                            BackendMessage::ReadyForQuery { status } => {
                                self.set_transaction_status(status);
                                break;
                            }
                            m => return Err(unexpected("query results", &m)),
                        }
                    }
                }
                Expect::ReadyForQuery => match self.expect_message().await? {
                    BackendMessage::ReadyForQuery { status } => self.set_transaction_status(status),
                    m => return Err(unexpected("ReadyForQuery", &m)),
                },
            }
        }

        Ok(results)
    }

    /// Next message that is not asynchronous chatter.
    async fn next_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            match self.reader.read_message().await? {
                BackendMessage::NoticeResponse { fields } => {
                    debug!(
                        connector_id = self.id,
                        notice = %ServerError::from_fields(&fields),
                        "server notice"
                    );
                }
                BackendMessage::NotificationResponse { channel, .. } => {
                    trace!(connector_id = self.id, channel = %channel, "ignoring notification");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                msg => return Ok(msg),
            }
        }
    }

    /// Next message; an ErrorResponse is turned into an error after the
    /// stream is resynchronized at ReadyForQuery.
    async fn expect_message(&mut self) -> PgResult<BackendMessage> {
        match self.next_message().await? {
            BackendMessage::ErrorResponse { fields } => Err(self.recover(&fields).await),
            msg => Ok(msg),
        }
    }

    async fn recover(&mut self, fields: &HashMap<u8, String>) -> PgError {
        let err = ServerError::from_fields(fields);
        if err.is_fatal() {
            return err.into();
        }
        loop {
            match self.next_message().await {
                Ok(BackendMessage::ReadyForQuery { status }) => {
                    self.set_transaction_status(status);
                    return err.into();
                }
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }

    /// Write one message and flush it.
    async fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        let writer = self.writer.as_mut().ok_or(PgError::ConnectorBroken)?;
        writer.write_message(msg).await?;
        writer.flush().await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.state, ConnectorState::Broken | ConnectorState::Closed)
    }

    pub fn clear_counter(&self) -> u64 {
        self.clear_counter
    }

    pub fn release_timestamp(&self) -> Instant {
        self.release_timestamp
    }

    pub(crate) fn touch_release_timestamp(&mut self) {
        self.release_timestamp = Instant::now();
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    pub fn has_pending_reset(&self) -> bool {
        !self.pending_reset.is_empty()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancels the operation running on a connector from anywhere.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: String,
    port: u16,
    process_id: i32,
    secret_key: i32,
    timeout: Option<Duration>,
}

impl CancelToken {
    /// Send a CancelRequest on a separate connection.
    ///
    /// The server answers by failing the running statement; the original
    /// connector reads that error and resynchronizes on ReadyForQuery.
    pub async fn cancel(&self) -> PgResult<()> {
        bounded(self.timeout, self.send_cancel()).await
    }

    async fn send_cancel(&self) -> PgResult<()> {
        debug!(backend_pid = self.process_id, "sending cancel request");
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let msg = CancelRequestMessage {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&msg.encode()).await?;
        stream.flush().await?;

        // The server closes the socket once the request is processed
        let mut buf = [0u8; 16];
        while stream.read(&mut buf).await? > 0 {}
        Ok(())
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Run `fut`, failing with [`PgError::Timeout`] after `limit`.
async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> PgResult<T>
where
    F: Future<Output = PgResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(PgError::Timeout)),
        None => fut.await,
    }
}

fn unexpected(expected: &str, received: &BackendMessage) -> PgError {
    PgError::protocol(format!(
        "Expected {}, received {}",
        expected,
        received.name()
    ))
}

/// Decode a row using each column's format.
fn decode_row(columns: &[FieldDescription], values: &[Option<Bytes>]) -> PgResult<Vec<PgValue>> {
    let mut row = Vec::with_capacity(values.len());

    for (i, value) in values.iter().enumerate() {
        let pg_value = match value {
            Some(data) => {
                let (oid, format) = columns
                    .get(i)
                    .map_or((Oid::TEXT, Format::Text), |c| (c.type_oid, c.format));
                match format {
                    Format::Binary => PgValue::decode_binary(oid, data)?,
                    Format::Text => PgValue::decode_text(oid, data)?,
                }
            }
            None => PgValue::Null,
        };
        row.push(pg_value);
    }

    Ok(row)
}
