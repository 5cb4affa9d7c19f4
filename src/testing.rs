//! In-process mock PostgreSQL backend for tests.
//!
//! Speaks enough of protocol v3 to drive the connector and pool: startup
//! with optional cleartext password, extended query messages, simple
//! queries, Close, CancelRequest on a separate socket, and error recovery
//! that skips input until Sync. Every frontend message is recorded as an
//! [`Event`] so tests can assert what was actually sent.
//!
//! Understood statements:
//! - `SELECT $1[, $2 ...]` echoes its parameters
//! - `SELECT <integer>` returns one int4
//! - `SELECT length($1)` returns the byte length of the parameter
//! - `SELECT generate_series(1, N)` returns N int4 rows
//! - `SELECT 1/0` fails with 22012
//! - `SELECT pg_sleep(...)` waits for a cancel request, then fails with 57014
//! - `SELECT fatal` sends a FATAL error and closes the socket
//! - anything containing `BOGUS` fails to parse with 42601
//! - other statements complete with their first word as the tag

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::protocol::CANCEL_REQUEST_CODE;
use crate::settings::ConnectionSettings;
use crate::types::Oid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Startup { pid: i32 },
    Query(String),
    Parse { name: String, query: String, param_types: Vec<i32> },
    Bind { statement: String },
    Describe { target: u8, name: String },
    Execute,
    Close { name: String },
    Sync,
    Terminate,
    Cancel { pid: i32 },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockConfig {
    pub password: Option<String>,
    /// Reject this many startups with FATAL 53300.
    pub reject_startups: usize,
}

struct Shared {
    config: MockConfig,
    events: Mutex<Vec<Event>>,
    next_pid: AtomicI32,
    rejected: AtomicUsize,
    cancels: Mutex<HashMap<i32, Arc<Notify>>>,
}

impl Shared {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(MockConfig::default()).await
    }

    pub async fn start_with(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            config,
            events: Mutex::new(Vec::new()),
            next_pid: AtomicI32::new(1000),
            rejected: AtomicUsize::new(0),
            cancels: Mutex::new(HashMap::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = Session::run(socket, shared).await;
                });
            }
        });

        Self { addr, shared, task }
    }

    /// Settings pointing at this server with test-friendly defaults.
    pub fn settings(&self) -> ConnectionSettings {
        let mut settings = ConnectionSettings::new("127.0.0.1", self.addr.port())
            .user("tester")
            .database("mock")
            .timeout(Duration::from_secs(5))
            .command_timeout(Duration::from_secs(10));
        if let Some(password) = &self.shared.config.password {
            settings = settings.password(password);
        }
        settings
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().clear();
    }

    /// Names of statements parsed so far, in order (`""` for unnamed).
    pub fn parsed_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Parse { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Query(q) => Some(q),
                _ => None,
            })
            .collect()
    }

    pub fn startups(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Startup { .. }))
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone)]
enum Plan {
    /// Echo the given zero-based parameters.
    Echo(Vec<usize>),
    Int(i32),
    Length,
    Series(i32),
    DivisionByZero,
    Sleep,
    Fatal,
    Bool,
    Command(String),
}

struct ServerError {
    severity: &'static str,
    code: &'static str,
    message: String,
}

impl ServerError {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR",
            code,
            message: message.into(),
        }
    }
}

fn plan_query(query: &str) -> Result<Plan, ServerError> {
    let q = query.trim().trim_end_matches(';').trim();
    if q.contains("BOGUS") {
        return Err(ServerError::error("42601", "syntax error at or near \"BOGUS\""));
    }
    let upper = q.to_ascii_uppercase();
    let Some(rest) = upper.strip_prefix("SELECT ") else {
        let tag = upper.split_whitespace().next().unwrap_or("").to_string();
        return Ok(Plan::Command(tag));
    };
    let rest = rest.trim();

    if rest == "1/0" {
        return Ok(Plan::DivisionByZero);
    }
    if rest == "FATAL" {
        return Ok(Plan::Fatal);
    }
    if rest.starts_with("PG_SLEEP") {
        return Ok(Plan::Sleep);
    }
    if rest.starts_with("PG_ADVISORY_UNLOCK_ALL") {
        return Ok(Plan::Bool);
    }
    if rest.starts_with("LENGTH($") {
        return Ok(Plan::Length);
    }
    if let Some(args) = rest.strip_prefix("GENERATE_SERIES(1,") {
        let n = args.trim_end_matches(')').trim().parse().unwrap_or(0);
        return Ok(Plan::Series(n));
    }
    if let Ok(n) = rest.parse::<i32>() {
        return Ok(Plan::Int(n));
    }
    let params: Option<Vec<usize>> = rest
        .split(',')
        .map(|p| p.trim().strip_prefix('$')?.parse::<usize>().ok().map(|n| n - 1))
        .collect();
    match params {
        Some(params) => Ok(Plan::Echo(params)),
        None => Ok(Plan::Command("SELECT".to_string())),
    }
}

/// Column names and type oids produced by `plan`.
fn columns(plan: &Plan, param_types: &[i32]) -> Vec<(String, i32)> {
    let int4 = || vec![("?column?".to_string(), Oid::INT4.as_i32())];
    match plan {
        Plan::Echo(params) => params
            .iter()
            .map(|i| {
                let oid = param_types.get(*i).copied().unwrap_or(0);
                let oid = if oid == 0 { Oid::TEXT.as_i32() } else { oid };
                ("?column?".to_string(), oid)
            })
            .collect(),
        Plan::Int(_) | Plan::DivisionByZero => int4(),
        Plan::Length => vec![("length".to_string(), Oid::INT4.as_i32())],
        Plan::Series(_) => vec![("generate_series".to_string(), Oid::INT4.as_i32())],
        Plan::Sleep => vec![("pg_sleep".to_string(), Oid::TEXT.as_i32())],
        Plan::Bool => vec![("pg_advisory_unlock_all".to_string(), Oid::BOOL.as_i32())],
        Plan::Fatal | Plan::Command(_) => Vec::new(),
    }
}

struct Outcome {
    rows: Vec<Vec<Option<Vec<u8>>>>,
    tag: String,
}

fn int_value(n: i32, binary: bool) -> Vec<u8> {
    if binary {
        n.to_be_bytes().to_vec()
    } else {
        n.to_string().into_bytes()
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Clone)]
struct Statement {
    query: String,
    plan: Plan,
    param_types: Vec<i32>,
}

struct Portal {
    statement: Statement,
    params: Vec<Option<Bytes>>,
    binary: bool,
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    socket: TcpStream,
    shared: Arc<Shared>,
    input: BytesMut,
    output: BytesMut,
    pid: i32,
    cancel: Arc<Notify>,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    skipping: bool,
    status: u8,
}

impl Session {
    async fn run(socket: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
        let mut session = Session {
            socket,
            shared,
            input: BytesMut::with_capacity(8192),
            output: BytesMut::with_capacity(8192),
            pid: 0,
            cancel: Arc::new(Notify::new()),
            statements: HashMap::new(),
            portal: None,
            skipping: false,
            status: b'I',
        };

        if !session.startup().await? {
            return Ok(());
        }
        loop {
            let (tag, body) = match session.read_message().await? {
                Some(message) => message,
                None => return Ok(()),
            };
            let flow = session.handle(tag, body).await;
            session.flush().await?;
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    async fn fill(&mut self, n: usize) -> std::io::Result<bool> {
        while self.input.len() < n {
            if self.socket.read_buf(&mut self.input).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn startup(&mut self) -> std::io::Result<bool> {
        if !self.fill(8).await? {
            return Ok(false);
        }
        let len = (&self.input[..4]).get_i32() as usize;
        if !self.fill(len).await? {
            return Ok(false);
        }
        let mut body = self.input.split_to(len);
        body.advance(4);
        let code = body.get_i32();

        if code == CANCEL_REQUEST_CODE {
            let pid = body.get_i32();
            self.shared.record(Event::Cancel { pid });
            if let Some(notify) = self.shared.cancels.lock().get(&pid) {
                notify.notify_one();
            }
            return Ok(false);
        }

        if self.shared.rejected.load(Ordering::SeqCst) < self.shared.config.reject_startups {
            self.shared.rejected.fetch_add(1, Ordering::SeqCst);
            self.error(&ServerError {
                severity: "FATAL",
                code: "53300",
                message: "sorry, too many clients already".to_string(),
            });
            self.flush().await?;
            return Ok(false);
        }

        if let Some(expected) = self.shared.config.password.clone() {
            self.message(b'R', |b| b.put_i32(3));
            self.flush().await?;
            let Some((b'p', body)) = self.read_message().await? else {
                return Ok(false);
            };
            let supplied = String::from_utf8_lossy(&body[..body.len().saturating_sub(1)]).to_string();
            if supplied != expected {
                self.error(&ServerError {
                    severity: "FATAL",
                    code: "28P01",
                    message: "password authentication failed".to_string(),
                });
                self.flush().await?;
                return Ok(false);
            }
        }

        self.pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        self.shared.cancels.lock().insert(self.pid, Arc::clone(&self.cancel));
        self.shared.record(Event::Startup { pid: self.pid });

        self.message(b'R', |b| b.put_i32(0));
        self.message(b'S', |b| {
            put_cstr(b, "server_version");
            put_cstr(b, "16.0");
        });
        let pid = self.pid;
        self.message(b'K', |b| {
            b.put_i32(pid);
            b.put_i32(pid * 7);
        });
        self.ready();
        self.flush().await?;
        Ok(true)
    }

    async fn read_message(&mut self) -> std::io::Result<Option<(u8, Bytes)>> {
        if !self.fill(5).await? {
            return Ok(None);
        }
        let len = (&self.input[1..5]).get_i32() as usize;
        if !self.fill(len + 1).await? {
            return Ok(None);
        }
        let tag = self.input[0];
        let mut frame = self.input.split_to(len + 1);
        frame.advance(5);
        Ok(Some((tag, frame.freeze())))
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.output.is_empty() {
            let out = self.output.split();
            self.socket.write_all(&out).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, tag: u8, mut body: Bytes) -> Flow {
        match tag {
            b'P' => {
                let name = get_cstr(&mut body);
                let query = get_cstr(&mut body);
                let n = body.get_i16();
                let param_types: Vec<i32> = (0..n).map(|_| body.get_i32()).collect();
                self.shared.record(Event::Parse {
                    name: name.clone(),
                    query: query.clone(),
                    param_types: param_types.clone(),
                });
                if self.skipping {
                    return Flow::Continue;
                }
                if !name.is_empty() && self.statements.contains_key(&name) {
                    self.fail(ServerError::error(
                        "42P05",
                        format!("prepared statement \"{}\" already exists", name),
                    ));
                    return Flow::Continue;
                }
                match plan_query(&query) {
                    Ok(plan) => {
                        self.statements.insert(
                            name,
                            Statement {
                                query,
                                plan,
                                param_types,
                            },
                        );
                        self.message(b'1', |_| {});
                    }
                    Err(e) => self.fail(e),
                }
            }
            b'B' => {
                let _portal = get_cstr(&mut body);
                let statement = get_cstr(&mut body);
                let n_formats = body.get_i16();
                for _ in 0..n_formats {
                    body.get_i16();
                }
                let n_params = body.get_i16();
                let mut params = Vec::with_capacity(n_params as usize);
                for _ in 0..n_params {
                    let len = body.get_i32();
                    if len < 0 {
                        params.push(None);
                    } else {
                        params.push(Some(body.split_to(len as usize)));
                    }
                }
                let n_results = body.get_i16();
                let binary = n_results > 0 && body.get_i16() == 1;
                self.shared.record(Event::Bind {
                    statement: statement.clone(),
                });
                if self.skipping {
                    return Flow::Continue;
                }
                match self.statements.get(&statement) {
                    Some(stmt) => {
                        self.portal = Some(Portal {
                            statement: stmt.clone(),
                            params,
                            binary,
                        });
                        self.message(b'2', |_| {});
                    }
                    None => self.fail(ServerError::error(
                        "26000",
                        format!("prepared statement \"{}\" does not exist", statement),
                    )),
                }
            }
            b'D' => {
                let target = body.get_u8();
                let name = get_cstr(&mut body);
                self.shared.record(Event::Describe {
                    target,
                    name: name.clone(),
                });
                if self.skipping {
                    return Flow::Continue;
                }
                if target == b'S' {
                    let Some(stmt) = self.statements.get(&name).cloned() else {
                        self.fail(ServerError::error("26000", "statement does not exist"));
                        return Flow::Continue;
                    };
                    let types: Vec<i32> = stmt
                        .param_types
                        .iter()
                        .map(|t| if *t == 0 { Oid::TEXT.as_i32() } else { *t })
                        .collect();
                    self.message(b't', |b| {
                        b.put_i16(types.len() as i16);
                        for t in &types {
                            b.put_i32(*t);
                        }
                    });
                    self.row_description(&columns(&stmt.plan, &stmt.param_types), false);
                } else {
                    let Some(portal) = self.portal.as_ref() else {
                        self.fail(ServerError::error("34000", "portal does not exist"));
                        return Flow::Continue;
                    };
                    let cols = columns(&portal.statement.plan, &portal.statement.param_types);
                    let binary = portal.binary;
                    self.row_description(&cols, binary);
                }
            }
            b'E' => {
                self.shared.record(Event::Execute);
                if self.skipping {
                    return Flow::Continue;
                }
                let Some(portal) = self.portal.take() else {
                    self.fail(ServerError::error("34000", "portal does not exist"));
                    return Flow::Continue;
                };
                match self.execute(&portal.statement, &portal.params, portal.binary).await {
                    Ok(outcome) => self.send_outcome(outcome),
                    Err(e) if e.severity == "FATAL" => {
                        self.error(&e);
                        return Flow::Close;
                    }
                    Err(e) => self.fail(e),
                }
            }
            b'C' => {
                let _target = body.get_u8();
                let name = get_cstr(&mut body);
                self.shared.record(Event::Close { name: name.clone() });
                if self.skipping {
                    return Flow::Continue;
                }
                self.statements.remove(&name);
                self.message(b'3', |_| {});
            }
            b'S' => {
                self.shared.record(Event::Sync);
                self.skipping = false;
                self.ready();
            }
            b'H' => {}
            b'Q' => {
                let query = get_cstr(&mut body);
                self.shared.record(Event::Query(query.clone()));
                for part in query.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                    match self.simple(part).await {
                        Ok(outcome) => self.send_outcome(outcome),
                        Err(e) if e.severity == "FATAL" => {
                            self.error(&e);
                            return Flow::Close;
                        }
                        Err(e) => {
                            self.fail(e);
                            break;
                        }
                    }
                }
                self.skipping = false;
                self.ready();
            }
            b'X' => {
                self.shared.record(Event::Terminate);
                return Flow::Close;
            }
            _ => {}
        }
        Flow::Continue
    }

    async fn simple(&mut self, query: &str) -> Result<Outcome, ServerError> {
        let upper = query.to_ascii_uppercase();
        match upper.as_str() {
            "BEGIN" => self.status = b'T',
            "COMMIT" | "ROLLBACK" => self.status = b'I',
            "DISCARD ALL" => self.statements.clear(),
            _ => {}
        }
        let statement = Statement {
            query: query.to_string(),
            plan: plan_query(query)?,
            param_types: Vec::new(),
        };
        let cols = columns(&statement.plan, &[]);
        if !cols.is_empty() {
            self.row_description(&cols, false);
        }
        self.execute(&statement, &[], false).await
    }

    async fn execute(
        &mut self,
        stmt: &Statement,
        params: &[Option<Bytes>],
        binary: bool,
    ) -> Result<Outcome, ServerError> {
        let single = |value: Vec<u8>| Outcome {
            rows: vec![vec![Some(value)]],
            tag: "SELECT 1".to_string(),
        };
        match &stmt.plan {
            Plan::Echo(indices) => Ok(Outcome {
                rows: vec![indices
                    .iter()
                    .map(|i| params.get(*i).cloned().flatten().map(|b| b.to_vec()))
                    .collect()],
                tag: "SELECT 1".to_string(),
            }),
            Plan::Int(n) => Ok(single(int_value(*n, binary))),
            Plan::Length => {
                let len = params.first().cloned().flatten().map_or(0, |b| b.len());
                Ok(single(int_value(len as i32, binary)))
            }
            Plan::Series(n) => Ok(Outcome {
                rows: (1..=*n).map(|i| vec![Some(int_value(i, binary))]).collect(),
                tag: format!("SELECT {}", n),
            }),
            Plan::Bool => Ok(single(if binary { vec![1] } else { b"t".to_vec() })),
            Plan::DivisionByZero => Err(ServerError::error("22012", "division by zero")),
            Plan::Sleep => {
                let _ = tokio::time::timeout(Duration::from_secs(5), self.cancel.notified()).await;
                Err(ServerError::error(
                    "57014",
                    "canceling statement due to user request",
                ))
            }
            Plan::Fatal => Err(ServerError {
                severity: "FATAL",
                code: "57P01",
                message: format!("terminating connection ({})", stmt.query),
            }),
            Plan::Command(tag) => Ok(Outcome {
                rows: Vec::new(),
                tag: match tag.as_str() {
                    "INSERT" => "INSERT 0 1".to_string(),
                    "UPDATE" | "DELETE" => format!("{} 1", tag),
                    "UNLISTEN" | "DISCARD" | "BEGIN" | "COMMIT" | "ROLLBACK" | "SET" => {
                        stmt.query.to_ascii_uppercase()
                    }
                    _ => tag.clone(),
                },
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    fn message(&mut self, tag: u8, body: impl FnOnce(&mut BytesMut)) {
        self.output.put_u8(tag);
        let pos = self.output.len();
        self.output.put_i32(0);
        body(&mut self.output);
        let len = (self.output.len() - pos) as i32;
        self.output[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
    }

    fn ready(&mut self) {
        let status = self.status;
        self.message(b'Z', |b| b.put_u8(status));
    }

    fn row_description(&mut self, cols: &[(String, i32)], binary: bool) {
        if cols.is_empty() {
            self.message(b'n', |_| {});
            return;
        }
        self.message(b'T', |b| {
            b.put_i16(cols.len() as i16);
            for (name, oid) in cols {
                put_cstr(b, name);
                b.put_i32(0);
                b.put_i16(0);
                b.put_i32(*oid);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(i16::from(binary));
            }
        });
    }

    fn send_outcome(&mut self, outcome: Outcome) {
        for row in &outcome.rows {
            self.message(b'D', |b| {
                b.put_i16(row.len() as i16);
                for value in row {
                    match value {
                        Some(v) => {
                            b.put_i32(v.len() as i32);
                            b.put_slice(v);
                        }
                        None => b.put_i32(-1),
                    }
                }
            });
        }
        self.message(b'C', |b| put_cstr(b, &outcome.tag));
    }

    fn error(&mut self, e: &ServerError) {
        self.message(b'E', |b| {
            b.put_u8(b'S');
            put_cstr(b, e.severity);
            b.put_u8(b'V');
            put_cstr(b, e.severity);
            b.put_u8(b'C');
            put_cstr(b, e.code);
            b.put_u8(b'M');
            put_cstr(b, &e.message);
            b.put_u8(0);
        });
    }

    /// Report an error and discard input until Sync.
    fn fail(&mut self, e: ServerError) {
        self.error(&e);
        self.skipping = true;
        if self.status == b'T' {
            self.status = b'E';
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..end]).to_string();
    buf.advance((end + 1).min(buf.len()));
    s
}
