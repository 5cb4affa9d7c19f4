//! Commands, results and transaction handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PgError, PgResult};
use crate::protocol::SharedColumns;
use crate::types::{Parameter, PgValue};

// ============================================================================
// Command
// ============================================================================

/// SQL text plus its parameters.
///
/// The text may hold several `;`-separated statements; each produces one
/// [`QueryResult`].
#[derive(Debug, Clone)]
pub struct Command {
    pub sql: String,
    pub parameters: Vec<Parameter>,
    transaction: Option<Transaction>,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
            transaction: None,
        }
    }

    /// Add a positional parameter (`$n`).
    pub fn bind(mut self, param: impl Into<Parameter>) -> Self {
        self.parameters.push(param.into());
        self
    }

    /// Add a named parameter (`@name`).
    pub fn bind_named(mut self, name: &str, value: PgValue) -> Self {
        self.parameters.push(Parameter::named(name, value));
        self
    }

    /// Run inside `tx`; the command may then only execute on the connector
    /// that owns the transaction.
    pub fn in_transaction(mut self, tx: &Transaction) -> Self {
        self.transaction = Some(tx.clone());
        self
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Reject running this command on `connector_id`.
    pub(crate) fn check_transaction(&self, connector_id: u64) -> PgResult<()> {
        match &self.transaction {
            None => Ok(()),
            Some(tx) if !tx.is_open() => Err(PgError::Usage(
                "The command's transaction has already completed".to_string(),
            )),
            Some(tx) if tx.connector_id != connector_id => Err(PgError::Usage(format!(
                "The command's transaction belongs to connector {} but the command was \
                 executed on connector {}",
                tx.connector_id, connector_id
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl From<&str> for Command {
    fn from(sql: &str) -> Self {
        Command::new(sql)
    }
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column descriptions, shared with the prepared statement when cached.
    pub columns: SharedColumns,
    pub rows: Vec<Vec<PgValue>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    pub(crate) fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&PgValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Parse rows affected from a PostgreSQL command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["FETCH", n]
        | ["MOVE", n]
        | ["COPY", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Handle to a transaction opened on one connector.
#[derive(Debug, Clone)]
pub struct Transaction {
    connector_id: u64,
    open: Arc<AtomicBool>,
}

impl Transaction {
    pub(crate) fn new(connector_id: u64) -> Self {
        Self {
            connector_id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn connector_id(&self) -> u64 {
        self.connector_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn complete(&self) {
        self.open.store(false, Ordering::Release);
    }
}
