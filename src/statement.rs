//! Server-side prepared statements and cached commands.
//!
//! This module provides:
//! - `PreparedStatement`: a named statement living on one connection
//! - `CachedCommand`: a SQL text tracked by the auto-prepare engine
//! - `ExecutionPlan`: what to send for one execution of a command

use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::protocol::SharedColumns;
use crate::sql::ParsedStatement;
use crate::types::{Oid, ParamFingerprint};

// ============================================================================
// Prepared Statement
// ============================================================================

/// Lifecycle of a server-side statement.
///
/// The `Being*` states exist only between writing a message and reading its
/// confirmation, so many messages can be pipelined before any reply is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedState {
    NotPrepared,
    /// Planned; Parse not yet written.
    ToBePrepared,
    /// Parse written, ParseComplete not yet read.
    BeingPrepared,
    Prepared,
    /// Close written, CloseComplete not yet read.
    BeingUnprepared,
}

/// A prepared statement that has been (or is being) parsed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Statement text after placeholder rewriting.
    pub sql: String,
    /// Server-side name (`_auto{slot}` or `_p{n}`)
    pub name: String,
    pub state: PreparedState,
    /// Number of cached commands attached to this statement.
    pub ref_count: u32,
    /// Auto-prepare slot; `None` for explicitly prepared statements.
    pub slot: Option<usize>,
    /// Parameter types the statement was parsed with.
    pub param_types: ParamFingerprint,
    /// Result columns, known after the first Describe.
    pub description: Option<SharedColumns>,
}

impl PreparedStatement {
    pub fn auto_name(slot: usize) -> String {
        format!("_auto{}", slot)
    }

    pub fn explicit_name(id: u32) -> String {
        format!("_p{}", id)
    }

    pub fn new(sql: String, name: String, slot: Option<usize>, param_types: ParamFingerprint) -> Self {
        Self {
            sql,
            name,
            state: PreparedState::ToBePrepared,
            ref_count: 1,
            slot,
            param_types,
            description: None,
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.slot.is_none()
    }

    /// Whether Bind may target this statement in the current pipeline.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            PreparedState::ToBePrepared | PreparedState::BeingPrepared | PreparedState::Prepared
        )
    }
}

// ============================================================================
// Cached Command
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Counted toward auto-preparation; runs unprepared.
    Candidate { slot: usize },
    AutoPrepared { slot: usize },
    /// Prepared by the user; never evicted.
    Explicit,
}

/// A SQL text tracked by the statement cache.
#[derive(Debug, Clone)]
pub struct CachedCommand {
    pub sql: String,
    pub statements: Arc<[ParsedStatement]>,
    pub usages: u32,
    pub last_used: Instant,
    pub kind: CommandKind,
    /// Executions currently in flight against this command.
    pub ref_count: u32,
    /// Per-statement parameter types, set once prepared.
    pub param_types: Option<Vec<ParamFingerprint>>,
}

impl CachedCommand {
    pub fn candidate(sql: String, statements: Arc<[ParsedStatement]>, slot: usize, now: Instant) -> Self {
        Self {
            sql,
            statements,
            usages: 0,
            last_used: now,
            kind: CommandKind::Candidate { slot },
            ref_count: 0,
            param_types: None,
        }
    }

    pub fn is_prepared(&self) -> bool {
        !matches!(self.kind, CommandKind::Candidate { .. })
    }

    pub fn is_auto_prepared(&self) -> bool {
        matches!(self.kind, CommandKind::AutoPrepared { .. })
    }

    /// Whether an execution with `types` may reuse the prepared statements.
    pub fn fingerprint_matches(&self, types: &[ParamFingerprint]) -> bool {
        self.param_types.as_deref() == Some(types)
    }
}

// ============================================================================
// Execution Plan
// ============================================================================

/// What to send for one statement of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementPlan {
    /// Unnamed Parse, Bind, Describe portal, Execute.
    Unprepared,
    /// Named Parse, Bind, Describe portal, Execute.
    Prepare { name: String },
    /// Bind and Execute; Describe portal too when columns are unknown.
    Prepared {
        name: String,
        description: Option<SharedColumns>,
    },
}

impl StatementPlan {
    pub fn statement_name(&self) -> &str {
        match self {
            StatementPlan::Unprepared => "",
            StatementPlan::Prepare { name } | StatementPlan::Prepared { name, .. } => name,
        }
    }

    /// Whether a Describe for the portal is sent.
    pub fn describes(&self) -> bool {
        !matches!(
            self,
            StatementPlan::Prepared {
                description: Some(_),
                ..
            }
        )
    }
}

/// Everything the connector needs to write one execution of a command.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Cache key holding a reference until [`crate::cache::StatementCache::release`].
    pub command: Option<String>,
    pub statements: Arc<[ParsedStatement]>,
    /// Indices into the command's parameters for each statement's `$1..$k`.
    pub bindings: Vec<SmallVec<[usize; 8]>>,
    /// Parameter types for each statement's Parse.
    pub param_types: Vec<ParamFingerprint>,
    pub steps: Vec<StatementPlan>,
}

impl ExecutionPlan {
    pub fn is_unprepared(&self) -> bool {
        self.steps.iter().all(|s| *s == StatementPlan::Unprepared)
    }

    /// Whether every statement runs on a named server-side statement.
    pub fn runs_prepared(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| *s != StatementPlan::Unprepared)
    }

    pub(crate) fn param_oids(&self, index: usize) -> Vec<Oid> {
        self.param_types[index].to_vec()
    }
}
