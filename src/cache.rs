//! Per-connector statement cache and auto-prepare engine.
//!
//! Every executed SQL text is tracked as a [`CachedCommand`]. New texts
//! enter a fixed-size candidate table; once a candidate has been executed
//! `auto_prepare_min_usages` times its statements are prepared under
//! `_auto{slot}` names taken from a table of `max_auto_prepare` slots.
//! When the slots run out, the least recently used auto-prepared command
//! with no execution in flight is evicted and its statements closed.
//!
//! The cache belongs to one connector and is only touched by the task
//! holding that connector, so nothing here is synchronized.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::error::PgResult;
use crate::protocol::SharedColumns;
use crate::settings::AUTO_PREPARE_WARN_THRESHOLD;
use crate::sql::{self, ParsedStatement};
use crate::statement::{
    CachedCommand, CommandKind, ExecutionPlan, PreparedState, PreparedStatement, StatementPlan,
};
use crate::types::{Oid, ParamFingerprint, Parameter};

/// Number of candidate slots tracked per connector.
pub const CANDIDATE_COUNT: usize = 100;

/// Statements are shared between commands when both text and parameter
/// types match.
pub type StatementKey = (String, ParamFingerprint);

/// Statements to parse for an explicit prepare.
#[derive(Debug, Clone)]
pub struct PreparePlan {
    pub statements: Arc<[ParsedStatement]>,
    pub param_types: Vec<ParamFingerprint>,
    /// (statement index, server-side name) for each Parse to send.
    pub to_prepare: Vec<(usize, String)>,
}

pub struct StatementCache {
    max_auto_prepare: usize,
    min_usages: u32,
    commands: HashMap<String, CachedCommand>,
    statements: HashMap<StatementKey, PreparedStatement>,
    candidates: Box<[Option<String>]>,
    auto_commands: Box<[Option<String>]>,
    auto_slots: Box<[Option<StatementKey>]>,
    next_explicit_id: u32,
    /// Evicted statements whose Close has not been written yet.
    pending_closes: Vec<PreparedStatement>,
    /// Statements whose Close is written but not confirmed.
    unpreparing: VecDeque<PreparedStatement>,
}

impl StatementCache {
    pub fn new(max_auto_prepare: usize, min_usages: u32) -> Self {
        if max_auto_prepare > AUTO_PREPARE_WARN_THRESHOLD {
            warn!(
                max_auto_prepare,
                "max_auto_prepare is above {}; every slot is a server-side statement \
                 held for the lifetime of the connection",
                AUTO_PREPARE_WARN_THRESHOLD
            );
        }

        let candidates = if max_auto_prepare == 0 { 0 } else { CANDIDATE_COUNT };
        Self {
            max_auto_prepare,
            min_usages: min_usages.max(1),
            commands: HashMap::new(),
            statements: HashMap::new(),
            candidates: vec![None; candidates].into_boxed_slice(),
            auto_commands: vec![None; max_auto_prepare].into_boxed_slice(),
            auto_slots: vec![None; max_auto_prepare].into_boxed_slice(),
            next_explicit_id: 0,
            pending_closes: Vec::new(),
            unpreparing: VecDeque::new(),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Decide how one execution of `sql` is sent.
    ///
    /// `fingerprint` holds the resolved wire type of every parameter. A plan
    /// with a `command` must be handed back to [`release`](Self::release)
    /// once its replies are read.
    pub fn plan(
        &mut self,
        sql: &str,
        params: &[Parameter],
        fingerprint: &[Oid],
        raw: bool,
    ) -> PgResult<ExecutionPlan> {
        let now = Instant::now();

        let Some(cmd) = self.commands.get(sql) else {
            return self.plan_new(sql, params, fingerprint, raw, now);
        };

        let statements = cmd.statements.clone();
        let (bindings, types) = resolve(&statements, params, fingerprint)?;

        if cmd.is_prepared() {
            if cmd.fingerprint_matches(&types) {
                if let Some(cmd) = self.commands.get_mut(sql) {
                    cmd.usages = cmd.usages.saturating_add(1);
                }
                return Ok(self.attach(sql, statements, bindings, types, &[], now));
            }
            trace!(sql, "parameter types differ from the prepared statement, executing unprepared");
            return Ok(unprepared(statements, bindings, types));
        }

        Ok(self.count_usage(sql, statements, bindings, types, now))
    }

    fn plan_new(
        &mut self,
        sql: &str,
        params: &[Parameter],
        fingerprint: &[Oid],
        raw: bool,
        now: Instant,
    ) -> PgResult<ExecutionPlan> {
        let statements: Arc<[ParsedStatement]> = sql::parse(sql, raw).into();
        let (bindings, types) = resolve(&statements, params, fingerprint)?;

        let Some(slot) = self.candidate_slot() else {
            return Ok(unprepared(statements, bindings, types));
        };

        if let Some(evicted) = self.candidates[slot].take() {
            trace!(sql = %evicted, "evicting auto-prepare candidate");
            self.commands.remove(&evicted);
        }
        self.candidates[slot] = Some(sql.to_string());
        self.commands.insert(
            sql.to_string(),
            CachedCommand::candidate(sql.to_string(), statements.clone(), slot, now),
        );

        Ok(self.count_usage(sql, statements, bindings, types, now))
    }

    fn count_usage(
        &mut self,
        sql: &str,
        statements: Arc<[ParsedStatement]>,
        bindings: Vec<SmallVec<[usize; 8]>>,
        types: Vec<ParamFingerprint>,
        now: Instant,
    ) -> ExecutionPlan {
        let min_usages = self.min_usages;
        if let Some(cmd) = self.commands.get_mut(sql) {
            cmd.usages += 1;
            if cmd.usages < min_usages {
                cmd.last_used = now;
                return unprepared(statements, bindings, types);
            }
        }

        match self.promote(sql, &statements, &types) {
            Some(fresh) => self.attach(sql, statements, bindings, types, &fresh, now),
            None => {
                if let Some(cmd) = self.commands.get_mut(sql) {
                    cmd.last_used = now;
                }
                unprepared(statements, bindings, types)
            }
        }
    }

    /// Empty slot first, else least usages, ties broken by oldest use.
    fn candidate_slot(&self) -> Option<usize> {
        let mut victim: Option<(usize, u32, Instant)> = None;
        for (i, entry) in self.candidates.iter().enumerate() {
            let Some(cmd) = entry.as_ref().and_then(|key| self.commands.get(key)) else {
                return Some(i);
            };
            let better = victim.map_or(true, |(_, usages, last_used)| {
                cmd.usages < usages || (cmd.usages == usages && cmd.last_used < last_used)
            });
            if better {
                victim = Some((i, cmd.usages, cmd.last_used));
            }
        }
        victim.map(|(i, _, _)| i)
    }

    /// Reference a prepared command for one execution.
    fn attach(
        &mut self,
        sql: &str,
        statements: Arc<[ParsedStatement]>,
        bindings: Vec<SmallVec<[usize; 8]>>,
        types: Vec<ParamFingerprint>,
        fresh: &[String],
        now: Instant,
    ) -> ExecutionPlan {
        if let Some(cmd) = self.commands.get_mut(sql) {
            cmd.ref_count += 1;
            cmd.last_used = now;
        }

        let steps = statements
            .iter()
            .zip(&types)
            .map(|(st, ty)| match self.statements.get(&(st.sql.clone(), ty.clone())) {
                Some(ps) if fresh.contains(&ps.name) => StatementPlan::Prepare {
                    name: ps.name.clone(),
                },
                Some(ps) => StatementPlan::Prepared {
                    name: ps.name.clone(),
                    description: ps.description.clone(),
                },
                None => StatementPlan::Unprepared,
            })
            .collect();

        ExecutionPlan {
            command: Some(sql.to_string()),
            statements,
            bindings,
            param_types: types,
            steps,
        }
    }

    /// Move a candidate into the auto-prepared table.
    ///
    /// Returns the names of statements that must be parsed, or `None` when
    /// no slots can be freed; the command then stays a candidate.
    fn promote(
        &mut self,
        sql: &str,
        statements: &[ParsedStatement],
        types: &[ParamFingerprint],
    ) -> Option<Vec<String>> {
        let wanted = distinct_keys(statements, types);

        // Pin shared statements first so evictions below cannot free them
        let mut attached = Vec::new();
        for key in &wanted {
            if let Some(st) = self.statements.get_mut(key) {
                if st.is_usable() {
                    st.ref_count += 1;
                    attached.push(key.clone());
                }
            }
        }
        let missing: Vec<StatementKey> = wanted
            .into_iter()
            .filter(|k| !attached.contains(k))
            .collect();

        let Some(victims) = self.plan_evictions(sql, missing.len()) else {
            self.unpin(&attached);
            return None;
        };
        for victim in &victims {
            debug!(sql = %victim, "evicting auto-prepared command");
            self.evict_command(victim);
        }

        let free: Vec<usize> = free_slots(&self.auto_slots).take(missing.len()).collect();
        let cmd_slot = free_slots(&self.auto_commands).next();
        let Some(cmd_slot) = cmd_slot.filter(|_| free.len() == missing.len()) else {
            warn!(sql, "no auto-prepare slot free after eviction, executing unprepared");
            self.unpin(&attached);
            return None;
        };

        let mut fresh = Vec::with_capacity(missing.len());
        for (key, slot) in missing.into_iter().zip(free) {
            let name = PreparedStatement::auto_name(slot);
            self.auto_slots[slot] = Some(key.clone());
            let (text, param_types) = key.clone();
            self.statements.insert(
                key,
                PreparedStatement::new(text, name.clone(), Some(slot), param_types),
            );
            fresh.push(name);
        }

        if let Some(cmd) = self.commands.get_mut(sql) {
            if let CommandKind::Candidate { slot } = cmd.kind {
                self.candidates[slot] = None;
            }
            cmd.kind = CommandKind::AutoPrepared { slot: cmd_slot };
            cmd.param_types = Some(types.to_vec());
        }
        self.auto_commands[cmd_slot] = Some(sql.to_string());

        debug!(sql, statements = ?fresh, "auto-preparing command");
        Some(fresh)
    }

    fn unpin(&mut self, keys: &[StatementKey]) {
        for key in keys {
            if let Some(st) = self.statements.get_mut(key) {
                st.ref_count = st.ref_count.saturating_sub(1);
            }
        }
    }

    /// Pick LRU auto-prepared commands to evict so that `needed` statement
    /// slots and one command slot become free. Nothing is mutated.
    fn plan_evictions(&self, sql: &str, needed: usize) -> Option<Vec<String>> {
        let mut free_statements = free_slots(&self.auto_slots).count();
        let mut free_commands = free_slots(&self.auto_commands).count();
        let satisfied = |s: usize, c: usize| s >= needed && c >= 1;
        if satisfied(free_statements, free_commands) {
            return Some(Vec::new());
        }

        let mut candidates: Vec<&CachedCommand> = self
            .auto_commands
            .iter()
            .flatten()
            .filter_map(|key| self.commands.get(key))
            .filter(|cmd| cmd.ref_count == 0 && cmd.sql != sql)
            .collect();
        candidates.sort_by_key(|cmd| cmd.last_used);

        let mut refs: HashMap<&StatementKey, u32> = HashMap::new();
        let mut victims = Vec::new();
        for cmd in candidates {
            let Some(types) = cmd.param_types.as_deref() else {
                continue;
            };
            for key in distinct_keys(&cmd.statements, types) {
                let Some((key, st)) = self.statements.get_key_value(&key) else {
                    continue;
                };
                let count = refs.entry(key).or_insert(st.ref_count);
                *count = count.saturating_sub(1);
                if *count == 0 && st.slot.is_some() {
                    free_statements += 1;
                }
            }
            free_commands += 1;
            victims.push(cmd.sql.clone());

            if satisfied(free_statements, free_commands) {
                return Some(victims);
            }
        }

        trace!(sql, needed, "every auto-prepared command is in use, leaving unprepared");
        None
    }

    /// Drop a prepared command, detaching it from its statements.
    fn evict_command(&mut self, sql: &str) {
        let Some(cmd) = self.commands.remove(sql) else {
            return;
        };
        match cmd.kind {
            CommandKind::Candidate { slot } => {
                self.candidates[slot] = None;
                return;
            }
            CommandKind::AutoPrepared { slot } => self.auto_commands[slot] = None,
            CommandKind::Explicit => {}
        }
        if let Some(types) = cmd.param_types.as_deref() {
            for key in distinct_keys(&cmd.statements, types) {
                self.detach_statement(&key);
            }
        }
    }

    fn detach_statement(&mut self, key: &StatementKey) {
        let Some(st) = self.statements.get_mut(key) else {
            return;
        };
        st.ref_count = st.ref_count.saturating_sub(1);
        if st.ref_count > 0 {
            return;
        }
        if let Some(st) = self.statements.remove(key) {
            if let Some(slot) = st.slot {
                self.auto_slots[slot] = None;
            }
            if st.state == PreparedState::Prepared {
                self.pending_closes.push(st);
            }
        }
    }

    /// Return the reference taken by [`plan`](Self::plan).
    pub fn release(&mut self, plan: &ExecutionPlan) {
        if let Some(cmd) = plan.command.as_ref().and_then(|k| self.commands.get_mut(k)) {
            cmd.ref_count = cmd.ref_count.saturating_sub(1);
        }
    }

    // ========================================================================
    // Protocol progress
    // ========================================================================

    /// Parse for a named statement was written.
    pub fn mark_sent(&mut self, sql: &str, types: &ParamFingerprint) {
        if let Some(st) = self.statements.get_mut(&(sql.to_string(), types.clone())) {
            if st.state == PreparedState::ToBePrepared {
                st.state = PreparedState::BeingPrepared;
            }
        }
    }

    /// ParseComplete arrived for a named statement.
    pub fn complete_prepare(&mut self, sql: &str, types: &ParamFingerprint) {
        if let Some(st) = self.statements.get_mut(&(sql.to_string(), types.clone())) {
            if st.state == PreparedState::BeingPrepared {
                st.state = PreparedState::Prepared;
            }
        }
    }

    /// Remember result columns so later executions can skip Describe.
    pub fn set_description(&mut self, sql: &str, types: &ParamFingerprint, columns: SharedColumns) {
        if let Some(st) = self.statements.get_mut(&(sql.to_string(), types.clone())) {
            if st.description.is_none() {
                st.description = Some(columns);
            }
        }
    }

    /// Take queued Close names; each must be confirmed or rolled back.
    pub fn take_closes(&mut self) -> Vec<String> {
        let names = self.pending_closes.iter().map(|st| st.name.clone()).collect();
        for mut st in self.pending_closes.drain(..) {
            st.state = PreparedState::BeingUnprepared;
            self.unpreparing.push_back(st);
        }
        names
    }

    /// CloseComplete arrived for the oldest unconfirmed Close.
    pub fn complete_close(&mut self) {
        self.unpreparing.pop_front();
    }

    /// The exchange failed before every reply was read.
    ///
    /// Statements whose ParseComplete never arrived do not exist on the
    /// server: they are dropped along with every command using them.
    /// Unconfirmed Closes are queued again.
    pub fn abort_in_flight(&mut self) {
        let aborted: Vec<StatementKey> = self
            .statements
            .iter()
            .filter(|(_, st)| {
                matches!(
                    st.state,
                    PreparedState::ToBePrepared | PreparedState::BeingPrepared
                )
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in aborted {
            if let Some(st) = self.statements.remove(&key) {
                debug!(name = %st.name, "statement was not prepared, dropping it");
                if let Some(slot) = st.slot {
                    self.auto_slots[slot] = None;
                }
            }
            let users: Vec<String> = self
                .commands
                .values()
                .filter(|cmd| {
                    cmd.param_types.as_deref().is_some_and(|types| {
                        distinct_keys(&cmd.statements, types).contains(&key)
                    })
                })
                .map(|cmd| cmd.sql.clone())
                .collect();
            for sql in users {
                self.evict_command(&sql);
            }
        }

        while let Some(mut st) = self.unpreparing.pop_back() {
            st.state = PreparedState::Prepared;
            self.pending_closes.insert(0, st);
        }
    }

    // ========================================================================
    // Explicit preparation
    // ========================================================================

    /// Prepare `sql` on request. Explicit statements use `_p{n}` names and
    /// are never evicted.
    pub fn prepare_explicit(
        &mut self,
        sql: &str,
        params: &[Parameter],
        fingerprint: &[Oid],
        raw: bool,
    ) -> PgResult<PreparePlan> {
        let statements: Arc<[ParsedStatement]> = match self.commands.get(sql) {
            Some(cmd) => cmd.statements.clone(),
            None => sql::parse(sql, raw).into(),
        };
        let (_, types) = resolve(&statements, params, fingerprint)?;

        if let Some(cmd) = self.commands.get_mut(sql) {
            let matches = cmd.fingerprint_matches(&types);
            match cmd.kind {
                CommandKind::Explicit if matches => {
                    return Ok(PreparePlan {
                        statements,
                        param_types: types,
                        to_prepare: Vec::new(),
                    });
                }
                CommandKind::AutoPrepared { slot } if matches => {
                    cmd.kind = CommandKind::Explicit;
                    self.auto_commands[slot] = None;
                    return Ok(PreparePlan {
                        statements,
                        param_types: types,
                        to_prepare: Vec::new(),
                    });
                }
                _ => self.evict_command(sql),
            }
        }

        let mut to_prepare = Vec::new();
        for key in distinct_keys(&statements, &types) {
            if let Some(existing) = self.statements.get_mut(&key) {
                if existing.is_usable() {
                    existing.ref_count += 1;
                    continue;
                }
            }
            let name = PreparedStatement::explicit_name(self.next_explicit_id);
            self.next_explicit_id += 1;
            let index = statements
                .iter()
                .zip(&types)
                .position(|(st, ty)| st.sql == key.0 && *ty == key.1);
            if let Some(index) = index {
                to_prepare.push((index, name.clone()));
            }
            self.statements.insert(
                key.clone(),
                PreparedStatement::new(key.0, name, None, key.1),
            );
        }

        let mut cmd = CachedCommand::candidate(sql.to_string(), statements.clone(), 0, Instant::now());
        cmd.kind = CommandKind::Explicit;
        cmd.param_types = Some(types.clone());
        self.commands.insert(sql.to_string(), cmd);

        Ok(PreparePlan {
            statements,
            param_types: types,
            to_prepare,
        })
    }

    /// Forget an explicitly prepared command. Returns whether Closes are
    /// now queued.
    pub fn unprepare_explicit(&mut self, sql: &str) -> bool {
        let explicit = self
            .commands
            .get(sql)
            .is_some_and(|cmd| cmd.kind == CommandKind::Explicit);
        if explicit {
            self.evict_command(sql);
        }
        !self.pending_closes.is_empty()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn command(&self, sql: &str) -> Option<&CachedCommand> {
        self.commands.get(sql)
    }

    /// First statement with this text, whatever its parameter types.
    pub fn statement(&self, sql: &str) -> Option<&PreparedStatement> {
        self.statements.values().find(|st| st.sql == sql)
    }

    pub fn has_prepared(&self) -> bool {
        !self.statements.is_empty()
    }

    pub fn auto_prepared_count(&self) -> usize {
        self.auto_slots.iter().flatten().count()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.iter().flatten().count()
    }

    pub fn pending_close_count(&self) -> usize {
        self.pending_closes.len()
    }

    pub fn max_auto_prepare(&self) -> usize {
        self.max_auto_prepare
    }
}

fn unprepared(
    statements: Arc<[ParsedStatement]>,
    bindings: Vec<SmallVec<[usize; 8]>>,
    types: Vec<ParamFingerprint>,
) -> ExecutionPlan {
    let steps = vec![StatementPlan::Unprepared; statements.len()];
    ExecutionPlan {
        command: None,
        statements,
        bindings,
        param_types: types,
        steps,
    }
}

/// Parameter indices and types for every statement.
fn resolve(
    statements: &[ParsedStatement],
    params: &[Parameter],
    fingerprint: &[Oid],
) -> PgResult<(Vec<SmallVec<[usize; 8]>>, Vec<ParamFingerprint>)> {
    let mut bindings = Vec::with_capacity(statements.len());
    let mut types = Vec::with_capacity(statements.len());
    for st in statements {
        let indices = st.bind_indices(params)?;
        types.push(
            indices
                .iter()
                .map(|i| fingerprint.get(*i).copied().unwrap_or(Oid::UNSPECIFIED))
                .collect(),
        );
        bindings.push(indices);
    }
    Ok((bindings, types))
}

fn distinct_keys(statements: &[ParsedStatement], types: &[ParamFingerprint]) -> Vec<StatementKey> {
    let mut keys: Vec<StatementKey> = Vec::with_capacity(statements.len());
    for (st, ty) in statements.iter().zip(types) {
        if !keys.iter().any(|(sql, t)| *sql == st.sql && t == ty) {
            keys.push((st.sql.clone(), ty.clone()));
        }
    }
    keys
}

fn free_slots<T>(slots: &[Option<T>]) -> impl Iterator<Item = usize> + '_ {
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
}
