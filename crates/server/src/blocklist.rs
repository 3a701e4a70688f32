// Block lifecycle: create, clear, expire, and reconcile against the
// firewall adapter.

use crate::db::{minutes_ahead_string, now_string, BlockRow, Database};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Whether a block applies at the network perimeter or to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockScope {
    Global,
    PerHost,
}

impl BlockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockScope::Global => "global",
            BlockScope::PerHost => "per-host",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "global" => Some(BlockScope::Global),
            "per-host" => Some(BlockScope::PerHost),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FirewallError {
    /// Worth retrying on the next reconciler pass.
    #[error("transient firewall error: {0}")]
    Transient(String),
    /// Not retried; the block row stays active for operator action.
    #[error("permanent firewall error: {0}")]
    Permanent(String),
}

/// Pluggable firewall. Both operations are idempotent: applying an
/// existing rule or removing a missing one succeeds.
pub trait FirewallAdapter: Send + Sync {
    fn apply(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError>;

    fn remove(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError>;
}

/// Default adapter: records intended rule changes in the log and does
/// nothing else. Real rule management is deployment-specific.
pub struct LogFirewall;

impl FirewallAdapter for LogFirewall {
    fn apply(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError> {
        tracing::info!(ip, scope = scope.as_str(), host = ?target_host_id, "firewall apply");
        Ok(())
    }

    fn remove(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError> {
        tracing::info!(ip, scope = scope.as_str(), host = ?target_host_id, "firewall remove");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallOp {
    Apply,
    Remove,
}

#[derive(Debug, Clone)]
pub struct FirewallCall {
    pub op: FirewallOp,
    pub ip: String,
    pub scope: BlockScope,
    pub target_host_id: Option<String>,
}

/// Test double: records every call, optionally failing applies.
#[derive(Default)]
pub struct MemoryFirewall {
    calls: Mutex<Vec<FirewallCall>>,
    fail_apply: Mutex<Option<FirewallError>>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<FirewallCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn apply_calls(&self) -> Vec<FirewallCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == FirewallOp::Apply)
            .collect()
    }

    pub fn remove_calls(&self) -> Vec<FirewallCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == FirewallOp::Remove)
            .collect()
    }

    /// Make subsequent apply() calls fail with the given error.
    pub fn fail_next_applies(&self, err: FirewallError) {
        *self.fail_apply.lock().unwrap() = Some(err);
    }

    pub fn heal(&self) {
        *self.fail_apply.lock().unwrap() = None;
    }

    fn record(&self, op: FirewallOp, ip: &str, scope: BlockScope, target: Option<&str>) {
        self.calls.lock().unwrap().push(FirewallCall {
            op,
            ip: ip.to_string(),
            scope,
            target_host_id: target.map(String::from),
        });
    }
}

impl FirewallAdapter for MemoryFirewall {
    fn apply(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError> {
        self.record(FirewallOp::Apply, ip, scope, target_host_id);
        match &*self.fail_apply.lock().unwrap() {
            Some(FirewallError::Transient(m)) => Err(FirewallError::Transient(m.clone())),
            Some(FirewallError::Permanent(m)) => Err(FirewallError::Permanent(m.clone())),
            None => Ok(()),
        }
    }

    fn remove(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
    ) -> Result<(), FirewallError> {
        self.record(FirewallOp::Remove, ip, scope, target_host_id);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no active block for this IP")]
    NotFound,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub struct BlockManager {
    db: Arc<Database>,
    firewall: Arc<dyn FirewallAdapter>,
}

impl BlockManager {
    pub fn new(db: Arc<Database>, firewall: Arc<dyn FirewallAdapter>) -> Self {
        Self { db, firewall }
    }

    /// Create a block and push the rule to the firewall. A failed
    /// apply leaves the row active: transient failures are retried by
    /// the reconciler, permanent ones wait for an operator.
    pub fn create_block(
        &self,
        ip: &str,
        scope: BlockScope,
        target_host_id: Option<&str>,
        reason: &str,
        duration_minutes: i64,
        created_by: &str,
    ) -> Result<i64, BlockError> {
        let expires_at = minutes_ahead_string(duration_minutes);
        let id = self.db.insert_block(
            ip,
            scope.as_str(),
            target_host_id,
            reason,
            &expires_at,
            created_by,
        )?;
        self.db.set_suspicious_status(ip, "blocked")?;

        match self.firewall.apply(ip, scope, target_host_id) {
            Ok(()) => self.db.set_firewall_applied(id, true)?,
            Err(FirewallError::Transient(m)) => {
                tracing::warn!(ip, "firewall apply failed, reconciler will retry: {}", m);
            }
            Err(FirewallError::Permanent(m)) => {
                tracing::error!(ip, "firewall apply failed permanently: {}", m);
            }
        }

        tracing::info!(
            ip,
            scope = scope.as_str(),
            host = ?target_host_id,
            expires_at = %expires_at,
            created_by,
            "block created"
        );
        Ok(id)
    }

    /// Clear every active block for the IP and remove the firewall
    /// rules. `NotFound` when nothing was active.
    pub fn unblock(&self, ip: &str, cleared_by: &str) -> Result<usize, BlockError> {
        let cleared = self.db.clear_active_blocks(ip, cleared_by)?;
        if cleared.is_empty() {
            return Err(BlockError::NotFound);
        }

        self.db.set_suspicious_status(ip, "cleared")?;
        for row in &cleared {
            self.remove_rule(row);
        }

        tracing::info!(ip, count = cleared.len(), cleared_by, "unblocked");
        Ok(cleared.len())
    }

    /// One reconciler pass: expire overdue blocks and retry firewall
    /// applies that failed transiently. Returns how many expired.
    pub fn run_expiry_cycle(&self) -> Result<usize, BlockError> {
        let now = now_string();

        let expired = self.db.expired_active_blocks(&now)?;
        for row in &expired {
            self.db.expire_block(row.id)?;
            self.remove_rule(row);
            tracing::info!(ip = %row.source_ip, scope = %row.scope, "block expired");
        }

        for row in self.db.unapplied_active_blocks()? {
            let scope = BlockScope::from_str(&row.scope).unwrap_or(BlockScope::Global);
            match self
                .firewall
                .apply(&row.source_ip, scope, row.target_host_id.as_deref())
            {
                Ok(()) => {
                    self.db.set_firewall_applied(row.id, true)?;
                    tracing::info!(ip = %row.source_ip, "firewall apply retried successfully");
                }
                Err(FirewallError::Transient(m)) => {
                    tracing::warn!(ip = %row.source_ip, "firewall apply still failing: {}", m);
                }
                Err(FirewallError::Permanent(m)) => {
                    tracing::error!(ip = %row.source_ip, "firewall apply failed permanently: {}", m);
                }
            }
        }

        Ok(expired.len())
    }

    fn remove_rule(&self, row: &BlockRow) {
        let scope = BlockScope::from_str(&row.scope).unwrap_or(BlockScope::Global);
        if let Err(e) = self
            .firewall
            .remove(&row.source_ip, scope, row.target_host_id.as_deref())
        {
            // Removal failures are logged only; the row is already
            // inactive and the adapter is idempotent.
            tracing::error!(ip = %row.source_ip, "firewall remove failed: {}", e);
        }
    }
}

/// Background expiry reconciler. Interval stays at or below 60 s so an
/// expired block outlives its deadline by at most one cycle.
pub async fn run_reconciler(manager: Arc<BlockManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match manager.run_expiry_cycle() {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "reconciler expired blocks"),
            Err(e) => tracing::error!("reconciler pass failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_memory_firewall() -> (BlockManager, Arc<Database>, Arc<MemoryFirewall>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let firewall = Arc::new(MemoryFirewall::new());
        let manager = BlockManager::new(db.clone(), firewall.clone());
        (manager, db, firewall)
    }

    #[test]
    fn test_create_block_applies_firewall_rule() {
        let (manager, db, firewall) = manager_with_memory_firewall();

        manager
            .create_block("203.0.113.10", BlockScope::Global, None, "test", 60, "auto")
            .unwrap();

        assert!(db.has_active_block("203.0.113.10", "global", None).unwrap());
        let applies = firewall.apply_calls();
        assert_eq!(applies.len(), 1);
        assert_eq!(applies[0].ip, "203.0.113.10");

        let blocks = db.active_blocks().unwrap();
        assert!(blocks[0].firewall_applied);
    }

    #[test]
    fn test_unblock_removes_rule_then_404s() {
        let (manager, db, firewall) = manager_with_memory_firewall();
        manager
            .create_block("203.0.113.12", BlockScope::Global, None, "test", 60, "manual")
            .unwrap();

        assert_eq!(manager.unblock("203.0.113.12", "manual").unwrap(), 1);
        assert!(!db.has_active_block("203.0.113.12", "global", None).unwrap());
        assert_eq!(firewall.remove_calls().len(), 1);

        // A second unblock has nothing to clear.
        assert!(matches!(
            manager.unblock("203.0.113.12", "manual"),
            Err(BlockError::NotFound)
        ));
    }

    #[test]
    fn test_transient_apply_failure_retried_by_reconciler() {
        let (manager, db, firewall) = manager_with_memory_firewall();
        firewall.fail_next_applies(FirewallError::Transient("fw offline".into()));

        manager
            .create_block("203.0.113.13", BlockScope::Global, None, "test", 60, "auto")
            .unwrap();

        // Row active but unapplied.
        let blocks = db.active_blocks().unwrap();
        assert!(blocks[0].is_active);
        assert!(!blocks[0].firewall_applied);

        firewall.heal();
        manager.run_expiry_cycle().unwrap();

        let blocks = db.active_blocks().unwrap();
        assert!(blocks[0].firewall_applied);
    }

    #[test]
    fn test_permanent_apply_failure_leaves_row_active() {
        let (manager, db, firewall) = manager_with_memory_firewall();
        firewall.fail_next_applies(FirewallError::Permanent("unsupported".into()));

        manager
            .create_block("203.0.113.14", BlockScope::Global, None, "test", 60, "auto")
            .unwrap();

        let blocks = db.active_blocks().unwrap();
        assert!(blocks[0].is_active);
        assert!(!blocks[0].firewall_applied);
    }

    #[test]
    fn test_expiry_cycle_deactivates_and_removes() {
        let (manager, db, firewall) = manager_with_memory_firewall();
        // Negative duration: already expired on creation.
        manager
            .create_block("203.0.113.15", BlockScope::Global, None, "test", -1, "auto")
            .unwrap();

        let expired = manager.run_expiry_cycle().unwrap();
        assert_eq!(expired, 1);
        assert!(db.active_blocks().unwrap().is_empty());
        assert_eq!(firewall.remove_calls().len(), 1);
    }

    #[test]
    fn test_per_host_block_carries_target() {
        let (manager, _db, firewall) = manager_with_memory_firewall();
        manager
            .create_block(
                "203.0.113.16",
                BlockScope::PerHost,
                Some("h-2"),
                "test",
                60,
                "auto",
            )
            .unwrap();

        let applies = firewall.apply_calls();
        assert_eq!(applies[0].scope, BlockScope::PerHost);
        assert_eq!(applies[0].target_host_id.as_deref(), Some("h-2"));
    }
}
