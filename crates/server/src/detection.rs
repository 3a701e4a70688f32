// Rolling-window brute-force detection.
//
// Threshold inputs are ALWAYS windowed counts over failed_logins. The
// suspicious_ips lifetime counter accumulates forever and would let a
// long-idle IP re-trigger on a single new attempt.

use crate::blocklist::BlockScope;
use crate::db::{minutes_ago_string, Database};
use crate::settings::Settings;

/// A block the engine decided to create.
#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub ip: String,
    pub scope: BlockScope,
    pub target_host_id: Option<String>,
    pub reason: String,
    pub duration_minutes: i64,
}

/// Evaluate both policies for one admitted event. At most one decision
/// comes back: when global and per-host would both trigger, only the
/// global block is created, and an active global block suppresses
/// per-host blocking entirely.
pub fn evaluate(
    db: &Database,
    settings: &Settings,
    ip: &str,
    host_id: &str,
) -> Result<Option<BlockDecision>, rusqlite::Error> {
    if settings.auto_block_enabled && settings.global_auto_block_enabled {
        let since = minutes_ago_string(settings.time_window_minutes);
        let count = db.count_failed_since(ip, &since)?;

        if count >= settings.effective_global_threshold() {
            if db.has_active_block(ip, BlockScope::Global.as_str(), None)? {
                // Already covered; nothing more to do for this IP.
                return Ok(None);
            }
            return Ok(Some(BlockDecision {
                ip: ip.to_string(),
                scope: BlockScope::Global,
                target_host_id: None,
                reason: format!(
                    "{} failed logins within {} minutes across all hosts",
                    count, settings.time_window_minutes
                ),
                duration_minutes: settings.block_duration_minutes,
            }));
        }
    }

    // An active global block already covers every host.
    if db.has_active_block(ip, BlockScope::Global.as_str(), None)? {
        return Ok(None);
    }

    let policy = settings.effective_for(db.host_policy(host_id)?.as_ref());
    if !policy.auto_block_enabled {
        return Ok(None);
    }

    let since = minutes_ago_string(policy.window_minutes);
    let count = db.count_failed_for_host_since(ip, host_id, &since)?;
    if count >= policy.threshold
        && !db.has_active_block(ip, BlockScope::PerHost.as_str(), Some(host_id))?
    {
        return Ok(Some(BlockDecision {
            ip: ip.to_string(),
            scope: BlockScope::PerHost,
            target_host_id: Some(host_id.to_string()),
            reason: format!(
                "{} failed logins within {} minutes on host {}",
                count, policy.window_minutes, host_id
            ),
            duration_minutes: policy.block_duration_minutes,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_string;
    use secmon_core::FailedLoginEvent;

    fn settings() -> Settings {
        Settings::default()
    }

    fn ingest_n(db: &Database, ip: &str, host_id: &str, n: usize) {
        for i in 0..n {
            let ev = FailedLoginEvent {
                // Fresh wall-clock stamps keep everything inside the window.
                timestamp: now_string(),
                ip_address: ip.to_string(),
                username: Some("admin".to_string()),
                domain: None,
                logon_type: Some("3".to_string()),
                status: None,
                workstation: None,
                source_port: Some(format!("{}", 40_000 + i)),
            };
            db.ingest_event(host_id, "WIN-1", &ev).unwrap();
        }
    }

    #[test]
    fn test_below_threshold_no_decision() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.10", "h-1", 4);

        let decision = evaluate(&db, &settings(), "203.0.113.10", "h-1").unwrap();
        assert!(decision.is_none());
    }

    #[test]
    fn test_threshold_triggers_global_block() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.10", "h-1", 5);

        let decision = evaluate(&db, &settings(), "203.0.113.10", "h-1")
            .unwrap()
            .expect("threshold crossed");
        assert_eq!(decision.scope, BlockScope::Global);
        assert!(decision.target_host_id.is_none());
        assert_eq!(decision.duration_minutes, 120);
    }

    #[test]
    fn test_decision_uses_windowed_count_not_lifetime() {
        let db = Database::open_in_memory().unwrap();

        // Ancient history: enough lifetime failures to trip any
        // threshold, all far outside the window.
        for i in 0..10 {
            let ev = FailedLoginEvent {
                timestamp: format!("2020-01-01T00:00:{:02}.0", i),
                ip_address: "203.0.113.10".to_string(),
                username: Some("admin".to_string()),
                domain: None,
                logon_type: None,
                status: None,
                workstation: None,
                source_port: Some(format!("{}", i)),
            };
            db.ingest_event("h-1", "WIN-1", &ev).unwrap();
        }
        // One fresh attempt.
        ingest_n(&db, "203.0.113.10", "h-1", 1);

        // Lifetime counter says 11; the window says 1. No block.
        let rows = db.suspicious_ips(1).unwrap();
        assert_eq!(rows[0].failure_count, 11);
        assert!(evaluate(&db, &settings(), "203.0.113.10", "h-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_active_global_block_suppresses_everything() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.11", "h-2", 5);
        db.insert_block(
            "203.0.113.11",
            "global",
            None,
            "already blocked",
            &crate::db::minutes_ahead_string(60),
            "auto",
        )
        .unwrap();

        let decision = evaluate(&db, &settings(), "203.0.113.11", "h-2").unwrap();
        assert!(decision.is_none());
    }

    #[test]
    fn test_per_host_policy_triggers_per_host_block() {
        let db = Database::open_in_memory().unwrap();
        // Tighter per-host threshold than global.
        db.set_host_policy(&crate::db::HostPolicyRow {
            host_id: "h-3".to_string(),
            threshold: Some(3),
            window_minutes: None,
            block_duration_minutes: Some(30),
            auto_block_enabled: Some(true),
        })
        .unwrap();

        ingest_n(&db, "203.0.113.12", "h-3", 3);

        let decision = evaluate(&db, &settings(), "203.0.113.12", "h-3")
            .unwrap()
            .expect("per-host threshold crossed");
        assert_eq!(decision.scope, BlockScope::PerHost);
        assert_eq!(decision.target_host_id.as_deref(), Some("h-3"));
        assert_eq!(decision.duration_minutes, 30);
    }

    #[test]
    fn test_master_switch_disables_all_blocking() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.13", "h-1", 10);

        let mut s = settings();
        s.auto_block_enabled = false;
        assert!(evaluate(&db, &s, "203.0.113.13", "h-1").unwrap().is_none());
    }

    #[test]
    fn test_global_switch_leaves_per_host_active() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.14", "h-1", 5);

        let mut s = settings();
        s.global_auto_block_enabled = false;
        let decision = evaluate(&db, &s, "203.0.113.14", "h-1")
            .unwrap()
            .expect("per-host path still evaluates");
        assert_eq!(decision.scope, BlockScope::PerHost);
    }

    #[test]
    fn test_existing_per_host_block_not_duplicated() {
        let db = Database::open_in_memory().unwrap();
        ingest_n(&db, "203.0.113.15", "h-1", 5);
        db.insert_block(
            "203.0.113.15",
            "per-host",
            Some("h-1"),
            "existing",
            &crate::db::minutes_ahead_string(60),
            "auto",
        )
        .unwrap();

        let mut s = settings();
        s.global_auto_block_enabled = false;
        assert!(evaluate(&db, &s, "203.0.113.15", "h-1").unwrap().is_none());
    }
}
