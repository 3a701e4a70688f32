// Policy settings: seeded in the settings table, overridable from the
// environment at startup.

use crate::db::{Database, HostPolicyRow};

/// Resolved global policy. Loaded once at startup; the settings table
/// is the durable source, environment variables win for the session.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Failed-login count that trips a block.
    pub threshold: i64,
    /// Rolling-window length in minutes.
    pub time_window_minutes: i64,
    /// Auto-block lifetime in minutes.
    pub block_duration_minutes: i64,
    /// Master switch for all auto-blocking.
    pub auto_block_enabled: bool,
    /// Override of `threshold` for global-scope (all hosts) counting;
    /// None falls back to `threshold`.
    pub global_threshold: Option<i64>,
    /// Switch for global-scope blocks specifically.
    pub global_auto_block_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: 5,
            time_window_minutes: 5,
            block_duration_minutes: 120,
            auto_block_enabled: true,
            global_threshold: None,
            global_auto_block_enabled: true,
        }
    }
}

/// Thresholds in effect for one host after per-host overrides.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub threshold: i64,
    pub window_minutes: i64,
    pub block_duration_minutes: i64,
    pub auto_block_enabled: bool,
}

impl Settings {
    /// Load from the settings table, then apply environment overrides.
    pub fn load(db: &Database) -> Self {
        let mut settings = Self::default();

        settings.threshold = resolve_i64(db, "THRESHOLD", settings.threshold);
        settings.time_window_minutes = resolve_i64(db, "TIME_WINDOW", settings.time_window_minutes);
        settings.block_duration_minutes =
            resolve_i64(db, "BLOCK_DURATION", settings.block_duration_minutes);
        settings.auto_block_enabled =
            resolve_bool(db, "ENABLE_AUTO_BLOCK", settings.auto_block_enabled);
        settings.global_threshold = resolve_opt_i64(db, "GLOBAL_THRESHOLD");
        settings.global_auto_block_enabled = resolve_bool(
            db,
            "ENABLE_GLOBAL_AUTO_BLOCK",
            settings.global_auto_block_enabled,
        );

        settings
    }

    /// Threshold used for the global (cross-host) count.
    pub fn effective_global_threshold(&self) -> i64 {
        self.global_threshold.unwrap_or(self.threshold)
    }

    /// Per-host policy with global fallback for NULL fields.
    pub fn effective_for(&self, policy: Option<&HostPolicyRow>) -> EffectivePolicy {
        let p = policy.cloned().unwrap_or_default();
        EffectivePolicy {
            threshold: p.threshold.unwrap_or(self.threshold),
            window_minutes: p.window_minutes.unwrap_or(self.time_window_minutes),
            block_duration_minutes: p
                .block_duration_minutes
                .unwrap_or(self.block_duration_minutes),
            auto_block_enabled: p.auto_block_enabled.unwrap_or(self.auto_block_enabled),
        }
    }
}

fn resolve_raw(db: &Database, key: &str) -> Option<String> {
    // Environment beats the table; empty values mean "unset" either way.
    let value = std::env::var(key)
        .ok()
        .or_else(|| db.get_setting(key).ok().flatten());
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_i64(db: &Database, key: &str, default: i64) -> i64 {
    resolve_raw(db, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve_opt_i64(db: &Database, key: &str) -> Option<i64> {
    resolve_raw(db, key).and_then(|v| v.trim().parse().ok())
}

fn resolve_bool(db: &Database, key: &str, default: bool) -> bool {
    match resolve_raw(db, key) {
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_seeded_table() {
        let db = Database::open_in_memory().unwrap();
        let s = Settings::load(&db);

        assert_eq!(s.threshold, 5);
        assert_eq!(s.time_window_minutes, 5);
        assert_eq!(s.block_duration_minutes, 120);
        assert!(s.auto_block_enabled);
        assert_eq!(s.global_threshold, None);
        assert_eq!(s.effective_global_threshold(), 5);
    }

    #[test]
    fn test_table_values_override_defaults() {
        let db = Database::open_in_memory().unwrap();
        db.set_setting("THRESHOLD", "8").unwrap();
        db.set_setting("GLOBAL_THRESHOLD", "20").unwrap();
        db.set_setting("ENABLE_AUTO_BLOCK", "false").unwrap();

        let s = Settings::load(&db);
        assert_eq!(s.threshold, 8);
        assert_eq!(s.effective_global_threshold(), 20);
        assert!(!s.auto_block_enabled);
    }

    #[test]
    fn test_effective_policy_inherits_global() {
        let s = Settings::default();

        let effective = s.effective_for(None);
        assert_eq!(effective.threshold, 5);
        assert_eq!(effective.window_minutes, 5);
        assert!(effective.auto_block_enabled);

        let policy = HostPolicyRow {
            host_id: "h-1".to_string(),
            threshold: Some(3),
            window_minutes: None,
            block_duration_minutes: Some(30),
            auto_block_enabled: None,
        };
        let effective = s.effective_for(Some(&policy));
        assert_eq!(effective.threshold, 3);
        assert_eq!(effective.window_minutes, 5);
        assert_eq!(effective.block_duration_minutes, 30);
        assert!(effective.auto_block_enabled);
    }
}
