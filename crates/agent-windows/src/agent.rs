// The agent main loop: back-scan, subscribe, drain, dedup, ship.
//
// Single-threaded by design. All event processing (parsing, dedup,
// queue mutation) happens on this one thread of control, so nothing
// here needs a lock.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::event_parser::parse_event_xml;
use crate::retry_queue::RetryQueue;
use crate::seen_store::SeenStore;
use crate::shipper::Shipper;
use crate::wevt_listener::{self, ScanControl, WaitOutcome, WevtListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct SecurityEventAgent {
    config: AgentConfig,
    host_name: String,
    seen: SeenStore,
    queue: RetryQueue,
    shipper: Shipper,
    shutdown: Arc<AtomicBool>,
}

impl SecurityEventAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let host_name = local_host_name();
        let shipper = Shipper::new(&config.collector_url, &config.host_id, &host_name)?;
        let seen = SeenStore::load(&config.seen_path());

        Ok(Self {
            config,
            host_name,
            seen,
            queue: RetryQueue::new(),
            shipper,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked at every wait boundary; flip it from a signal
    /// handler to stop the loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> Result<(), AgentError> {
        tracing::info!(
            host_id = %self.config.host_id,
            host_name = %self.host_name,
            "agent started"
        );

        // Phase 1: catch events generated while the agent was down.
        match self.scan_existing() {
            Ok(n) if n > 0 => {
                tracing::info!(count = n, "startup scan found unsent events");
                self.flush();
            }
            Ok(_) => {}
            Err(e) => tracing::error!("startup scan failed: {}", e),
        }

        // Phase 2: live subscription, or pure polling if the OS
        // refuses the subscription.
        match WevtListener::subscribe(self.config.event_id) {
            Ok(listener) => {
                tracing::info!("real-time subscription active");
                self.run_subscription(listener);
            }
            Err(e) => {
                tracing::error!(
                    "subscription unavailable ({}); falling back to polling every {}s",
                    e,
                    self.config.poll_interval
                );
                self.run_polling();
            }
        }

        tracing::info!("agent stopped");
        Ok(())
    }

    fn run_subscription(&mut self, listener: WevtListener) {
        let timeout_ms = (self.config.poll_interval * 1000).min(u32::MAX as u64) as u32;

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.wait(timeout_ms) {
                WaitOutcome::Signaled => {
                    // Reset before draining so events arriving mid-drain
                    // re-signal instead of being absorbed.
                    listener.reset_signal();
                    self.admit(listener.drain());
                    self.flush();
                }
                WaitOutcome::TimedOut => {
                    // Safety-net drain: the signal is not trusted to
                    // fire on every build, but EvtNext always works.
                    self.admit(listener.drain());
                    self.flush();
                }
                WaitOutcome::Failed => {
                    tracing::error!("subscription wait failed");
                    std::thread::sleep(Duration::from_secs(self.config.poll_interval));
                }
            }
        }

        // One best-effort flush on the way out. Anything still queued
        // after a failed flush is recovered by the next back-scan.
        self.flush();
    }

    fn run_polling(&mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.scan_existing() {
                Ok(_) => {}
                Err(e) => tracing::error!("poll scan failed: {}", e),
            }
            self.flush();
            std::thread::sleep(Duration::from_secs(self.config.poll_interval));
        }
        self.flush();
    }

    /// Reverse back-scan of the log, early-exiting once a whole batch
    /// is already fingerprint-known. Returns newly admitted events.
    fn scan_existing(&mut self) -> Result<usize, AgentError> {
        let mut collected: Vec<String> = Vec::new();
        {
            let seen = &self.seen;
            wevt_listener::back_scan(self.config.event_id, |batch| {
                let mut candidates = 0usize;
                let mut unseen = 0usize;
                for xml in &batch {
                    if let Some(parsed) = parse_event_xml(xml) {
                        if parsed.is_noise() {
                            continue;
                        }
                        candidates += 1;
                        if !seen.contains(&parsed.fingerprint()) {
                            unseen += 1;
                        }
                    }
                }
                collected.extend(batch);

                // Newest-first: a fully-seen batch means everything
                // older is seen too.
                if candidates > 0 && unseen == 0 {
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                }
            })?;
        }

        Ok(self.admit(collected))
    }

    /// Parse, filter, and dedup rendered events; admitted events join
    /// the outbound queue. Returns how many were new.
    pub fn admit(&mut self, xmls: Vec<String>) -> usize {
        let total = xmls.len();
        let mut admitted = 0usize;

        for xml in xmls {
            let parsed = match parse_event_xml(&xml) {
                Some(p) => p,
                None => {
                    tracing::warn!("skipping unparseable event record");
                    continue;
                }
            };
            if parsed.is_noise() {
                continue;
            }
            if !self.seen.insert(parsed.fingerprint()) {
                continue;
            }

            tracing::info!(
                user = parsed.event.username.as_deref().unwrap_or("-"),
                ip = %parsed.event.ip_address,
                "failed login"
            );
            self.queue.push(parsed.event);
            admitted += 1;
        }

        if total > 0 {
            tracing::debug!(total, admitted, "drained events");
        }
        admitted
    }

    /// Ship everything queued as one batch. The seen-set is persisted
    /// only after a successful send: fingerprints of undelivered events
    /// must not survive a crash, or the back-scan would skip them.
    pub fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let batch = self.queue.snapshot();
        if self.shipper.send(&batch) {
            self.queue.clear();
            if let Err(e) = self.seen.save() {
                tracing::warn!("could not persist seen set: {}", e);
            }
        }
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

fn local_host_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> (SecurityEventAgent, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        // host_id doubles as the seen-file prefix; point it into the
        // tempdir so nothing lands in the working directory.
        let config = AgentConfig {
            host_id: dir.path().join("t").display().to_string(),
            collector_url: "http://127.0.0.1:9/api/v1/events".to_string(),
            poll_interval: 1,
            event_id: 4625,
        };
        (SecurityEventAgent::new(config).unwrap(), dir)
    }

    fn sample_xml(second: u32, ip: &str) -> String {
        format!(
            "<Event><System><TimeCreated SystemTime='2026-02-21T16:42:{:02}.0000000Z'/></System>\
             <EventData><Data Name='TargetUserName'>admin</Data>\
             <Data Name='IpAddress'>{}</Data>\
             <Data Name='IpPort'>49152</Data></EventData></Event>",
            second, ip
        )
    }

    #[test]
    fn test_admit_dedups_and_queues() {
        let (mut agent, _dir) = test_agent();

        let admitted = agent.admit(vec![
            sample_xml(1, "203.0.113.10"),
            sample_xml(2, "203.0.113.10"),
            sample_xml(1, "203.0.113.10"), // duplicate of first
        ]);

        assert_eq!(admitted, 2);
        assert_eq!(agent.queue_len(), 2);

        // A second pass over the same events admits nothing.
        let again = agent.admit(vec![sample_xml(1, "203.0.113.10")]);
        assert_eq!(again, 0);
        assert_eq!(agent.queue_len(), 2);
    }

    #[test]
    fn test_admit_drops_loopback_noise() {
        let (mut agent, _dir) = test_agent();
        let admitted = agent.admit(vec![
            sample_xml(1, "127.0.0.1"),
            sample_xml(2, "::1"),
            sample_xml(3, "0.0.0.0"),
            sample_xml(4, "-"),
        ]);
        assert_eq!(admitted, 0);
        assert_eq!(agent.queue_len(), 0);
    }

    #[test]
    fn test_admit_skips_garbage_without_aborting() {
        let (mut agent, _dir) = test_agent();
        let admitted = agent.admit(vec![
            "<Event>no system time</Event>".to_string(),
            sample_xml(5, "198.51.100.7"),
        ]);
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_failed_flush_retains_queue() {
        // Collector URL points at a closed port; the send fails fast
        // and the queue must survive for the next cycle.
        let (mut agent, _dir) = test_agent();
        agent.admit(vec![sample_xml(1, "203.0.113.10")]);
        agent.flush();
        assert_eq!(agent.queue_len(), 1);
    }
}
