//! Hot-loop purity accounting.
//!
//! The engine performs no network I/O between the first and last frame; an
//! external syscall audit enforces that from outside the process. This
//! module is the in-process accounting surface the audit reconciles
//! against: counters any networking shim must bump, armed only while the
//! hot loop runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::error;

/// Purity summary merged into `metrics.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PurityReport {
    pub network_syscalls: bool,
    pub sockets_blocked: u64,
    pub dns_blocked: u64,
}

/// Counter surface for the run-long purity invariant.
#[derive(Debug, Default)]
pub struct PurityGuard {
    armed: AtomicBool,
    sockets: AtomicU64,
    dns: AtomicU64,
}

impl PurityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm before the first frame.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarm after the last frame.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Record a socket operation attempted while armed.
    pub fn record_socket(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.sockets.fetch_add(1, Ordering::SeqCst);
            error!("socket operation recorded inside hot loop");
        }
    }

    /// Record a DNS resolution attempted while armed.
    pub fn record_dns(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.dns.fetch_add(1, Ordering::SeqCst);
            error!("dns resolution recorded inside hot loop");
        }
    }

    pub fn report(&self) -> PurityReport {
        let sockets = self.sockets.load(Ordering::SeqCst);
        let dns = self.dns.load(Ordering::SeqCst);
        PurityReport {
            network_syscalls: sockets + dns > 0,
            sockets_blocked: sockets,
            dns_blocked: dns,
        }
    }

    /// True when the run stayed pure.
    pub fn is_clean(&self) -> bool {
        !self.report().network_syscalls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run_reports_zeroes() {
        let guard = PurityGuard::new();
        guard.arm();
        guard.disarm();
        assert_eq!(
            guard.report(),
            PurityReport {
                network_syscalls: false,
                sockets_blocked: 0,
                dns_blocked: 0,
            }
        );
        assert!(guard.is_clean());
    }

    #[test]
    fn recordings_only_count_while_armed() {
        let guard = PurityGuard::new();
        guard.record_socket();
        guard.record_dns();
        assert!(guard.is_clean());

        guard.arm();
        guard.record_socket();
        guard.record_dns();
        guard.record_dns();
        guard.disarm();
        guard.record_socket();

        let report = guard.report();
        assert!(report.network_syscalls);
        assert_eq!(report.sockets_blocked, 1);
        assert_eq!(report.dns_blocked, 2);
    }
}
