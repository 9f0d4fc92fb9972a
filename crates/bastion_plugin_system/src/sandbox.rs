//! # Sandbox Accounting
//!
//! Resource tracking for sandboxed (user-supplied) plugin instances. Three
//! signals are watched against configured ceilings:
//!
//! - **task count** — background tasks spawned through the instance's
//!   sandbox handle, counted live;
//! - **busy time** — cumulative wall-clock spent inside the instance's
//!   event handlers and commands, the CPU-time approximation;
//! - **memory** — process resident-set growth sampled via `sysinfo`,
//!   attributed as an approximation (per-instance memory cannot be measured
//!   exactly in-process).
//!
//! The manager's monitor task samples on a fixed period; a breached ceiling
//! transitions the instance to `error` and stops it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ceilings for one sandboxed instance.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    /// Maximum live background tasks.
    pub max_tasks: usize,
    /// Maximum cumulative busy time.
    pub max_busy: Duration,
    /// Maximum process memory growth attributed while sampling, in bytes.
    pub max_memory_bytes: u64,
    /// Monitor sampling period.
    pub sample_period: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_tasks: 64,
            max_busy: Duration::from_secs(60),
            max_memory_bytes: 256 * 1024 * 1024,
            sample_period: Duration::from_secs(5),
        }
    }
}

/// Per-instance resource accounting, shared between the instance's API
/// bundle and the monitor.
#[derive(Debug, Default)]
pub struct SandboxHandle {
    live_tasks: AtomicUsize,
    busy_micros: AtomicU64,
}

impl SandboxHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a tracked background task tied to the instance context. The
    /// counter drops when the future finishes or the context cancels it.
    pub fn spawn<F>(self: &Arc<Self>, cancel: CancellationToken, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.live_tasks.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = future => {}
            }
            handle.live_tasks.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Currently live background tasks.
    pub fn task_count(&self) -> usize {
        self.live_tasks.load(Ordering::Relaxed)
    }

    /// Adds instrumented busy time (manager-side, around handler calls).
    pub fn record_busy(&self, elapsed: Duration) {
        self.busy_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Cumulative busy time.
    pub fn busy_time(&self) -> Duration {
        Duration::from_micros(self.busy_micros.load(Ordering::Relaxed))
    }

    /// Checks the instance-local counters against the limits. Returns the
    /// breach description, if any. Memory is checked by the monitor with
    /// process-level data and reported separately.
    pub fn check(&self, limits: &SandboxLimits) -> Option<String> {
        let tasks = self.task_count();
        if tasks > limits.max_tasks {
            return Some(format!("task count {tasks} exceeds limit {}", limits.max_tasks));
        }
        let busy = self.busy_time();
        if busy > limits.max_busy {
            return Some(format!(
                "busy time {busy:?} exceeds limit {:?}",
                limits.max_busy
            ));
        }
        None
    }
}

/// Process-wide memory sampler used by the monitor task.
pub(crate) struct MemorySampler {
    system: sysinfo::System,
    pid: sysinfo::Pid,
    baseline: u64,
}

impl MemorySampler {
    pub(crate) fn new() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let baseline = system.process(pid)?.memory();
        Some(Self {
            system,
            pid,
            baseline,
        })
    }

    /// Resident-set growth since the sampler was created, in bytes.
    pub(crate) fn growth(&mut self) -> u64 {
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map(|p| p.memory().saturating_sub(self.baseline))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_counter_tracks_spawn_and_completion() {
        let handle = Arc::new(SandboxHandle::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        handle.spawn(cancel.clone(), async move {
            let _ = rx.await;
        });
        tokio::task::yield_now().await;
        assert_eq!(handle.task_count(), 1);

        tx.send(()).ok();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.task_count(), 0);
    }

    #[test]
    fn busy_time_breach_is_reported() {
        let handle = SandboxHandle::new();
        let limits = SandboxLimits {
            max_busy: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(handle.check(&limits).is_none());
        handle.record_busy(Duration::from_millis(25));
        let breach = handle.check(&limits).unwrap();
        assert!(breach.contains("busy time"));
    }

    #[test]
    fn task_count_breach_is_reported() {
        let handle = SandboxHandle::new();
        let limits = SandboxLimits {
            max_tasks: 0,
            ..Default::default()
        };
        handle.live_tasks.fetch_add(1, Ordering::Relaxed);
        let breach = handle.check(&limits).unwrap();
        assert!(breach.contains("task count"));
    }

    #[test]
    fn memory_sampler_reports_nonnegative_growth() {
        if let Some(mut sampler) = MemorySampler::new() {
            let _growth = sampler.growth();
        }
    }
}
