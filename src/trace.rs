/// Deterministic kernel trace.
///
/// Records what the kernel did to each process (spawns, resumptions,
/// transitions, grants, preemptions, interrupts) in an append-only log.
/// Two runs of the same model must produce logs with the same hash;
/// `logs_match` and `log_hash` turn that into a one-line assertion.

use crate::process::ProcessId;
use crate::resource::{RequestId, ResourceId};
use crate::time::VirtualTime;

// ── Hash utility ──────────────────────────────────────────────────────

/// Combine two u64 hashes deterministically.
pub fn hash_combine(a: u64, b: u64) -> u64 {
    let mut h = a;
    h = h.wrapping_mul(0x517cc1b727220a95);
    h = h.wrapping_add(b);
    h ^= h >> 32;
    h
}

/// Hash a byte slice deterministically (FNV-1a variant).
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

// ── Entries ───────────────────────────────────────────────────────────

/// One kernel action.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceKind {
    Spawned { name: String, state: String },
    Resumed { wake: String },
    Transition { from: String, to: String },
    Suspended,
    Requested { resource: ResourceId, request: RequestId },
    Granted { request: RequestId },
    Released { request: RequestId },
    Cancelled { request: RequestId },
    Preempted { request: RequestId, by: ProcessId },
    /// A preemption notice could not be queued because the holder's
    /// mailbox was occupied or the holder was not suspended.
    PreemptionUndelivered { request: RequestId },
    Interrupted { cause: String },
    Terminated,
    Failed { error: String },
}

impl TraceKind {
    fn hash(&self) -> u64 {
        match self {
            TraceKind::Spawned { name, state } => hash_combine(
                hash_combine(1, hash_bytes(name.as_bytes())),
                hash_bytes(state.as_bytes()),
            ),
            TraceKind::Resumed { wake } => hash_combine(2, hash_bytes(wake.as_bytes())),
            TraceKind::Transition { from, to } => hash_combine(
                hash_combine(3, hash_bytes(from.as_bytes())),
                hash_bytes(to.as_bytes()),
            ),
            TraceKind::Suspended => 4,
            TraceKind::Requested { resource, request } => {
                hash_combine(hash_combine(5, resource.raw()), request.raw())
            }
            TraceKind::Granted { request } => hash_combine(6, request.raw()),
            TraceKind::Released { request } => hash_combine(7, request.raw()),
            TraceKind::Cancelled { request } => hash_combine(8, request.raw()),
            TraceKind::Preempted { request, by } => {
                hash_combine(hash_combine(9, request.raw()), by.raw())
            }
            TraceKind::PreemptionUndelivered { request } => hash_combine(10, request.raw()),
            TraceKind::Interrupted { cause } => hash_combine(11, hash_bytes(cause.as_bytes())),
            TraceKind::Terminated => 12,
            TraceKind::Failed { error } => hash_combine(13, hash_bytes(error.as_bytes())),
        }
    }
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceKind::Spawned { name, state } => write!(f, "spawned {} in {}", name, state),
            TraceKind::Resumed { wake } => write!(f, "resumed ({})", wake),
            TraceKind::Transition { from, to } => write!(f, "{} → {}", from, to),
            TraceKind::Suspended => write!(f, "suspended"),
            TraceKind::Requested { resource, request } => {
                write!(f, "requested {} as {}", resource, request)
            }
            TraceKind::Granted { request } => write!(f, "granted {}", request),
            TraceKind::Released { request } => write!(f, "released {}", request),
            TraceKind::Cancelled { request } => write!(f, "cancelled {}", request),
            TraceKind::Preempted { request, by } => write!(f, "lost {} to {}", request, by),
            TraceKind::PreemptionUndelivered { request } => {
                write!(f, "preemption of {} not delivered", request)
            }
            TraceKind::Interrupted { cause } => write!(f, "interrupted: {}", cause),
            TraceKind::Terminated => write!(f, "terminated"),
            TraceKind::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A record of a single kernel action on a process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceEntry {
    pub time: VirtualTime,
    pub process: ProcessId,
    pub kind: TraceKind,
}

impl std::fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[T={} {}] {}", self.time.ticks(), self.process, self.kind)
    }
}

// ── Trace Log ─────────────────────────────────────────────────────────

/// Append-only log of kernel actions.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    entries: Vec<TraceEntry>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, time: VirtualTime, process: ProcessId, kind: TraceKind) {
        self.entries.push(TraceEntry {
            time,
            process,
            kind,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Entries concerning one process, in order.
    pub fn for_process(&self, process: ProcessId) -> impl Iterator<Item = &TraceEntry> + '_ {
        self.entries.iter().filter(move |e| e.process == process)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute a deterministic hash of the entire log.
    pub fn log_hash(&self) -> u64 {
        let mut h: u64 = 0;
        for entry in &self.entries {
            h = hash_combine(h, entry.time.ticks());
            h = hash_combine(h, entry.process.raw());
            h = hash_combine(h, entry.kind.hash());
        }
        h
    }

    /// Render the log as pretty-printed JSON.
    #[cfg(feature = "serialize")]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.entries).unwrap_or_else(|_| "[]".into())
    }
}

/// Compare two logs entry by entry.
pub fn logs_match(a: &TraceLog, b: &TraceLog) -> bool {
    a.entries == b.entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(wake: &str) -> TraceLog {
        let mut log = TraceLog::new();
        let p = ProcessId::new(0);
        log.record(
            VirtualTime::ZERO,
            p,
            TraceKind::Spawned {
                name: "car".into(),
                state: "Parked".into(),
            },
        );
        log.record(VirtualTime::new(5), p, TraceKind::Resumed { wake: wake.into() });
        log
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(sample("timeout").log_hash(), sample("timeout").log_hash());
        assert!(logs_match(&sample("timeout"), &sample("timeout")));
    }

    #[test]
    fn test_hash_detects_divergence() {
        assert_ne!(sample("timeout").log_hash(), sample("interrupted").log_hash());
        assert!(!logs_match(&sample("timeout"), &sample("interrupted")));
    }

    #[test]
    fn test_entry_display() {
        let log = sample("timeout");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].to_string(), "[T=5 P0] resumed (timeout)");
        assert_eq!(log.for_process(ProcessId::new(1)).count(), 0);
    }

    #[test]
    fn test_hash_combine_order_matters() {
        assert_ne!(hash_combine(1, 2), hash_combine(2, 1));
        assert_eq!(hash_bytes(b""), 0xcbf29ce484222325);
    }
}
