//! Non-fatal findings recorded during a run, kept for post-hoc analysis.
//!
//! The engine records a [`Diagnostic`] whenever a consistency check fails or
//! the optimizer falls back. Each kind keeps its most recent findings in a
//! bounded [`DiagnosticBuffer`].
//!
//! # Suppression
//!
//! Kinds can be suppressed via [`DiagnosticLog::suppress`]. Suppressed
//! diagnostics are neither buffered nor delivered to listeners.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::id::{ElementId, NodeId};
use crate::resource::ResourceVector;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

/// A recorded finding. All diagnostics carry the macro tick they refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Flows into a node did not match flows out of it.
    ConservationMismatch {
        node: NodeId,
        inflow: ResourceVector,
        outflow: ResourceVector,
        tick: u64,
    },
    /// What one element sent differs from what its counterparty received.
    ExchangeAsymmetry {
        sender: ElementId,
        receiver: ElementId,
        sent: ResourceVector,
        received: ResourceVector,
        tick: u64,
    },
    /// The optimizer failed; the previous tick's rates were kept.
    OptimizerFallback {
        optimizer: String,
        reason: String,
        tick: u64,
    },
}

/// Discriminant tag for diagnostics, used for suppression and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    ConservationMismatch,
    ExchangeAsymmetry,
    OptimizerFallback,
}

const DIAGNOSTIC_KIND_COUNT: usize = 3;

impl Diagnostic {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Diagnostic::ConservationMismatch { .. } => DiagnosticKind::ConservationMismatch,
            Diagnostic::ExchangeAsymmetry { .. } => DiagnosticKind::ExchangeAsymmetry,
            Diagnostic::OptimizerFallback { .. } => DiagnosticKind::OptimizerFallback,
        }
    }

    pub fn tick(&self) -> u64 {
        match self {
            Diagnostic::ConservationMismatch { tick, .. }
            | Diagnostic::ExchangeAsymmetry { tick, .. }
            | Diagnostic::OptimizerFallback { tick, .. } => *tick,
        }
    }
}

impl DiagnosticKind {
    pub const ALL: [DiagnosticKind; DIAGNOSTIC_KIND_COUNT] = [
        DiagnosticKind::ConservationMismatch,
        DiagnosticKind::ExchangeAsymmetry,
        DiagnosticKind::OptimizerFallback,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// DiagnosticBuffer
// ---------------------------------------------------------------------------

/// The most recent findings of one kind. Once `limit` entries are held,
/// recording another evicts the earliest tick's entry.
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    entries: VecDeque<Diagnostic>,
    limit: usize,
    evicted: u64,
}

impl DiagnosticBuffer {
    /// Holds at least one entry.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            limit,
            evicted: 0,
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(diagnostic);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Findings lost to eviction since the buffer was created.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// In recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A passive listener sees each diagnostic as it is recorded.
pub type DiagnosticListener = Box<dyn FnMut(&Diagnostic) + Send>;

// ---------------------------------------------------------------------------
// DiagnosticLog
// ---------------------------------------------------------------------------

/// Per-kind buffers plus listeners and suppression flags.
pub struct DiagnosticLog {
    buffers: [Option<DiagnosticBuffer>; DIAGNOSTIC_KIND_COUNT],
    suppressed: [bool; DIAGNOSTIC_KIND_COUNT],
    listeners: Vec<(DiagnosticKind, DiagnosticListener)>,
    capacity: usize,
}

impl std::fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticLog")
            .field("buffers", &self.buffers)
            .field("suppressed", &self.suppressed)
            .field("listeners", &self.listeners.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; DIAGNOSTIC_KIND_COUNT],
            listeners: Vec::new(),
            capacity,
        }
    }

    pub fn suppress(&mut self, kind: DiagnosticKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
    }

    pub fn is_suppressed(&self, kind: DiagnosticKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Register a listener for one kind. Listeners run in registration order.
    pub fn on_diagnostic(&mut self, kind: DiagnosticKind, listener: DiagnosticListener) {
        self.listeners.push((kind, listener));
    }

    /// Buffer a diagnostic and notify listeners. No-op for suppressed kinds.
    pub fn record(&mut self, diagnostic: Diagnostic) {
        let kind = diagnostic.kind();
        if self.suppressed[kind.index()] {
            return;
        }
        for (k, listener) in &mut self.listeners {
            if *k == kind {
                listener(&diagnostic);
            }
        }
        let capacity = self.capacity;
        self.buffers[kind.index()]
            .get_or_insert_with(|| DiagnosticBuffer::new(capacity))
            .push(diagnostic);
    }

    /// Diagnostics currently buffered for `kind`.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.buffers[kind.index()].as_ref().map_or(0, DiagnosticBuffer::len)
    }

    pub fn len(&self) -> usize {
        DiagnosticKind::ALL.iter().map(|&k| self.count(k)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.buffers[kind.index()].iter().flat_map(|b| b.iter())
    }

    /// Every buffered diagnostic, ordered by tick then kind.
    pub fn all(&self) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = DiagnosticKind::ALL
            .iter()
            .flat_map(|&k| self.iter(k).cloned())
            .collect();
        out.sort_by_key(|d| d.tick());
        out
    }

    /// Remove and return every buffered diagnostic.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        let out = self.all();
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.clear();
        }
        out
    }

    /// Buffered diagnostics as a JSON array.
    #[cfg(feature = "diagnostics-json")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.all())
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(1024)
    }
}
