//! Run comparison and determinism checking.
//!
//! Used to confirm that two engines (or a federation and a single engine)
//! holding the same scenario agree element by element.

use crate::config::SimConfig;
use crate::engine::{Engine, SimError};
use crate::id::ElementId;
use crate::query::ElementView;
use crate::scenario::Scenario;

// ---------------------------------------------------------------------------
// Diff types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementDiff {
    OnlyInA(ElementId),
    OnlyInB(ElementId),
    /// Present in both with differing committed attributes.
    Mismatch {
        id: ElementId,
        name: String,
        fields: Vec<&'static str>,
    },
}

#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub clock_matches: bool,
    pub element_diffs: Vec<ElementDiff>,
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Field-by-field comparison of two element enumerations, matched by id.
pub fn compare_views(a: &[ElementView], b: &[ElementView]) -> Vec<ElementDiff> {
    let mut diffs = Vec::new();
    for va in a {
        let Some(vb) = b.iter().find(|v| v.id == va.id) else {
            diffs.push(ElementDiff::OnlyInA(va.id));
            continue;
        };
        let mut fields = Vec::new();
        if va.stock != vb.stock {
            fields.push("stock");
        }
        if va.state != vb.state {
            fields.push("state");
        }
        if va.location != vb.location {
            fields.push("location");
        }
        if va.parent != vb.parent {
            fields.push("parent");
        }
        if va.flows != vb.flows {
            fields.push("flows");
        }
        if !fields.is_empty() {
            diffs.push(ElementDiff::Mismatch {
                id: va.id,
                name: va.name.clone(),
                fields,
            });
        }
    }
    for vb in b {
        if !a.iter().any(|v| v.id == vb.id) {
            diffs.push(ElementDiff::OnlyInB(vb.id));
        }
    }
    diffs
}

pub fn diff_engines(a: &Engine, b: &Engine) -> StateDiff {
    let clock_matches = a.sim_state == b.sim_state;
    let element_diffs = compare_views(&a.snapshot_all(), &b.snapshot_all());
    StateDiff {
        is_identical: clock_matches && element_diffs.is_empty() && a.state_hash() == b.state_hash(),
        clock_matches,
        element_diffs,
    }
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

/// Where two replays of one scenario first disagreed.
#[derive(Debug, Clone)]
pub struct Divergence {
    pub tick: u64,
    pub hashes: (u64, u64),
    /// Elements whose committed views differ at that tick.
    pub elements: Vec<ElementDiff>,
}

#[derive(Debug, Clone)]
pub struct DeterminismReport {
    /// Ticks both replays committed before stopping.
    pub ticks: u64,
    pub divergence: Option<Divergence>,
}

impl DeterminismReport {
    pub fn is_deterministic(&self) -> bool {
        self.divergence.is_none()
    }
}

/// Replay `scenario` on two fresh engines in lockstep for `ticks` macro
/// ticks, stopping at the first tick whose fingerprints disagree.
pub fn validate_determinism(
    scenario: &Scenario,
    config: &SimConfig,
    ticks: u64,
) -> Result<DeterminismReport, SimError> {
    let replay = || -> Result<Engine, SimError> {
        let mut engine = Engine::new(scenario.clone(), config.clone())?;
        engine.initialize()?;
        Ok(engine)
    };
    let (mut a, mut b) = (replay()?, replay()?);

    for _ in 0..ticks {
        a.step()?;
        b.step()?;
        if a.state_hash() != b.state_hash() {
            let tick = a.sim_state.tick;
            tracing::warn!(tick, "replays diverged");
            return Ok(DeterminismReport {
                ticks: tick,
                divergence: Some(Divergence {
                    tick,
                    hashes: (a.state_hash(), b.state_hash()),
                    elements: compare_views(&a.snapshot_all(), &b.snapshot_all()),
                }),
            });
        }
    }
    Ok(DeterminismReport {
        ticks: a.sim_state.tick,
        divergence: None,
    })
}
