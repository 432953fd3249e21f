//! Macro-tick clock and the committed-state fingerprint.

use rust_decimal::Decimal;

use crate::id::StateId;
use crate::location::Location;
use crate::resource::{ResourceVector, Time};

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Macro-tick clock tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Number of committed macro ticks.
    pub tick: u64,

    /// Simulated time at the start of the next macro tick.
    pub time: Time,
}

impl SimState {
    pub fn new(t0: Time) -> Self {
        Self { tick: 0, time: t0 }
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// Fingerprint of a committed macro tick: the clock followed by each
/// element's stock, state, placement and time in state, in table order.
///
/// Federated workers and a single engine holding the same scenario must
/// produce the same fingerprint after every tick. 64-bit FNV-1a over the
/// little-endian encoding of each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(u64);

const FNV_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl StateHash {
    /// Start a fingerprint for the clock at `state`.
    pub fn for_clock(state: &SimState) -> Self {
        let mut hash = Self(FNV_BASIS);
        hash.absorb(&state.tick.to_le_bytes());
        hash.decimal(state.time);
        hash
    }

    /// Fold one element's committed record in.
    pub fn element(
        &mut self,
        stock: &ResourceVector,
        state: StateId,
        location: &Location,
        time_in_state: Time,
    ) {
        for (_, amount) in stock.components() {
            self.decimal(amount);
        }
        self.absorb(&state.0.to_le_bytes());
        self.absorb(&location.origin.0.to_le_bytes());
        self.absorb(&location.destination.0.to_le_bytes());
        self.decimal(time_in_state);
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// `1.0` and `1` must fingerprint alike, so scale is normalized away.
    fn decimal(&mut self, v: Decimal) {
        self.absorb(&v.normalize().serialize());
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.0 = bytes
            .iter()
            .fold(self.0, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME));
    }
}
