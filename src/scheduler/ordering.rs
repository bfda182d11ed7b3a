//! Order in which the qubits of one MUX are calibrated.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scheduler::wiring::QUBITS_PER_MUX;
use crate::types::Qid;

/// Strategy for ordering the qubits that share a MUX.
pub trait QubitOrdering: Send + Sync {
    fn name(&self) -> &str;

    /// Sort `qids` (all on the same MUX) into execution order.
    fn order(&self, qids: &mut [Qid]);
}

/// Numeric ascending order; qids that are not numbers sort last, lexically.
#[derive(Debug, Default, Clone, Copy)]
pub struct AscendingOrdering;

fn numeric_cmp(a: &Qid, b: &Qid) -> Ordering {
    match (a.qubit_index(), b.qubit_index()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

impl QubitOrdering for AscendingOrdering {
    fn name(&self) -> &str {
        "ascending"
    }

    fn order(&self, qids: &mut [Qid]) {
        qids.sort_by(numeric_cmp);
    }
}

/// Frequency-isolation order.
///
/// The MUX is a 2×2 plaquette (offsets 0 1 / 2 3); offsets 0 and 3 share a
/// checkerboard colour, as do 1 and 2. Running `[0, 3, 1, 2]` keeps every
/// synchronized step on one colour across all MUXes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckerboardOrdering;

const CHECKERBOARD_RANK: [u32; QUBITS_PER_MUX as usize] = [0, 2, 3, 1];

impl QubitOrdering for CheckerboardOrdering {
    fn name(&self) -> &str {
        "checkerboard"
    }

    fn order(&self, qids: &mut [Qid]) {
        qids.sort_by(|a, b| match (a.qubit_index(), b.qubit_index()) {
            (Some(x), Some(y)) => {
                let rank_x = CHECKERBOARD_RANK[(x % QUBITS_PER_MUX) as usize];
                let rank_y = CHECKERBOARD_RANK[(y % QUBITS_PER_MUX) as usize];
                rank_x.cmp(&rank_y).then(x.cmp(&y))
            }
            _ => numeric_cmp(a, b),
        });
    }
}

/// Named ordering strategy, used by configuration and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingKind {
    #[default]
    Ascending,
    Checkerboard,
}

impl OrderingKind {
    pub fn strategy(self) -> Arc<dyn QubitOrdering> {
        match self {
            Self::Ascending => Arc::new(AscendingOrdering),
            Self::Checkerboard => Arc::new(CheckerboardOrdering),
        }
    }
}

impl FromStr for OrderingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascending" => Ok(Self::Ascending),
            "checkerboard" => Ok(Self::Checkerboard),
            other => Err(format!("unknown ordering strategy `{other}`")),
        }
    }
}
