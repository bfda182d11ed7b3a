//! Two-qubit (coupling) scheduling.
//!
//! Couplings are staged by box type like single qubits, then packed into
//! rounds of mutually non-conflicting pairs. Two couplings conflict when they
//! share a qubit or a MUX.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CalibError, CalibResult};
use crate::scheduler::wiring::{BoxType, WiringTopology};
use crate::types::Qid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingStage {
    pub box_type: BoxType,
    /// Rounds run in order; couplings inside a round run concurrently.
    pub rounds: Vec<Vec<Qid>>,
}

#[derive(Debug, Clone)]
struct Footprint {
    coupling: Qid,
    qubits: [Qid; 2],
    /// `None` when a qubit has no MUX; such couplings get a round of their own.
    muxes: Option<BTreeSet<u32>>,
}

impl Footprint {
    fn conflicts_with(&self, other: &Footprint) -> bool {
        if self.qubits.iter().any(|q| other.qubits.contains(q)) {
            return true;
        }
        match (&self.muxes, &other.muxes) {
            (Some(a), Some(b)) => !a.is_disjoint(b),
            _ => true,
        }
    }
}

pub struct CouplingScheduler {
    topology: Arc<WiringTopology>,
    max_parallel_ops: Option<usize>,
}

impl CouplingScheduler {
    pub fn new(topology: Arc<WiringTopology>) -> Self {
        Self {
            topology,
            max_parallel_ops: None,
        }
    }

    /// Caps the number of couplings in one round.
    pub fn with_max_parallel_ops(mut self, max_parallel_ops: Option<usize>) -> Self {
        self.max_parallel_ops = max_parallel_ops.filter(|n| *n > 0);
        self
    }

    fn footprint(&self, coupling: &Qid) -> CalibResult<(BoxType, Footprint)> {
        let (a, b) = coupling.coupling_pair().ok_or_else(|| {
            CalibError::scheduling(format!("malformed coupling id `{coupling}` (expected `a-b`)"))
        })?;
        if a == b {
            return Err(CalibError::scheduling(format!(
                "coupling `{coupling}` joins a qubit to itself"
            )));
        }

        let mux_a = self.topology.mux_of(&a);
        let mux_b = self.topology.mux_of(&b);
        let (box_type, muxes) = match (mux_a, mux_b) {
            (Some(ma), Some(mb)) => {
                let ta = self.topology.box_type_of_mux(ma).unwrap_or(BoxType::Mixed);
                let tb = self.topology.box_type_of_mux(mb).unwrap_or(BoxType::Mixed);
                let box_type = if ta == tb { ta } else { BoxType::Mixed };
                (box_type, Some(BTreeSet::from([ma, mb])))
            }
            _ => {
                tracing::warn!(%coupling, "coupling qubit has no MUX in the wiring, scheduling it alone");
                (BoxType::Mixed, None)
            }
        };

        Ok((
            box_type,
            Footprint {
                coupling: coupling.clone(),
                qubits: [a, b],
                muxes,
            },
        ))
    }

    pub fn generate(&self, couplings: &[Qid]) -> CalibResult<Vec<CouplingStage>> {
        if couplings.is_empty() {
            return Err(CalibError::scheduling("no couplings to schedule"));
        }

        let unique: BTreeSet<&Qid> = couplings.iter().collect();
        let mut by_type: BTreeMap<BoxType, Vec<Footprint>> = BTreeMap::new();
        for coupling in unique {
            let (box_type, footprint) = self.footprint(coupling)?;
            by_type.entry(box_type).or_default().push(footprint);
        }

        let mut stages = Vec::new();
        for box_type in BoxType::STAGE_ORDER {
            let Some(mut footprints) = by_type.remove(&box_type) else {
                continue;
            };
            footprints.sort_by_key(|f| {
                let mut idx = [
                    f.qubits[0].qubit_index().unwrap_or(u32::MAX),
                    f.qubits[1].qubit_index().unwrap_or(u32::MAX),
                ];
                idx.sort_unstable();
                (idx, f.coupling.clone())
            });
            stages.push(CouplingStage {
                box_type,
                rounds: self.pack_rounds(footprints),
            });
        }

        tracing::debug!(stages = stages.len(), "generated coupling schedule");
        Ok(stages)
    }

    fn pack_rounds(&self, footprints: Vec<Footprint>) -> Vec<Vec<Qid>> {
        let mut rounds: Vec<Vec<Footprint>> = Vec::new();

        for fp in footprints {
            let cap = self.max_parallel_ops.unwrap_or(usize::MAX);
            let slot = rounds
                .iter()
                .position(|round| round.len() < cap && round.iter().all(|other| !fp.conflicts_with(other)));
            match slot {
                Some(i) => rounds[i].push(fp),
                None => rounds.push(vec![fp]),
            }
        }

        rounds
            .into_iter()
            .map(|round| round.into_iter().map(|fp| fp.coupling).collect())
            .collect()
    }
}
