//! Box-conflict scheduling for single-qubit calibration.
//!
//! Qubits are staged by the box type of their MUX (A, then B, then MIXED).
//! Inside a stage, MUXes run in parallel and qubits sharing a MUX run in
//! sequence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CalibError, CalibResult};
use crate::scheduler::ordering::{AscendingOrdering, QubitOrdering};
use crate::scheduler::wiring::{BoxType, WiringTopology};
use crate::types::Qid;

/// One scheduling phase: every qubit of one box type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub box_type: BoxType,
    pub qids: Vec<Qid>,
    /// One group per MUX, ascending by MUX id; groups run concurrently.
    pub parallel_groups: Vec<Vec<Qid>>,
}

/// One globally barriered slice: at most one qubit per active MUX.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedStep {
    pub index: usize,
    pub box_type: BoxType,
    pub parallel_qids: Vec<Qid>,
}

#[derive(Debug, Default)]
struct Classified {
    by_type: BTreeMap<BoxType, BTreeMap<u32, Vec<Qid>>>,
    unresolved: Vec<Qid>,
}

pub struct BoxConflictScheduler {
    topology: Arc<WiringTopology>,
    ordering: Arc<dyn QubitOrdering>,
}

impl BoxConflictScheduler {
    pub fn new(topology: Arc<WiringTopology>) -> Self {
        Self {
            topology,
            ordering: Arc::new(AscendingOrdering),
        }
    }

    pub fn with_ordering(mut self, ordering: Arc<dyn QubitOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn topology(&self) -> &WiringTopology {
        &self.topology
    }

    fn classify(&self, qids: &[Qid]) -> CalibResult<Classified> {
        if qids.is_empty() {
            return Err(CalibError::scheduling("no qids to schedule"));
        }

        let unique: BTreeSet<&Qid> = qids.iter().collect();
        let mut classified = Classified::default();

        for qid in unique {
            let resolved = self
                .topology
                .mux_of(qid)
                .and_then(|mux| self.topology.box_type_of_mux(mux).map(|bt| (mux, bt)));

            match resolved {
                Some((mux, box_type)) => classified
                    .by_type
                    .entry(box_type)
                    .or_default()
                    .entry(mux)
                    .or_default()
                    .push(qid.clone()),
                None => {
                    tracing::warn!(%qid, "qid has no MUX in the wiring, scheduling it as MIXED");
                    classified.unresolved.push(qid.clone());
                }
            }
        }

        for muxes in classified.by_type.values_mut() {
            for group in muxes.values_mut() {
                self.ordering.order(group);
            }
        }
        AscendingOrdering.order(&mut classified.unresolved);

        Ok(classified)
    }

    /// Stages in A, B, MIXED order; empty stages are omitted.
    ///
    /// Every group holds exactly the qids of one MUX, with one exception:
    /// qids without a MUX land in the MIXED stage as one trailing sequential
    /// group. Nothing proves two of them sit on different MUXes, so they are
    /// never run side by side.
    pub fn generate(&self, qids: &[Qid]) -> CalibResult<Vec<Stage>> {
        let mut classified = self.classify(qids)?;
        let mut stages = Vec::new();

        for box_type in BoxType::STAGE_ORDER {
            let mut parallel_groups: Vec<Vec<Qid>> = classified
                .by_type
                .remove(&box_type)
                .map(|muxes| muxes.into_values().collect())
                .unwrap_or_default();

            if box_type == BoxType::Mixed && !classified.unresolved.is_empty() {
                parallel_groups.push(std::mem::take(&mut classified.unresolved));
            }

            if parallel_groups.is_empty() {
                continue;
            }

            let qids = parallel_groups.iter().flatten().cloned().collect();
            stages.push(Stage {
                box_type,
                qids,
                parallel_groups,
            });
        }

        tracing::debug!(stages = stages.len(), "generated box-conflict schedule");
        Ok(stages)
    }

    /// Step-indexed schedule with a global barrier between steps.
    ///
    /// Step N of a stage runs the N-th qubit of every active MUX. MIXED MUXes
    /// that share a Box-B module are split into subgroups that run one after
    /// the other, each with its own steps.
    pub fn generate_synchronized(&self, qids: &[Qid]) -> CalibResult<Vec<SynchronizedStep>> {
        let mut classified = self.classify(qids)?;
        let mut steps = Vec::new();

        for box_type in BoxType::STAGE_ORDER {
            let Some(muxes) = classified.by_type.remove(&box_type) else {
                continue;
            };

            let subgroups = if box_type == BoxType::Mixed {
                self.split_shared_box_b(muxes)
            } else {
                vec![muxes]
            };

            for subgroup in subgroups {
                let depth = subgroup.values().map(Vec::len).max().unwrap_or(0);
                for n in 0..depth {
                    let parallel_qids: Vec<Qid> =
                        subgroup.values().filter_map(|group| group.get(n).cloned()).collect();
                    steps.push(SynchronizedStep {
                        index: steps.len(),
                        box_type,
                        parallel_qids,
                    });
                }
            }
        }

        for qid in std::mem::take(&mut classified.unresolved) {
            steps.push(SynchronizedStep {
                index: steps.len(),
                box_type: BoxType::Mixed,
                parallel_qids: vec![qid],
            });
        }

        tracing::debug!(steps = steps.len(), "generated synchronized schedule");
        Ok(steps)
    }

    /// Splits MIXED MUXes so no two in a subgroup share a Box-B module.
    ///
    /// A MUX's preferred subgroup is its position in its module's MUX list;
    /// it moves to the next free index if a MUX sharing one of its modules
    /// already took that one.
    fn split_shared_box_b(
        &self,
        muxes: BTreeMap<u32, Vec<Qid>>,
    ) -> Vec<BTreeMap<u32, Vec<Qid>>> {
        let modules = self.topology.box_b_modules();
        let mut assigned: BTreeMap<u32, usize> = BTreeMap::new();

        for &mux in muxes.keys() {
            let sharing: Vec<&Vec<u32>> = modules.values().filter(|list| list.contains(&mux)).collect();
            let preferred = sharing
                .iter()
                .filter_map(|list| list.iter().position(|m| *m == mux))
                .max()
                .unwrap_or(0);

            let taken: BTreeSet<usize> = sharing
                .iter()
                .flat_map(|list| list.iter())
                .filter(|other| **other != mux)
                .filter_map(|other| assigned.get(other).copied())
                .collect();

            let mut index = preferred;
            while taken.contains(&index) {
                index += 1;
            }
            assigned.insert(mux, index);
        }

        let mut subgroups: BTreeMap<usize, BTreeMap<u32, Vec<Qid>>> = BTreeMap::new();
        for (mux, qids) in muxes {
            let index = assigned.get(&mux).copied().unwrap_or(0);
            subgroups.entry(index).or_default().insert(mux, qids);
        }
        subgroups.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WiringEntry;
    use crate::scheduler::ordering::CheckerboardOrdering;
    use crate::scheduler::wiring::tests::{config, entry};

    fn qids(ids: &[&str]) -> Vec<Qid> {
        ids.iter().map(|s| Qid::new(*s)).collect()
    }

    fn mixed(mux: u32, box_b: &str) -> WiringEntry {
        let mut e = entry(mux, "Q73A");
        e.read_out = format!("{box_b}-5");
        e
    }

    fn scheduler(entries: Vec<WiringEntry>) -> BoxConflictScheduler {
        let topo = WiringTopology::from_config(&config(entries), false).unwrap();
        BoxConflictScheduler::new(Arc::new(topo))
    }

    #[test]
    fn end_to_end_single_a_stage() {
        let s = scheduler(vec![entry(0, "Q73A"), entry(1, "Q73A")]);
        let stages = s.generate(&qids(&["0", "1", "4", "5"])).unwrap();

        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].box_type, BoxType::A);
        assert_eq!(stages[0].parallel_groups, vec![qids(&["0", "1"]), qids(&["4", "5"])]);
        assert_eq!(stages[0].qids, qids(&["0", "1", "4", "5"]));
    }

    #[test]
    fn empty_input_is_scheduling_error() {
        let s = scheduler(vec![entry(0, "Q73A")]);
        assert!(matches!(s.generate(&[]), Err(CalibError::Scheduling { .. })));
        assert!(matches!(s.generate_synchronized(&[]), Err(CalibError::Scheduling { .. })));
    }

    #[test]
    fn stages_follow_a_b_mixed_order_and_partition_input() {
        let s = scheduler(vec![
            mixed(0, "R21B"),
            entry(1, "R30B"),
            entry(2, "Q73A"),
        ]);
        let input = qids(&["1", "5", "8", "9", "0", "9", "4"]);
        let stages = s.generate(&input).unwrap();

        let order: Vec<BoxType> = stages.iter().map(|st| st.box_type).collect();
        assert_eq!(order, vec![BoxType::A, BoxType::B, BoxType::Mixed]);

        let mut seen = BTreeSet::new();
        for stage in &stages {
            let grouped: Vec<Qid> = stage.parallel_groups.iter().flatten().cloned().collect();
            assert_eq!(grouped, stage.qids);
            for qid in &stage.qids {
                assert!(seen.insert(qid.clone()), "duplicate qid {qid}");
            }
        }
        let expected: BTreeSet<Qid> = input.into_iter().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn groups_match_shared_mux_exactly() {
        let s = scheduler(vec![entry(0, "Q73A"), entry(1, "Q73A"), entry(2, "Q73A")]);
        let stages = s.generate(&qids(&["11", "0", "3", "4", "8", "2"])).unwrap();
        let topo = s.topology();

        for stage in &stages {
            for (i, g1) in stage.parallel_groups.iter().enumerate() {
                for (j, g2) in stage.parallel_groups.iter().enumerate() {
                    for a in g1 {
                        for b in g2 {
                            let same_mux = topo.mux_of(a) == topo.mux_of(b);
                            assert_eq!(i == j, same_mux, "{a} vs {b}");
                        }
                    }
                }
            }
        }
        assert_eq!(stages[0].parallel_groups[0], qids(&["0", "2", "3"]));
    }

    #[test]
    fn unresolved_qids_go_to_mixed_sequential_group() {
        let s = scheduler(vec![entry(0, "Q73A")]);
        let stages = s.generate(&qids(&["0", "40", "41"])).unwrap();

        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].box_type, BoxType::Mixed);
        assert_eq!(stages[1].parallel_groups, vec![qids(&["40", "41"])]);
    }

    #[test]
    fn custom_ordering_is_applied_within_mux() {
        let s = scheduler(vec![entry(0, "Q73A")]).with_ordering(Arc::new(CheckerboardOrdering));
        let stages = s.generate(&qids(&["0", "1", "2", "3"])).unwrap();
        assert_eq!(stages[0].parallel_groups[0], qids(&["0", "3", "1", "2"]));
    }

    #[test]
    fn synchronized_steps_take_one_qubit_per_mux() {
        let s = scheduler(vec![entry(0, "Q73A"), entry(1, "Q73A")]);
        let steps = s.generate_synchronized(&qids(&["0", "1", "2", "4", "5"])).unwrap();

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].parallel_qids, qids(&["0", "4"]));
        assert_eq!(steps[1].parallel_qids, qids(&["1", "5"]));
        assert_eq!(steps[2].parallel_qids, qids(&["2"]));
        assert!(steps.iter().enumerate().all(|(i, st)| st.index == i));

        for pair in steps.windows(2) {
            for qid in &pair[1].parallel_qids {
                assert!(!pair[0].parallel_qids.contains(qid));
            }
        }
    }

    #[test]
    fn synchronized_stages_do_not_share_steps() {
        let s = scheduler(vec![entry(0, "Q73A"), entry(1, "R21B")]);
        let steps = s.generate_synchronized(&qids(&["0", "4"])).unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].box_type, BoxType::A);
        assert_eq!(steps[0].parallel_qids, qids(&["0"]));
        assert_eq!(steps[1].box_type, BoxType::B);
    }

    #[test]
    fn mixed_muxes_sharing_box_b_module_never_share_steps() {
        // MUX 0 and 1 share R21B; MUX 2 and 3 share R30B.
        let s = scheduler(vec![
            mixed(0, "R21B"),
            mixed(1, "R21B"),
            mixed(2, "R30B"),
            mixed(3, "R30B"),
        ]);
        let input = qids(&["0", "1", "4", "5", "8", "12"]);
        let steps = s.generate_synchronized(&input).unwrap();
        let topo = s.topology();

        for step in &steps {
            let muxes: Vec<u32> = step.parallel_qids.iter().filter_map(|q| topo.mux_of(q)).collect();
            for muxes_of_module in topo.box_b_modules().values() {
                let shared = muxes.iter().filter(|m| muxes_of_module.contains(m)).count();
                assert!(shared <= 1, "step {} mixes MUXes {:?}", step.index, muxes);
            }
        }

        // Subgroup 0 = MUX 0 and 2, subgroup 1 = MUX 1 and 3.
        assert_eq!(steps[0].parallel_qids, qids(&["0", "8"]));
        assert_eq!(steps[1].parallel_qids, qids(&["1"]));
        assert_eq!(steps[2].parallel_qids, qids(&["4", "12"]));
        assert_eq!(steps[3].parallel_qids, qids(&["5"]));

        let all: BTreeSet<Qid> = steps.iter().flat_map(|st| st.parallel_qids.clone()).collect();
        assert_eq!(all, input.into_iter().collect());
    }

    #[test]
    fn mux_on_two_shared_modules_gets_a_free_subgroup() {
        let mut bridge = mixed(1, "R21B");
        bridge.pump = Some("R30B-3".into());
        let s = scheduler(vec![mixed(0, "R21B"), bridge, mixed(2, "R30B")]);
        let steps = s.generate_synchronized(&qids(&["0", "4", "8"])).unwrap();

        // MUX 1 shares R21B with MUX 0 and R30B with MUX 2.
        for step in &steps {
            assert!(!(step.parallel_qids.contains(&Qid::new("4")) && step.parallel_qids.len() > 1));
        }
        // MUX 2 prefers subgroup 1 (its position under R30B), which MUX 1 holds.
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2].parallel_qids, qids(&["8"]));
    }
}
