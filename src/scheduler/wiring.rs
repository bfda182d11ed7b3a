//! Box / MUX / qubit mappings derived from a chip's wiring description.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{WiringConfig, WiringEntry};
use crate::error::{CalibError, CalibResult};
use crate::types::{ChipId, Qid};

/// Qubits addressed by one MUX.
pub const QUBITS_PER_MUX: u32 = 4;

/// Controller chassis family. A and B boxes cannot run at the same time;
/// `Mixed` marks a MUX wired to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoxType {
    A,
    B,
    Mixed,
}

impl BoxType {
    /// Stage execution order.
    pub const STAGE_ORDER: [BoxType; 3] = [BoxType::A, BoxType::B, BoxType::Mixed];
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::Mixed => write!(f, "MIXED"),
        }
    }
}

/// Module identifier with any `-<channel>` suffix removed: `"R21B-5"` → `"R21B"`.
pub fn module_base(module_name: &str) -> &str {
    match module_name.rsplit_once('-') {
        Some((base, channel))
            if !base.is_empty() && !channel.is_empty() && channel.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => module_name,
    }
}

/// Box type of a module by the trailing letter of its identifier.
///
/// Returns `None` for names that end in anything other than `A` or `B`.
pub fn extract_box_type(module_name: &str) -> Option<BoxType> {
    match module_base(module_name).chars().last() {
        Some('A') => Some(BoxType::A),
        Some('B') => Some(BoxType::B),
        _ => None,
    }
}

/// Box types seen on each MUX's modules.
pub fn build_mux_box_map(wiring: &[WiringEntry]) -> BTreeMap<u32, BTreeSet<BoxType>> {
    wiring
        .iter()
        .map(|entry| {
            let types: BTreeSet<BoxType> = entry.modules().filter_map(extract_box_type).collect();
            (entry.mux, types)
        })
        .collect()
}

/// `qid = mux * 4 + offset` for every wired MUX.
pub fn build_qubit_to_mux(wiring: &[WiringEntry]) -> BTreeMap<Qid, u32> {
    let mut map = BTreeMap::new();
    for entry in wiring {
        for offset in 0..QUBITS_PER_MUX {
            map.insert(Qid::new((entry.mux * QUBITS_PER_MUX + offset).to_string()), entry.mux);
        }
    }
    map
}

fn resolve_box_type(mux: u32, types: &BTreeSet<BoxType>, strict: bool) -> CalibResult<BoxType> {
    match types.len() {
        0 if strict => Err(CalibError::config(format!(
            "MUX {mux} has no module matching a known box type"
        ))),
        0 => {
            tracing::warn!(mux, "no box type recognized for MUX modules, treating as MIXED");
            Ok(BoxType::Mixed)
        }
        1 => Ok(*types.iter().next().unwrap_or(&BoxType::Mixed)),
        _ => Ok(BoxType::Mixed),
    }
}

/// Parsed wiring: per-MUX box type, qubit ownership and Box-B module usage.
#[derive(Debug, Clone)]
pub struct WiringTopology {
    chip_id: ChipId,
    mux_box_types: BTreeMap<u32, BTreeSet<BoxType>>,
    mux_box: BTreeMap<u32, BoxType>,
    qubit_to_mux: BTreeMap<Qid, u32>,
    /// Box-B module base name → MUXes it drives, ascending.
    box_b_modules: BTreeMap<String, Vec<u32>>,
}

impl WiringTopology {
    /// Parses the wiring; empty box-type sets become MIXED unless `strict`.
    pub fn from_config(config: &WiringConfig, strict: bool) -> CalibResult<Self> {
        if config.wiring.is_empty() {
            return Err(CalibError::config("wiring description has no MUX entries"));
        }

        let mux_box_types = build_mux_box_map(&config.wiring);
        let mut mux_box = BTreeMap::new();
        for (mux, types) in &mux_box_types {
            mux_box.insert(*mux, resolve_box_type(*mux, types, strict)?);
        }

        let mut box_b_modules: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for entry in &config.wiring {
            let modules: BTreeSet<&str> = entry
                .modules()
                .filter(|m| extract_box_type(m) == Some(BoxType::B))
                .map(module_base)
                .collect();
            for module in modules {
                box_b_modules.entry(module.to_string()).or_default().push(entry.mux);
            }
        }
        for muxes in box_b_modules.values_mut() {
            muxes.sort_unstable();
            muxes.dedup();
        }

        tracing::debug!(
            chip_id = %config.chip_id,
            muxes = mux_box.len(),
            box_b_modules = box_b_modules.len(),
            "wiring topology loaded"
        );

        Ok(Self {
            chip_id: config.chip_id.clone(),
            mux_box_types,
            mux_box,
            qubit_to_mux: build_qubit_to_mux(&config.wiring),
            box_b_modules,
        })
    }

    pub fn chip_id(&self) -> &ChipId {
        &self.chip_id
    }

    pub fn mux_of(&self, qid: &Qid) -> Option<u32> {
        self.qubit_to_mux.get(qid).copied()
    }

    pub fn box_type_of_mux(&self, mux: u32) -> Option<BoxType> {
        self.mux_box.get(&mux).copied()
    }

    /// Raw box-type set for a MUX, before collapsing to a single type.
    pub fn mux_box_types(&self, mux: u32) -> Option<&BTreeSet<BoxType>> {
        self.mux_box_types.get(&mux)
    }

    pub fn muxes(&self) -> impl Iterator<Item = u32> + '_ {
        self.mux_box.keys().copied()
    }

    /// The four qids owned by `mux`, in offset order.
    pub fn qids_of_mux(&self, mux: u32) -> Vec<Qid> {
        if !self.mux_box.contains_key(&mux) {
            return Vec::new();
        }
        (0..QUBITS_PER_MUX)
            .map(|offset| Qid::new((mux * QUBITS_PER_MUX + offset).to_string()))
            .collect()
    }

    pub fn box_b_modules(&self) -> &BTreeMap<String, Vec<u32>> {
        &self.box_b_modules
    }
}
