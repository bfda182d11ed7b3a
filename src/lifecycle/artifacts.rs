// Artifact naming for figures and raw data

use serde::{Deserialize, Serialize};

use crate::types::Qid;

/// A figure produced by `postprocess`, stored twice: the rendered image and
/// the serialized plot definition it was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub rendered: Vec<u8>,
    pub definition: serde_json::Value,
}

impl Figure {
    pub fn new(rendered: Vec<u8>, definition: serde_json::Value) -> Self {
        Self { rendered, definition }
    }
}

/// `{qid}_{task}_{index}`, or `{task}_{index}` for global and system tasks.
pub fn artifact_base_name(qid: &Qid, task: &str, index: usize) -> String {
    if qid.is_global() {
        format!("{task}_{index}")
    } else {
        format!("{qid}_{task}_{index}")
    }
}

/// `base` if free, else `base_1`, `base_2`, ... until `taken` says no.
pub fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{base}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
