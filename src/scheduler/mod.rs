// Wiring parsing and conflict-aware scheduling

pub mod box_conflict;
pub mod coupling;
pub mod ordering;
pub mod plan;
pub mod wiring;

pub use box_conflict::{BoxConflictScheduler, Stage, SynchronizedStep};
pub use coupling::{CouplingScheduler, CouplingStage};
pub use ordering::{AscendingOrdering, CheckerboardOrdering, OrderingKind, QubitOrdering};
pub use plan::ScheduleNode;
pub use wiring::{BoxType, WiringTopology, extract_box_type};
