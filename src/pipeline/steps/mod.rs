//! The analysis steps.
//!
//! Steps are registered explicitly: the pipeline receives this list at
//! construction rather than consulting any global registry.

pub mod eco;
pub mod move_quality;
pub mod phase;
pub mod stockfish;
pub mod tactics;
pub mod write;

use std::sync::Arc;

use super::AnalysisStep;

pub use eco::EcoStep;
pub use move_quality::{compute_difficulty, MoveQualityStep};
pub use phase::PhaseStep;
pub use stockfish::StockfishStep;
pub use tactics::TacticsStep;
pub use write::WriteStep;

/// All steps shipped with the analyzer, in declaration order.
pub fn standard_steps() -> Vec<Arc<dyn AnalysisStep>> {
    vec![
        Arc::new(EcoStep),
        Arc::new(StockfishStep),
        Arc::new(MoveQualityStep),
        Arc::new(PhaseStep),
        Arc::new(TacticsStep),
        Arc::new(WriteStep),
    ]
}
