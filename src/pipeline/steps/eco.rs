//! Opening classification step.

use async_trait::async_trait;
use tracing::debug;

use crate::chess::eco::classify_opening;
use crate::error::Result;
use crate::pipeline::context::{StepContext, StepData, StepResult};
use crate::pipeline::AnalysisStep;

/// Matches the game's opening against the ECO table and records the
/// result on the game's analysis record. Unmatched games get nulls.
pub struct EcoStep;

#[async_trait]
impl AnalysisStep for EcoStep {
    fn step_id(&self) -> &'static str {
        "eco"
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let entry = classify_opening(&ctx.game);
        if entry.is_none() {
            debug!("no ECO match for game {}", ctx.game_id);
        }
        let code = entry.as_ref().map(|e| e.code.clone());
        let name = entry.as_ref().map(|e| e.name.clone());

        ctx.analysis
            .update_game_eco(&ctx.game_id, code.as_deref(), name.as_deref())?;

        Ok(StepResult::ok(
            self.step_id(),
            StepData::Eco { code, name },
        ))
    }
}
