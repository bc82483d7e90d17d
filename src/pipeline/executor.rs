//! Pipeline execution for a single game.

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Thresholds;
use crate::db::analysis::AnalysisStore;
use crate::db::games::GameStore;
use crate::engine::EngineProcess;

use super::context::{StepContext, StepData, StepResult};
use super::AnalysisPipeline;

/// What happened during one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub game_id: String,
    pub steps_executed: Vec<String>,
    pub steps_skipped: Vec<String>,
    pub steps_failed: Vec<String>,
    pub started_at: String,
    pub completed_at: String,
    pub success: bool,
    pub error: Option<String>,
}

impl PipelineReport {
    fn new(game_id: &str) -> Self {
        Self {
            game_id: game_id.to_string(),
            steps_executed: Vec::new(),
            steps_skipped: Vec::new(),
            steps_failed: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: String::new(),
            success: true,
            error: None,
        }
    }

    fn finish(mut self) -> Self {
        self.completed_at = Utc::now().to_rfc3339();
        self
    }
}

/// Runs pipelines against one pair of repositories.
#[derive(Clone)]
pub struct PipelineExecutor {
    analysis: AnalysisStore,
    games: GameStore,
    engine_path: String,
}

impl PipelineExecutor {
    pub fn new(analysis: AnalysisStore, games: GameStore, engine_path: String) -> Self {
        Self {
            analysis,
            games,
            engine_path,
        }
    }

    pub fn engine_path(&self) -> &str {
        &self.engine_path
    }

    /// Execute a pipeline for one game.
    ///
    /// Steps run in topological order. Completed steps are skipped (unless
    /// forced) and a successful empty result is synthesized so later steps
    /// can still consult the context. A step only runs once every declared
    /// dependency has a successful result; the completion marker is only
    /// written after the step's own side effects succeeded.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_pipeline(
        &self,
        pipeline: &AnalysisPipeline,
        game_id: &str,
        thresholds: Thresholds,
        depth: Option<u32>,
        time_limit: Option<f64>,
        engine: Option<&mut EngineProcess>,
    ) -> PipelineReport {
        let mut report = PipelineReport::new(game_id);

        let game = match self.games.load_game(game_id) {
            Ok(game) => game,
            Err(e) => {
                report.success = false;
                report.error = Some(format!("Failed to load game: {}", e));
                return report.finish();
            }
        };

        let mut ctx = StepContext::new(
            game_id.to_string(),
            game,
            &self.analysis,
            &self.games,
            self.engine_path.clone(),
            thresholds,
            depth,
            time_limit,
            pipeline.config().force_rerun,
            engine,
        );

        for step in pipeline.ordered_steps() {
            let step_id = step.step_id();

            if !ctx.force_rerun {
                match step.is_completed(&ctx).await {
                    Ok(true) => {
                        debug!("step {} already completed, skipping", step_id);
                        report.steps_skipped.push(step_id.to_string());
                        ctx.add_step_result(StepResult::ok(step_id, StepData::Empty));
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("completion check for step {} failed: {}", step_id, e);
                        report.steps_failed.push(step_id.to_string());
                        report.success = false;
                        report.error = Some(e.to_string());
                        break;
                    }
                }
            }

            let missing: Vec<&str> = step
                .depends_on()
                .iter()
                .copied()
                .filter(|dep| !ctx.has_successful_result(dep))
                .collect();
            if !missing.is_empty() {
                warn!("step {} missing dependencies: {:?}", step_id, missing);
                report.steps_failed.push(step_id.to_string());
                report.success = false;
                report.error = Some(format!(
                    "Step {} missing dependencies: {:?}",
                    step_id, missing
                ));
                break;
            }

            debug!("executing step {}", step_id);
            match step.execute(&mut ctx).await {
                Ok(result) => {
                    let success = result.success;
                    let error = result.error.clone();
                    ctx.add_step_result(result);

                    if success {
                        report.steps_executed.push(step_id.to_string());
                        if let Err(e) = self.analysis.mark_step_completed(game_id, step_id) {
                            warn!("failed to mark step {} completed: {}", step_id, e);
                            report.success = false;
                            report.error = Some(e.to_string());
                            break;
                        }
                    } else {
                        report.steps_failed.push(step_id.to_string());
                        report.success = false;
                        report.error = error;
                        break;
                    }
                }
                Err(e) => {
                    warn!("step {} failed: {}", step_id, e);
                    report.steps_failed.push(step_id.to_string());
                    report.success = false;
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.finish()
    }
}
