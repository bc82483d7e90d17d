//! Dependency-ordered, resumable analysis pipeline.
//!
//! A pipeline is a requested set of step ids over an injected list of
//! available steps. Construction validates the request; ordering resolves
//! the transitive dependency closure and topologically sorts it, so a
//! caller asking for `write` alone still gets the engine work it needs.

pub mod context;
pub mod executor;
pub mod steps;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use context::{
    BlunderTactic, MoveClass, MoveEval, PhaseEntry, ScoredMove, StepContext, StepData,
    StepResult,
};
pub use executor::{PipelineExecutor, PipelineReport};
pub use steps::standard_steps;

/// One unit of pipeline work.
#[async_trait]
pub trait AnalysisStep: Send + Sync {
    /// Stable identifier, used for dependency edges and completion rows.
    fn step_id(&self) -> &'static str;

    /// Steps whose results this one consumes, in preferred visit order.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult>;

    /// Whether this step already ran for the context's game. The default
    /// consults the persisted completion marker.
    async fn is_completed(&self, ctx: &StepContext<'_>) -> Result<bool> {
        ctx.analysis.is_step_completed(&ctx.game_id, self.step_id())
    }
}

/// Canned step selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePreset {
    Full,
    Fast,
    BackfillEco,
    BackfillPhase,
}

impl PipelinePreset {
    pub fn step_ids(self) -> &'static [&'static str] {
        match self {
            PipelinePreset::Full => &["eco", "stockfish", "move_quality", "phase", "write"],
            PipelinePreset::Fast => &["eco", "phase"],
            PipelinePreset::BackfillEco => &["eco"],
            PipelinePreset::BackfillPhase => &["phase"],
        }
    }
}

/// Requested steps plus the force flag.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub steps: Vec<String>,
    pub force_rerun: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_preset(PipelinePreset::Full, false)
    }
}

impl PipelineConfig {
    pub fn new(steps: Vec<String>, force_rerun: bool) -> Self {
        Self { steps, force_rerun }
    }

    pub fn from_preset(preset: PipelinePreset, force_rerun: bool) -> Self {
        Self {
            steps: preset.step_ids().iter().map(|s| s.to_string()).collect(),
            force_rerun,
        }
    }
}

/// A validated pipeline over an explicit step registry.
pub struct AnalysisPipeline {
    config: PipelineConfig,
    steps_by_id: HashMap<&'static str, Arc<dyn AnalysisStep>>,
}

impl AnalysisPipeline {
    /// Build a pipeline, failing fast on unknown step ids.
    pub fn new(
        config: PipelineConfig,
        available_steps: Vec<Arc<dyn AnalysisStep>>,
    ) -> Result<Self> {
        let steps_by_id: HashMap<&'static str, Arc<dyn AnalysisStep>> = available_steps
            .into_iter()
            .map(|step| (step.step_id(), step))
            .collect();

        for step_id in &config.steps {
            if !steps_by_id.contains_key(step_id.as_str()) {
                let mut available: Vec<String> =
                    steps_by_id.keys().map(|id| id.to_string()).collect();
                available.sort();
                return Err(Error::UnknownStep {
                    step: step_id.clone(),
                    available,
                });
            }
        }

        // A step declaring a dependency nothing registered is a wiring
        // mistake, caught here rather than mid-run.
        for step in steps_by_id.values() {
            let missing: Vec<String> = step
                .depends_on()
                .iter()
                .filter(|dep| !steps_by_id.contains_key(*dep))
                .map(|dep| dep.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(Error::MissingDependencies {
                    step: step.step_id().to_string(),
                    missing,
                });
            }
        }

        Ok(Self { config, steps_by_id })
    }

    pub fn from_preset(
        preset: PipelinePreset,
        available_steps: Vec<Arc<dyn AnalysisStep>>,
        force_rerun: bool,
    ) -> Result<Self> {
        Self::new(PipelineConfig::from_preset(preset, force_rerun), available_steps)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Requested steps plus their transitive dependencies, topologically
    /// sorted with dependencies first.
    pub fn ordered_steps(&self) -> Vec<Arc<dyn AnalysisStep>> {
        // Dependency closure, computed to a fixed point. Insertion order
        // is kept so the final sort is deterministic.
        let mut closure: Vec<&'static str> = Vec::new();
        for step_id in &self.config.steps {
            if let Some((&id, _)) = self.steps_by_id.get_key_value(step_id.as_str()) {
                if !closure.contains(&id) {
                    closure.push(id);
                }
            }
        }
        loop {
            let mut added = false;
            for index in 0..closure.len() {
                let step = &self.steps_by_id[closure[index]];
                for &dep in step.depends_on() {
                    if self.steps_by_id.contains_key(dep) && !closure.contains(&dep) {
                        closure.push(dep);
                        added = true;
                    }
                }
            }
            if !added {
                break;
            }
        }

        // Post-order DFS: dependencies come out before their dependents.
        let member: HashSet<&'static str> = closure.iter().copied().collect();
        let mut visited: HashSet<&'static str> = HashSet::new();
        let mut ordered: Vec<Arc<dyn AnalysisStep>> = Vec::new();

        fn visit(
            step_id: &'static str,
            steps_by_id: &HashMap<&'static str, Arc<dyn AnalysisStep>>,
            member: &HashSet<&'static str>,
            visited: &mut HashSet<&'static str>,
            ordered: &mut Vec<Arc<dyn AnalysisStep>>,
        ) {
            if visited.contains(step_id) || !member.contains(step_id) {
                return;
            }
            visited.insert(step_id);
            let step = match steps_by_id.get(step_id) {
                Some(step) => step,
                None => return,
            };
            for &dep in step.depends_on() {
                visit(dep, steps_by_id, member, visited, ordered);
            }
            ordered.push(Arc::clone(step));
        }

        for &step_id in &closure {
            visit(step_id, &self.steps_by_id, &member, &mut visited, &mut ordered);
        }
        ordered
    }
}
