//! Game analysis entry points: single game and pooled bulk runs.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{cpu_count, default_concurrency, Thresholds};
use crate::db::analysis::AnalysisStore;
use crate::db::games::GameStore;
use crate::db::jobs::{JobStatus, JobStore};
use crate::engine::{engine_task, EngineProcess, WorkCoordinator};
use crate::error::{Error, Result};
use crate::events::{AppEvent, EventBus};
use crate::pipeline::{
    standard_steps, AnalysisPipeline, PipelineConfig, PipelineExecutor, PipelinePreset,
    PipelineReport,
};

use super::progress::{CancelCheck, ProgressTracker};

/// Options for a single-game analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub depth: Option<u32>,
    pub time_limit: Option<f64>,
    pub thresholds: Option<Thresholds>,
    /// Explicit step ids; `None` means the full pipeline.
    pub steps: Option<Vec<String>>,
    pub force: bool,
}

/// Options for a bulk run over many games.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub source: Option<String>,
    pub username: Option<String>,
    pub depth: Option<u32>,
    pub time_limit: Option<f64>,
    pub limit: Option<usize>,
    pub force: bool,
    pub steps: Option<Vec<String>>,
    pub concurrency: usize,
    /// Job row to track progress and cancellation against.
    pub job_id: Option<String>,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            source: None,
            username: None,
            depth: None,
            time_limit: None,
            limit: None,
            force: false,
            steps: None,
            concurrency: default_concurrency(),
            job_id: None,
        }
    }
}

/// Aggregate counters of one bulk run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub processed: usize,
    pub analyzed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Front door of the analysis engine: runs pipelines for single games and
/// feeds the engine pool for bulk runs.
pub struct GameAnalyzer {
    analysis: AnalysisStore,
    games: GameStore,
    jobs: JobStore,
    events: EventBus,
    engine_path: String,
    thresholds: Thresholds,
    /// Injected coordinator; when absent, bulk runs own a temporary one.
    coordinator: Option<WorkCoordinator>,
}

impl GameAnalyzer {
    pub fn new(
        analysis: AnalysisStore,
        games: GameStore,
        jobs: JobStore,
        events: EventBus,
        engine_path: String,
    ) -> Self {
        Self {
            analysis,
            games,
            jobs,
            events,
            engine_path,
            thresholds: Thresholds::default(),
            coordinator: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: WorkCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn analysis(&self) -> &AnalysisStore {
        &self.analysis
    }

    pub fn games(&self) -> &GameStore {
        &self.games
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(
            self.analysis.clone(),
            self.games.clone(),
            self.engine_path.clone(),
        )
    }

    fn pipeline_for(&self, opts: &AnalyzeOptions) -> Result<AnalysisPipeline> {
        let config = match &opts.steps {
            Some(steps) => PipelineConfig::new(steps.clone(), opts.force),
            None => PipelineConfig::from_preset(PipelinePreset::Full, opts.force),
        };
        AnalysisPipeline::new(config, standard_steps())
    }

    /// Analyze one game, optionally on a borrowed pool engine.
    ///
    /// Errors if the pipeline reports failure.
    pub async fn analyze_game(
        &self,
        game_id: &str,
        opts: &AnalyzeOptions,
        engine: Option<&mut EngineProcess>,
    ) -> Result<PipelineReport> {
        let thresholds = opts.thresholds.unwrap_or(self.thresholds);
        thresholds.validate()?;
        let pipeline = self.pipeline_for(opts)?;

        let report = self
            .executor()
            .execute_pipeline(
                &pipeline,
                game_id,
                thresholds,
                opts.depth,
                opts.time_limit,
                engine,
            )
            .await;

        if !report.success {
            return Err(Error::PipelineFailed(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown pipeline error".to_string()),
            ));
        }
        Ok(report)
    }

    /// Analyze a filtered set of games with pooled concurrency.
    ///
    /// One closure per game id is submitted to the engine pool; the
    /// per-game `analysis_exists` check is the authoritative skip decision
    /// when `force` is off. A single failed game never aborts the run.
    pub async fn analyze_bulk(&mut self, opts: BulkOptions) -> Result<BulkReport> {
        let source = opts.source.as_deref();
        let username = opts.username.as_deref();
        let mut game_ids = if opts.force {
            self.games.list_game_ids(source, username)?
        } else {
            self.games.list_unanalyzed_game_ids(source, username)?
        };
        if let Some(limit) = opts.limit {
            game_ids.truncate(limit);
        }

        let tracked_job = opts
            .job_id
            .as_ref()
            .map(|id| (self.jobs.clone(), id.clone()));
        let cancel = CancelCheck::new(tracked_job.clone());
        if cancel.is_cancelled() {
            warn!("bulk analysis job already cancelled, nothing to do");
            return Ok(BulkReport::default());
        }

        if game_ids.is_empty() {
            if let Some((jobs, job_id)) = &tracked_job {
                jobs.complete_job(job_id, &json!({"processed": 0, "analyzed": 0, "skipped": 0, "failed": 0}))?;
                self.events
                    .publish(AppEvent::status_changed(job_id, "analyze", "completed", None));
            }
            return Ok(BulkReport::default());
        }

        let concurrency = opts.concurrency.clamp(1, cpu_count().max(1));
        info!(
            "processing {} games with concurrency={}",
            game_ids.len(),
            concurrency
        );

        if let Some((jobs, job_id)) = &tracked_job {
            jobs.update_status(job_id, JobStatus::Running, None)?;
            self.events
                .publish(AppEvent::status_changed(job_id, "analyze", "running", None));
        }

        let mut owned: Option<WorkCoordinator> = None;
        let coordinator: &WorkCoordinator = match self.coordinator.as_ref() {
            Some(coordinator) => coordinator,
            None => {
                let mut fresh = WorkCoordinator::new(&self.engine_path, Some(concurrency));
                fresh.start().await?;
                owned.get_or_insert(fresh)
            }
        };

        let total = game_ids.len();
        let progress = Arc::new(ProgressTracker::new(
            tracked_job.clone(),
            "analyze",
            self.events.clone(),
            total as u32,
        ));
        let counters = Arc::new(Mutex::new(BulkReport::default()));

        for game_id in game_ids {
            if cancel.is_cancelled() {
                warn!("bulk analysis cancelled, stopping submission");
                break;
            }

            let executor = self.executor();
            let analysis = self.analysis.clone();
            let counters = Arc::clone(&counters);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            let thresholds = self.thresholds;
            let depth = opts.depth;
            let time_limit = opts.time_limit;
            let force = opts.force;
            let steps = opts.steps.clone();

            let _handle = coordinator.submit(engine_task(move |engine: &mut EngineProcess| {
                Box::pin(async move {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }

                    // Authoritative skip check, per game, at execution time.
                    let exists = match analysis.analysis_exists(&game_id) {
                        Ok(exists) => exists,
                        Err(e) => {
                            error!("existence check failed for {}: {}", game_id, e);
                            let mut c = lock_counters(&counters);
                            c.failed += 1;
                            c.processed += 1;
                            progress.tick(c.processed as u32);
                            return Ok(());
                        }
                    };
                    if exists && !force {
                        let mut c = lock_counters(&counters);
                        c.skipped += 1;
                        c.processed += 1;
                        progress.tick(c.processed as u32);
                        return Ok(());
                    }

                    let config = match steps {
                        Some(steps) => PipelineConfig::new(steps, force),
                        None => PipelineConfig::from_preset(PipelinePreset::Full, force),
                    };
                    let outcome = match AnalysisPipeline::new(config, standard_steps()) {
                        Ok(pipeline) => {
                            let report = executor
                                .execute_pipeline(
                                    &pipeline,
                                    &game_id,
                                    thresholds,
                                    depth,
                                    time_limit,
                                    Some(engine),
                                )
                                .await;
                            if report.success {
                                Ok(())
                            } else {
                                Err(report
                                    .error
                                    .unwrap_or_else(|| "unknown pipeline error".to_string()))
                            }
                        }
                        Err(e) => Err(e.to_string()),
                    };

                    let mut c = lock_counters(&counters);
                    match outcome {
                        Ok(()) => c.analyzed += 1,
                        Err(e) => {
                            error!("failed to analyze game {}: {}", game_id, e);
                            c.failed += 1;
                        }
                    }
                    c.processed += 1;
                    progress.tick(c.processed as u32);
                    Ok(())
                })
            }));
        }

        coordinator.drain().await;
        if let Some(mut coordinator) = owned {
            coordinator.shutdown().await;
        }

        progress.finish();
        let report = *lock_counters(&counters);

        // A cancelled job keeps its failed status; completing it would
        // overwrite the cancellation.
        if let Some((jobs, job_id)) = tracked_job.as_ref().filter(|_| !cancel.is_cancelled()) {
            jobs.complete_job(
                job_id,
                &json!({
                    "processed": report.processed,
                    "analyzed": report.analyzed,
                    "skipped": report.skipped,
                    "failed": report.failed,
                }),
            )?;
            self.events
                .publish(AppEvent::status_changed(job_id, "analyze", "completed", None));
        }

        Ok(report)
    }
}

fn lock_counters(counters: &Mutex<BulkReport>) -> std::sync::MutexGuard<'_, BulkReport> {
    counters
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}


#[cfg(all(test, unix))]
mod integration_tests {
    use super::*;
    use crate::config::MATE_SCORE;
    use crate::db::analysis::AnalysisRecord;
    use crate::db::games::NewGame;
    use crate::db::Database;
    use crate::pipeline::MoveClass;
    use crate::testing::fake_engine::{fake_engine, RESPONSIVE_GO};

    const SCHOLARS_MATE_PGN: &str =
        "[White \"alice\"]\n[Black \"bob\"]\n[Result \"1-0\"]\n\n1. e4 e5 2. Qh5 Nc6 3. Bc4 Nf6 4. Qxf7# 1-0\n";
    const SICILIAN_PGN: &str = "1. e4 c5 2. Nf3 d6 3. d4 cxd4 *\n";

    fn analyzer_with_engine(engine_path: &std::path::Path) -> GameAnalyzer {
        let db = Database::open_in_memory().unwrap();
        GameAnalyzer::new(
            AnalysisStore::new(db.clone()),
            GameStore::new(db.clone()),
            JobStore::new(db.clone()),
            EventBus::new(),
            engine_path.to_string_lossy().into_owned(),
        )
    }

    fn insert_game(analyzer: &GameAnalyzer, pgn: &str) -> String {
        let game = NewGame::from_pgn(pgn, "lichess", "alice").unwrap();
        let id = game.game_id.clone();
        analyzer.games().insert_games(&[game]).unwrap();
        id
    }

    fn record_fields(record: &AnalysisRecord) -> (String, Option<u32>, Option<f64>, Thresholds, Option<String>, Option<String>) {
        (
            record.engine_path.clone(),
            record.depth,
            record.time_limit,
            record.thresholds,
            record.eco_code.clone(),
            record.eco_name.clone(),
        )
    }

    #[tokio::test]
    async fn full_pipeline_on_scholars_mate() {
        let (_dir, engine_path) = fake_engine(RESPONSIVE_GO);
        let analyzer = analyzer_with_engine(&engine_path);
        let game_id = insert_game(&analyzer, SCHOLARS_MATE_PGN);

        let opts = AnalyzeOptions {
            depth: Some(10),
            ..Default::default()
        };
        let report = analyzer.analyze_game(&game_id, &opts, None).await.unwrap();
        assert_eq!(
            report.steps_executed,
            vec!["eco", "stockfish", "move_quality", "phase", "write"]
        );

        let record = analyzer.analysis().get_analysis(&game_id).unwrap().unwrap();
        assert!(record.eco_code.is_some());
        assert_eq!(record.depth, Some(10));

        let moves = analyzer.analysis().fetch_moves(&game_id).unwrap();
        assert_eq!(moves.len(), 7);
        for row in &moves {
            assert!(row.cp_loss >= 0);
            assert!(row.classification.as_i64() <= 3);
            assert_eq!(
                row.game_phase,
                Some(crate::chess::phase::GamePhase::Opening)
            );
        }
        // The mating move carries the sentinel and is never a blunder.
        let last = moves.last().unwrap();
        assert_eq!(last.eval_after, MATE_SCORE);
        assert_eq!(last.classification, MoveClass::Good);
        assert_eq!(last.san.as_deref(), Some("Qxf7#"));

        assert!(analyzer.games().get_game(&game_id).unwrap().unwrap().analyzed);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let (_dir, engine_path) = fake_engine(RESPONSIVE_GO);
        let analyzer = analyzer_with_engine(&engine_path);
        let game_id = insert_game(&analyzer, SCHOLARS_MATE_PGN);
        let opts = AnalyzeOptions {
            depth: Some(10),
            ..Default::default()
        };

        analyzer.analyze_game(&game_id, &opts, None).await.unwrap();
        let first = analyzer.analysis().get_analysis(&game_id).unwrap().unwrap();

        let rerun = analyzer.analyze_game(&game_id, &opts, None).await.unwrap();
        assert!(rerun.steps_executed.is_empty());
        assert_eq!(rerun.steps_skipped.len(), 5);

        let second = analyzer.analysis().get_analysis(&game_id).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(analyzer.analysis().count_moves(&game_id).unwrap(), 7);
    }

    #[tokio::test]
    async fn resumption_reruns_only_the_truncated_step() {
        let (_dir, engine_path) = fake_engine(RESPONSIVE_GO);
        let analyzer = analyzer_with_engine(&engine_path);
        let game_id = insert_game(&analyzer, SCHOLARS_MATE_PGN);
        let opts = AnalyzeOptions {
            depth: Some(10),
            ..Default::default()
        };

        analyzer.analyze_game(&game_id, &opts, None).await.unwrap();
        let baseline = analyzer.analysis().get_analysis(&game_id).unwrap().unwrap();

        // Crash-simulate: the write completed but its marker was lost.
        analyzer.analysis().clear_step(&game_id, "write").unwrap();

        let report = analyzer.analyze_game(&game_id, &opts, None).await.unwrap();
        assert_eq!(report.steps_executed, vec!["write"]);
        assert!(report.steps_skipped.contains(&"stockfish".to_string()));

        let resumed = analyzer.analysis().get_analysis(&game_id).unwrap().unwrap();
        assert_eq!(record_fields(&baseline), record_fields(&resumed));
        assert_eq!(analyzer.analysis().count_moves(&game_id).unwrap(), 7);
    }

    #[tokio::test]
    async fn bulk_analyzes_skips_and_survives_failures() {
        let (_dir, engine_path) = fake_engine(RESPONSIVE_GO);
        let mut analyzer = analyzer_with_engine(&engine_path);
        insert_game(&analyzer, SCHOLARS_MATE_PGN);
        insert_game(&analyzer, SICILIAN_PGN);

        let report = analyzer
            .analyze_bulk(BulkOptions {
                depth: Some(8),
                concurrency: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 0);

        // A game whose analysis already exists is skipped, per-game.
        let extra = insert_game(&analyzer, "1. d4 d5 2. c4 e6 *\n");
        analyzer
            .analysis()
            .write_analysis(
                &AnalysisRecord {
                    game_id: extra.clone(),
                    pgn_path: String::new(),
                    analyzed_at: "2024-01-01T00:00:00+00:00".to_string(),
                    engine_path: "stockfish".to_string(),
                    depth: Some(14),
                    time_limit: None,
                    thresholds: Thresholds::default(),
                    eco_code: None,
                    eco_name: None,
                },
                &[],
            )
            .unwrap();

        let report = analyzer
            .analyze_bulk(BulkOptions {
                depth: Some(8),
                concurrency: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.analyzed, 0);
    }

    #[tokio::test]
    async fn cancelled_job_stops_before_submitting() {
        let (_dir, engine_path) = fake_engine(RESPONSIVE_GO);
        let mut analyzer = analyzer_with_engine(&engine_path);
        insert_game(&analyzer, SCHOLARS_MATE_PGN);

        let job_id = analyzer
            .jobs()
            .create_job("analyze", None, None, None)
            .unwrap();
        analyzer
            .jobs()
            .update_status(&job_id, JobStatus::Failed, Some("cancelled by user"))
            .unwrap();

        let report = analyzer
            .analyze_bulk(BulkOptions {
                depth: Some(8),
                concurrency: 1,
                job_id: Some(job_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report, BulkReport::default());

        // The cancellation is preserved, not overwritten with "completed".
        let job = analyzer.jobs().get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
