//! Orchestration of a full augmentation run.
//!
//! A run is a fixed sequence of fan-out/fan-in stages separated by barriers:
//! optional pre-slicing, preparation, extraction, registration and field
//! application. Every stage collects its results in submission order, so
//! position `i` of a stage's output always belongs to input `i` whatever
//! order the workers finished in. Deformation fields are transient and are
//! removed when the run ends, whether it succeeded, failed or was cancelled.

use crate::apply::{AntsApplyTransforms, AugmentedSample, FieldApplicationService, FieldApplicator};
use crate::config::RunConfig;
use crate::dataset::{DatasetIndex, SampleSet, Sampler, VolumePair};
use crate::enums::{Role, Stage};
use crate::error::AugmentError;
use crate::extractor::{CacheStatus, ExtractedSlice, SliceExtractor};
use crate::preprocess::Preprocessor;
use crate::registration::{
    AntsRegistration, DeformationField, FieldArtifacts, RegistrationEngine, RegistrationService,
};
use crate::slice_cache::SliceCache;
use crate::tools::{CancelToken, ToolRunner};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::any::Any;
use std::collections::HashSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use web_time::Instant;

/// Result of a single task within a stage.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Done(T),
    Failed(AugmentError),
    /// Never dispatched: the run was cancelled or an earlier task failed.
    Skipped,
}

/// Executes the tasks of one stage, serially or on a bounded thread pool.
pub enum WorkerPool {
    Serial,
    Parallel(rayon::ThreadPool),
}

impl WorkerPool {
    /// `workers == 0` runs every task on the calling thread.
    pub fn new(workers: usize) -> Result<Self, AugmentError> {
        if workers == 0 {
            return Ok(WorkerPool::Serial);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("augment-worker-{i}"))
            .build()?;
        Ok(WorkerPool::Parallel(pool))
    }

    pub fn workers(&self) -> usize {
        match self {
            WorkerPool::Serial => 0,
            WorkerPool::Parallel(pool) => pool.current_num_threads(),
        }
    }

    /// Run `task` once per input and wait for all of them.
    ///
    /// Results come back in input order. Once a task fails or `cancel` is
    /// set, tasks not yet started are skipped.
    ///
    /// # Errors
    ///
    /// [`AugmentError::Cancelled`] if the token was set, otherwise
    /// [`AugmentError::Task`] for the lowest-index failed task
    pub fn run_stage<I, T, F>(
        &self,
        stage: Stage,
        inputs: &[I],
        cancel: &CancelToken,
        task: F,
    ) -> Result<Vec<T>, AugmentError>
    where
        I: Sync,
        T: Send,
        F: Fn(usize, &I) -> Result<T, AugmentError> + Sync,
    {
        let started = Instant::now();
        let abort = AtomicBool::new(false);

        let run_one = |(index, input): (usize, &I)| -> TaskOutcome<T> {
            if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                return TaskOutcome::Skipped;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| task(index, input))) {
                Ok(Ok(value)) => TaskOutcome::Done(value),
                Ok(Err(err)) => {
                    abort.store(true, Ordering::SeqCst);
                    TaskOutcome::Failed(err)
                }
                Err(payload) => {
                    abort.store(true, Ordering::SeqCst);
                    TaskOutcome::Failed(AugmentError::Panicked(panic_message(payload.as_ref())))
                }
            }
        };

        let outcomes: Vec<TaskOutcome<T>> = match self {
            WorkerPool::Serial => inputs.iter().enumerate().map(run_one).collect(),
            WorkerPool::Parallel(pool) => {
                pool.install(|| inputs.par_iter().enumerate().map(run_one).collect())
            }
        };

        info!(
            %stage,
            tasks = inputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage finished"
        );
        fold_outcomes(stage, outcomes, cancel)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn fold_outcomes<T>(
    stage: Stage,
    outcomes: Vec<TaskOutcome<T>>,
    cancel: &CancelToken,
) -> Result<Vec<T>, AugmentError> {
    if cancel.is_cancelled() {
        return Err(AugmentError::Cancelled { stage });
    }
    let mut values = Vec::with_capacity(outcomes.len());
    let mut skipped = false;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            TaskOutcome::Done(value) => values.push(value),
            TaskOutcome::Failed(source) => {
                return Err(AugmentError::Task {
                    stage,
                    index,
                    source: Box::new(source),
                });
            }
            TaskOutcome::Skipped => skipped = true,
        }
    }
    if skipped {
        return Err(AugmentError::Cancelled { stage });
    }
    Ok(values)
}

/// Every deformation field a run may create, removed exactly once.
///
/// Artifacts are tracked before registration is dispatched, so fields
/// written by tasks that were later cancelled or failed are removed too.
/// Dropping an unreleased ledger releases it.
#[derive(Debug, Default)]
pub struct FieldLedger {
    pending: Vec<FieldArtifacts>,
}

impl FieldLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, artifacts: FieldArtifacts) {
        self.pending.push(artifacts);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delete all tracked artifacts. Returns how many warp fields existed.
    pub fn release(&mut self) -> usize {
        let removed = self
            .pending
            .drain(..)
            .filter(FieldArtifacts::remove)
            .count();
        debug!(removed, "deformation fields cleaned up");
        removed
    }
}

impl Drop for FieldLedger {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "releasing deformation fields on unwind");
            self.release();
        }
    }
}

/// External collaborators a run delegates to.
#[derive(Clone)]
pub struct Services {
    pub registration: Arc<dyn RegistrationService>,
    pub application: Arc<dyn FieldApplicationService>,
}

impl Services {
    pub fn new(
        registration: Arc<dyn RegistrationService>,
        application: Arc<dyn FieldApplicationService>,
    ) -> Self {
        Self {
            registration,
            application,
        }
    }

    /// The ANTs command-line tools at the given locations.
    pub fn ants(
        registration_bin: impl Into<PathBuf>,
        apply_bin: impl Into<PathBuf>,
        echo_output: bool,
    ) -> Self {
        Self::new(
            Arc::new(AntsRegistration::new(
                ToolRunner::new(registration_bin).echo_output(echo_output),
            )),
            Arc::new(AntsApplyTransforms::new(
                ToolRunner::new(apply_bin).echo_output(echo_output),
            )),
        )
    }
}

/// Summary of a completed run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Output pairs in `wrap * slice_count + slot` order.
    pub samples: Vec<AugmentedSample>,
    pub fields_registered: usize,
    pub fields_removed: usize,
    pub seed: u64,
}

/// Slices extracted for one run, split by role.
struct ExtractedPools {
    sources: Vec<ExtractedSlice>,
    destinations: Vec<ExtractedSlice>,
    targets: Vec<ExtractedSlice>,
}

pub struct Pipeline {
    config: RunConfig,
    services: Services,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: RunConfig, services: Services, cancel: CancelToken) -> Self {
        Self {
            config,
            services,
            cancel,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every stage to completion.
    ///
    /// # Errors
    ///
    /// Validation errors are returned before any work starts. Afterwards the
    /// first failed task or a cancellation aborts the run; transient fields
    /// are removed in every case
    pub fn run(&self) -> Result<RunReport, AugmentError> {
        let started = Instant::now();
        self.config.validate()?;
        self.check_overrides()?;

        let catalog = self.catalog()?;
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!(seed, pairs = catalog.len(), "starting augmentation run");

        let mut sampler = Sampler::new(ChaCha8Rng::seed_from_u64(seed));
        let sources = self.draw(&mut sampler, &catalog, Role::Source, self.config.wrap_count)?;
        let destinations =
            self.draw(&mut sampler, &catalog, Role::Destination, self.config.wrap_count)?;
        let targets =
            self.draw(&mut sampler, &catalog, Role::Target, self.config.target_count())?;

        fs::create_dir_all(&self.config.output_folder)?;
        fs::create_dir_all(&self.config.work_dir)?;

        let pool = WorkerPool::new(self.config.workers)?;
        let preprocessor = Preprocessor::default();
        let extractor = SliceExtractor::new(
            SliceCache::new(&self.config.cache_root),
            self.config.output_size,
            self.config.center_on_segmentation,
        );

        if self.config.pre_slice_all {
            self.pre_slice(&pool, &catalog, &preprocessor, &extractor)?;
        }
        self.prepare(&pool, &preprocessor, [&sources, &destinations, &targets])?;
        let slices = self.extract(&pool, &extractor, seed, [&sources, &destinations, &targets])?;

        let mut ledger = FieldLedger::new();
        let outcome = self.register_and_apply(&pool, &slices, &mut ledger);
        let fields_removed = ledger.release();
        let (fields_registered, samples) = outcome?;

        info!(
            samples = samples.len(),
            fields_removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "augmentation finished"
        );
        Ok(RunReport {
            samples,
            fields_registered,
            fields_removed,
            seed,
        })
    }

    fn check_overrides(&self) -> Result<(), AugmentError> {
        let overrides = &self.config.overrides;
        for pair in [&overrides.source, &overrides.destination, &overrides.target]
            .into_iter()
            .flatten()
        {
            if !pair.image.is_file() {
                return Err(AugmentError::InvalidConfig(format!(
                    "{} does not exist",
                    pair.image.display()
                )));
            }
            if !pair.segmentation.is_file() {
                return Err(AugmentError::MissingSegmentation(pair.image.clone()));
            }
        }
        Ok(())
    }

    fn catalog(&self) -> Result<Vec<VolumePair>, AugmentError> {
        match &self.config.input_folder {
            Some(folder) => DatasetIndex::scan(folder),
            None => Ok(Vec::new()),
        }
    }

    fn draw(
        &self,
        sampler: &mut Sampler<ChaCha8Rng>,
        catalog: &[VolumePair],
        role: Role,
        count: usize,
    ) -> Result<SampleSet, AugmentError> {
        let set = match self.config.overrides.get(role) {
            Some(pair) => SampleSet::repeated(role, pair, count),
            None => sampler.sample(catalog, count, role)?,
        };
        debug!(%role, count = set.len(), "sampled");
        Ok(set)
    }

    fn pre_slice(
        &self,
        pool: &WorkerPool,
        catalog: &[VolumePair],
        preprocessor: &Preprocessor,
        extractor: &SliceExtractor,
    ) -> Result<(), AugmentError> {
        let counts = pool.run_stage(Stage::PreSlice, catalog, &self.cancel, |_, pair| {
            preprocessor.normalize(pair)?;
            Ok(extractor.extract_all(pair)?.len())
        })?;
        info!(
            volumes = catalog.len(),
            slices = counts.iter().sum::<usize>(),
            "pre-sliced catalog"
        );
        Ok(())
    }

    /// Normalise every distinct sampled volume exactly once.
    fn prepare(
        &self,
        pool: &WorkerPool,
        preprocessor: &Preprocessor,
        sets: [&SampleSet; 3],
    ) -> Result<(), AugmentError> {
        let mut seen = HashSet::new();
        let distinct: Vec<&VolumePair> = sets
            .iter()
            .flat_map(|set| set.pairs.iter())
            .filter(|pair| seen.insert(*pair))
            .collect();

        let prepared = pool.run_stage(Stage::Prepare, &distinct, &self.cancel, |_, pair| {
            preprocessor.normalize(pair)
        })?;
        let modified = prepared.iter().filter(|p| p.was_modified()).count();
        info!(volumes = prepared.len(), modified, "prepared sampled volumes");
        Ok(())
    }

    /// One random slice per sampled entry: sources, then destinations, then targets.
    fn extract(
        &self,
        pool: &WorkerPool,
        extractor: &SliceExtractor,
        seed: u64,
        sets: [&SampleSet; 3],
    ) -> Result<ExtractedPools, AugmentError> {
        let entries: Vec<&VolumePair> = sets.iter().flat_map(|set| set.pairs.iter()).collect();

        let mut slices = pool.run_stage(Stage::Extract, &entries, &self.cancel, |index, pair| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1 + index as u64));
            let (slice, status) = extractor.extract_random(pair, &mut rng)?;
            debug!(
                volume = %slice.volume_id,
                index = slice.index,
                cached = status == CacheStatus::Hit,
                "slice ready"
            );
            Ok(slice)
        })?;

        let targets = slices.split_off(sets[0].len() + sets[1].len());
        let destinations = slices.split_off(sets[0].len());
        Ok(ExtractedPools {
            sources: slices,
            destinations,
            targets,
        })
    }

    fn register_and_apply(
        &self,
        pool: &WorkerPool,
        slices: &ExtractedPools,
        ledger: &mut FieldLedger,
    ) -> Result<(usize, Vec<AugmentedSample>), AugmentError> {
        let engine = RegistrationEngine::new(
            self.services.registration.clone(),
            &self.config.work_dir,
        );
        let wraps: Vec<(&ExtractedSlice, &ExtractedSlice)> = slices
            .sources
            .iter()
            .zip(&slices.destinations)
            .collect();
        for pair_index in 0..wraps.len() {
            ledger.track(engine.artifacts(pair_index));
        }

        let fields: Vec<DeformationField> =
            pool.run_stage(Stage::Register, &wraps, &self.cancel, |pair_index, (source, destination)| {
                engine.register(source, destination, pair_index, &self.cancel)
            })?;

        let applicator = FieldApplicator::new(
            self.services.application.clone(),
            &self.config.output_folder,
        )
        .with_previews(self.config.previews);
        let per_field = self.config.slice_count;
        let samples = pool.run_stage(Stage::Apply, &slices.targets, &self.cancel, |k, target| {
            applicator.apply(target, &fields[k / per_field], k % per_field, &self.cancel)
        })?;

        Ok((fields.len(), samples))
    }
}
