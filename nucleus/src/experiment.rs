//! Parameter-sweep experiments: dimensions, scenarios, and the worker pool.
//!
//! An experiment takes a base plugin set plus a list of dimensions and runs
//! one independent simulation per point in the cross product of dimension
//! levels. Scenario ids are assigned up front by mixed-radix decomposition
//! (the first dimension varies fastest), so ids are stable regardless of
//! completion order. Scenarios share nothing: each worker rebuilds the plugin
//! set from cloned plugin data builders and owns its simulation exclusively.
//! The only shared structures are the scenario id queue and a single message
//! channel back to the dispatch thread, where all consumers run serialized.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
    },
    thread,
    time::Instant,
};

use tracing::{debug, info, instrument};

use crate::{
    error::{NucleusError, NucleusResult},
    plugin::{Plugin, PluginDataBuilder},
    report::{ExperimentReport, ScenarioMetrics, ScenarioOutcome},
    simulation::{OutputItem, Simulation},
};

/// One axis of an experiment's parameter sweep.
///
/// A dimension enumerates levels; executing a level mutates plugin data
/// builders held in the [`DimensionContext`] and returns human-readable
/// metadata strings labeling that level.
pub trait Dimension: Send + Sync {
    /// Number of levels along this axis.
    fn level_count(&self) -> usize;

    /// Experiment-level metadata contributed by this dimension (column
    /// headers for the per-level metadata strings).
    fn experiment_meta_data(&self) -> Vec<String>;

    /// Applies level `level` to the builders in `ctx`, returning that level's
    /// metadata strings.
    fn execute_level(
        &self,
        ctx: &mut DimensionContext,
        level: usize,
    ) -> NucleusResult<Vec<String>>;
}

type LevelFn = Box<dyn Fn(&mut DimensionContext) -> NucleusResult<Vec<String>> + Send + Sync>;

/// A [`Dimension`] assembled from closures, one per level.
pub struct FunctionalDimension {
    meta: Vec<String>,
    levels: Vec<LevelFn>,
}

impl FunctionalDimension {
    /// Creates a dimension with the given experiment-level metadata and no
    /// levels yet.
    pub fn new<I, S>(meta: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meta: meta.into_iter().map(Into::into).collect(),
            levels: Vec::new(),
        }
    }

    /// Appends a level.
    pub fn with_level(
        mut self,
        level: impl Fn(&mut DimensionContext) -> NucleusResult<Vec<String>> + Send + Sync + 'static,
    ) -> Self {
        self.levels.push(Box::new(level));
        self
    }
}

impl Dimension for FunctionalDimension {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn experiment_meta_data(&self) -> Vec<String> {
        self.meta.clone()
    }

    fn execute_level(
        &self,
        ctx: &mut DimensionContext,
        level: usize,
    ) -> NucleusResult<Vec<String>> {
        match self.levels.get(level) {
            Some(f) => f(ctx),
            None => Err(NucleusError::InvalidState {
                detail: format!(
                    "level {level} out of range for dimension with {} levels",
                    self.levels.len()
                ),
            }),
        }
    }
}

struct BuilderEntry {
    plugin: usize,
    slot: usize,
    builder: Box<dyn PluginDataBuilder>,
}

/// Mutable view of a scenario's plugin data, presented as builders.
///
/// Dimension levels locate a builder by its concrete type and mutate it; the
/// runner freezes every builder back into plugin data before constructing the
/// scenario's simulation. The frozen base data is never touched.
pub struct DimensionContext {
    entries: Vec<BuilderEntry>,
}

impl DimensionContext {
    fn from_plugins(plugins: &[Plugin]) -> Self {
        let mut entries = Vec::new();
        for (plugin, definition) in plugins.iter().enumerate() {
            for (slot, blob) in definition.data().iter().enumerate() {
                entries.push(BuilderEntry {
                    plugin,
                    slot,
                    builder: blob.clone_builder(),
                });
            }
        }
        Self { entries }
    }

    /// Returns the builder of concrete type `T`.
    pub fn builder_mut<T: PluginDataBuilder>(&mut self) -> NucleusResult<&mut T> {
        let index = self
            .entries
            .iter()
            .position(|entry| (&*entry.builder as &dyn Any).is::<T>());
        let error = NucleusError::UnknownDimensionBuilder {
            type_name: std::any::type_name::<T>(),
        };
        match index {
            Some(index) => {
                let any: &mut dyn Any = &mut *self.entries[index].builder;
                any.downcast_mut::<T>().ok_or(error)
            }
            None => Err(error),
        }
    }

    fn apply(self, plugins: &mut [Plugin]) {
        for entry in self.entries {
            plugins[entry.plugin].replace_data(entry.slot, entry.builder.build());
        }
    }
}

/// Batch-level policy when a scenario aborts with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report the failed scenario and keep running the rest of the batch.
    #[default]
    ContinueBatch,
    /// Let in-flight scenarios finish, then skip everything still queued.
    AbortBatch,
}

/// Read-only experiment state visible to consumers during dispatch.
pub struct ExperimentContext {
    experiment_meta: Vec<String>,
    scenario_meta: HashMap<usize, Vec<String>>,
    scenario_count: usize,
}

impl ExperimentContext {
    /// Metadata contributed by every dimension, in dimension order.
    pub fn experiment_meta_data(&self) -> &[String] {
        &self.experiment_meta
    }

    /// A scenario's metadata: the concatenation of its constituent level
    /// metadata, in dimension order. Available once the scenario has opened.
    pub fn scenario_meta_data(&self, scenario_id: usize) -> NucleusResult<&[String]> {
        self.scenario_meta
            .get(&scenario_id)
            .map(Vec::as_slice)
            .ok_or(NucleusError::UnknownScenario { scenario_id })
    }

    /// Total number of scenarios in the experiment.
    pub fn scenario_count(&self) -> usize {
        self.scenario_count
    }
}

type OutputConsumer =
    Box<dyn FnMut(&ExperimentContext, usize, &dyn Any) -> NucleusResult<()>>;
type ExperimentHook = Box<dyn FnMut(&ExperimentContext) -> NucleusResult<()>>;
type SimulationOpenHook = Box<dyn FnMut(&ExperimentContext, usize) -> NucleusResult<()>>;
type SimulationCloseHook =
    Box<dyn FnMut(&ExperimentContext, &ScenarioOutcome) -> NucleusResult<()>>;

#[derive(Default)]
struct ExperimentConsumers {
    output: Vec<OutputConsumer>,
    experiment_open: Vec<ExperimentHook>,
    experiment_close: Vec<ExperimentHook>,
    simulation_open: Vec<SimulationOpenHook>,
    simulation_close: Vec<SimulationCloseHook>,
}

enum ScenarioMessage {
    Open { scenario: usize, meta: Vec<String> },
    Output { scenario: usize, item: OutputItem },
    Close { outcome: ScenarioOutcome },
}

/// A parameter-sweep batch of independent simulations.
///
/// Built via [`Experiment::builder`]; consumed by
/// [`execute`](Self::execute).
pub struct Experiment {
    plugins: Vec<Plugin>,
    dimensions: Vec<Arc<dyn Dimension>>,
    consumers: ExperimentConsumers,
    thread_count: usize,
    base_seed: u64,
    failure_policy: FailurePolicy,
}

impl Experiment {
    /// Starts building an experiment.
    pub fn builder() -> ExperimentBuilder {
        ExperimentBuilder {
            plugins: Vec::new(),
            dimensions: Vec::new(),
            consumers: ExperimentConsumers::default(),
            thread_count: 1,
            base_seed: 0,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Number of scenarios in the cross product of dimension levels.
    ///
    /// An experiment with no dimensions has exactly one scenario (the base
    /// configuration); a dimension with zero levels empties the product.
    pub fn scenario_count(&self) -> usize {
        self.dimensions
            .iter()
            .map(|dimension| dimension.level_count())
            .product()
    }

    /// Runs every scenario and returns the aggregated report.
    ///
    /// Scenario failures are recorded in the report (and end the batch early
    /// under [`FailurePolicy::AbortBatch`]); an error returned by a consumer
    /// aborts the experiment itself.
    #[instrument(skip(self))]
    pub fn execute(mut self) -> NucleusResult<ExperimentReport> {
        let scenario_count = self.scenario_count();
        let workers = self.thread_count.clamp(1, scenario_count.max(1));
        let failure_policy = self.failure_policy;
        let base_seed = self.base_seed;
        info!(scenario_count, workers, "executing experiment");

        let mut context = ExperimentContext {
            experiment_meta: self
                .dimensions
                .iter()
                .flat_map(|dimension| dimension.experiment_meta_data())
                .collect(),
            scenario_meta: HashMap::new(),
            scenario_count,
        };
        let mut consumers = std::mem::take(&mut self.consumers);
        let mut dispatch_error: Option<NucleusError> = None;

        for hook in &mut consumers.experiment_open {
            if let Err(err) = hook(&context) {
                dispatch_error = Some(err);
                break;
            }
        }

        let mut outcomes: Vec<ScenarioOutcome> = Vec::with_capacity(scenario_count);
        if scenario_count > 0 && dispatch_error.is_none() {
            let queue: Mutex<VecDeque<usize>> = Mutex::new((0..scenario_count).collect());
            let abort = AtomicBool::new(false);
            let (sender, receiver) = mpsc::channel::<ScenarioMessage>();
            let plugins = &self.plugins;
            let dimensions = &self.dimensions;

            thread::scope(|scope| {
                for _ in 0..workers {
                    let sender = sender.clone();
                    let queue = &queue;
                    let abort = &abort;
                    scope.spawn(move || {
                        worker_loop(queue, abort, sender, plugins, dimensions, base_seed);
                    });
                }
                drop(sender);

                while let Ok(message) = receiver.recv() {
                    match message {
                        ScenarioMessage::Open { scenario, meta } => {
                            context.scenario_meta.insert(scenario, meta);
                            if dispatch_error.is_none() {
                                for hook in &mut consumers.simulation_open {
                                    if let Err(err) = hook(&context, scenario) {
                                        dispatch_error = Some(err);
                                        abort.store(true, Ordering::SeqCst);
                                        break;
                                    }
                                }
                            }
                        }
                        ScenarioMessage::Output { scenario, item } => {
                            if dispatch_error.is_none() {
                                for consumer in &mut consumers.output {
                                    if let Err(err) =
                                        consumer(&context, scenario, item.as_ref())
                                    {
                                        dispatch_error = Some(err);
                                        abort.store(true, Ordering::SeqCst);
                                        break;
                                    }
                                }
                            }
                        }
                        ScenarioMessage::Close { outcome } => {
                            if dispatch_error.is_none() {
                                for hook in &mut consumers.simulation_close {
                                    if let Err(err) = hook(&context, &outcome) {
                                        dispatch_error = Some(err);
                                        abort.store(true, Ordering::SeqCst);
                                        break;
                                    }
                                }
                            }
                            if outcome.result.is_err()
                                && failure_policy == FailurePolicy::AbortBatch
                            {
                                abort.store(true, Ordering::SeqCst);
                            }
                            outcomes.push(outcome);
                        }
                    }
                }
            });
        }

        if dispatch_error.is_none() {
            for hook in &mut consumers.experiment_close {
                if let Err(err) = hook(&context) {
                    dispatch_error = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = dispatch_error {
            return Err(err);
        }
        let report = ExperimentReport::new(scenario_count, outcomes);
        info!(
            successes = report.successes(),
            failures = report.failures(),
            skipped = report.skipped(),
            "experiment finished"
        );
        Ok(report)
    }
}

/// Builder for [`Experiment`].
pub struct ExperimentBuilder {
    plugins: Vec<Plugin>,
    dimensions: Vec<Arc<dyn Dimension>>,
    consumers: ExperimentConsumers,
    thread_count: usize,
    base_seed: u64,
    failure_policy: FailurePolicy,
}

impl ExperimentBuilder {
    /// Adds a plugin to the base configuration of every scenario.
    pub fn add_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds a sweep dimension.
    pub fn add_dimension(mut self, dimension: impl Dimension + 'static) -> Self {
        self.dimensions.push(Arc::new(dimension));
        self
    }

    /// Sets the worker pool size (default 1: scenarios run sequentially).
    pub fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    /// Sets the base seed from which each scenario's seed is derived
    /// (default 0).
    pub fn base_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    /// Sets the batch-level failure policy (default
    /// [`FailurePolicy::ContinueBatch`]).
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Subscribes `consumer` to every released output item of type `T`,
    /// tagged with the releasing scenario's id. Items of other types are
    /// ignored by this consumer.
    pub fn subscribe_to_output<T: Any>(
        mut self,
        mut consumer: impl FnMut(&ExperimentContext, usize, &T) -> NucleusResult<()> + 'static,
    ) -> Self {
        self.consumers
            .output
            .push(Box::new(move |ctx, scenario, item| {
                match item.downcast_ref::<T>() {
                    Some(item) => consumer(ctx, scenario, item),
                    None => Ok(()),
                }
            }));
        self
    }

    /// Runs `hook` once before any scenario starts.
    pub fn subscribe_to_experiment_open(
        mut self,
        hook: impl FnMut(&ExperimentContext) -> NucleusResult<()> + 'static,
    ) -> Self {
        self.consumers.experiment_open.push(Box::new(hook));
        self
    }

    /// Runs `hook` once after the last scenario finishes.
    pub fn subscribe_to_experiment_close(
        mut self,
        hook: impl FnMut(&ExperimentContext) -> NucleusResult<()> + 'static,
    ) -> Self {
        self.consumers.experiment_close.push(Box::new(hook));
        self
    }

    /// Runs `hook` when a scenario opens, after its metadata is recorded.
    pub fn subscribe_to_simulation_open(
        mut self,
        hook: impl FnMut(&ExperimentContext, usize) -> NucleusResult<()> + 'static,
    ) -> Self {
        self.consumers.simulation_open.push(Box::new(hook));
        self
    }

    /// Runs `hook` when a scenario closes, with its outcome.
    pub fn subscribe_to_simulation_close(
        mut self,
        hook: impl FnMut(&ExperimentContext, &ScenarioOutcome) -> NucleusResult<()> + 'static,
    ) -> Self {
        self.consumers.simulation_close.push(Box::new(hook));
        self
    }

    /// Finalizes and immediately runs the experiment.
    pub fn execute(self) -> NucleusResult<ExperimentReport> {
        self.build().execute()
    }

    /// Finalizes the experiment.
    pub fn build(self) -> Experiment {
        Experiment {
            plugins: self.plugins,
            dimensions: self.dimensions,
            consumers: self.consumers,
            thread_count: self.thread_count,
            base_seed: self.base_seed,
            failure_policy: self.failure_policy,
        }
    }
}

/// Derives a scenario's seed from the experiment's base seed, so each
/// scenario gets an independent but reproducible stream.
fn derive_scenario_seed(base_seed: u64, scenario: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    base_seed.hash(&mut hasher);
    scenario.hash(&mut hasher);
    hasher.finish()
}

fn worker_loop(
    queue: &Mutex<VecDeque<usize>>,
    abort: &AtomicBool,
    sender: Sender<ScenarioMessage>,
    plugins: &[Plugin],
    dimensions: &[Arc<dyn Dimension>],
    base_seed: u64,
) {
    loop {
        if abort.load(Ordering::SeqCst) {
            return;
        }
        let scenario = match queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => return,
        };
        let Some(scenario) = scenario else {
            return;
        };
        run_scenario(scenario, &sender, plugins, dimensions, base_seed);
    }
}

/// Decomposes `scenario` into per-dimension level indices (first dimension
/// varies fastest), applies those levels to cloned plugin data builders, and
/// returns the concatenated level metadata.
fn apply_scenario_levels(
    plugins: &mut [Plugin],
    dimensions: &[Arc<dyn Dimension>],
    scenario: usize,
) -> NucleusResult<Vec<String>> {
    if dimensions.is_empty() {
        return Ok(Vec::new());
    }
    let mut ctx = DimensionContext::from_plugins(plugins);
    let mut meta = Vec::new();
    let mut remainder = scenario;
    for dimension in dimensions {
        let levels = dimension.level_count();
        let level = remainder % levels;
        remainder /= levels;
        meta.extend(dimension.execute_level(&mut ctx, level)?);
    }
    ctx.apply(plugins);
    Ok(meta)
}

fn run_scenario(
    scenario: usize,
    sender: &Sender<ScenarioMessage>,
    plugins: &[Plugin],
    dimensions: &[Arc<dyn Dimension>],
    base_seed: u64,
) {
    let seed = derive_scenario_seed(base_seed, scenario);
    debug!(scenario, seed, "running scenario");

    let mut plugins: Vec<Plugin> = plugins.to_vec();
    let meta = match apply_scenario_levels(&mut plugins, dimensions, scenario) {
        Ok(meta) => meta,
        Err(err) => {
            // Send errors mean the dispatch side is gone; nothing to do.
            let _ = sender.send(ScenarioMessage::Close {
                outcome: ScenarioOutcome {
                    scenario_id: scenario,
                    seed,
                    meta_data: Vec::new(),
                    result: Err(err),
                },
            });
            return;
        }
    };
    let _ = sender.send(ScenarioMessage::Open {
        scenario,
        meta: meta.clone(),
    });

    let output_sender = sender.clone();
    let mut simulation = Simulation::builder()
        .add_plugins(plugins)
        .seed(seed)
        .output_sink(move |item| {
            let _ = output_sender.send(ScenarioMessage::Output { scenario, item });
        })
        .build();

    let start = Instant::now();
    let result = simulation.run().map(|()| ScenarioMetrics {
        wall_time: start.elapsed(),
        final_time: simulation.current_time(),
        plans_executed: simulation.plans_executed(),
        output_items: simulation.output_released(),
    });
    let _ = sender.send(ScenarioMessage::Close {
        outcome: ScenarioOutcome {
            scenario_id: scenario,
            seed,
            meta_data: meta,
            result,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimension_with_levels(levels: usize) -> FunctionalDimension {
        let mut dimension = FunctionalDimension::new(["axis"]);
        for level in 0..levels {
            dimension = dimension.with_level(move |_| Ok(vec![format!("level {level}")]));
        }
        dimension
    }

    #[test]
    fn scenario_count_is_the_cross_product() {
        let experiment = Experiment::builder()
            .add_dimension(dimension_with_levels(2))
            .add_dimension(dimension_with_levels(3))
            .build();
        assert_eq!(experiment.scenario_count(), 6);
    }

    #[test]
    fn no_dimensions_means_one_base_scenario() {
        assert_eq!(Experiment::builder().build().scenario_count(), 1);
    }

    #[test]
    fn zero_level_dimension_empties_the_product() {
        let experiment = Experiment::builder()
            .add_dimension(dimension_with_levels(0))
            .add_dimension(dimension_with_levels(3))
            .build();
        assert_eq!(experiment.scenario_count(), 0);
    }

    #[test]
    fn scenario_seeds_are_deterministic_and_distinct() {
        for scenario in 0..16 {
            assert_eq!(
                derive_scenario_seed(42, scenario),
                derive_scenario_seed(42, scenario)
            );
        }
        let seeds: std::collections::HashSet<u64> =
            (0..16).map(|s| derive_scenario_seed(42, s)).collect();
        assert_eq!(seeds.len(), 16);
        assert_ne!(derive_scenario_seed(1, 0), derive_scenario_seed(2, 0));
    }

    #[test]
    fn first_dimension_varies_fastest() {
        let dimensions: Vec<Arc<dyn Dimension>> = vec![
            Arc::new(
                FunctionalDimension::new(["fast"])
                    .with_level(|_| Ok(vec!["f0".into()]))
                    .with_level(|_| Ok(vec!["f1".into()])),
            ),
            Arc::new(
                FunctionalDimension::new(["slow"])
                    .with_level(|_| Ok(vec!["s0".into()]))
                    .with_level(|_| Ok(vec!["s1".into()])),
            ),
        ];
        let mut all_meta = Vec::new();
        for scenario in 0..4 {
            let mut plugins: Vec<Plugin> = Vec::new();
            all_meta.push(
                apply_scenario_levels(&mut plugins, &dimensions, scenario)
                    .unwrap()
                    .join(","),
            );
        }
        assert_eq!(all_meta, vec!["f0,s0", "f1,s0", "f0,s1", "f1,s1"]);
    }

    #[test]
    fn missing_builder_type_is_reported() {
        struct Unregistered;
        impl PluginDataBuilder for Unregistered {
            fn build(self: Box<Self>) -> Arc<dyn crate::plugin::PluginData> {
                unreachable!("never built in this test")
            }
        }

        let mut ctx = DimensionContext::from_plugins(&[]);
        assert!(matches!(
            ctx.builder_mut::<Unregistered>(),
            Err(NucleusError::UnknownDimensionBuilder { .. })
        ));
    }
}
