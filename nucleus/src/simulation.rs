//! The simulation: plugin initialization and the discrete-event main loop.
//!
//! A `Simulation` owns the plan queue, the event subscriber table, the data
//! manager registry, and the output sink behind a single `Rc<RefCell<_>>`.
//! Contexts hold weak handles into that state, which keeps the whole run
//! single-threaded and lock-free: one logical thread of control, run-to-
//! completion callbacks, no preemption. The type is intentionally not `Send`.

use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::Rc,
};

use tracing::{debug, instrument, trace};

use crate::{
    context::{ActorContext, KernelHandle, PluginContext, ReportContext},
    error::{NucleusError, NucleusResult},
    events::{ErasedEventHandler, EventSubscriptions, SubscriptionId},
    managers::{DataManager, DataManagerRegistry},
    plans::PlanQueue,
    plugin::{Plugin, dependency_order},
    rng::{reset_sim_rng, set_sim_seed},
};

/// A deferred unit of work bound to a future simulation time.
pub(crate) type PlanCallback = Box<dyn FnOnce(&ActorContext) -> NucleusResult<()>>;

pub(crate) type ActorInit = Box<dyn FnOnce(&ActorContext) -> NucleusResult<()>>;
pub(crate) type ReportInit = Box<dyn FnOnce(&ReportContext) -> NucleusResult<()>>;

/// An item released through `release_output`: typed, arbitrary, and owned.
///
/// Consumers downcast to the concrete types they understand.
pub type OutputItem = Box<dyn Any + Send>;

pub(crate) type OutputSink = Box<dyn FnMut(OutputItem)>;

/// Lifecycle of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    /// Built but not yet run.
    Constructing,
    /// Plugin initializers (and queued actors/reports) are running.
    Initializing,
    /// The main loop is draining the plan queue.
    Running,
    /// The run ended: queue drained, halted, or aborted on error.
    Finished,
}

pub(crate) struct SimInner {
    state: SimulationState,
    current_time: f64,
    plans: PlanQueue<PlanCallback>,
    subscriptions: EventSubscriptions,
    managers: DataManagerRegistry,
    pending_actors: VecDeque<ActorInit>,
    pending_reports: VecDeque<ReportInit>,
    output: Vec<OutputItem>,
    output_sink: Option<OutputSink>,
    output_released: u64,
    plans_executed: u64,
    halted: bool,
}

impl SimInner {
    fn new(output_sink: Option<OutputSink>) -> Self {
        Self {
            state: SimulationState::Constructing,
            current_time: 0.0,
            plans: PlanQueue::new(),
            subscriptions: EventSubscriptions::new(),
            managers: DataManagerRegistry::new(),
            pending_actors: VecDeque::new(),
            pending_reports: VecDeque::new(),
            output: Vec::new(),
            output_sink,
            output_released: 0,
            plans_executed: 0,
            halted: false,
        }
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.current_time
    }

    pub(crate) fn schedule_plan(
        &mut self,
        time: f64,
        key: Option<String>,
        callback: PlanCallback,
    ) -> NucleusResult<u64> {
        self.plans.schedule(time, self.current_time, key, callback)
    }

    pub(crate) fn cancel_plan(&mut self, key: &str) -> bool {
        self.plans.cancel(key)
    }

    pub(crate) fn subscribe_erased(
        &mut self,
        event_type: std::any::TypeId,
        handler: ErasedEventHandler,
    ) -> SubscriptionId {
        self.subscriptions.subscribe_erased(event_type, handler)
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    pub(crate) fn event_handlers(
        &self,
        event_type: std::any::TypeId,
    ) -> Vec<ErasedEventHandler> {
        self.subscriptions.handlers_for(event_type)
    }

    pub(crate) fn insert_data_manager<T: DataManager>(
        &mut self,
        manager: T,
    ) -> NucleusResult<Rc<RefCell<T>>> {
        self.managers.insert(manager)
    }

    pub(crate) fn data_manager<T: DataManager>(&self) -> NucleusResult<Rc<RefCell<T>>> {
        self.managers.get::<T>()
    }

    pub(crate) fn queue_actor(&mut self, actor: ActorInit) {
        self.pending_actors.push_back(actor);
    }

    pub(crate) fn queue_report(&mut self, report: ReportInit) {
        self.pending_reports.push_back(report);
    }

    pub(crate) fn push_output(&mut self, item: OutputItem) {
        self.output_released += 1;
        match &mut self.output_sink {
            Some(sink) => sink(item),
            None => self.output.push(item),
        }
    }

    pub(crate) fn request_halt(&mut self) {
        self.halted = true;
    }
}

/// A single discrete-event simulation run over a set of plugins.
///
/// Built via [`Simulation::builder`], run once with [`run`](Self::run).
/// After the run, collected output and metrics remain queryable.
pub struct Simulation {
    inner: Rc<RefCell<SimInner>>,
    plugins: Vec<Plugin>,
    seed: Option<u64>,
}

impl Simulation {
    /// Starts building a simulation.
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder {
            plugins: Vec::new(),
            seed: None,
            output_sink: None,
        }
    }

    /// Runs the simulation to completion.
    ///
    /// Initializes plugins in dependency order, runs queued actor and report
    /// initializers, then drains the plan queue until it is empty or a halt
    /// is requested. An unhandled error aborts the run: remaining plans are
    /// discarded and the error is returned.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> NucleusResult<()> {
        {
            let inner = self.inner.borrow();
            if inner.state != SimulationState::Constructing {
                return Err(NucleusError::InvalidState {
                    detail: format!("run called on a {:?} simulation", inner.state),
                });
            }
        }
        if let Some(seed) = self.seed {
            reset_sim_rng();
            set_sim_seed(seed);
        }
        self.inner.borrow_mut().state = SimulationState::Initializing;

        let result = self.initialize_and_drain();

        let mut inner = self.inner.borrow_mut();
        inner.state = SimulationState::Finished;
        if result.is_err() {
            inner.plans.clear();
        }
        debug!(
            final_time = inner.current_time,
            plans_executed = inner.plans_executed,
            ok = result.is_ok(),
            "simulation finished"
        );
        result
    }

    fn initialize_and_drain(&mut self) -> NucleusResult<()> {
        let handle = KernelHandle::from_inner(&self.inner);

        let order = dependency_order(&self.plugins)?;
        for index in order {
            let plugin = &self.plugins[index];
            debug!(plugin = %plugin.id(), "initializing plugin");
            let ctx = PluginContext::new(handle.clone(), plugin.data().to_vec());
            (plugin.init())(&ctx)?;
        }

        // Actors, then reports, each in registration order. Popping one at a
        // time keeps the kernel unborrowed while an initializer runs, so it
        // may queue further actors or reports.
        let actor_ctx = ActorContext::from_handle(handle.clone());
        loop {
            let next = self.inner.borrow_mut().pending_actors.pop_front();
            match next {
                Some(actor) => actor(&actor_ctx)?,
                None => break,
            }
        }
        let report_ctx = ReportContext::from_handle(handle.clone());
        loop {
            let next = self.inner.borrow_mut().pending_reports.pop_front();
            match next {
                Some(report) => report(&report_ctx)?,
                None => break,
            }
        }

        self.inner.borrow_mut().state = SimulationState::Running;
        loop {
            // Pop inside a scoped borrow; the callback runs with the kernel
            // released so it can schedule, cancel, and emit freely.
            let plan = {
                let mut inner = self.inner.borrow_mut();
                if inner.halted {
                    None
                } else {
                    match inner.plans.pop_earliest() {
                        Some(plan) => {
                            inner.current_time = plan.time();
                            inner.plans_executed += 1;
                            Some(plan)
                        }
                        None => None,
                    }
                }
            };
            let Some(plan) = plan else {
                break;
            };
            trace!(time = plan.time(), sequence = plan.sequence(), "executing plan");
            plan.into_payload()(&actor_ctx)?;
        }
        Ok(())
    }

    /// Returns the simulation's lifecycle state.
    pub fn state(&self) -> SimulationState {
        self.inner.borrow().state
    }

    /// Returns the current simulation time (the time of the most recently
    /// executed plan, or 0.0 before any plan has run).
    pub fn current_time(&self) -> f64 {
        self.inner.borrow().current_time
    }

    /// Returns `true` if no pending plans remain.
    pub fn all_plans_complete(&self) -> bool {
        self.inner.borrow().plans.is_empty()
    }

    /// Returns the number of plans still pending (excluding canceled plans).
    pub fn pending_plan_count(&self) -> usize {
        self.inner.borrow().plans.len()
    }

    /// Returns `true` if at least one plan is still pending.
    pub fn has_pending_plans(&self) -> bool {
        !self.all_plans_complete()
    }

    /// Returns the number of plan callbacks executed so far.
    pub fn plans_executed(&self) -> u64 {
        self.inner.borrow().plans_executed
    }

    /// Returns the number of output items released so far.
    pub fn output_released(&self) -> u64 {
        self.inner.borrow().output_released
    }

    /// Takes the output items collected during the run, in release order.
    ///
    /// Empty when an output sink was installed (experiment runs stream their
    /// output instead of collecting it).
    pub fn take_output(&mut self) -> Vec<OutputItem> {
        std::mem::take(&mut self.inner.borrow_mut().output)
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Simulation")
            .field("state", &inner.state)
            .field("current_time", &inner.current_time)
            .field("pending_plans", &inner.plans.len())
            .field("plans_executed", &inner.plans_executed)
            .finish()
    }
}

/// Builder for [`Simulation`].
pub struct SimulationBuilder {
    plugins: Vec<Plugin>,
    seed: Option<u64>,
    output_sink: Option<OutputSink>,
}

impl SimulationBuilder {
    /// Adds a plugin to the simulation.
    pub fn add_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds several plugins, preserving order.
    pub fn add_plugins(mut self, plugins: impl IntoIterator<Item = Plugin>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Seeds the thread-local RNG at the start of the run for deterministic
    /// randomness. Without a seed the RNG state is left untouched.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Streams released output into `sink` instead of collecting it.
    pub(crate) fn output_sink(mut self, sink: impl FnMut(OutputItem) + 'static) -> Self {
        self.output_sink = Some(Box::new(sink));
        self
    }

    /// Finalizes the simulation.
    pub fn build(self) -> Simulation {
        Simulation {
            inner: Rc::new(RefCell::new(SimInner::new(self.output_sink))),
            plugins: self.plugins,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_plugin(times: &[f64]) -> Plugin {
        let times = times.to_vec();
        Plugin::builder("counting")
            .with_initializer(move |ctx| {
                for &t in &times {
                    ctx.add_plan(t, move |actor| actor.release_output(t))?;
                }
                Ok(())
            })
            .build()
    }

    fn output_times(sim: &mut Simulation) -> Vec<f64> {
        sim.take_output()
            .into_iter()
            .map(|item| *item.downcast::<f64>().unwrap())
            .collect()
    }

    #[test]
    fn empty_simulation_finishes_immediately() {
        let mut sim = Simulation::builder().build();
        sim.run().unwrap();
        assert_eq!(sim.state(), SimulationState::Finished);
        assert_eq!(sim.current_time(), 0.0);
        assert!(sim.all_plans_complete());
        assert_eq!(sim.plans_executed(), 0);
    }

    #[test]
    fn plans_run_in_time_order_and_advance_the_clock() {
        let mut sim = Simulation::builder()
            .add_plugin(counting_plugin(&[3.0, 1.0, 2.0]))
            .build();
        sim.run().unwrap();
        assert_eq!(output_times(&mut sim), vec![1.0, 2.0, 3.0]);
        assert_eq!(sim.current_time(), 3.0);
        assert_eq!(sim.plans_executed(), 3);
    }

    #[test]
    fn run_twice_is_an_invalid_state() {
        let mut sim = Simulation::builder().build();
        sim.run().unwrap();
        assert!(matches!(
            sim.run(),
            Err(NucleusError::InvalidState { .. })
        ));
    }

    #[test]
    fn halt_stops_before_the_next_plan() {
        let mut sim = Simulation::builder()
            .add_plugin(
                Plugin::builder("halting")
                    .with_initializer(|ctx| {
                        ctx.add_plan(1.0, |actor| {
                            actor.release_output(1.0_f64)?;
                            actor.halt()
                        })?;
                        ctx.add_plan(2.0, |actor| actor.release_output(2.0_f64))?;
                        Ok(())
                    })
                    .build(),
            )
            .build();
        sim.run().unwrap();
        assert_eq!(output_times(&mut sim), vec![1.0]);
        assert_eq!(sim.current_time(), 1.0);
        assert!(!sim.all_plans_complete());
    }

    #[test]
    fn plan_error_aborts_and_discards_pending_plans() {
        let mut sim = Simulation::builder()
            .add_plugin(
                Plugin::builder("failing")
                    .with_initializer(|ctx| {
                        ctx.add_plan(1.0, |actor| {
                            // Scheduling into the past from a running plan.
                            actor.add_plan(0.5, |_| Ok(()))
                        })?;
                        ctx.add_plan(2.0, |actor| actor.release_output(2.0_f64))?;
                        Ok(())
                    })
                    .build(),
            )
            .build();
        let err = sim.run().unwrap_err();
        assert!(matches!(err, NucleusError::PastPlanningTime { .. }));
        assert_eq!(sim.state(), SimulationState::Finished);
        assert!(sim.all_plans_complete());
        assert!(output_times(&mut sim).is_empty());
    }

    #[test]
    fn actors_and_reports_run_after_plugin_initializers() {
        use std::sync::{Arc, Mutex};

        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (trace.clone(), trace.clone());
        let mut sim = Simulation::builder()
            .add_plugin(
                Plugin::builder("first")
                    .with_initializer(move |ctx| {
                        a.lock().unwrap().push("init-first");
                        let t = a.clone();
                        ctx.add_actor(move |_| {
                            t.lock().unwrap().push("actor");
                            Ok(())
                        })?;
                        let t = a.clone();
                        ctx.add_report(move |_| {
                            t.lock().unwrap().push("report");
                            Ok(())
                        })
                    })
                    .build(),
            )
            .add_plugin(
                Plugin::builder("second")
                    .with_initializer(move |_| {
                        b.lock().unwrap().push("init-second");
                        Ok(())
                    })
                    .build(),
            )
            .build();
        sim.run().unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["init-first", "init-second", "actor", "report"]
        );
    }
}
