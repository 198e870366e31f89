//! # Nucleus
//!
//! A discrete-event simulation kernel for agent-based models.
//!
//! The kernel provides:
//! - Dependency-ordered plugin composition (data managers, actors, reports)
//! - A time-ordered plan scheduler with deterministic FIFO tie-breaking
//! - A typed publish/subscribe event bus with structural filters
//! - An experiment layer sweeping parameter dimensions across many
//!   independent, optionally concurrent, simulation runs
//!
//! ## Example Usage
//!
//! ```rust
//! use nucleus::{Plugin, Simulation};
//!
//! let mut sim = Simulation::builder()
//!     .add_plugin(
//!         Plugin::builder("greeter")
//!             .with_initializer(|ctx| {
//!                 ctx.add_plan(1.0, |actor| actor.release_output("hello"))
//!             })
//!             .build(),
//!     )
//!     .build();
//!
//! sim.run().unwrap();
//! assert_eq!(sim.current_time(), 1.0);
//! assert_eq!(sim.take_output().len(), 1);
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Capability contexts handed into plugin, manager, actor, and report code.
pub mod context;
/// Error types for kernel operations.
pub mod error;
/// Typed publish/subscribe event dispatch.
pub mod events;
/// Parameter-sweep experiments over independent scenarios.
pub mod experiment;
/// Data manager trait and type-keyed registry.
pub mod managers;
/// Plan scheduling: time-ordered deferred callbacks.
pub mod plans;
/// Plugin composition and dependency resolution.
pub mod plugin;
/// Experiment result aggregation.
pub mod report;
/// Thread-local deterministic random number generation.
pub mod rng;
/// The simulation main loop and its builder.
pub mod simulation;

// Public API exports
pub use context::{ActorContext, DataManagerContext, PluginContext, ReportContext};
pub use error::{NucleusError, NucleusResult};
pub use events::{SimulationEvent, SubscriptionId};
pub use experiment::{
    Dimension, DimensionContext, Experiment, ExperimentBuilder, ExperimentContext,
    FailurePolicy, FunctionalDimension,
};
pub use managers::DataManager;
pub use plans::{PlanQueue, ScheduledPlan};
pub use plugin::{Plugin, PluginBuilder, PluginData, PluginDataBuilder, PluginId};
pub use report::{ExperimentReport, ScenarioMetrics, ScenarioOutcome};
pub use rng::{get_current_sim_seed, reset_sim_rng, set_sim_seed, sim_random, sim_random_range};
pub use simulation::{OutputItem, Simulation, SimulationBuilder, SimulationState};
