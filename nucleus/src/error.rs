use thiserror::Error;

use crate::plugin::PluginId;

/// Errors raised by kernel operations.
///
/// Every variant is a precondition violation: it is never retried and always
/// aborts the operation that raised it. Variants carry structured detail so
/// callers and tests can assert on the kind and the offending values rather
/// than on a message string.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NucleusError {
    /// A plan was scheduled at a time earlier than the current simulation time.
    #[error("cannot schedule a plan at time {time}, current time is {current_time}")]
    PastPlanningTime {
        /// The requested plan time.
        time: f64,
        /// The simulation time at the moment of scheduling.
        current_time: f64,
    },
    /// A plan was scheduled at a NaN or infinite time.
    #[error("plan time {time} is not finite")]
    NonFinitePlanningTime {
        /// The requested plan time.
        time: f64,
    },
    /// A keyed plan was scheduled while another plan with the same key is pending.
    #[error("a plan with key {key:?} is already pending")]
    DuplicatePlanKey {
        /// The conflicting plan key.
        key: String,
    },
    /// No data manager is registered under the requested type.
    #[error("no data manager registered for type {type_name}")]
    UnknownDataManager {
        /// The requested data manager type name.
        type_name: &'static str,
    },
    /// A data manager of this type has already been registered.
    #[error("a data manager of type {type_name} is already registered")]
    DuplicateDataManager {
        /// The conflicting data manager type name.
        type_name: &'static str,
    },
    /// The initializing plugin owns no plugin data of the requested type.
    #[error("plugin has no data of type {type_name}")]
    UnknownPluginData {
        /// The requested plugin data type name.
        type_name: &'static str,
    },
    /// A plugin declares a dependency that is not part of the plugin set.
    #[error("plugin {plugin} declares dependency {dependency} which is missing from the plugin set")]
    MissingPluginDependency {
        /// The plugin declaring the dependency.
        plugin: PluginId,
        /// The dependency that could not be found.
        dependency: PluginId,
    },
    /// The plugin dependency graph contains a cycle.
    #[error("circular plugin dependencies among {plugins:?}")]
    CircularPluginDependencies {
        /// The plugins participating in the cycle.
        plugins: Vec<PluginId>,
    },
    /// Two plugins in the same set share an id.
    #[error("duplicate plugin id {plugin}")]
    DuplicatePluginId {
        /// The duplicated id.
        plugin: PluginId,
    },
    /// No scenario with this id has been opened by the experiment.
    #[error("unknown scenario id {scenario_id}")]
    UnknownScenario {
        /// The requested scenario id.
        scenario_id: usize,
    },
    /// A dimension level requested a plugin data builder type that no plugin contributed.
    #[error("no plugin data builder of type {type_name} in dimension context")]
    UnknownDimensionBuilder {
        /// The requested builder type name.
        type_name: &'static str,
    },
    /// A context handle outlived its simulation.
    #[error("simulation has been shut down")]
    SimulationShutdown,
    /// A lifecycle rule was violated, e.g. running an already-finished simulation.
    #[error("invalid simulation state: {detail}")]
    InvalidState {
        /// Human-readable description of the violation.
        detail: String,
    },
}

/// A type alias for `Result<T, NucleusError>`.
pub type NucleusResult<T> = Result<T, NucleusError>;
