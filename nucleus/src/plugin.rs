//! Plugin composition and dependency resolution.
//!
//! A plugin is a composable unit of simulation capability: an id, a set of
//! dependency ids, zero or more opaque data blobs, and an initializer that
//! registers data managers, actors, and reports with the simulation. Plugins
//! are initialized in an order consistent with their declared dependencies,
//! so a plugin can rely on data managers registered by its dependencies.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    context::PluginContext,
    error::{NucleusError, NucleusResult},
};

/// Opaque, comparable identity for a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(Arc<str>);

impl PluginId {
    /// Creates a plugin id from a name.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PluginId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An immutable configuration/state blob owned by one plugin.
///
/// The kernel never inspects the contents; it only clones builders so the
/// experiment layer can derive per-scenario variants.
pub trait PluginData: Any + Send + Sync {
    /// Returns a mutable builder seeded with this blob's current contents.
    fn clone_builder(&self) -> Box<dyn PluginDataBuilder>;
}

/// The mutable half of the two-phase plugin data pattern.
///
/// Dimension levels downcast builders to their concrete type and mutate them;
/// `build` freezes the result back into an immutable blob.
pub trait PluginDataBuilder: Any + Send {
    /// Freezes the builder into an immutable plugin data blob.
    fn build(self: Box<Self>) -> Arc<dyn PluginData>;
}

/// The initializer capability a plugin contributes.
///
/// `Arc<dyn Fn>` rather than a boxed `FnOnce` so a plugin can be cloned and
/// re-initialized once per experiment scenario, on any worker thread.
pub(crate) type PluginInit =
    Arc<dyn Fn(&PluginContext) -> NucleusResult<()> + Send + Sync>;

/// A composable unit of simulation capability.
///
/// Built once via [`Plugin::builder`]; consumed by a [`Simulation`] or an
/// [`Experiment`] at construction.
///
/// [`Simulation`]: crate::simulation::Simulation
/// [`Experiment`]: crate::experiment::Experiment
#[derive(Clone)]
pub struct Plugin {
    id: PluginId,
    dependencies: BTreeSet<PluginId>,
    data: Vec<Arc<dyn PluginData>>,
    init: PluginInit,
}

impl Plugin {
    /// Starts building a plugin with the given id.
    pub fn builder(id: impl Into<PluginId>) -> PluginBuilder {
        PluginBuilder {
            id: id.into(),
            dependencies: BTreeSet::new(),
            data: Vec::new(),
            init: None,
        }
    }

    /// Returns the plugin's id.
    pub fn id(&self) -> &PluginId {
        &self.id
    }

    /// Returns the declared dependency ids.
    pub fn dependencies(&self) -> &BTreeSet<PluginId> {
        &self.dependencies
    }

    pub(crate) fn data(&self) -> &[Arc<dyn PluginData>] {
        &self.data
    }

    pub(crate) fn replace_data(&mut self, index: usize, data: Arc<dyn PluginData>) {
        self.data[index] = data;
    }

    pub(crate) fn init(&self) -> &PluginInit {
        &self.init
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("data", &self.data.len())
            .finish()
    }
}

/// Builder for [`Plugin`].
pub struct PluginBuilder {
    id: PluginId,
    dependencies: BTreeSet<PluginId>,
    data: Vec<Arc<dyn PluginData>>,
    init: Option<PluginInit>,
}

impl PluginBuilder {
    /// Declares a dependency on another plugin.
    pub fn depends_on(mut self, id: impl Into<PluginId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Attaches an opaque data blob to the plugin.
    pub fn with_data(mut self, data: impl PluginData) -> Self {
        self.data.push(Arc::new(data));
        self
    }

    /// Sets the plugin's initializer.
    pub fn with_initializer(
        mut self,
        init: impl Fn(&PluginContext) -> NucleusResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Arc::new(init));
        self
    }

    /// Finalizes the plugin. A plugin without an initializer gets a no-op.
    pub fn build(self) -> Plugin {
        Plugin {
            id: self.id,
            dependencies: self.dependencies,
            data: self.data,
            init: self.init.unwrap_or_else(|| Arc::new(|_| Ok(()))),
        }
    }
}

/// Computes a deterministic initialization order consistent with every
/// plugin's declared dependency set.
///
/// Kahn's algorithm over the dependency DAG. Among plugins whose dependencies
/// are equally satisfied, declared order is preserved, so the result is
/// stable across runs. Returns indices into `plugins`.
pub(crate) fn dependency_order(plugins: &[Plugin]) -> NucleusResult<Vec<usize>> {
    let mut position: HashMap<&PluginId, usize> = HashMap::new();
    for (index, plugin) in plugins.iter().enumerate() {
        if position.insert(plugin.id(), index).is_some() {
            return Err(NucleusError::DuplicatePluginId {
                plugin: plugin.id().clone(),
            });
        }
    }

    // dependents[i] lists plugins that must wait for plugin i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plugins.len()];
    let mut in_degree: Vec<usize> = vec![0; plugins.len()];
    for (index, plugin) in plugins.iter().enumerate() {
        for dependency in plugin.dependencies() {
            let Some(&dep_index) = position.get(dependency) else {
                return Err(NucleusError::MissingPluginDependency {
                    plugin: plugin.id().clone(),
                    dependency: dependency.clone(),
                });
            };
            dependents[dep_index].push(index);
            in_degree[index] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..plugins.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(plugins.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() < plugins.len() {
        let cycle: Vec<PluginId> = (0..plugins.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| plugins[i].id().clone())
            .collect();
        return Err(NucleusError::CircularPluginDependencies { plugins: cycle });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(id: &str, deps: &[&str]) -> Plugin {
        let mut builder = Plugin::builder(id);
        for dep in deps {
            builder = builder.depends_on(*dep);
        }
        builder.build()
    }

    fn ordered_ids(plugins: &[Plugin]) -> Vec<String> {
        dependency_order(plugins)
            .unwrap()
            .into_iter()
            .map(|i| plugins[i].id().as_str().to_string())
            .collect()
    }

    #[test]
    fn independent_plugins_keep_declared_order() {
        let plugins = vec![plugin("a", &[]), plugin("b", &[]), plugin("c", &[])];
        assert_eq!(ordered_ids(&plugins), vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_come_first() {
        let plugins = vec![
            plugin("reports", &["people", "regions"]),
            plugin("people", &["regions"]),
            plugin("regions", &[]),
        ];
        assert_eq!(ordered_ids(&plugins), vec!["regions", "people", "reports"]);
    }

    #[test]
    fn diamond_dependencies_resolve() {
        let plugins = vec![
            plugin("base", &[]),
            plugin("left", &["base"]),
            plugin("right", &["base"]),
            plugin("top", &["left", "right"]),
        ];
        let order = ordered_ids(&plugins);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("top"));
        assert!(pos("right") < pos("top"));
    }

    #[test]
    fn missing_dependency_is_reported() {
        let plugins = vec![plugin("people", &["regions"])];
        let err = dependency_order(&plugins).unwrap_err();
        assert_eq!(
            err,
            NucleusError::MissingPluginDependency {
                plugin: PluginId::new("people"),
                dependency: PluginId::new("regions"),
            }
        );
    }

    #[test]
    fn cycle_is_reported_with_participants() {
        let plugins = vec![
            plugin("a", &["b"]),
            plugin("b", &["a"]),
            plugin("standalone", &[]),
        ];
        match dependency_order(&plugins).unwrap_err() {
            NucleusError::CircularPluginDependencies { plugins } => {
                assert_eq!(plugins, vec![PluginId::new("a"), PluginId::new("b")]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_plugin_id_is_rejected() {
        let plugins = vec![plugin("a", &[]), plugin("a", &[])];
        assert_eq!(
            dependency_order(&plugins).unwrap_err(),
            NucleusError::DuplicatePluginId {
                plugin: PluginId::new("a")
            }
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plugins = vec![plugin("a", &["a"])];
        assert!(matches!(
            dependency_order(&plugins).unwrap_err(),
            NucleusError::CircularPluginDependencies { .. }
        ));
    }
}
