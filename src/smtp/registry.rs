//! Handler registry and dependency sorting.
//!
//! Every command has its own chain. Within a chain a handler runs after the
//! plugins named in its `after` list and before those in its `before` list,
//! and any handler named `core` runs ahead of the rest. Handlers whose
//! constraints cannot be satisfied, because of a cycle or because an `after`
//! target is not registered, keep their registration order and run after
//! every sorted handler.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;

use super::{
    handler::{Handler, HandlerDef},
    plugins,
};
use crate::{Config, error::RegistryError, internal};

/// One command's sorted handlers.
pub type Chain = Arc<[HandlerDef]>;

/// Sorted chains for every command.
#[derive(Clone, Default, Debug)]
pub struct Handlers(HashMap<String, Chain>);

impl Handlers {
    pub fn chain(&self, command: &str) -> Option<&Chain> {
        self.0.get(command)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.0.get(command).is_some_and(|chain| !chain.is_empty())
    }

    /// Handler names of a chain, in execution order.
    pub fn names(&self, command: &str) -> Vec<&str> {
        self.0
            .get(command)
            .map(|chain| chain.iter().map(|def| def.name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Handlers registered on a single session, run after the snapshot's.
#[derive(Default)]
pub struct Overlay {
    handlers: HashMap<String, Vec<HandlerDef>>,
    count: usize,
}

impl Overlay {
    /// Appends `handler` to the session's chain for `event` as
    /// `on-<event>-<n>`.
    pub fn on(&mut self, event: &str, handler: impl Handler + 'static) {
        let event = event.to_ascii_lowercase();
        self.count += 1;
        let name = format!("on-{event}-{}", self.count);

        self.handlers
            .entry(event)
            .or_default()
            .push(HandlerDef::new(name, handler));
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers.get(event).is_some_and(|defs| !defs.is_empty())
    }

    /// The snapshot's chain for `event` followed by this overlay's.
    pub fn chain(&self, handlers: &Handlers, event: &str) -> Vec<HandlerDef> {
        handlers
            .chain(event)
            .map(|chain| chain.to_vec())
            .unwrap_or_default()
            .into_iter()
            .chain(self.handlers.get(event).into_iter().flatten().cloned())
            .collect()
    }
}

#[derive(Default)]
struct State {
    definitions: HashMap<String, Vec<HandlerDef>>,
    sorted: Arc<Handlers>,
}

/// The live handler set. Sessions take a [`snapshot`](Self::snapshot) when
/// they connect, so registering handlers never affects running sessions.
#[derive(Default)]
pub struct Registry {
    state: RwLock<State>,
}

impl Registry {
    /// Built-in handlers merged with `extra`, minus any handler disabled in
    /// the configuration, sorted per command.
    pub fn load<I>(extra: I, config: &Config) -> Self
    where
        I: IntoIterator<Item = (String, HandlerDef)>,
    {
        let mut definitions: HashMap<String, Vec<HandlerDef>> = HashMap::new();

        let builtin = plugins::builtin()
            .into_iter()
            .map(|(event, def)| (event.to_string(), def));

        for (event, def) in builtin.chain(extra) {
            let event = event.to_ascii_lowercase();
            if config.is_disabled(&event, &def.name) {
                internal!(level = DEBUG, "Handler {event}/{} is disabled", def.name);
                continue;
            }

            definitions.entry(event).or_default().push(def);
        }

        let sorted = sort(&definitions);

        Self {
            state: RwLock::new(State {
                definitions,
                sorted: Arc::new(sorted),
            }),
        }
    }

    /// Registers a handler for `event` and re-sorts that event's chain.
    ///
    /// # Errors
    ///
    /// If `event` or the handler's name is empty.
    pub fn add_handler(&self, event: &str, def: HandlerDef) -> Result<(), RegistryError> {
        let event = event.trim().to_ascii_lowercase();
        if event.is_empty() {
            return Err(RegistryError::EmptyEvent);
        }

        if def.name.trim().is_empty() {
            return Err(RegistryError::EmptyName(event));
        }

        internal!(level = DEBUG, "Registering handler {event}/{}", def.name);

        let mut state = self.state.write();
        let definitions = state.definitions.entry(event.clone()).or_default();
        definitions.push(def);

        let chain: Chain = sort_chain(&event, definitions).into();
        let mut sorted = Handlers::clone(&state.sorted);
        sorted.0.insert(event, chain);
        state.sorted = Arc::new(sorted);

        Ok(())
    }

    /// The current sorted handler set.
    pub fn snapshot(&self) -> Arc<Handlers> {
        Arc::clone(&self.state.read().sorted)
    }
}

/// Sorts every command's handlers.
pub fn sort(definitions: &HashMap<String, Vec<HandlerDef>>) -> Handlers {
    Handlers(
        definitions
            .iter()
            .map(|(event, defs)| (event.clone(), sort_chain(event, defs).into()))
            .collect(),
    )
}

/// Dependencies are plugin names; a `command/` qualifier is ignored.
fn plugin_name(dependency: &str) -> &str {
    dependency
        .rsplit_once('/')
        .map_or(dependency, |(_, name)| name)
}

/// Kahn's algorithm, always taking the earliest registered ready handler.
/// Nodes marked `blocked` are never emitted, and neither is anything that
/// depends on them.
fn kahn(edges: &[Vec<usize>], blocked: &[bool]) -> Vec<usize> {
    let mut indegree = vec![0usize; edges.len()];
    for targets in edges {
        for &target in targets {
            indegree[target] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..edges.len())
        .filter(|&node| indegree[node] == 0 && !blocked[node])
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &target in &edges[node] {
            indegree[target] -= 1;
            if indegree[target] == 0 && !blocked[target] {
                ready.insert(target);
            }
        }
    }

    order
}

/// Orders one command's handlers.
pub fn sort_chain(command: &str, definitions: &[HandlerDef]) -> Vec<HandlerDef> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (position, def) in definitions.iter().enumerate() {
        index.entry(def.name.as_str()).or_insert(position);
    }

    let mut edges = vec![Vec::new(); definitions.len()];
    let mut missing = vec![false; definitions.len()];
    let core = index.get("core").copied();

    for (position, def) in definitions.iter().enumerate() {
        if let Some(core) = core
            && def.name != "core"
        {
            edges[core].push(position);
        }

        for dependency in &def.after {
            match index.get(plugin_name(dependency)) {
                Some(&source) if source != position => edges[source].push(position),
                Some(_) => {}
                None => {
                    internal!(
                        level = DEBUG,
                        "{command}/{} runs after unknown handler {dependency}",
                        def.name
                    );
                    missing[position] = true;
                }
            }
        }

        for dependency in &def.before {
            match index.get(plugin_name(dependency)) {
                Some(&target) if target != position => edges[position].push(target),
                Some(_) => {}
                None => internal!(
                    level = DEBUG,
                    "{command}/{} runs before unknown handler {dependency}, ignoring",
                    def.name
                ),
            }
        }
    }

    let order = kahn(&edges, &missing);

    if order.len() < definitions.len() {
        let unsorted: Vec<&str> = (0..definitions.len())
            .filter(|node| !order.contains(node))
            .map(|node| definitions[node].name.as_str())
            .collect();

        if kahn(&edges, &vec![false; definitions.len()]).len() < definitions.len() {
            internal!(
                level = WARN,
                "Cyclic dependencies in {command} handlers, running {unsorted:?} last in registration order"
            );
        } else {
            internal!(
                level = DEBUG,
                "Unresolved dependencies in {command} handlers, running {unsorted:?} last in registration order"
            );
        }
    }

    let mut sorted: Vec<HandlerDef> = order
        .iter()
        .map(|&node| definitions[node].clone())
        .collect();
    sorted.extend(
        (0..definitions.len())
            .filter(|node| !order.contains(node))
            .map(|node| definitions[node].clone()),
    );

    sorted
}
