//! # Task Graph
//!
//! A dependency graph of named steps executed on tokio tasks.
//!
//! ## Construction
//!
//! Steps are registered on a [`TaskGraphBuilder`] with the names of the steps they depend on.
//! [`TaskGraphBuilder::build`] validates the whole graph before anything runs: duplicate names,
//! dependencies on unknown steps, self-dependencies and cycles are all reported together as a
//! single [`ExporterError::Graph`].
//!
//! ## Execution
//!
//! - A step starts once every dependency has succeeded. Ready steps start concurrently.
//! - A step receives the results of all of its transitive dependencies through [`StepInputs`].
//! - The first failure stops new steps from starting. Steps already running finish naturally and
//!   their results are discarded.
//! - A panicking step is reported as [`ExporterError::TaskPanicked`] and treated like any other
//!   failure.
//!
//! Execution never returns early: [`TaskGraph::execute`] returns only once no step is running,
//! so whatever finalization the caller performs afterwards cannot race a step.
//!
//! ```rust
//! use exporter_core::orchestration::task_graph::TaskGraph;
//!
//! # async fn example() -> exporter_core::Result<()> {
//! let graph = TaskGraph::<u64>::builder()
//!     .step("a", &[], |_| async { Ok(1) })
//!     .step("b", &["a"], |inputs| async move { Ok(inputs.get("a")? + 1) })
//!     .build()?;
//! let results = graph.execute().await.into_result()?;
//! assert_eq!(results["b"], 2);
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{ExporterError, Result};
use crate::log_step;
use crate::logging::step_label;

type StepAction<T> = Box<dyn FnOnce(StepInputs<T>) -> BoxFuture<'static, Result<T>> + Send>;

/// Results of a step's transitive dependencies, keyed by step name
#[derive(Debug, Clone)]
pub struct StepInputs<T> {
    results: HashMap<String, T>,
}

impl<T> StepInputs<T> {
    /// Result of the named dependency; a `Graph` error when it is not an ancestor.
    pub fn get(&self, step: &str) -> Result<&T> {
        self.results.get(step).ok_or_else(|| {
            ExporterError::Graph(format!("step '{step}' is not a dependency of this step"))
        })
    }

    pub fn contains(&self, step: &str) -> bool {
        self.results.contains_key(step)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Hooks invoked by the graph as steps start and settle
pub trait StepObserver: Send + Sync {
    fn step_started(&self, _step: &str) {}
    fn step_succeeded(&self, _step: &str, _elapsed: Duration) {}
    fn step_failed(&self, _step: &str, _error: &ExporterError) {}
}

/// Observer that does nothing beyond the graph's own logging
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StepObserver for NoopObserver {}

struct StepSpec<T> {
    name: String,
    dependencies: Vec<String>,
    action: StepAction<T>,
}

pub struct TaskGraphBuilder<T> {
    steps: Vec<StepSpec<T>>,
}

impl<T: Clone + Send + 'static> TaskGraphBuilder<T> {
    /// Register a step. `dependencies` name steps registered before or after this one.
    pub fn step<F, Fut>(mut self, name: &str, dependencies: &[&str], action: F) -> Self
    where
        F: FnOnce(StepInputs<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.steps.push(StepSpec {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            action: Box::new(move |inputs| action(inputs).boxed()),
        });
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<TaskGraph<T>> {
        let mut errors = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                errors.push(format!("step #{i} has an empty name"));
            }
            if index.insert(step.name.clone(), i).is_some() {
                errors.push(format!("duplicate step '{}'", step.name));
            }
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let mut resolved = Vec::new();
            let mut seen = HashSet::new();
            for dep in &step.dependencies {
                if dep == &step.name {
                    errors.push(format!("step '{}' depends on itself", step.name));
                    continue;
                }
                match index.get(dep) {
                    Some(&d) if seen.insert(d) => resolved.push(d),
                    Some(_) => {}
                    None => errors.push(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.name
                    )),
                }
            }
            dependencies.push(resolved);
        }

        if !errors.is_empty() {
            return Err(ExporterError::Graph(errors.join("; ")));
        }

        let order = topological_order(&dependencies).map_err(|cyclic| {
            let names: Vec<&str> = cyclic.iter().map(|&i| self.steps[i].name.as_str()).collect();
            ExporterError::Graph(format!("cycle detected among steps: {}", names.join(", ")))
        })?;

        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.steps.len()];
        for &node in &order {
            let mut set = BTreeSet::new();
            for &dep in &dependencies[node] {
                set.insert(dep);
                set.extend(ancestors[dep].iter().copied());
            }
            ancestors[node] = set;
        }

        let nodes = self
            .steps
            .into_iter()
            .zip(dependencies)
            .map(|(spec, dependencies)| TaskNode {
                name: spec.name,
                dependencies,
                action: Some(spec.action),
            })
            .collect();

        Ok(TaskGraph {
            nodes,
            order,
            ancestors,
            observer: Arc::new(NoopObserver),
        })
    }
}

/// Kahn's algorithm. On a cycle, returns the nodes that could not be ordered.
fn topological_order(dependencies: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// A validated step
pub struct TaskNode<T> {
    pub name: String,
    /// Indices of direct dependencies
    pub dependencies: Vec<usize>,
    action: Option<StepAction<T>>,
}

impl<T> std::fmt::Debug for TaskNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// How a graph execution settled
#[derive(Debug)]
pub struct GraphOutcome<T> {
    /// Results of every step that succeeded before the first failure
    pub results: HashMap<String, T>,
    /// First failing step and its error
    pub error: Option<(String, ExporterError)>,
    /// Steps that succeeded, in completion order
    pub completed: Vec<String>,
    /// Steps never started because of the failure
    pub skipped: Vec<String>,
}

impl<T> GraphOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<HashMap<String, T>> {
        match self.error {
            Some((_, err)) => Err(err),
            None => Ok(self.results),
        }
    }
}

pub struct TaskGraph<T> {
    nodes: Vec<TaskNode<T>>,
    order: Vec<usize>,
    ancestors: Vec<BTreeSet<usize>>,
    observer: Arc<dyn StepObserver>,
}

impl<T> std::fmt::Debug for TaskGraph<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.nodes)
            .field("order", &self.order)
            .finish()
    }
}

impl<T: Clone + Send + 'static> TaskGraph<T> {
    pub fn builder() -> TaskGraphBuilder<T> {
        TaskGraphBuilder { steps: Vec::new() }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Step names in a valid execution order
    pub fn step_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.nodes[i].name.as_str())
            .collect()
    }

    /// Names of every transitive dependency of `step`
    pub fn ancestors_of(&self, step: &str) -> Option<Vec<&str>> {
        let idx = self.nodes.iter().position(|n| n.name == step)?;
        Some(
            self.ancestors[idx]
                .iter()
                .map(|&a| self.nodes[a].name.as_str())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Run every step; returns once no step is in flight.
    pub async fn execute(mut self) -> GraphOutcome<T> {
        let n = self.nodes.len();
        let mut pending: Vec<usize> = self.nodes.iter().map(|node| node.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in self.nodes.iter().enumerate() {
            for &dep in &node.dependencies {
                dependents[dep].push(i);
            }
        }

        let mut ready: VecDeque<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut started = vec![false; n];
        let mut results: HashMap<String, T> = HashMap::new();
        let mut completed = Vec::new();
        let mut failure: Option<(String, ExporterError)> = None;
        let mut in_flight: HashSet<usize> = HashSet::new();
        let mut join_set: JoinSet<(usize, Result<T>, Duration)> = JoinSet::new();

        debug!(steps = n, "Task graph execution started");

        loop {
            if failure.is_none() {
                while let Some(idx) = ready.pop_front() {
                    let inputs = StepInputs {
                        results: self.ancestors[idx]
                            .iter()
                            .filter_map(|&a| {
                                let name = &self.nodes[a].name;
                                results.get(name).map(|r| (name.clone(), r.clone()))
                            })
                            .collect(),
                    };
                    let Some(action) = self.nodes[idx].action.take() else {
                        continue;
                    };
                    let name = self.nodes[idx].name.clone();

                    log_step!(info, name, format!("{} Started", step_label(&name)));
                    self.observer.step_started(&name);
                    started[idx] = true;
                    in_flight.insert(idx);

                    join_set.spawn(async move {
                        let start = Instant::now();
                        let outcome = AssertUnwindSafe(async move { action(inputs).await })
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(ExporterError::TaskPanicked(format!(
                                    "step '{name}' panicked: {}",
                                    panic_message(&*panic)
                                )))
                            });
                        (idx, outcome, start.elapsed())
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((idx, outcome, elapsed)) => {
                    in_flight.remove(&idx);
                    let name = self.nodes[idx].name.clone();
                    match outcome {
                        Ok(value) if failure.is_none() => {
                            log_step!(
                                info,
                                name,
                                format!("{} Success", step_label(&name)),
                                elapsed_sec = elapsed.as_secs_f64()
                            );
                            self.observer.step_succeeded(&name, elapsed);
                            results.insert(name.clone(), value);
                            completed.push(name);
                            for &next in &dependents[idx] {
                                pending[next] -= 1;
                                if pending[next] == 0 {
                                    ready.push_back(next);
                                }
                            }
                        }
                        Ok(_) => {
                            info!(step = %name, "Step finished after an earlier failure, result discarded");
                        }
                        Err(err) => {
                            log_step!(
                                error,
                                name,
                                format!("{} Failure", step_label(&name)),
                                error = %err,
                                error_kind = err.kind(),
                                elapsed_sec = elapsed.as_secs_f64()
                            );
                            self.observer.step_failed(&name, &err);
                            if failure.is_none() {
                                failure = Some((name, err));
                            }
                        }
                    }
                }
                Err(join_err) => {
                    // catch_unwind converts panics, so this is a cancelled runtime
                    let names: Vec<String> = in_flight
                        .iter()
                        .map(|&i| self.nodes[i].name.clone())
                        .collect();
                    error!(error = %join_err, in_flight = ?names, "Step task did not complete");
                    if failure.is_none() {
                        failure = Some((
                            names.join(","),
                            ExporterError::TaskPanicked(join_err.to_string()),
                        ));
                    }
                }
            }
        }

        let skipped: Vec<String> = self
            .order
            .iter()
            .filter(|&&i| !started[i])
            .map(|&i| self.nodes[i].name.clone())
            .collect();

        if failure.is_none() && completed.len() < n {
            failure = Some((
                skipped.join(","),
                ExporterError::Graph(format!(
                    "graph stalled with {} step(s) never started",
                    skipped.len()
                )),
            ));
        }

        GraphOutcome {
            results,
            error: failure,
            completed,
            skipped,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
