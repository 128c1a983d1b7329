use std::collections::{HashMap, HashSet};

use crate::error::CadenzaError;
use crate::task::Task;

/// Validated task dependency graph (DAG).
///
/// Construction rejects duplicate ids, dependencies on unknown tasks and
/// cycles, so every method on an existing graph can assume a DAG.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Tasks in the order they were declared.
    tasks: Vec<Task>,

    /// task_id -> position in `tasks`
    index: HashMap<String, usize>,

    /// task_id -> tasks that depend on it, in declaration order
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Result<Self, CadenzaError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            task.validate()?;
            if index.insert(task.id.clone(), pos).is_some() {
                return Err(CadenzaError::DuplicateTask(task.id.clone()));
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &tasks {
            for dep in &task.dependencies {
                if !index.contains_key(dep) {
                    return Err(CadenzaError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        let graph = Self {
            tasks,
            index,
            dependents,
        };
        if let Some(cycle) = graph.detect_cycle() {
            return Err(CadenzaError::DependencyCycle(cycle));
        }
        Ok(graph)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&pos| &self.tasks[pos])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks nothing else depends on, in declaration order.
    pub fn sinks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| self.dependents(&t.id).is_empty())
            .collect()
    }

    /// Topological layering using Kahn's algorithm.
    ///
    /// A task with no dependencies lands in layer 0; any other task lands in
    /// the layer right after the deepest of its dependencies. Within a layer
    /// tasks keep their declaration order.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.len()))
            .collect();

        let mut layers = Vec::new();
        let mut current: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.as_str())
            .collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for id in &current {
                for dependent in self.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            next.sort_by_key(|id| self.index.get(*id).copied().unwrap_or(usize::MAX));

            layers.push(current.iter().map(|id| id.to_string()).collect());
            current = next;
        }

        layers
    }

    /// Returns the first cycle found as `a -> b -> a`.
    fn detect_cycle(&self) -> Option<String> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for task in &self.tasks {
            if visited.contains(task.id.as_str()) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(&task.id, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<String> {
        visited.insert(node);
        stack.push(node);

        if let Some(task) = self.get(node) {
            for dep in &task.dependencies {
                if let Some(pos) = stack.iter().position(|x| *x == dep.as_str()) {
                    let mut path: Vec<&str> = stack[pos..].to_vec();
                    path.push(dep.as_str());
                    return Some(path.join(" -> "));
                }
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        None
    }
}
