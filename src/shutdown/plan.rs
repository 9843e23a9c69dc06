/*!
 * Shutdown Planning
 *
 * Turns the registered hooks into ordered stages:
 *
 * - one stage per priority tier, in tier order
 * - inside a stage, edges between hooks of the same tier; edges to earlier
 *   tiers are satisfied by tier ordering alone
 * - a trailing deferred stage for hooks caught in a dependency cycle and
 *   anything downstream of one, in any tier; only edges between hooks on a
 *   cycle are ignored there
 *
 * Registration rejects every problem it can already see. Whatever only shows
 * up once all modules registered (forward references) is repaired here and
 * reported as a warning instead.
 */

use super::hook::{HookPriority, ShutdownHook};
use crate::core::errors::RegistrationError;
use std::collections::{HashMap, HashSet, VecDeque};

/// A hook placed in a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedHook {
    pub name: String,
    pub priority: HookPriority,
    /// Hooks of the same stage that must finish first
    pub depends_on: Vec<String>,
}

/// A group of hooks attempted together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// `None` for the deferred stage
    pub priority: Option<HookPriority>,
    pub hooks: Vec<PlannedHook>,
}

impl Stage {
    pub fn is_deferred(&self) -> bool {
        self.priority.is_none()
    }
}

/// Deterministic execution plan for one shutdown sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownPlan {
    pub stages: Vec<Stage>,
    pub warnings: Vec<String>,
}

impl ShutdownPlan {
    /// Plan `hooks`, given in registration order
    pub fn build(hooks: &[ShutdownHook]) -> Self {
        let priorities: HashMap<&str, HookPriority> =
            hooks.iter().map(|h| (h.name(), h.priority())).collect();
        let mut warnings = Vec::new();
        // Every edge that survived repair, earlier-tier ones included
        let mut edges: HashMap<&str, Vec<String>> = HashMap::new();
        let mut tiers: Vec<Vec<PlannedHook>> = vec![Vec::new(); HookPriority::ALL.len()];

        for hook in hooks {
            let mut depends_on = Vec::new();
            let mut kept = Vec::new();
            for dep in hook.dependencies() {
                match priorities.get(dep.as_str()) {
                    None => warnings.push(format!(
                        "hook '{}' depends on unregistered hook '{}'; dependency dropped",
                        hook.name(),
                        dep
                    )),
                    Some(&dep_priority) if dep_priority > hook.priority() => {
                        warnings.push(format!(
                            "hook '{}' ({}) depends on '{}' ({}) in a later tier; dependency dropped",
                            hook.name(),
                            hook.priority(),
                            dep,
                            dep_priority
                        ))
                    }
                    Some(&dep_priority) => {
                        kept.push(dep.clone());
                        // Earlier tiers finish before this one starts
                        if dep_priority == hook.priority() {
                            depends_on.push(dep.clone());
                        }
                    }
                }
            }
            edges.insert(hook.name(), kept);
            tiers[hook.priority() as usize].push(PlannedHook {
                name: hook.name().to_string(),
                priority: hook.priority(),
                depends_on,
            });
        }

        let mut stages = Vec::new();
        let mut deferred: Vec<PlannedHook> = Vec::new();
        let mut deferred_names: HashSet<String> = HashSet::new();
        let waits_on_deferred = |hook: &PlannedHook, deferred_names: &HashSet<String>| {
            edges
                .get(hook.name.as_str())
                .is_some_and(|deps| deps.iter().any(|dep| deferred_names.contains(dep)))
        };

        for (priority, mut tier) in HookPriority::ALL.into_iter().zip(tiers) {
            // Dependents of deferred hooks follow them, transitively within the tier
            let mut blocked = Vec::new();
            while let Some(i) = tier
                .iter()
                .position(|hook| waits_on_deferred(hook, &deferred_names))
            {
                let hook = tier.remove(i);
                deferred_names.insert(hook.name.clone());
                blocked.push(hook);
            }
            if !blocked.is_empty() {
                let names: Vec<&str> = blocked.iter().map(|h| h.name.as_str()).collect();
                warnings.push(format!(
                    "{} hooks [{}] depend on deferred hooks; deferred with them",
                    priority,
                    names.join(", ")
                ));
                deferred.extend(blocked);
            }

            let (_, stuck) = topological_order(&tier);
            if !stuck.is_empty() {
                let names: Vec<&str> = stuck.iter().map(|&i| tier[i].name.as_str()).collect();
                warnings.push(format!(
                    "dependency cycle among {} hooks [{}]; deferred after all tiers",
                    priority,
                    names.join(", ")
                ));
            }

            let stuck: HashSet<usize> = stuck.into_iter().collect();
            let mut runnable = Vec::with_capacity(tier.len());
            for (i, hook) in tier.into_iter().enumerate() {
                if stuck.contains(&i) {
                    deferred_names.insert(hook.name.clone());
                    deferred.push(hook);
                } else {
                    runnable.push(hook);
                }
            }
            if !runnable.is_empty() {
                stages.push(Stage {
                    priority: Some(priority),
                    hooks: runnable,
                });
            }
        }

        if !deferred.is_empty() {
            for hook in &mut deferred {
                hook.depends_on = edges
                    .get(hook.name.as_str())
                    .map(|deps| {
                        deps.iter()
                            .filter(|dep| deferred_names.contains(*dep))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
            }
            let (_, stuck) = topological_order(&deferred);
            for i in cycle_members(&deferred, &stuck) {
                deferred[i].depends_on.clear();
            }
            stages.push(Stage {
                priority: None,
                hooks: deferred,
            });
        }

        Self { stages, warnings }
    }

    /// Number of planned hooks across all stages
    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.hooks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hook names that were moved to the deferred stage
    pub fn deferred(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.is_deferred())
            .flat_map(|s| s.hooks.iter().map(|h| h.name.as_str()))
            .collect()
    }

    /// One valid sequential order: stages in order, Kahn's order inside each
    pub fn execution_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.len());
        for stage in &self.stages {
            let (ordered, _) = topological_order(&stage.hooks);
            order.extend(ordered.into_iter().map(|i| stage.hooks[i].name.clone()));
        }
        order
    }
}

/// Kahn's algorithm over the intra-stage edges
///
/// Returns indices in a dependency-respecting order (ties broken by input
/// order) and the indices that could never become ready.
pub(crate) fn topological_order(hooks: &[PlannedHook]) -> (Vec<usize>, Vec<usize>) {
    let index: HashMap<&str, usize> = hooks
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.as_str(), i))
        .collect();

    let mut pending = vec![0usize; hooks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); hooks.len()];
    for (i, hook) in hooks.iter().enumerate() {
        for dep in &hook.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                pending[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..hooks.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(hooks.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    let placed: HashSet<usize> = order.iter().copied().collect();
    let stuck = (0..hooks.len()).filter(|i| !placed.contains(i)).collect();
    (order, stuck)
}

/// Hooks among `candidates` that can reach themselves through their edges
fn cycle_members(hooks: &[PlannedHook], candidates: &[usize]) -> Vec<usize> {
    let index: HashMap<&str, usize> = hooks
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.as_str(), i))
        .collect();
    let deps_of = |i: usize| {
        hooks[i]
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .collect::<Vec<_>>()
    };

    candidates
        .iter()
        .copied()
        .filter(|&start| {
            let mut seen = HashSet::new();
            let mut stack = deps_of(start);
            while let Some(i) = stack.pop() {
                if i == start {
                    return true;
                }
                if seen.insert(i) {
                    stack.extend(deps_of(i));
                }
            }
            false
        })
        .collect()
}

/// Check a new hook against those already registered
pub(crate) fn validate_registration(
    existing: &[ShutdownHook],
    hook: &ShutdownHook,
) -> Result<(), RegistrationError> {
    let name = hook.name();
    if existing.iter().any(|h| h.name() == name) {
        return Err(RegistrationError::DuplicateHook(name.to_string()));
    }
    if hook.dependencies().iter().any(|dep| dep == name) {
        return Err(RegistrationError::SelfDependency(name.to_string()));
    }

    let known: HashMap<&str, &ShutdownHook> = existing.iter().map(|h| (h.name(), h)).collect();
    for dep in hook.dependencies() {
        if let Some(dep_hook) = known.get(dep.as_str()) {
            if dep_hook.priority() > hook.priority() {
                return Err(RegistrationError::PriorityInversion {
                    name: name.to_string(),
                    priority: hook.priority(),
                    dependency: dep.clone(),
                    dependency_priority: dep_hook.priority(),
                });
            }
        }
    }

    // Existing hooks may already point at this name through forward references
    for dep in hook.dependencies() {
        let mut path = vec![name.to_string(), dep.clone()];
        let mut visited = HashSet::new();
        if reaches(&known, dep, name, &mut path, &mut visited) {
            return Err(RegistrationError::CycleDetected {
                name: name.to_string(),
                cycle: path,
            });
        }
    }

    // Priority inversions seen from the other side of a forward reference
    for other in existing {
        if other.dependencies().iter().any(|dep| dep == name) && hook.priority() > other.priority()
        {
            return Err(RegistrationError::PriorityInversion {
                name: other.name().to_string(),
                priority: other.priority(),
                dependency: name.to_string(),
                dependency_priority: hook.priority(),
            });
        }
    }

    Ok(())
}

/// Depth-first search for `target` from `from`, recording the path taken
fn reaches(
    known: &HashMap<&str, &ShutdownHook>,
    from: &str,
    target: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> bool {
    if !visited.insert(from.to_string()) {
        return false;
    }
    let Some(hook) = known.get(from) else {
        return false;
    };
    for dep in hook.dependencies() {
        path.push(dep.clone());
        if dep == target || reaches(known, dep, target, path, visited) {
            return true;
        }
        path.pop();
    }
    false
}
