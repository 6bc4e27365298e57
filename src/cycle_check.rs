use std::collections::btree_set;
use std::collections::{BTreeSet, HashMap, HashSet};
use crate::JobId;

static NO_DEPENDENCIES: BTreeSet<JobId> = BTreeSet::new();

/// Returns true if following prerequisite edges from any job leads back to it.
pub fn has_cycle(edges: &HashMap<JobId, BTreeSet<JobId>>) -> bool {
    find_cycle(edges).is_some()
}

/// Returns a job that sits on a dependency cycle, if there is one.
pub fn find_cycle(edges: &HashMap<JobId, BTreeSet<JobId>>) -> Option<JobId> {
    let mut ids: Vec<&str> = edges.keys().map(String::as_str).collect();
    ids.sort_unstable();
    find_cycle_from(ids, |id| edges.get(id))
}

/// Depth-first search from `starts` only, reading prerequisites through
/// `dependencies_of`. Unknown ids have no prerequisites. Uses an explicit
/// stack, so chain length is bounded by memory rather than the call stack.
pub fn find_cycle_from<'a, I, F>(starts: I, dependencies_of: F) -> Option<JobId>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> Option<&'a BTreeSet<JobId>>,
{
    let deps = |id: &str| -> btree_set::Iter<'a, JobId> {
        dependencies_of(id).unwrap_or(&NO_DEPENDENCIES).iter()
    };

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut on_path: HashSet<&'a str> = HashSet::new();
    let mut stack: Vec<(&'a str, btree_set::Iter<'a, JobId>)> = Vec::new();

    for start in starts {
        if visited.contains(start) {
            continue;
        }
        visited.insert(start);
        on_path.insert(start);
        stack.push((start, deps(start)));

        while let Some((job_id, pending)) = stack.last_mut() {
            match pending.next() {
                Some(dep) => {
                    let dep = dep.as_str();
                    if on_path.contains(dep) {
                        return Some(dep.to_string()); // back edge
                    }
                    if visited.insert(dep) {
                        on_path.insert(dep);
                        stack.push((dep, deps(dep)));
                    }
                }
                None => {
                    on_path.remove(*job_id);
                    stack.pop();
                }
            }
        }
    }

    None
}
