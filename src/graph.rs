use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write;

use crate::cycle_check::find_cycle_from;
use crate::{Job, JobId, JobcuterError};

/// Prerequisite edges of every admitted job. Always acyclic: admission that
/// would close a cycle is rejected before anything is recorded.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    edges: HashMap<JobId, BTreeSet<JobId>>,
    dependents: HashMap<JobId, Vec<JobId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<JobId>> {
        self.edges.get(id)
    }

    pub fn dependents_of(&self, id: &str) -> &[JobId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.edges.keys()
    }

    /// Every job that transitively depends on one of `failed`. Such jobs can
    /// never become ready.
    pub fn blocked_by(&self, failed: &HashSet<JobId>) -> HashSet<JobId> {
        let mut blocked = HashSet::new();
        let mut frontier: VecDeque<&str> = failed.iter().map(String::as_str).collect();
        while let Some(id) = frontier.pop_front() {
            for child in self.dependents_of(id) {
                if blocked.insert(child.clone()) {
                    frontier.push_back(child);
                }
            }
        }
        blocked
    }

    /// Records a single job. Every dependency must already be admitted.
    pub fn admit(&mut self, job: &Job) -> Result<(), JobcuterError> {
        self.admit_all(std::slice::from_ref(job))
    }

    /// Records a batch atomically. Dependencies may name admitted jobs or jobs
    /// in the same batch; on error the graph is left untouched.
    pub fn admit_all(&mut self, jobs: &[Job]) -> Result<(), JobcuterError> {
        let mut batch: HashMap<&str, &Job> = HashMap::with_capacity(jobs.len());
        for job in jobs {
            if self.contains(&job.id) || batch.insert(job.id.as_str(), job).is_some() {
                return Err(JobcuterError::DuplicateJob(job.id.clone()));
            }
        }

        for job in jobs {
            if job.dependencies.contains(&job.id) {
                return Err(JobcuterError::CycleDetected(job.id.clone()));
            }
            for dep in &job.dependencies {
                if !self.contains(dep) && !batch.contains_key(dep.as_str()) {
                    return Err(JobcuterError::UnsatisfiableDependency {
                        job: job.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // The admitted graph is acyclic, so a new cycle has to pass through
        // the batch. Searching from the batch alone is enough.
        let mut starts: Vec<&str> = batch.keys().copied().collect();
        starts.sort_unstable();
        let cycle = find_cycle_from(starts, |id| {
            batch
                .get(id)
                .copied()
                .map(|job| &job.dependencies)
                .or_else(|| self.edges.get(id))
        });
        if let Some(member) = cycle {
            return Err(JobcuterError::CycleDetected(member));
        }

        for job in jobs {
            for dep in &job.dependencies {
                self.dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(job.id.clone());
            }
            self.edges.insert(job.id.clone(), job.dependencies.clone());
        }
        Ok(())
    }

    /// Renders each root followed by the chains of jobs waiting on it.
    pub fn render(&self) -> String {
        let mut roots: Vec<&JobId> = self
            .edges
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id)
            .collect();
        roots.sort();

        let mut out = String::new();
        for root in roots {
            let _ = writeln!(out, "{}", root);
            self.render_chain(&mut out, root, "  ");
        }
        out
    }

    fn render_chain(&self, out: &mut String, id: &str, prefix: &str) {
        for child in self.dependents_of(id) {
            let _ = writeln!(out, "{}└─> {}", prefix, child);
            self.render_chain(out, child, &format!("{}    ", prefix));
        }
    }
}
