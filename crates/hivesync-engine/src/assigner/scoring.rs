//! Worker/task scoring.

use std::collections::BTreeSet;

use hivesync_core::{Task, Worker};

use crate::config::ScoringWeights;

/// A worker as the assigner sees it during one planning pass.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker: Worker,
    /// Tasks currently ASSIGNED/IN_PROGRESS for this worker, including
    /// assignments planned earlier in the pass.
    pub load: u32,
    /// Resources the worker holds or will need for planned tasks.
    pub held: BTreeSet<String>,
}

impl Candidate {
    pub fn new(worker: Worker, load: u32) -> Self {
        let held = worker.claimed_resources.clone();
        Self { worker, load, held }
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.worker.max_concurrent_tasks.max(1)
    }

    /// Count a planned assignment against this candidate.
    pub fn take(&mut self, task: &Task) {
        self.load += 1;
        self.held.extend(task.resources.iter().cloned());
    }
}

/// How well a candidate fits a task. Higher is better.
pub trait ScoringStrategy: Send + Sync {
    fn score(&self, task: &Task, candidate: &Candidate) -> f64;
}

/// `workload + capability + performance - conflict`, with named weights.
#[derive(Debug, Clone, Default)]
pub struct WeightedScoring {
    weights: ScoringWeights,
}

impl WeightedScoring {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }
}

impl ScoringStrategy for WeightedScoring {
    fn score(&self, task: &Task, c: &Candidate) -> f64 {
        let w = &self.weights;

        let limit = f64::from(c.worker.max_concurrent_tasks.max(1));
        let workload = w.workload * (1.0 - (f64::from(c.load) / limit).min(1.0));

        let required = &task.required_capabilities;
        let capability = if required.is_empty() {
            w.capability
        } else {
            w.capability * required.overlap(&c.worker.capabilities) as f64 / required.len() as f64
        };

        let performance = w.performance * c.worker.performance_score;

        let contended = task.resources.iter().filter(|r| c.held.contains(*r)).count();
        let conflict = w.conflict * contended as f64;

        workload + capability + performance - conflict
    }
}
