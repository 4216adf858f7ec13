//! Job registration and scheduling.
//!
//! The registry lists every available job in a fixed order. The scheduler
//! picks the jobs needed for a set of required output types, pulls in their
//! transitive dependencies, and orders them so producers run before
//! consumers.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::blocks::ExportBlocksJob;
use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::receipts::ExportTransactionsAndLogsJob;
use super::token_balances::ExportTokenBalancesJob;
use super::token_transfers::ExtractTokenTransfersJob;
use super::tokens::ExportTokensJob;
use super::traces::ExportTracesJob;
use super::traits::Job;
use crate::types::items::{Item, ItemBuffer, ItemType};

/// Registry of all extraction jobs, built at startup.
pub struct JobRegistry {
    jobs: Vec<Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn register<J: Job>(&mut self, job: J) {
        self.jobs.push(Arc::new(job));
    }

    pub fn jobs(&self) -> &[Arc<dyn Job>] {
        &self.jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the registry with all jobs. Registration order breaks ties when
/// ordering independent jobs.
pub fn build_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(ExportBlocksJob);
    registry.register(ExportTransactionsAndLogsJob);
    registry.register(ExportTracesJob);
    registry.register(ExtractTokenTransfersJob);
    registry.register(ExportTokensJob::new());
    registry.register(ExportTokenBalancesJob);
    registry
}

/// Runs the ordered jobs over a block range.
pub struct JobScheduler {
    jobs: Vec<Arc<dyn Job>>,
    required: BTreeSet<ItemType>,
}

impl JobScheduler {
    pub fn new(registry: &JobRegistry, required: BTreeSet<ItemType>) -> Result<Self, JobError> {
        let jobs = resolve_jobs(registry.jobs(), &required)?;
        tracing::info!(
            "Scheduled jobs: {}",
            jobs.iter().map(|j| j.name()).collect::<Vec<_>>().join(" -> ")
        );
        Ok(Self { jobs, required })
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    pub fn required_types(&self) -> &BTreeSet<ItemType> {
        &self.required
    }

    /// Run every job in order; the first failing job aborts the batch.
    pub async fn run_jobs(&self, ctx: &JobContext, range: BlockRange) -> Result<ItemBuffer, (String, JobError)> {
        let mut buffer = ItemBuffer::new();
        for job in &self.jobs {
            let started = std::time::Instant::now();
            job.run(ctx, range, &mut buffer)
                .await
                .map_err(|e| (job.name().to_string(), e))?;
            tracing::debug!("Job {} finished {} in {:?}", job.name(), range, started.elapsed());
        }
        Ok(buffer)
    }

    /// Let every job keep what it learned from the last successful batch.
    pub fn commit(&self) {
        for job in &self.jobs {
            job.commit();
        }
    }

    /// Drain the required item types from the buffer in job order.
    pub fn collect_exports(&self, buffer: &mut ItemBuffer) -> Vec<Item> {
        let mut items = Vec::new();
        for job in &self.jobs {
            for item_type in job.output_types() {
                if self.required.contains(item_type) {
                    items.extend(buffer.take(*item_type));
                }
            }
        }
        items
    }
}

/// Select the producers of `required` and their transitive dependencies,
/// then order them topologically with registration order as tie-break.
fn resolve_jobs(
    registered: &[Arc<dyn Job>],
    required: &BTreeSet<ItemType>,
) -> Result<Vec<Arc<dyn Job>>, JobError> {
    let producers_of = |item_type: ItemType| -> Vec<usize> {
        registered
            .iter()
            .enumerate()
            .filter(|(_, j)| j.output_types().contains(&item_type))
            .map(|(i, _)| i)
            .collect()
    };

    let mut selected: BTreeSet<usize> = BTreeSet::new();
    let mut queue: Vec<usize> = Vec::new();
    for item_type in required {
        let producers = producers_of(*item_type);
        if producers.is_empty() {
            return Err(JobError::NoProducer(*item_type));
        }
        queue.extend(producers);
    }

    while let Some(idx) = queue.pop() {
        if !selected.insert(idx) {
            continue;
        }
        let job = &registered[idx];
        for dep in job.dependency_types() {
            let producers = producers_of(*dep);
            if producers.is_empty() {
                return Err(JobError::UnresolvedDependency {
                    job_name: job.name().to_string(),
                    item_type: *dep,
                });
            }
            queue.extend(producers);
        }
    }

    // Kahn's algorithm over the selected jobs
    let depends_on = |consumer: usize, producer: usize| -> bool {
        consumer != producer
            && registered[consumer]
                .dependency_types()
                .iter()
                .any(|dep| registered[producer].output_types().contains(dep))
    };

    let mut ordered: Vec<usize> = Vec::with_capacity(selected.len());
    let mut placed: HashSet<usize> = HashSet::new();
    while ordered.len() < selected.len() {
        let next = selected.iter().copied().find(|&candidate| {
            !placed.contains(&candidate)
                && selected
                    .iter()
                    .all(|&other| placed.contains(&other) || !depends_on(candidate, other))
        });
        match next {
            Some(idx) => {
                placed.insert(idx);
                ordered.push(idx);
            }
            None => {
                let stuck: Vec<&str> = selected
                    .iter()
                    .filter(|i| !placed.contains(i))
                    .map(|&i| registered[i].name())
                    .collect();
                return Err(JobError::DependencyCycle(stuck.join(", ")));
            }
        }
    }

    Ok(ordered.into_iter().map(|i| registered[i].clone()).collect())
}
