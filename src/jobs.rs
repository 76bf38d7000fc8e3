use crate::analyzer::{BatchItem, BatchOutcome};
use crate::models::ProductId;
use crate::pipeline::{Pipeline, PipelineError};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_BATCH_PRODUCTS: usize = 50;
/// Finished jobs stay queryable this long.
pub const FINISHED_JOB_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    user_id: String,
    product_ids: Vec<ProductId>,
}

#[derive(Clone)]
struct JobRecord {
    user_id: String,
    state: JobState,
    finished_at: Option<Instant>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        results: BTreeMap<ProductId, BatchOutcome>,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&statuses_bg, job.id, JobState::Running).await;
                let state = match analyze_and_store(&pipeline, &job).await {
                    Ok(results) => JobState::Completed { results },
                    Err(err) => JobState::Failed {
                        error: err.detail().to_string(),
                        stage: Some(err.stage().to_string()),
                    },
                };
                set_state(&statuses_bg, job.id, state).await;
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_batch(
        &self,
        user_id: &str,
        product_ids: Vec<ProductId>,
    ) -> Result<Uuid, PipelineError> {
        if product_ids.is_empty() || product_ids.len() > MAX_BATCH_PRODUCTS {
            return Err(PipelineError::invalid_input(
                "enqueue",
                format!("between 1 and {MAX_BATCH_PRODUCTS} product ids are required"),
            ));
        }
        let id = Uuid::new_v4();
        {
            let mut statuses = self.statuses.lock().await;
            prune_finished(&mut statuses, Instant::now(), FINISHED_JOB_TTL);
            statuses.insert(
                id,
                JobRecord {
                    user_id: user_id.to_string(),
                    state: JobState::Queued,
                    finished_at: None,
                },
            );
        }
        let job = Job {
            id,
            user_id: user_id.to_string(),
            product_ids,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(PipelineError::internal("enqueue", "worker not available"));
        }
        Ok(id)
    }

    /// Status of a job owned by `user_id`.
    pub async fn get(&self, user_id: &str, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .get(&id)
            .filter(|record| record.user_id == user_id)
            .map(|record| JobInfo {
                id: id.to_string(),
                state: record.state.clone(),
            })
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    if let Some(record) = statuses.lock().await.get_mut(&id) {
        if matches!(state, JobState::Completed { .. } | JobState::Failed { .. }) {
            record.finished_at = Some(Instant::now());
        }
        record.state = state;
    }
}

fn prune_finished(statuses: &mut HashMap<Uuid, JobRecord>, now: Instant, ttl: Duration) {
    let before = statuses.len();
    statuses.retain(|_, record| {
        record
            .finished_at
            .is_none_or(|finished| now.saturating_duration_since(finished) < ttl)
    });
    let evicted = before - statuses.len();
    if evicted > 0 {
        debug!(target = "inventory.jobs", evicted, "finished_jobs_pruned");
    }
}

async fn analyze_and_store(
    pipeline: &Pipeline,
    job: &Job,
) -> Result<BTreeMap<ProductId, BatchOutcome>, PipelineError> {
    let mut results = BTreeMap::new();
    let mut items = Vec::with_capacity(job.product_ids.len());
    for &product_id in &job.product_ids {
        match pipeline.load_owned(&job.user_id, product_id).await {
            Ok(product) => items.push(BatchItem {
                id: product.id,
                name: product.name,
                description: product.description,
            }),
            Err(err) => {
                results.insert(
                    product_id,
                    BatchOutcome::Failed {
                        error: err.detail().to_string(),
                    },
                );
            }
        }
    }

    for (product_id, outcome) in pipeline.analyzer().analyze_batch(items).await {
        let outcome = match outcome {
            BatchOutcome::Ok { market_analysis } => {
                match pipeline
                    .apply_analysis(&job.user_id, product_id, market_analysis.clone())
                    .await
                {
                    Ok(_) => BatchOutcome::Ok { market_analysis },
                    Err(err) => {
                        warn!(target = "inventory.jobs", job_id = %job.id, product_id, error = %err, "batch_persist_failed");
                        BatchOutcome::Failed {
                            error: err.detail().to_string(),
                        }
                    }
                }
            }
            failed => failed,
        };
        results.insert(product_id, outcome);
    }

    info!(
        target = "inventory.jobs",
        job_id = %job.id,
        products = results.len(),
        "batch_job_finished"
    );
    Ok(results)
}
