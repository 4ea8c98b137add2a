use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::jobs::Job;

/// Persistence collaborator. The real application backs this with its local
/// database; failures surface as job FAILED, never as an engine crash.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), DispatchError>;
    async fn update_job(&self, job: &Job) -> Result<(), DispatchError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DispatchError>;
    async fn get_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, DispatchError>;
}

/// In-memory store for tests and the probe binary.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    order: RwLock<Vec<Uuid>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DispatchError::Store(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        self.order.write().await.push(job.id);
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(DispatchError::Store(format!("job {} not found", job.id))),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, DispatchError> {
        let order = self.order.read().await;
        let jobs = self.jobs.read().await;
        Ok(order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| jobs.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobMode;
    use serde_json::json;

    #[tokio::test]
    async fn create_update_get_roundtrip() {
        let store = MemoryJobStore::new();
        let mut job = Job::new("airdrop", JobMode::Distribution, json!({}), 5);
        store.create_job(&job).await.unwrap();

        job.done = 3;
        store.update_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.done, 3);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryJobStore::new();
        let job = Job::new("airdrop", JobMode::Distribution, json!({}), 5);
        store.create_job(&job).await.unwrap();
        assert!(matches!(
            store.create_job(&job).await,
            Err(DispatchError::Store(_))
        ));
    }

    #[tokio::test]
    async fn recent_jobs_newest_first() {
        let store = MemoryJobStore::new();
        let a = Job::new("first", JobMode::Rewards, json!({}), 1);
        let b = Job::new("second", JobMode::Rewards, json!({}), 1);
        store.create_job(&a).await.unwrap();
        store.create_job(&b).await.unwrap();

        let recent = store.get_recent_jobs(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title, "second");
    }
}
