//! In-process ledger backend for single-instance deployments and tests.

use super::{
    apply_update, check_transition, ExecutionLedger, JobExecutionRecord, JobFilter, JobStatus,
    LedgerError, LedgerResult, NewJobExecution, StatusUpdate,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

/// Ledger kept in process memory; records are lost on restart
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: RwLock<Vec<JobExecutionRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, oldest first
    pub fn all_records(&self) -> Vec<JobExecutionRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn find_completed(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .find(|record| {
                record.tenant_id == tenant_id
                    && record.job_key == job_key
                    && record.status == JobStatus::Completed
            })
            .cloned())
    }

    async fn find_latest(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .rev()
            .find(|record| record.tenant_id == tenant_id && record.job_key == job_key)
            .cloned())
    }

    async fn get(&self, id: Uuid) -> LedgerResult<Option<JobExecutionRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn create(&self, new: NewJobExecution) -> LedgerResult<JobExecutionRecord> {
        let mut records = self.records.write();
        if new.status == JobStatus::Completed
            && records.iter().any(|record| {
                record.tenant_id == new.tenant_id
                    && record.job_key == new.job_key
                    && record.status == JobStatus::Completed
            })
        {
            return Err(LedgerError::AlreadyCompleted {
                tenant_id: new.tenant_id,
                job_key: new.job_key,
            });
        }

        let record = JobExecutionRecord {
            id: Uuid::new_v4(),
            started_at: (new.status == JobStatus::Processing).then_some(new.created_at),
            completed_at: None,
            error_message: None,
            result_summary: None,
            tenant_id: new.tenant_id,
            job_key: new.job_key,
            job_type: new.job_type,
            status: new.status,
            attempt: new.attempt,
            max_attempts: new.max_attempts,
            actor_user_id: new.actor_user_id,
            request_id: new.request_id,
            broker_job_id: new.broker_job_id,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> LedgerResult<JobExecutionRecord> {
        let mut records = self.records.write();

        let index = records
            .iter()
            .position(|record| record.id == id)
            .ok_or(LedgerError::NotFound { id })?;
        check_transition(&records[index], &update)?;

        if update.status == JobStatus::Completed {
            let (tenant_id, job_key) = (&records[index].tenant_id, &records[index].job_key);
            let already_completed = records.iter().any(|record| {
                record.id != id
                    && &record.tenant_id == tenant_id
                    && &record.job_key == job_key
                    && record.status == JobStatus::Completed
            });
            if already_completed {
                return Err(LedgerError::AlreadyCompleted {
                    tenant_id: tenant_id.clone(),
                    job_key: job_key.clone(),
                });
            }
        }

        let record = &mut records[index];
        apply_update(record, update);
        Ok(record.clone())
    }

    async fn attach_broker_job(&self, id: Uuid, broker_job_id: &str) -> LedgerResult<()> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(LedgerError::NotFound { id })?;
        record.broker_job_id = Some(broker_job_id.to_string());
        Ok(())
    }

    async fn list_recent(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: u32,
    ) -> LedgerResult<Vec<JobExecutionRecord>> {
        let records = self.records.read();
        let mut matching: Vec<JobExecutionRecord> = records
            .iter()
            .filter(|record| record.tenant_id == tenant_id && filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }
}
