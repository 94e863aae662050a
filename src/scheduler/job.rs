use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, TenantId};

/// Behavior of a job. Implementations are stored serialized inside the descriptor.
#[typetag::serde(tag = "type")]
pub trait JobContent: Send + Sync + Debug {
    fn execute(
        &self,
        ctx: &JobContext,
    ) -> Result<()>;
}

/// Engine operations available to job bodies.
pub trait JobEnvironment: Send + Sync {
    fn execute_flow_node(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<()>;

    fn fire_timer(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<()>;

    fn start_process_from_timer(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        start_event_id: &str,
    ) -> Result<()>;

    /// Re-executes flow nodes left in a non-stable state. Returns how many were resumed.
    fn recover(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobDescriptor {
    pub id: u64,
    pub tenant_id: TenantId,
    pub job_name: String,
    pub group_name: String,
    pub content: Value,
    pub disallow_concurrent_execution: bool,
    /// Overrides the scheduler's default retry count.
    pub max_retries: Option<u32>,
}

impl JobDescriptor {
    /// Descriptor in the tenant's group.
    pub fn new(
        tenant_id: TenantId,
        job_name: &str,
        content: &dyn JobContent,
    ) -> Result<Self> {
        Ok(Self {
            id: 0,
            tenant_id,
            job_name: job_name.to_string(),
            group_name: tenant_id.to_string(),
            content: serde_json::to_value(content)?,
            disallow_concurrent_execution: false,
            max_retries: None,
        })
    }

    pub fn group(
        mut self,
        group_name: &str,
    ) -> Self {
        self.group_name = group_name.to_string();
        self
    }

    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.disallow_concurrent_execution = true;
        self
    }

    pub fn max_retries(
        mut self,
        retries: u32,
    ) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn content(&self) -> Result<Box<dyn JobContent>> {
        Ok(serde_json::from_value(self.content.clone())?)
    }
}

/// Execution context handed to [`JobContent::execute`].
pub struct JobContext {
    pub descriptor: JobDescriptor,
    pub fire_time: DateTime<Utc>,
    pub environment: Arc<dyn JobEnvironment>,
}
