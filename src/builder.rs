use std::{sync::Arc, time::Duration};

use tokio::runtime::{Builder, Runtime};

use crate::{
    Config, Engine, ProcflowError, Result,
    engine::EngineParts,
    expression::{DefaultExpressionEvaluator, ExpressionEvaluator, IdentityService, JsonSchemaContractValidator, MemIdentityService},
    lock::MemoryLockService,
    scheduler::{JobStore, MemJobStore},
    store::{MemPersistence, Persistence},
    transaction::TransactionService,
};

type PersistenceFactory = Box<dyn Fn(Arc<TransactionService>) -> Arc<dyn Persistence> + Send + Sync>;

#[derive(Default)]
pub struct EngineBuilder {
    config: Config,
    rt: Option<Arc<Runtime>>,
    txs: Option<Arc<TransactionService>>,
    persistence: Option<PersistenceFactory>,
    identity: Option<Arc<dyn IdentityService>>,
    job_store: Option<Arc<dyn JobStore>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn async_worker_thread_number(
        mut self,
        n: u16,
    ) -> Self {
        self.config.async_worker_thread_number = n;
        self
    }

    pub fn runtime(
        mut self,
        runtime: Arc<Runtime>,
    ) -> Self {
        self.rt = Some(runtime);
        self
    }

    /// Transaction coordinator shared with state that outlives this engine, such as a
    /// persistence reused across restarts.
    pub fn transactions(
        mut self,
        txs: Arc<TransactionService>,
    ) -> Self {
        self.txs = Some(txs);
        self
    }

    /// Persistence of every engine entity, created over the engine's transaction
    /// coordinator. Defaults to `MemPersistence`.
    pub fn persistence(
        mut self,
        factory: impl Fn(Arc<TransactionService>) -> Arc<dyn Persistence> + Send + Sync + 'static,
    ) -> Self {
        self.persistence = Some(Box::new(factory));
        self
    }

    /// Identity lookups for user tasks. Defaults to an empty in-memory directory.
    pub fn identity(
        mut self,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn job_store(
        mut self,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        self.job_store = Some(job_store);
        self
    }

    pub fn evaluator(
        mut self,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn build(&self) -> Result<Engine> {
        let runtime = match &self.rt {
            Some(rt) => rt.clone(),
            None => Arc::new(
                Builder::new_multi_thread()
                    .worker_threads(self.config.async_worker_thread_number.max(1).into())
                    .enable_all()
                    .build()
                    .map_err(|e| ProcflowError::Engine(format!("failed to build the tokio runtime: {}", e)))?,
            ),
        };

        let txs = self.txs.clone().unwrap_or_else(|| Arc::new(TransactionService::new()));
        let persistence: Arc<dyn Persistence> = match &self.persistence {
            Some(factory) => factory(txs.clone()),
            None => Arc::new(MemPersistence::new(txs.clone())),
        };
        let locks = Arc::new(MemoryLockService::new(Duration::from_millis(self.config.lock.timeout_ms)));
        let job_store = self.job_store.clone().unwrap_or_else(|| Arc::new(MemJobStore::new()));
        let evaluator = self.evaluator.clone().unwrap_or_else(|| Arc::new(DefaultExpressionEvaluator));
        let identity = self.identity.clone().unwrap_or_else(|| Arc::new(MemIdentityService::new()));

        let engine = Engine::new(
            self.config.clone(),
            EngineParts {
                runtime,
                txs,
                persistence,
                locks,
                job_store,
                evaluator,
                contracts: Arc::new(JsonSchemaContractValidator::default()),
                identity,
            },
        );

        Ok(engine)
    }
}
