//! Bounded worker pool for answering many queries at once.
//!
//! Queries are independent, so a batch is a plain `par_iter` over requests
//! on a dedicated rayon pool. The engine is shared by reference; every
//! component it holds is `Sync`.

use anyhow::{Context, Result};
use rayon::prelude::*;

use crate::config::WorkersConfig;
use crate::engine::{QueryRequest, QueryResponse, RagEngine};
use crate::error::RagError;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(config: &WorkersConfig) -> Result<Self> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("trag-worker-{}", i));
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build().context("building query worker pool")?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Answer `requests` concurrently. Results keep the input order.
    pub fn run_queries(
        &self,
        engine: &RagEngine,
        requests: &[QueryRequest],
    ) -> Vec<Result<QueryResponse, RagError>> {
        tracing::debug!(
            queries = requests.len(),
            threads = self.threads(),
            "running query batch"
        );
        self.pool
            .install(|| requests.par_iter().map(|r| engine.query(r)).collect())
    }
}
