//! # relayq
//!
//! Reliable task dispatch over a durable broker queue.
//!
//! ## Features
//!
//! - **Confirmed Publishing**: Persistent, mandatory publishes that wait for the broker
//! - **Bounded Retries**: Exponential backoff expressed as explicit republishes
//! - **Dead-Lettering**: Exhausted, fatal and malformed messages end up in one place
//! - **Execution Budget**: A watchdog abandons executors that outlive their timeout
//! - **Status Lifecycle**: Every task is persisted as PENDING, STARTED, SUCCESS or FAILURE
//! - **Graceful Shutdown**: Stop taking deliveries, drain in-flight work, then disconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relayq::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let config = RelayConfig::from_env()?;
//!     relayq::logging::init_tracing(&config.logging)?;
//!
//!     let executors = ExecutorRegistry::new().register(
//!         "sales_report",
//!         BlockingExecutor::new(|request: &ExecutionRequest| {
//!             let year = request
//!                 .params
//!                 .get("year")
//!                 .ok_or_else(|| ExecutionError::fatal("missing parameter 'year'"))?;
//!             Ok(OutputDescriptor::new("json", format!("/reports/{year}.json")))
//!         }),
//!     );
//!
//!     let worker = RelayWorker::new(
//!         config,
//!         Arc::new(InMemoryBroker::new()),
//!         Arc::new(InMemoryTaskStore::new()),
//!         Arc::new(executors),
//!     );
//!
//!     worker.run_until_signal().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod store;
pub mod task;
pub mod utils;

pub mod prelude {
    pub use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, InMemoryBroker};
    pub use crate::config::*;
    pub use crate::core::{
        BlockingExecutor, ExecutionError, ExecutionRequest, Executor, ExecutorRegistry,
        FnExecutor, PublishOutcome, RelayWorker, TaskClient, WorkerStats,
    };
    pub use crate::error::{RelayError, RelayResult};
    pub use crate::store::{InMemoryTaskStore, TaskStore};
    pub use crate::task::{
        OutputDescriptor, TaskId, TaskMessage, TaskParams, TaskRecord, TaskRequest, TaskStatus,
    };
    pub use async_trait::async_trait;
}

pub use crate::config::*;
pub use crate::core::{RelayWorker, TaskClient};
pub use crate::error::{RelayError, RelayResult};
pub use crate::task::{OutputDescriptor, TaskId, TaskMessage, TaskRecord, TaskRequest, TaskStatus};
