//! Lumen Core - asynchronous image transform pipeline.
//!
//! Uploaded images are stored, and a processing task is queued on a message
//! broker. A pool of workers consumes tasks, runs the requested operation
//! chain, and persists one artifact per operation kind.
//!
//! # Architecture
//!
//! ```text
//! upload → object store + image row → broker ─┐
//!                                              ├→ worker pool → orchestrator → pipeline
//! status / fetch ← image rows + artifacts ←────┘         (retry, persist, stats)
//! ```
//!
//! Delivery is at-least-once: a message is committed only after its handler
//! succeeds, so a task can run more than once.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lumen_core::{Config, Lumen, OperationKind, OperationParams};
//!
//! #[tokio::main]
//! async fn main() -> lumen_core::Result<()> {
//!     let lumen = Lumen::in_memory(Config::load()?).await?;
//!     let pool = lumen.worker_pool();
//!     tokio::spawn(pool.run(async { let _ = tokio::signal::ctrl_c().await; }));
//!
//!     let bytes = std::fs::read("./image.jpg")?;
//!     let ops = vec![OperationParams::new(OperationKind::Thumbnail).with("size", 150)];
//!     let image = lumen.service().upload_image(bytes, "image.jpg", "image/jpeg", ops).await?;
//!     println!("queued {}", image.id);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod broker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod operations;
pub mod orchestrator;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod storage;
pub mod types;
pub mod worker;

pub use app::Lumen;
pub use broker::{Broker, MemoryBroker, MessageSource, TaskConsumer, TaskHandler, TaskProducer};
pub use config::Config;
pub use discovery::{InputDiscovery, InputFile};
pub use error::{
    BrokerError, ConfigError, LumenError, PipelineError, PipelineResult, Result, ServiceError,
    StorageError, TaskError,
};
pub use orchestrator::{OrchestratorOptions, TaskOrchestrator, TaskOutcome};
pub use pipeline::{ImagePipeline, PipelineOutput, StageOutput};
pub use service::ImageService;
pub use stats::StatsService;
pub use types::{
    DetailedStatistics, Image, ImageFormat, ImageStatus, ImageStatusReport, JobStatus,
    OperationKind, OperationParams, ParamValue, ProcessedImage, ProcessingJob, ProcessingTask,
    Statistics,
};
pub use worker::{ShutdownReport, WorkerPool};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
