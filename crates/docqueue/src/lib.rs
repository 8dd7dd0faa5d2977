//! Background document processing queue
//!
//! A priority-ordered, persistent work queue with a bounded pool of async
//! workers. Jobs age while they wait so low priorities are never starved,
//! failures are retried with exponential backoff, and every state change is
//! written through a pluggable [`QueueStore`].
//!
//! ```rust,ignore
//! use docqueue::{handler_fn, BackgroundProcessor, FileStore, JobPriority, QueuePersistence, Settings};
//!
//! let settings = Settings::from_env()?;
//! let processor = BackgroundProcessor::new(
//!     settings.processor,
//!     PriorityQueueManager::new(settings.priority),
//!     QueuePersistence::new(FileStore::open("./data")?),
//!     handler_fn(|ctx, progress| async move {
//!         progress.report(0.5, "extracting text");
//!         progress.checkpoint()?;
//!         Ok(None)
//!     }),
//! );
//! processor.start().await?;
//! processor.submit_job("scan.pdf", JobPriority::High, Default::default()).await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod persistence;
pub mod priority;
pub mod processor;
pub mod telemetry;

pub use backend::file::FileStore;
pub use backend::memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use backend::postgres::PostgresStore;
pub use backend::{HistoryRecord, QueueStore};
pub use config::{ConfigError, MonitorThresholds, PriorityConfig, ProcessorConfig, Settings};
pub use error::{JobError, Result};
pub use job::{
    handler_fn, BatchProcessingResult, HandlerResult, Job, JobContext, JobHandler, JobMetadata,
    JobOutcome, JobPriority, JobStatus, ProcessingProgress, ProgressReporter,
};
pub use monitor::{
    AlertLevel, HealthAlert, HealthReport, HealthStatus, PerformanceMetrics, QueueMonitor,
    SummaryReport, Trend,
};
pub use persistence::{DailyCount, PriorityBreakdown, QueuePersistence, QueueStatistics};
pub use priority::{EffectivePriority, PriorityQueueManager};
pub use processor::{BackgroundProcessor, ProcessorStats, ProgressCallback, QueueSnapshot};
