pub mod adapter;
pub mod api;
pub mod checkpoint;
pub mod compile;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod validation;

pub use adapter::EventAdapter;
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use compile::MetricsCompiler;
pub use config::Config;
pub use datasource::{DataSourceError, EventSource, HttpEventSource, MockEventSource};
pub use db::{init_db, Repository};
pub use domain::{Address, CanonicalFill, Decimal, MarketId, Side, SourceTag, TimeMs};
pub use engine::{CategoryAggregator, PnlEngine};
pub use error::AppError;
pub use orchestration::{SyncOrchestrator, SyncSettings};
