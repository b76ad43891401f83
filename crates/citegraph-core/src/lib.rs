pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod storage;

pub use config::{AppConfig, EutilsConfig, GraphConfig, PipelineConfig, SchedulerConfig};
pub use error::{GraphError, Result};
pub use gateway::{GraphGateway, PlaceholderOutcome};
pub use models::*;

pub use storage::{
    GraphStats, GraphStore, MergeMode, NodePredicate, Properties, Relationship, SqliteGraphStore,
};
