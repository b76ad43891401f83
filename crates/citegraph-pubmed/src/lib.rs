//! PubMed retrieval and the placeholder completion pipeline.

pub mod error;
pub mod eutils;
pub mod http;
pub mod loader;
pub mod pipeline;
pub mod record_parser;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testing;

pub use error::{PubMedError, Result};
pub use eutils::{EutilsClient, RawRecord};
pub use http::{Clock, ManualClock, RateLimitedClient, RateLimiter, SystemClock};
pub use loader::PublicationLoader;
pub use pipeline::{CompletionPipeline, CycleReport, ItemFailure, PipelineOptions, Stage, WorkItem};
pub use scheduler::{Schedule, ScheduledCompletion};
pub use source::RecordSource;
