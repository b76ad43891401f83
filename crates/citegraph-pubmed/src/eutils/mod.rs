pub mod client;
pub mod parser;
pub mod types;

pub use client::EutilsClient;
pub use types::{ArticleId, RawAuthor, RawRecord};
