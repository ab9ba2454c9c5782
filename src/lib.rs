pub mod browse;
pub mod cli;
pub mod config;
pub mod dialog;
pub mod events;
pub mod quotes;
pub mod signature;
pub mod storage;

pub use browse::{Browser, PageSpecifier};
pub use config::{AppConfig, ConfigLoader, ConfigPaths, PathOverrides};
pub use quotes::{Quote, QuoteBook, QuoteError};
