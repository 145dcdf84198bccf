pub mod book_paths;
pub mod config;
pub mod context;
pub mod cooldown_retry;
pub mod file_cleaner;
pub mod logging;
