// Library interface for quizlet_scraper
// The binary and the integration tests drive everything through these modules

pub mod atomic_file;
pub mod auth;
pub mod browser;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod export;
pub mod extract;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod session_store;
pub mod set_scraper;
pub mod testing;
pub mod throttle;

pub use error::{Error, ExitStatus, Result};
