//! Error taxonomy for the scraping core
//!
//! Pool-level errors are the only ones a scrape caller ever sees as `Err`;
//! everything that happens during an individual scrape attempt is normalized
//! into result data so batch runs can continue past per-item failures.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the browser pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No page became available within the acquisition timeout. Retryable.
    #[error("no page became available within {0:?}")]
    Exhausted(Duration),

    /// The pool has been shut down; acquisitions fail fast.
    #[error("browser pool is shutting down")]
    ShuttingDown,

    /// Launching the Chromium process for a pool key failed.
    #[error("failed to launch browser for pool key '{key}': {message}")]
    Launch { key: String, message: String },

    /// Opening a new page inside an existing browser failed.
    #[error("failed to open page for pool key '{key}': {message}")]
    PageCreate { key: String, message: String },
}

/// Errors raised inside a single scrape attempt.
///
/// These never cross the scrape-runner boundary as `Err`; the runner folds
/// them into the outcome's `error` field after the retry budget is spent.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out after {timeout:?} waiting for '{selector}'")]
    SelectorTimeout { selector: String, timeout: Duration },

    #[error("browser command failed: {0}")]
    Automation(String),

    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Missing credentials are a construction-time configuration error and
    /// the one case that is fatal instead of retried.
    #[error("missing credentials: {0} is not set")]
    MissingCredentials(&'static str),
}

impl From<chromiumoxide::error::CdpError> for ScrapeError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        Self::Automation(e.to_string())
    }
}

/// Errors surfaced by the batch processor.
#[derive(Debug, Error)]
pub enum BatchError {
    /// `process` was called while another run was still in flight.
    #[error("a batch run is already in progress")]
    AlreadyRunning,
}
