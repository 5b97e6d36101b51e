//! HTTP response boundary for Cumulus.
//!
//! Maps core errors onto API error responses and turns prepared downloads
//! into streamed responses. Routing lives with the embedding application.

pub mod download;
pub mod error;

pub use download::{content_disposition_header, download_response};
pub use error::{ApiError, ErrorCode};
