//! Outbound HTTP, content classification and OCR.
//!
//! This crate provides:
//! - [`rate_limit`] — per-domain jittered delay and concurrency cap
//! - [`fetch`] — polite fetcher with SSRF guard and transient/permanent failure split
//! - [`classify`] — HTML / text PDF / scanned PDF / other, plus text recovery
//! - [`ocr`] — OCR engine seam and the external-command implementation

pub mod classify;
pub mod fetch;
pub mod ocr;
pub mod rate_limit;

pub use classify::{PdfStats, classify, document_text, html_text, pdf_stats, pdf_text};
pub use fetch::{FetchError, FetchedDocument, Fetcher, is_ssrf_target};
pub use ocr::{CommandOcr, OcrEngine};
pub use rate_limit::{DomainPermit, DomainPolicy, DomainRateLimiter};
