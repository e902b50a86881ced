//! Narrow trait seams for collaborators that sit outside this crate's scope
//! (`spec.md` §1 Non-goals): virus scanning, text extraction, OAuth2 token
//! refresh. Each module defines the trait the daemon core calls through and
//! a trivial stub implementation so the pipeline runs end to end without a
//! real backend wired in.

pub mod extract;
pub mod oauth;
pub mod virus;

pub use extract::{NullTextExtractor, TextExtractor};
pub use oauth::{StaticTokenRefresher, TokenRefresher};
pub use virus::{NullVirusScanner, ScanVerdict, VirusScanner};
