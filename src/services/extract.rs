//! Attachment text extraction collaborator seam. A real implementation
//! would call out to something like Apache Tika; out of scope here
//! (`spec.md` §1).

use async_trait::async_trait;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extracts readable text from an attachment body, truncated by the
    /// caller to `global.extraction.max_extracted_chars`. Returns `None`
    /// when the content type isn't supported.
    async fn extract(&self, content_type: &str, bytes: &[u8]) -> Option<String>;
}

/// Extracts nothing. Used when `global.extraction.enabled` is false or no
/// real extractor has been wired in.
#[derive(Debug, Default)]
pub struct NullTextExtractor;

#[async_trait]
impl TextExtractor for NullTextExtractor {
    async fn extract(&self, _content_type: &str, _bytes: &[u8]) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_extractor_returns_none() {
        let extractor = NullTextExtractor;
        assert!(extractor.extract("application/pdf", b"%PDF").await.is_none());
    }
}
