//! Virus scanning collaborator seam. A real implementation would shell out
//! to ClamAV or call a scanning API; out of scope here (`spec.md` §1).

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected,
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, bytes: &[u8]) -> ScanVerdict;
}

/// Always reports clean. Used when `global.virus_scan.enabled` is false or
/// no real scanner has been wired in.
#[derive(Debug, Default)]
pub struct NullVirusScanner;

#[async_trait]
impl VirusScanner for NullVirusScanner {
    async fn scan(&self, _bytes: &[u8]) -> ScanVerdict {
        ScanVerdict::Clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_scanner_always_clean() {
        let scanner = NullVirusScanner;
        assert_eq!(scanner.scan(b"anything").await, ScanVerdict::Clean);
    }
}
