//! OAuth2 access token refresh collaborator seam. A real implementation
//! would POST to the provider's token endpoint with a stored refresh token;
//! out of scope here (`spec.md` §1).

use async_trait::async_trait;

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns a current access token for XOAUTH2 SASL login, refreshing it
    /// if the cached one has expired.
    async fn access_token(&self, account_name: &str) -> Result<String, String>;
}

/// Returns a fixed token regardless of account, for accounts whose
/// `imap.auth` is `Oauth2` but whose real refresh flow hasn't been wired in.
#[derive(Debug)]
pub struct StaticTokenRefresher {
    token: String,
}

impl StaticTokenRefresher {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenRefresher for StaticTokenRefresher {
    async fn access_token(&self, _account_name: &str) -> Result<String, String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_refresher_returns_configured_token() {
        let refresher = StaticTokenRefresher::new("abc123");
        assert_eq!(refresher.access_token("acct").await.unwrap(), "abc123");
    }
}
