// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod client;
pub mod error;
pub mod oauth2;
pub mod session;
pub mod types;
pub mod xoauth2;

pub use client::ImapClient;
pub use error::ImapError;
pub use oauth2::{MicrosoftOAuth2Client, MicrosoftOAuth2Config, OAuth2Error, StoredToken, TokenResponse};
pub use session::{AsyncImapOps, AsyncImapSessionWrapper};
pub use types::{
    Address, AppendEmailPayload, Email, Envelope, FlagOperation, Flags, Folder, MailboxInfo,
    ModifyFlagsPayload, SearchCriteria,
};
pub use xoauth2::XOAuth2Authenticator;

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub type ImapSessionFactoryResult = Result<ImapClient<AsyncImapSessionWrapper>, ImapError>;

pub type ImapSessionFactory = Box<dyn Fn() -> BoxFuture<'static, ImapSessionFactoryResult> + Send + Sync>;

#[derive(Clone)]
pub struct CloneableImapSessionFactory {
    factory: Arc<ImapSessionFactory>,
}

impl CloneableImapSessionFactory {
    pub fn new(factory: ImapSessionFactory) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Create a session using the default factory (credentials from .env)
    pub fn create_session(&self) -> BoxFuture<ImapSessionFactoryResult> {
        (self.factory)()
    }

    /// Create a session for a specific account (using the account's own
    /// endpoint and credentials rather than the `.env`-based default).
    pub async fn create_session_for_account(
        &self,
        account: &crate::config::AccountConfig,
        oauth_access_token: Option<&str>,
    ) -> ImapSessionFactoryResult {
        use crate::config::AuthMode;
        use crate::imap::client::ImapClient;
        use log::debug;

        debug!("Creating IMAP session for account: {} ({})", account.username, account.imap.host);

        if account.imap.auth == AuthMode::Oauth2 {
            let Some(token) = oauth_access_token else {
                return Err(ImapError::Auth(
                    "OAuth account has no access token — refresh before connecting".to_string(),
                ));
            };
            let client = ImapClient::<AsyncImapSessionWrapper>::connect_with_xoauth2(
                &account.imap.host,
                account.imap.port,
                &account.username,
                token,
            )
            .await?;
            return Ok(client);
        }

        let client = ImapClient::<AsyncImapSessionWrapper>::connect(
            &account.imap.host,
            account.imap.port,
            &account.username,
            &account.password,
        )
        .await?;

        Ok(client)
    }
}

impl fmt::Debug for CloneableImapSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneableImapSessionFactory")
            .field("factory", &"<function>")
            .finish()
    }
}

