use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_crypto::password::{hash_password, verify_password};
use parley_db::Database;
use parley_db::models::NewUser;
use parley_db::sessions::ClientInfo;
use parley_db::users::BOT_USERNAME;
use parley_types::api::{LoginRequest, RegisterRequest};
use parley_types::{Role, User};

use crate::capabilities::{self, CapabilityGate};
use crate::error::{Error, Result};
use crate::store::blocking;
use crate::tokens::{IssuedTokens, TokenService};

const INVALID_CREDENTIALS: &str = "invalid credentials";

/// Registration, login and profile lookup.
#[derive(Clone)]
pub struct Accounts {
    db: Arc<Database>,
    tokens: TokenService,
    gate: CapabilityGate,
}

impl Accounts {
    pub fn new(db: Arc<Database>, tokens: TokenService, gate: CapabilityGate) -> Self {
        Self { db, tokens, gate }
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<User> {
        self.gate.require(capabilities::REGISTRATION)?;

        let username = req.username.trim().to_string();
        let email = req.email.trim().to_lowercase();
        let display_name = req.display_name.trim().to_string();

        let name_len = username.chars().count();
        if !(3..=32).contains(&name_len) {
            return Err(Error::Validation("username must be 3-32 characters".into()));
        }
        if username.eq_ignore_ascii_case(BOT_USERNAME) {
            return Err(Error::Conflict("username or email already taken".into()));
        }
        if !email.contains('@') {
            return Err(Error::Validation("email address is invalid".into()));
        }
        if req.password.chars().count() < 8 {
            return Err(Error::Validation("password must be at least 8 characters".into()));
        }
        if display_name.is_empty() {
            return Err(Error::Validation("display name is required".into()));
        }

        let password = req.password;
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| Error::Internal(format!("hashing task failed: {e}")))?
            .map_err(|e| {
                error!("Password hashing failed: {}", e);
                Error::Internal("password hashing failed".into())
            })?;

        let row = blocking(&self.db, move |db| {
            db.create_user(
                &NewUser {
                    username: &username,
                    email: &email,
                    password_hash: &password_hash,
                    display_name: &display_name,
                    role: Role::User,
                },
                Utc::now(),
            )
        })
        .await?;
        let user = row.to_model()?;
        info!("Registered {} ({})", user.username, user.id);
        Ok(user)
    }

    /// Every failure, including the bot account, reads as "invalid credentials".
    pub async fn login(&self, req: LoginRequest, client: ClientInfo) -> Result<IssuedTokens> {
        let identity = req.identity.trim().to_string();
        let row = blocking(&self.db, move |db| db.get_user_by_identity(&identity)).await?;
        let Some(row) = row else {
            return Err(Error::Unauthenticated(INVALID_CREDENTIALS.into()));
        };

        let user = row.to_model()?;
        if user.role == Role::Bot {
            warn!("Login attempt against the assistant account");
            return Err(Error::Unauthenticated(INVALID_CREDENTIALS.into()));
        }

        let stored = row.password;
        let password = req.password;
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| Error::Internal(format!("verification task failed: {e}")))?;
        if !valid {
            return Err(Error::Unauthenticated(INVALID_CREDENTIALS.into()));
        }

        info!("{} ({}) logged in", user.username, user.id);
        self.tokens.issue_pair(user, client).await
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<User> {
        let row = blocking(&self.db, move |db| db.get_user_by_id(user_id)).await?;
        Ok(row.ok_or(Error::NotFound("user"))?.to_model()?)
    }

    /// Startup hook for the configured administrator. Takes effect on the
    /// account's next login, since roles travel inside access credentials.
    pub async fn promote_admin(&self, username: &str) -> Result<bool> {
        let username = username.trim().to_string();
        let promoted = blocking(&self.db, move |db| db.promote_to_admin(&username)).await?;
        if promoted {
            info!("Granted admin role to configured account");
        }
        Ok(promoted)
    }
}
