use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_crypto::secrets::{generate_refresh_secret, hash_secret};
use parley_db::Database;
pub use parley_db::sessions::ClientInfo;
use parley_types::User;
use parley_types::api::{Claims, SessionInfo};

use crate::error::{Error, Result};
use crate::store::blocking;

/// Access + refresh pair handed to a client after login or rotation.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub user: User,
    pub access_token: String,
    /// Plaintext refresh secret. Only its digest is stored.
    pub refresh_token: String,
}

/// A refresh credential that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedRefresh {
    pub user_id: Uuid,
    pub session: SessionInfo,
}

/// Issues and verifies access credentials (HS256 JWTs, verified without the
/// store) and manages rotating opaque refresh credentials.
#[derive(Clone)]
pub struct TokenService {
    db: Arc<Database>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(db: Arc<Database>, secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            db,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access(&self, user: &User) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            iat: now.timestamp() as usize,
            exp: (now + self.access_ttl).timestamp().max(0) as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("signing access credential: {e}")))
    }

    /// Signature and expiry check only. Never touches the store, so the
    /// realtime handshake keeps working while SQLite is slow or down.
    pub fn verify_access(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Rejected access credential: {}", e);
                Error::reauthenticate()
            })
    }

    pub async fn create_refresh(&self, user_id: Uuid, client: ClientInfo) -> Result<String> {
        let secret = generate_refresh_secret();
        let digest = hash_secret(&secret);
        let now = Utc::now();
        let expires_at = now + self.refresh_ttl;
        blocking(&self.db, move |db| {
            db.insert_refresh_token(user_id, &digest, expires_at, &client, now)
        })
        .await?;
        Ok(secret)
    }

    /// `None` for unknown, revoked and expired secrets alike.
    pub async fn verify_refresh(&self, secret: &str) -> Result<Option<VerifiedRefresh>> {
        let digest = hash_secret(secret);
        let row = blocking(&self.db, move |db| db.find_active_refresh(&digest, Utc::now())).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(VerifiedRefresh {
            user_id: row.user_id()?,
            session: row.to_info()?,
        }))
    }

    /// Revoke `secret` and mint a new pair. The revoke is a single
    /// compare-and-set in the store, so a replayed or raced secret fails
    /// closed with `Unauthenticated`.
    pub async fn rotate(&self, secret: &str, client: ClientInfo) -> Result<IssuedTokens> {
        let old_digest = hash_secret(secret);
        let new_secret = generate_refresh_secret();
        let new_digest = hash_secret(&new_secret);
        let now = Utc::now();
        let expires_at = now + self.refresh_ttl;

        let rotated = blocking(&self.db, move |db| {
            db.rotate_refresh_token(&old_digest, &new_digest, expires_at, &client, now)
        })
        .await?;

        let Some((row, _session)) = rotated else {
            warn!("Refresh credential rejected (unknown, expired or already rotated)");
            return Err(Error::reauthenticate());
        };
        let user = row.to_model()?;
        info!("Rotated refresh credential for {}", user.id);

        Ok(IssuedTokens {
            access_token: self.issue_access(&user)?,
            refresh_token: new_secret,
            user,
        })
    }

    /// Idempotent; unknown secrets are not an error.
    pub async fn revoke(&self, secret: &str) -> Result<()> {
        let digest = hash_secret(secret);
        let hit = blocking(&self.db, move |db| db.revoke_refresh_token(&digest, Utc::now())).await?;
        if hit {
            debug!("Refresh credential revoked");
        }
        Ok(())
    }

    pub async fn sessions(&self, user_id: Uuid) -> Result<Vec<SessionInfo>> {
        let rows = blocking(&self.db, move |db| db.active_sessions_for_user(user_id, Utc::now())).await?;
        rows.iter()
            .map(|row| row.to_info().map_err(Error::from))
            .collect()
    }

    /// Login path: access credential plus a fresh refresh credential.
    pub async fn issue_pair(&self, user: User, client: ClientInfo) -> Result<IssuedTokens> {
        let access_token = self.issue_access(&user)?;
        let refresh_token = self.create_refresh(user.id, client).await?;
        Ok(IssuedTokens {
            user,
            access_token,
            refresh_token,
        })
    }
}
