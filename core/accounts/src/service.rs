//! Account service: registration, login, lockout, sessions.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use cipherchat_common::{Error, Result, UserId};
use cipherchat_crypto::{generate_secure_token, IdentityPublicKey, IdentitySecretKey, KdfParams, Keypair};
use cipherchat_keyring::LockedIdentity;
use cipherchat_store::{
    AuditEvent, AuditRecord, ChatStore, SessionRecord, UserRecord,
};

/// How long issued sessions stay valid.
pub const SESSION_TTL_HOURS: i64 = 24;

/// A logged-in user with their unsealed identity secret.
///
/// The secret lives only in memory and is zeroized when this value drops;
/// persisted copies exist solely as the password-wrapped blob.
pub struct AuthenticatedUser {
    /// The user's directory record as of login.
    pub user: UserRecord,
    /// The active session.
    pub session: SessionRecord,
    secret: IdentitySecretKey,
    public: IdentityPublicKey,
}

impl AuthenticatedUser {
    /// The user's id.
    pub fn id(&self) -> UserId {
        self.user.id
    }

    /// The user's username.
    pub fn username(&self) -> &str {
        &self.user.username
    }

    /// The unsealed identity secret.
    pub fn secret(&self) -> &IdentitySecretKey {
        &self.secret
    }

    /// The identity public key.
    pub fn public_key(&self) -> &IdentityPublicKey {
        &self.public
    }
}

impl std::fmt::Debug for AuthenticatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AuthenticatedUser {{ username: {:?}, secret: [REDACTED] }}",
            self.user.username
        )
    }
}

/// Registration, authentication, and account security operations.
pub struct AccountService {
    store: Arc<dyn ChatStore>,
    kdf_params: KdfParams,
}

impl AccountService {
    /// Create a service over a store.
    pub fn new(store: Arc<dyn ChatStore>, kdf_params: KdfParams) -> Self {
        Self { store, kdf_params }
    }

    /// The KDF parameters used for password wrapping.
    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf_params
    }

    /// Register a new user.
    ///
    /// # Postconditions
    /// - An X25519 identity keypair is generated
    /// - The secret is sealed under the password; only the wrapped blob
    ///   and the public key are stored
    ///
    /// # Errors
    /// - `InvalidInput` on empty username or password
    /// - `AlreadyExists` if the username is taken
    pub async fn register(&self, username: &str, password: &str) -> Result<UserRecord> {
        if username.trim().is_empty() {
            return Err(Error::InvalidInput("Username cannot be empty".to_string()));
        }
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }

        let pair = Keypair::generate();
        let locked = LockedIdentity::seal(&pair.secret, password.as_bytes(), &self.kdf_params)?;

        let user = UserRecord::new(
            username,
            pair.public.to_base64(),
            locked.blob(),
            cipherchat_keyring::manager::KEY_VERSION,
        );
        self.store.create_user(user.clone()).await?;

        self.store
            .append_audit(AuditRecord::new(
                user.id,
                AuditEvent::Login,
                serde_json::json!({"action": "registration"}),
            ))
            .await?;

        info!(username = %user.username, "Registered user with fresh identity keys");
        Ok(user)
    }

    /// Authenticate a user and unseal their identity.
    ///
    /// # Postconditions
    /// - On success the failure counter resets, an audit entry is written,
    ///   and an active session is issued
    /// - On a wrong password the failure counter advances; the fifth
    ///   consecutive failure locks the account for thirty minutes
    ///
    /// # Errors
    /// - `Locked` while a lockout is standing
    /// - `NotPermitted` on bad credentials (unknown users get the same
    ///   error as wrong passwords)
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthenticatedUser> {
        let mut user = match self.store.user_by_username(username).await {
            Ok(user) => user,
            Err(Error::NotFound(_)) => {
                return Err(Error::NotPermitted("Invalid credentials".to_string()));
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();

        if user.is_locked {
            if user.lock_expired(now) {
                user.reset_failed_logins();
                self.store.update_user(&user).await?;
                self.store
                    .append_audit(AuditRecord::new(
                        user.id,
                        AuditEvent::AccountUnlocked,
                        serde_json::json!({"reason": "lockout expired"}),
                    ))
                    .await?;
            } else {
                return Err(Error::Locked(format!(
                    "Account locked until {}",
                    user.locked_until
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string())
                )));
            }
        }

        let locked = LockedIdentity::from_blob(&user.locked_identity);
        let secret = match locked.unseal(password.as_bytes(), &self.kdf_params) {
            Ok(secret) => secret,
            Err(_) => {
                let locked_now = user.record_failed_login(now);
                self.store.update_user(&user).await?;
                self.store
                    .append_audit(AuditRecord::new(
                        user.id,
                        AuditEvent::FailedLogin,
                        serde_json::json!({"attempts": user.failed_login_attempts}),
                    ))
                    .await?;

                if locked_now {
                    warn!(username = %user.username, "Account locked after repeated failures");
                    self.store
                        .append_audit(AuditRecord::new(
                            user.id,
                            AuditEvent::AccountLocked,
                            serde_json::json!({"attempts": user.failed_login_attempts}),
                        ))
                        .await?;
                }

                return Err(Error::NotPermitted("Invalid credentials".to_string()));
            }
        };

        if user.failed_login_attempts > 0 {
            user.reset_failed_logins();
            self.store.update_user(&user).await?;
        }

        let session = SessionRecord::new(
            user.id,
            generate_secure_token(32),
            now + Duration::hours(SESSION_TTL_HOURS),
        );
        self.store.create_session(session.clone()).await?;

        self.store
            .append_audit(AuditRecord::new(
                user.id,
                AuditEvent::Login,
                serde_json::json!({}),
            ))
            .await?;

        info!(username = %user.username, "Login succeeded");

        let public = secret.public_key();
        Ok(AuthenticatedUser {
            user,
            session,
            secret,
            public,
        })
    }

    /// End a session.
    pub async fn logout(&self, auth: &AuthenticatedUser) -> Result<()> {
        let mut session = auth.session.clone();
        session.is_active = false;
        session.last_activity = Utc::now();
        self.store.update_session(&session).await?;

        self.store
            .append_audit(AuditRecord::new(
                auth.id(),
                AuditEvent::Logout,
                serde_json::json!({}),
            ))
            .await?;

        info!(username = %auth.username(), "Logged out");
        Ok(())
    }

    /// Change a user's password, re-wrapping their identity secret.
    ///
    /// The identity keypair itself does not change, so the public key the
    /// directory serves stays stable.
    ///
    /// # Errors
    /// - `NotPermitted` if the old password is wrong
    pub async fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::InvalidInput(
                "New password cannot be empty".to_string(),
            ));
        }

        let mut user = self.store.user_by_username(username).await?;

        let locked = LockedIdentity::from_blob(&user.locked_identity);
        let secret = locked
            .unseal(old_password.as_bytes(), &self.kdf_params)
            .map_err(|_| Error::NotPermitted("Invalid credentials".to_string()))?;

        let resealed = LockedIdentity::seal(&secret, new_password.as_bytes(), &self.kdf_params)?;
        user.locked_identity = resealed.blob().to_string();
        self.store.update_user(&user).await?;

        self.store
            .append_audit(AuditRecord::new(
                user.id,
                AuditEvent::PasswordChange,
                serde_json::json!({}),
            ))
            .await?;

        info!(username = %user.username, "Password changed, identity re-wrapped");
        Ok(())
    }

    /// Look up a user's public key (the directory endpoint).
    ///
    /// Returns the base64 public key and its version.
    pub async fn public_key(&self, user_id: UserId) -> Result<(String, u32)> {
        let user = self.store.user(user_id).await?;
        Ok((user.public_key, user.key_version))
    }
}
