//! In-memory user accounts.
//!
//! Accounts are keyed by id with a secondary index on email. Passwords are
//! stored as Argon2id PHC strings; OAuth-only accounts carry no password and
//! cannot log in with one.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use courier_core::user::{LoginGranted, OauthUser, ROLE_USER, RegisterUser, UserProfile};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

/// Why a directory operation was refused.
///
/// The `Display` text is sent back to the requester as the failure message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Another account already uses this email.
    #[error("Email already registered")]
    EmailTaken,

    /// Unknown email, wrong password, or an account without a password.
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// No account with this id.
    #[error("User not found")]
    NotFound,

    /// The password could not be hashed.
    #[error("Failed to secure password: {0}")]
    Hashing(String),

    /// The blocking task doing password work did not complete.
    #[error("Failed to process request: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone)]
struct Account {
    profile: UserProfile,
    password_hash: Option<String>,
}

#[derive(Debug, Default)]
struct Accounts {
    by_id: HashMap<String, Account>,
    id_by_email: HashMap<String, String>,
}

impl Accounts {
    fn insert(&mut self, account: Account) {
        self.id_by_email
            .insert(normalize_email(&account.profile.email), account.profile.id.clone());
        self.by_id.insert(account.profile.id.clone(), account);
    }

    fn by_email(&self, email: &str) -> Option<&Account> {
        self.id_by_email
            .get(&normalize_email(email))
            .and_then(|id| self.by_id.get(id))
    }
}

/// Thread-safe in-memory account store.
pub struct UserDirectory {
    accounts: RwLock<Accounts>,
    hasher: Argon2<'static>,
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UserDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDirectory")
            .field("accounts", &self.len())
            .finish_non_exhaustive()
    }
}

impl UserDirectory {
    /// Empty directory hashing with Argon2id defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(Argon2::default())
    }

    /// Empty directory with custom Argon2 parameters.
    #[must_use]
    pub fn with_hasher(hasher: Argon2<'static>) -> Self {
        Self {
            accounts: RwLock::new(Accounts::default()),
            hasher,
        }
    }

    /// Number of accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Returns `true` if there are no accounts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a password account.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::EmailTaken`] if the email is in use (compared
    /// case-insensitively), [`DirectoryError::Hashing`] if hashing fails.
    pub fn register(&self, request: RegisterUser) -> Result<UserProfile, DirectoryError> {
        if self.read().by_email(&request.email).is_some() {
            return Err(DirectoryError::EmailTaken);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = self
            .hasher
            .hash_password(request.password.as_bytes(), &salt)
            .map_err(|e| DirectoryError::Hashing(e.to_string()))?
            .to_string();

        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            email: request.email,
            username: request.username,
            role: ROLE_USER.to_string(),
            address: request.address,
            phone: request.phone,
            age: request.age,
            google_id: None,
            avatar: None,
        };

        let mut accounts = self.write();
        // Another registration may have taken the email while hashing.
        if accounts.by_email(&profile.email).is_some() {
            return Err(DirectoryError::EmailTaken);
        }
        accounts.insert(Account {
            profile: profile.clone(),
            password_hash: Some(password_hash),
        });
        Ok(profile)
    }

    /// Check credentials.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::InvalidCredentials`] for an unknown email, a wrong
    /// password, or an OAuth-only account.
    pub fn login(&self, email: &str, password: &str) -> Result<LoginGranted, DirectoryError> {
        let account = self
            .read()
            .by_email(email)
            .cloned()
            .ok_or(DirectoryError::InvalidCredentials)?;

        let stored = account
            .password_hash
            .as_deref()
            .ok_or(DirectoryError::InvalidCredentials)?;
        let parsed = PasswordHash::new(stored).map_err(|_| DirectoryError::InvalidCredentials)?;
        self.hasher
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| DirectoryError::InvalidCredentials)?;

        Ok(LoginGranted {
            id: account.profile.id,
            email: account.profile.email,
            role: account.profile.role,
        })
    }

    /// Look up a profile by id.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::NotFound`] if there is no such account.
    pub fn profile(&self, id: &str) -> Result<UserProfile, DirectoryError> {
        self.read()
            .by_id
            .get(id)
            .map(|account| account.profile.clone())
            .ok_or(DirectoryError::NotFound)
    }

    /// Find the account for an OAuth identity, creating it on first sight.
    ///
    /// An existing account with the same email is linked to the identity:
    /// its `google_id` and `avatar` are filled in if they were empty.
    pub fn find_or_create_oauth(&self, identity: OauthUser) -> UserProfile {
        let mut accounts = self.write();

        if let Some(id) = accounts.id_by_email.get(&normalize_email(&identity.email)).cloned() {
            if let Some(account) = accounts.by_id.get_mut(&id) {
                let profile = &mut account.profile;
                if profile.google_id.is_none() {
                    profile.google_id = Some(identity.google_id);
                }
                if profile.avatar.is_none() {
                    profile.avatar = identity.avatar;
                }
                return profile.clone();
            }
        }

        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            email: identity.email,
            username: identity.username,
            role: ROLE_USER.to_string(),
            address: None,
            phone: None,
            age: None,
            google_id: Some(identity.google_id),
            avatar: identity.avatar,
        };
        accounts.insert(Account {
            profile: profile.clone(),
            password_hash: None,
        });
        profile
    }

    fn read(&self) -> RwLockReadGuard<'_, Accounts> {
        self.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Accounts> {
        self.accounts.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use argon2::{Algorithm, Params, Version};

    /// Directory with cheap hashing parameters for tests.
    pub(crate) fn fast_directory() -> UserDirectory {
        let params = Params::new(1024, 1, 1, None).expect("valid argon2 params");
        UserDirectory::with_hasher(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub(crate) fn ada() -> RegisterUser {
        RegisterUser {
            email: "ada@example.com".into(),
            username: "ada".into(),
            password: "analytical-engine".into(),
            address: None,
            phone: Some("+44 20 0000 0000".into()),
            age: Some(36),
        }
    }

    #[test]
    fn register_then_login() {
        let directory = fast_directory();
        let profile = directory.register(ada()).expect("registered");
        assert_eq!(profile.role, ROLE_USER);
        assert_eq!(profile.phone.as_deref(), Some("+44 20 0000 0000"));

        let granted = directory
            .login("ada@example.com", "analytical-engine")
            .expect("valid credentials");
        assert_eq!(granted.id, profile.id);
    }

    #[test]
    fn duplicate_email_is_refused_case_insensitively() {
        let directory = fast_directory();
        directory.register(ada()).expect("first");

        let mut again = ada();
        again.email = "ADA@example.com".into();
        assert_eq!(directory.register(again), Err(DirectoryError::EmailTaken));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn bad_credentials_look_the_same() {
        let directory = fast_directory();
        directory.register(ada()).expect("registered");

        assert_eq!(
            directory.login("ada@example.com", "wrong"),
            Err(DirectoryError::InvalidCredentials)
        );
        assert_eq!(
            directory.login("nobody@example.com", "analytical-engine"),
            Err(DirectoryError::InvalidCredentials)
        );
    }

    #[test]
    fn unknown_profile() {
        let directory = fast_directory();
        assert_eq!(directory.profile("missing"), Err(DirectoryError::NotFound));
        assert_eq!(DirectoryError::NotFound.to_string(), "User not found");
    }

    #[test]
    fn oauth_creates_once_then_finds() {
        let directory = fast_directory();
        let identity = OauthUser {
            google_id: "g-42".into(),
            email: "grace@example.com".into(),
            username: "grace".into(),
            avatar: None,
        };

        let first = directory.find_or_create_oauth(identity.clone());
        let second = directory.find_or_create_oauth(identity);
        assert_eq!(first.id, second.id);
        assert_eq!(directory.len(), 1);

        assert_eq!(
            directory.login("grace@example.com", ""),
            Err(DirectoryError::InvalidCredentials)
        );
    }

    #[test]
    fn oauth_links_an_existing_password_account() {
        let directory = fast_directory();
        let registered = directory.register(ada()).expect("registered");

        let linked = directory.find_or_create_oauth(OauthUser {
            google_id: "g-7".into(),
            email: "ada@example.com".into(),
            username: "ada-google".into(),
            avatar: Some("https://example.com/ada.png".into()),
        });

        assert_eq!(linked.id, registered.id);
        assert_eq!(linked.username, "ada");
        assert_eq!(linked.google_id.as_deref(), Some("g-7"));
        assert!(directory.login("ada@example.com", "analytical-engine").is_ok());
    }
}
