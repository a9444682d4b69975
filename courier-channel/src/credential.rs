use chrono::{DateTime, Utc};

/// A bearer token with its expiry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthToken {
    /// The raw token sent in the `Authorization` header.
    pub token: String,
    /// Time after which the token must no longer be used.
    pub expires_on: DateTime<Utc>,
}

impl AuthToken {
    /// Returns `true` if the token has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

/// Supplies tokens for authenticated transmissions.
///
/// Returning `None` means no token is currently available. Transmissions are held back until a
/// token becomes available rather than being sent unauthenticated.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current token.
    fn get_token(&self) -> Option<AuthToken>;
}

/// A credential provider that always hands out the same token until it expires.
#[derive(Clone, Debug)]
pub struct StaticCredential {
    token: AuthToken,
}

impl StaticCredential {
    /// Creates a provider for a fixed token.
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: AuthToken {
                token: token.into(),
                expires_on,
            },
        }
    }
}

impl CredentialProvider for StaticCredential {
    fn get_token(&self) -> Option<AuthToken> {
        (!self.token.is_expired(Utc::now())).then(|| self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn test_static_token() {
        let credential = StaticCredential::new("secret", Utc::now() + TimeDelta::hours(1));
        assert_eq!(credential.get_token().unwrap().token, "secret");
    }

    #[test]
    fn test_expired_token() {
        let credential = StaticCredential::new("secret", Utc::now() - TimeDelta::seconds(1));
        assert_eq!(credential.get_token(), None);
    }
}
