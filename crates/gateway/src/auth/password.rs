//! Fixed user/password table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{AuthMethod, AuthRequest, Authenticator, Credentials, Principal};
use crate::error::AuthenticationError;

/// Checks passwords against a table held as SHA-256 digests.
///
/// Digests are compared in constant time.
pub struct PasswordList {
    digests: BTreeMap<String, [u8; 32]>,
}

fn digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl PasswordList {
    pub fn new(passwords: &BTreeMap<String, String>) -> Self {
        let digests = passwords
            .iter()
            .map(|(user, password)| (user.clone(), digest(password)))
            .collect();
        Self { digests }
    }
}

#[async_trait]
impl Authenticator for PasswordList {
    fn methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::Password]
    }

    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Principal, AuthenticationError> {
        let Credentials::Password(password) = request.credentials else {
            return Err(AuthenticationError::MethodNotAllowed(
                request.credentials.method().as_str(),
            ));
        };
        let offered = digest(password);
        match self.digests.get(request.user) {
            Some(expected) if constant_time_eq(expected, &offered) => {
                Ok(Principal::new(request.user, AuthMethod::Password))
            }
            Some(_) => Err(AuthenticationError::BadPassword(request.user.to_string())),
            None => Err(AuthenticationError::UnknownUser(request.user.to_string())),
        }
    }
}
