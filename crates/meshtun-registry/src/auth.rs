//! Access token validation
//!
//! The registry only needs a yes/no answer, but the check sits behind a trait
//! so deployments can plug in something other than a static list.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth fail")]
    InvalidToken,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<(), AuthError>;
}

/// Accepts exactly the configured tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<(), AuthError> {
        if self.is_valid(token) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_match_only() {
        let validator = StaticTokenValidator::new(vec!["abcdefg".to_string()]);

        assert!(validator.validate("abcdefg").await.is_ok());
        assert_eq!(
            validator.validate("abcdef").await,
            Err(AuthError::InvalidToken)
        );
        assert!(validator.validate("ABCDEFG").await.is_err());
        assert!(validator.validate(" abcdefg").await.is_err());
        assert!(validator.validate("").await.is_err());
    }

    #[tokio::test]
    async fn test_no_tokens_rejects_everything() {
        let validator = StaticTokenValidator::default();
        assert!(validator.validate("anything").await.is_err());
    }
}
