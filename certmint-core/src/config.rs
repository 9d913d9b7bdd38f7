//! Authority configuration

use time::{Duration, OffsetDateTime};

use crate::error::{CaError, Result};

/// Root CA common name used when none is given
pub const DEFAULT_COMMON_NAME: &str = "Root CA";

/// Certificates start one hour in the past
pub const DEFAULT_NOT_BEFORE_SECS: i64 = -60 * 60;

/// Certificates stay valid for three years
pub const DEFAULT_NOT_AFTER_SECS: i64 = 3 * 365 * 24 * 60 * 60;

/// Configuration for a [`CertificateAuthority`](crate::CertificateAuthority)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// Common name of the root certificate when it is created
    pub common_name: String,
    /// Optional organization added to root and host subjects
    pub organization: Option<String>,
    /// Start of validity, in seconds relative to issuance
    pub not_before_secs: i64,
    /// End of validity, in seconds relative to issuance
    pub not_after_secs: i64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            common_name: DEFAULT_COMMON_NAME.to_string(),
            organization: None,
            not_before_secs: DEFAULT_NOT_BEFORE_SECS,
            not_after_secs: DEFAULT_NOT_AFTER_SECS,
        }
    }
}

impl AuthorityConfig {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_validity(mut self, not_before_secs: i64, not_after_secs: i64) -> Self {
        self.not_before_secs = not_before_secs;
        self.not_after_secs = not_after_secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::Validation(
                "root common name must not be empty".to_string(),
            ));
        }
        if self.not_after_secs <= self.not_before_secs {
            return Err(CaError::Validation(format!(
                "validity window is empty: not_before={}s, not_after={}s",
                self.not_before_secs, self.not_after_secs
            )));
        }
        Ok(())
    }

    /// Validity window for a certificate issued at `now`
    pub(crate) fn validity_from(&self, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        (
            now + Duration::seconds(self.not_before_secs),
            now + Duration::seconds(self.not_after_secs),
        )
    }
}
