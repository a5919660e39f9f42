//! Per-tenant policy. Both state machines consult this read-only model:
//! password composition rules, which second factors a tenant mandates,
//! federated domains that bypass local credentials, and whether unknown
//! users may self-register.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use vigil_proto::v1::PasswordPolicyView;
use vigil_proto::PasswordFeedback;

use crate::prelude::*;

/// Which second factors a tenant mandates at authentication time. Factors a
/// user has enrolled are always challenged even when not mandated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MfaPolicy {
    #[serde(default)]
    pub require_totp: bool,
    #[serde(default)]
    pub require_security_key: bool,
}

/// Password composition policy. Checked server side on every set and
/// rotation; clients may pre-validate from the [`PasswordPolicyView`]
/// projection but that is advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPasswordConfig {
    pub min_length: usize,
    pub max_length: usize,
    #[serde(default)]
    pub require_digit: bool,
    #[serde(default)]
    pub require_lowercase: bool,
    #[serde(default)]
    pub require_uppercase: bool,
    #[serde(default)]
    pub require_special: bool,
    pub allowed_special: String,
    pub max_repeat_run: usize,
    /// Values rejected outright, compared case-insensitively.
    #[serde(default)]
    pub badlist: HashSet<String>,
}

impl Default for TenantPasswordConfig {
    fn default() -> Self {
        TenantPasswordConfig {
            min_length: 10,
            max_length: 128,
            require_digit: false,
            require_lowercase: false,
            require_uppercase: false,
            require_special: false,
            allowed_special: "!@#$%^&*()-_=+[]{};:,.?/".to_string(),
            max_repeat_run: 4,
            badlist: HashSet::new(),
        }
    }
}

impl TenantPasswordConfig {
    /// Apply the composition rules in their fixed order. The first rule to
    /// fail determines the feedback - callers surface exactly one sub-code.
    pub fn check_password(&self, cleartext: &str) -> Result<(), PasswordFeedback> {
        let len = cleartext.chars().count();
        if len < self.min_length {
            return Err(PasswordFeedback::TooShort(self.min_length));
        }
        if len > self.max_length {
            return Err(PasswordFeedback::TooLong(self.max_length));
        }

        if cleartext != cleartext.trim() {
            return Err(PasswordFeedback::LeadingOrTrailingWhitespace);
        }

        if cleartext
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !self.allowed_special.contains(c))
        {
            return Err(PasswordFeedback::InvalidCharacter);
        }

        if self.require_digit && !cleartext.chars().any(|c| c.is_ascii_digit()) {
            return Err(PasswordFeedback::MissingDigit);
        }

        // Case rules only apply when the value contains letters at all.
        if cleartext.chars().any(|c| c.is_ascii_alphabetic()) {
            if self.require_lowercase && !cleartext.chars().any(|c| c.is_ascii_lowercase()) {
                return Err(PasswordFeedback::MissingLowercase);
            }
            if self.require_uppercase && !cleartext.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(PasswordFeedback::MissingUppercase);
            }
        }

        if self.require_special && !cleartext.chars().any(|c| self.allowed_special.contains(c)) {
            return Err(PasswordFeedback::MissingSpecialCharacter);
        }

        let mut run = 0;
        let mut last = None;
        for c in cleartext.chars() {
            if last == Some(c) {
                run += 1;
            } else {
                run = 1;
                last = Some(c);
            }
            if run > self.max_repeat_run {
                return Err(PasswordFeedback::RepeatingCharacters(self.max_repeat_run));
            }
        }

        if self.badlist.contains(&cleartext.to_lowercase()) {
            return Err(PasswordFeedback::BadListed);
        }

        Ok(())
    }

    pub fn to_view(&self) -> PasswordPolicyView {
        PasswordPolicyView {
            min_length: self.min_length,
            max_length: self.max_length,
            require_digit: self.require_digit,
            require_lowercase: self.require_lowercase,
            require_uppercase: self.require_uppercase,
            require_special: self.require_special,
            allowed_special: self.allowed_special.clone(),
            max_repeat_run: self.max_repeat_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base of this tenant's issuer for discovery documents.
    pub issuer: Url,
    /// Where a completed pre-authenticated login returns to.
    pub application_uri: Url,
    /// Where a completed portal login lands.
    pub portal_uri: Url,
    #[serde(default)]
    pub allow_self_registration: bool,
    /// Email domains handed off to a federated provider instead of local
    /// credentials.
    #[serde(default)]
    pub federated_domains: Vec<String>,
    pub federated_authorization_uri: Option<Url>,
    #[serde(default)]
    pub password: TenantPasswordConfig,
    #[serde(default)]
    pub mfa: MfaPolicy,
}

fn default_true() -> bool {
    true
}

impl Tenant {
    /// The federated handoff uri for this username, when its mail domain is
    /// delegated.
    pub fn federated_uri_for(&self, username: &str) -> Option<&Url> {
        let domain = username.rsplit_once('@').map(|(_, d)| d)?;
        if self
            .federated_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
        {
            self.federated_authorization_uri.as_ref()
        } else {
            None
        }
    }
}

/// Read-only view over the configured tenants. The state machines never
/// mutate tenant policy.
pub trait TenantPolicyResolver: Send + Sync {
    fn resolve(&self, tenant_id: Uuid) -> Option<Arc<Tenant>>;

    fn tenants(&self) -> Vec<Arc<Tenant>>;
}

/// Resolver over a fixed set loaded at startup from the server config.
#[derive(Debug, Default)]
pub struct StaticTenantResolver {
    inner: HashMap<Uuid, Arc<Tenant>>,
}

impl StaticTenantResolver {
    pub fn new<I>(tenants: I) -> Self
    where
        I: IntoIterator<Item = Tenant>,
    {
        let inner = tenants
            .into_iter()
            .map(|t| (t.tenant_id, Arc::new(t)))
            .collect();
        StaticTenantResolver { inner }
    }
}

impl TenantPolicyResolver for StaticTenantResolver {
    fn resolve(&self, tenant_id: Uuid) -> Option<Arc<Tenant>> {
        self.inner.get(&tenant_id).cloned()
    }

    fn tenants(&self) -> Vec<Arc<Tenant>> {
        self.inner.values().cloned().collect()
    }
}

/// A permissive tenant for state-machine tests in other modules.
#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) fn test_tenant() -> Tenant {
    Tenant {
        tenant_id: Uuid::new_v4(),
        name: "Example".to_string(),
        enabled: true,
        issuer: Url::parse("https://idm.example.com").expect("invalid uri"),
        application_uri: Url::parse("https://app.example.com/return").expect("invalid uri"),
        portal_uri: Url::parse("https://idm.example.com/portal").expect("invalid uri"),
        allow_self_registration: false,
        federated_domains: Vec::new(),
        federated_authorization_uri: None,
        password: TenantPasswordConfig::default(),
        mfa: MfaPolicy::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_config() -> TenantPasswordConfig {
        TenantPasswordConfig {
            min_length: 10,
            max_length: 32,
            require_digit: true,
            require_lowercase: true,
            require_uppercase: true,
            require_special: true,
            allowed_special: "!@#$%".to_string(),
            max_repeat_run: 3,
            badlist: ["list@no3IBTyqHx0".to_lowercase()].into_iter().collect(),
        }
    }

    #[test]
    fn test_password_rules_first_failure_wins() {
        let cfg = strict_config();

        assert_eq!(
            cfg.check_password("short"),
            Err(PasswordFeedback::TooShort(10))
        );
        assert_eq!(
            cfg.check_password(&"aB3!".repeat(16)),
            Err(PasswordFeedback::TooLong(32))
        );
        // Whitespace is reported before the missing digit.
        assert_eq!(
            cfg.check_password(" abcdeFGHI! "),
            Err(PasswordFeedback::LeadingOrTrailingWhitespace)
        );
        // An out-of-set codepoint is reported before class requirements.
        assert_eq!(
            cfg.check_password("abcdeFGHI€3"),
            Err(PasswordFeedback::InvalidCharacter)
        );
        assert_eq!(
            cfg.check_password("abcdeFGHIj!"),
            Err(PasswordFeedback::MissingDigit)
        );
        assert_eq!(
            cfg.check_password("ABCDEFGHI3!"),
            Err(PasswordFeedback::MissingLowercase)
        );
        assert_eq!(
            cfg.check_password("abcdefghi3!"),
            Err(PasswordFeedback::MissingUppercase)
        );
        assert_eq!(
            cfg.check_password("abcdeFGHI33"),
            Err(PasswordFeedback::MissingSpecialCharacter)
        );
        assert_eq!(
            cfg.check_password("aaaaBCDEF3!"),
            Err(PasswordFeedback::RepeatingCharacters(3))
        );
        assert_eq!(
            cfg.check_password("list@No3IBTyqHx0"),
            Err(PasswordFeedback::BadListed)
        );
        assert_eq!(cfg.check_password("aaaBCDEF33!"), Ok(()));
    }

    #[test]
    fn test_password_case_rules_need_letters() {
        let cfg = TenantPasswordConfig {
            min_length: 6,
            require_lowercase: true,
            require_uppercase: true,
            require_special: false,
            require_digit: false,
            ..TenantPasswordConfig::default()
        };
        // All-digit values skip the case rules entirely.
        assert_eq!(cfg.check_password("314159265358"), Ok(()));
        assert_eq!(
            cfg.check_password("31415926535a"),
            Err(PasswordFeedback::MissingUppercase)
        );
    }

    #[test]
    fn test_federated_domain_match() {
        let mut t = test_tenant();
        t.federated_domains = vec!["corp.example.com".to_string()];
        t.federated_authorization_uri = Some(
            Url::parse("https://idp.example.com/authorize").expect("invalid uri"),
        );

        assert!(t.federated_uri_for("alice@CORP.example.com").is_some());
        assert!(t.federated_uri_for("alice@example.com").is_none());
        assert!(t.federated_uri_for("no-at-sign").is_none());
    }
}
