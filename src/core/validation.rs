//! Target and request validation.
//!
//! Runs before admission so a rejected request never consumes quota:
//! - Target URL shape, scheme and length
//! - Private/reserved hosts (SSRF protection)
//! - Host denylist patterns
//! - Capability domain allowlist
//! - Enabled task list

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

use crate::domain::TaskType;

/// Validation failures surfaced before any task runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("targetUrl is required")]
    MissingTarget,

    #[error("targetUrl exceeds maximum length of {limit} characters")]
    TargetTooLong { limit: usize },

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    #[error("Only http and https protocols are allowed")]
    UnsupportedScheme(String),

    #[error("URLs with credentials are not allowed")]
    CredentialsInUrl,

    #[error("URLs targeting private/internal networks are not allowed")]
    PrivateHost(String),

    #[error("Target host matches denylist pattern: {pattern}")]
    DenylistedHost { host: String, pattern: String },

    #[error("No task types enabled")]
    EmptyTaskList,

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("No check registered for task type: {0}")]
    UnregisteredTaskType(TaskType),
}

/// A target that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTarget {
    /// Normalised URL handed to checks
    pub url: Url,

    /// Registrable domain used for admission and allowlists
    pub domain: String,
}

/// Limits applied to incoming targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPolicy {
    /// Maximum length of the raw target string (default: 2048)
    #[serde(default = "default_max_url_len")]
    pub max_url_len: usize,

    /// Glob patterns matched against the target domain
    #[serde(default)]
    pub host_denylist: Vec<String>,
}

fn default_max_url_len() -> usize {
    2048
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            max_url_len: default_max_url_len(),
            host_denylist: Vec::new(),
        }
    }
}

impl TargetPolicy {
    /// Parse and check a raw target string
    pub fn validate_target(&self, raw: &str) -> Result<ValidatedTarget, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::MissingTarget);
        }
        if raw.chars().count() > self.max_url_len {
            return Err(ValidationError::TargetTooLong {
                limit: self.max_url_len,
            });
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };

        let url = Url::parse(&with_scheme).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::UnsupportedScheme(url.scheme().to_string()));
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(ValidationError::CredentialsInUrl);
        }

        let host = url
            .host()
            .ok_or_else(|| ValidationError::InvalidUrl("missing host".to_string()))?;

        if is_private_host(&host) {
            return Err(ValidationError::PrivateHost(host.to_string()));
        }

        let domain = normalize_domain(&host.to_string());

        if let Some(pattern) = self.denylist_match(&domain) {
            return Err(ValidationError::DenylistedHost {
                host: domain,
                pattern,
            });
        }

        Ok(ValidatedTarget { url, domain })
    }

    /// First denylist pattern matching `domain`, if any
    pub fn denylist_match(&self, domain: &str) -> Option<String> {
        self.host_denylist
            .iter()
            .find(|p| Pattern::new(p).map(|pat| pat.matches(domain)).unwrap_or(false))
            .cloned()
    }
}

/// Lower-case, drop a trailing dot and a leading `www.`
pub fn normalize_domain(host: &str) -> String {
    let lower = host.trim_end_matches('.').to_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => lower,
    }
}

/// Whether the host points at loopback, private or reserved address space
pub fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_lowercase();
            name == "localhost" || name.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_private_v4(ip),
        Host::Ipv6(ip) => is_private_v6(ip),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        // CGNAT 100.64.0.0/10
        || (a == 100 && (64..=127).contains(&b))
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link local fe80::/10
        || (first & 0xffc0) == 0xfe80
}

/// Check the target domain against a capability allowlist.
///
/// `None` means the capability is unrestricted. A domain is allowed when
/// it equals an entry or is a subdomain of one.
pub fn domain_allowed(domain: &str, allowed: Option<&[String]>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };

    allowed.iter().any(|entry| {
        let entry = normalize_domain(entry);
        domain == entry || domain.ends_with(&format!(".{}", entry))
    })
}

/// Resolve the requested task names into a non-empty set.
///
/// `None` selects every registered task type.
pub fn resolve_task_types(requested: Option<&[String]>) -> Result<BTreeSet<TaskType>, ValidationError> {
    let Some(names) = requested else {
        return Ok(TaskType::ALL.into_iter().collect());
    };

    let mut tasks = BTreeSet::new();
    for name in names {
        let task: TaskType = name
            .parse()
            .map_err(|_| ValidationError::UnknownTaskType(name.clone()))?;
        tasks.insert(task);
    }

    if tasks.is_empty() {
        return Err(ValidationError::EmptyTaskList);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheme_and_domain() {
        let target = TargetPolicy::default().validate_target("WWW.Example.com./pricing").unwrap();
        assert_eq!(target.url.scheme(), "https");
        assert_eq!(target.domain, "example.com");
    }

    #[test]
    fn test_private_hosts_rejected() {
        let policy = TargetPolicy::default();
        for raw in [
            "http://localhost:3000",
            "http://127.0.0.1",
            "http://10.1.2.3",
            "http://172.20.0.1",
            "http://192.168.1.1",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://100.64.0.1",
        ] {
            assert!(
                matches!(policy.validate_target(raw), Err(ValidationError::PrivateHost(_))),
                "{} should be rejected",
                raw
            );
        }

        assert!(policy.validate_target("http://172.32.0.1").is_ok());
        assert!(policy.validate_target("http://100.128.0.1").is_ok());
    }

    #[test]
    fn test_scheme_and_credentials() {
        let policy = TargetPolicy::default();
        assert!(matches!(
            policy.validate_target("ftp://example.com"),
            Err(ValidationError::UnsupportedScheme(_))
        ));
        assert_eq!(
            policy.validate_target("https://user:pw@example.com"),
            Err(ValidationError::CredentialsInUrl)
        );
        assert_eq!(policy.validate_target("  "), Err(ValidationError::MissingTarget));
    }

    #[test]
    fn test_length_limit() {
        let policy = TargetPolicy {
            max_url_len: 30,
            ..Default::default()
        };
        let long = format!("https://example.com/{}", "a".repeat(40));
        assert_eq!(
            policy.validate_target(&long),
            Err(ValidationError::TargetTooLong { limit: 30 })
        );
    }

    #[test]
    fn test_denylist() {
        let policy = TargetPolicy {
            host_denylist: vec!["*.internal.example".to_string(), "gov.*".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            policy.validate_target("https://db.internal.example"),
            Err(ValidationError::DenylistedHost { .. })
        ));
        assert!(policy.validate_target("https://example.com").is_ok());
    }

    #[test]
    fn test_domain_allowlist() {
        let allowed = vec!["example.com".to_string(), "www.shop.io".to_string()];
        assert!(domain_allowed("example.com", Some(allowed.as_slice())));
        assert!(domain_allowed("api.example.com", Some(allowed.as_slice())));
        assert!(domain_allowed("shop.io", Some(allowed.as_slice())));
        assert!(!domain_allowed("notexample.com", Some(allowed.as_slice())));
        assert!(domain_allowed("anything.dev", None));
    }

    #[test]
    fn test_resolve_task_types() {
        assert_eq!(resolve_task_types(None).unwrap().len(), TaskType::ALL.len());

        let names = vec!["ssl".to_string(), "security-headers".to_string()];
        let tasks = resolve_task_types(Some(names.as_slice())).unwrap();
        assert!(tasks.contains(&TaskType::Ssl));
        assert!(tasks.contains(&TaskType::SecurityHeaders));

        assert_eq!(resolve_task_types(Some(Vec::new().as_slice())), Err(ValidationError::EmptyTaskList));
        assert!(matches!(
            resolve_task_types(Some(&["port_scan".to_string()][..])),
            Err(ValidationError::UnknownTaskType(_))
        ));
    }
}
