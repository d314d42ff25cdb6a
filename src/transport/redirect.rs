//! Redirect allow-list policy
//!
//! Known hosts are listed as `{host_suffix, allowed_target_suffix}` pairs.
//! Their redirects are held and followed only when the target host belongs to
//! the expected family. Every other host follows same-origin redirects only.

use url::Url;

use super::RedirectMode;
use crate::config::RedirectRule;

/// What to do with one 3xx response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedirectDecision {
    /// Issue the follow-up request
    Follow,
    /// Hand the 3xx response back to the caller
    Return,
    /// Refuse the redirect
    Block,
}

/// Redirect policy built from the configured allow-list
#[derive(Clone, Debug, Default)]
pub struct RedirectPolicy {
    rules: Vec<RedirectRule>,
    max_redirects: usize,
}

impl RedirectPolicy {
    /// Build a policy from allow-list rules and a hop limit
    pub fn new(rules: Vec<RedirectRule>, max_redirects: usize) -> Self {
        Self {
            rules,
            max_redirects,
        }
    }

    /// Maximum redirect hops for one request
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    fn rule_for(&self, url: &Url) -> Option<&RedirectRule> {
        let host = url.host_str()?;
        self.rules
            .iter()
            .find(|rule| host_matches(host, &rule.host_suffix))
    }

    /// Redirect mode a request to `url` should use
    pub fn mode_for(&self, url: &str) -> RedirectMode {
        match Url::parse(url) {
            Ok(parsed) if self.rule_for(&parsed).is_some() => RedirectMode::UserVerified,
            _ => RedirectMode::FollowSameOrigin,
        }
    }

    /// Decide whether a redirect from `from` to `to` is followed
    pub fn decide(&self, mode: RedirectMode, from: &Url, to: &Url) -> RedirectDecision {
        match mode {
            RedirectMode::Manual => RedirectDecision::Return,
            RedirectMode::FollowSameOrigin => {
                if same_origin(from, to) {
                    RedirectDecision::Follow
                } else {
                    RedirectDecision::Block
                }
            }
            RedirectMode::UserVerified => {
                if same_origin(from, to) {
                    return RedirectDecision::Follow;
                }
                let Some(rule) = self.rule_for(from) else {
                    return RedirectDecision::Block;
                };
                let verified = to
                    .host_str()
                    .is_some_and(|host| host_matches(host, &rule.allowed_target_suffix));
                // never downgrade to plain http
                if verified && !(from.scheme() == "https" && to.scheme() == "http") {
                    RedirectDecision::Follow
                } else {
                    RedirectDecision::Block
                }
            }
        }
    }
}

/// Scheme, host and port all equal
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// `host` equals `suffix` or is a subdomain of it. A leading dot in the
/// suffix is ignored.
fn host_matches(host: &str, suffix: &str) -> bool {
    let suffix = suffix.trim_start_matches('.');
    if suffix.is_empty() {
        return false;
    }
    let host = host.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    host == suffix || host.ends_with(&format!(".{}", suffix))
}
