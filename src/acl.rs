//! Bypass access-control list.
//!
//! Destinations matched here are dialed directly instead of through a
//! relay server, with no tunnel header and no encryption. The list is
//! loaded once at startup and read-only afterwards.
//!
//! File format: one rule per line. A line that parses as an IPv4
//! address populates the exact-match IP table; anything else is a
//! domain suffix. Blank lines and `#` comments are skipped.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// The bypass tables.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    ipv4: HashSet<Ipv4Addr>,
    domains: Vec<String>,
}

impl Acl {
    /// Load rules from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Acl(format!("{}: {e}", path.display())))?;
        Ok(Self::parse(&content))
    }

    /// Parse rules from text.
    pub fn parse(content: &str) -> Self {
        let mut acl = Acl::default();
        for line in content.lines() {
            let rule = line.split('#').next().unwrap_or("").trim();
            if rule.is_empty() {
                continue;
            }
            match rule.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    acl.ipv4.insert(ip);
                }
                Err(_) => acl.domains.push(rule.to_ascii_lowercase()),
            }
        }
        acl
    }

    /// Exact lookup in the IPv4 table.
    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.ipv4.contains(&ip)
    }

    /// Suffix lookup in the domain table.
    ///
    /// A rule `example.com` matches `example.com` itself and any
    /// subdomain such as `www.example.com`, but not `notexample.com`.
    pub fn contains_domain(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.domains.iter().any(|rule| {
            domain == *rule
                || (domain.len() > rule.len()
                    && domain.ends_with(rule.as_str())
                    && domain.as_bytes()[domain.len() - rule.len() - 1] == b'.')
        })
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.ipv4.len() + self.domains.len()
    }

    /// Whether the list holds no rules.
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_rules() {
        let acl = Acl::parse(
            "# bypass list\n\
             10.0.0.1\n\
             \n\
             example.com  # comment after rule\n\
             Intranet.Corp\n",
        );

        assert_eq!(acl.len(), 3);
        assert!(acl.contains_ip(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!acl.contains_ip(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(acl.contains_domain("intranet.corp"));
    }

    #[test]
    fn test_domain_suffix_matching() {
        let acl = Acl::parse("example.com\n");

        assert!(acl.contains_domain("example.com"));
        assert!(acl.contains_domain("www.example.com"));
        assert!(acl.contains_domain("WWW.EXAMPLE.COM"));
        assert!(!acl.contains_domain("notexample.com"));
        assert!(!acl.contains_domain("example.com.evil.net"));
    }

    #[test]
    fn test_missing_file() {
        assert!(Acl::load("/nonexistent/bypass.acl").is_err());
    }
}
