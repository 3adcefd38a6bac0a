use base64::{prelude::BASE64_STANDARD, Engine};
use openssl::hash::{hash, MessageDigest};
use tracing::warn;
use url::Url;

use crate::utils::distinct_values;

/// Longest metadata location accepted in the whitelist.
pub const MAX_WHITELIST_URI_LENGTH: usize = 1024;

/// Metadata locations a node is willing to fetch. Matching is exact and
/// case sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataWhitelist {
    locations: Vec<String>,
}

impl MetadataWhitelist {
    /// Parses a `;` separated list. Entries that are not absolute URIs or
    /// exceed [`MAX_WHITELIST_URI_LENGTH`] are dropped.
    pub fn parse(input: &str) -> Self {
        let locations = distinct_values(input)
            .into_iter()
            .filter(|location| {
                if location.chars().count() > MAX_WHITELIST_URI_LENGTH {
                    warn!(length = location.len(), "metadata whitelist entry too long, dropped");
                    return false;
                }
                if let Err(e) = Url::parse(location) {
                    warn!(location = %location, error = %e, "malformed metadata whitelist entry, dropped");
                    return false;
                }
                true
            })
            .collect();
        Self { locations }
    }

    pub fn is_whitelisted(&self, location: &str) -> bool {
        self.locations.iter().any(|candidate| candidate == location)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.locations.iter().map(String::as_str)
    }

    /// Base64 SHA-256 of each location, for audit logs.
    pub fn hashes(&self) -> Vec<String> {
        self.locations
            .iter()
            .filter_map(|location| hash(MessageDigest::sha256(), location.as_bytes()).ok())
            .map(|digest| BASE64_STANDARD.encode(digest))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_whitelist_preserving_case() {
        let whitelist = MetadataWhitelist::parse("http://Europa.eu;mickey://mouse.com");
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.is_whitelisted("http://Europa.eu"));
        assert!(whitelist.is_whitelisted("mickey://mouse.com"));
        assert!(!whitelist.is_whitelisted("http://europa.eu"));
        assert!(!whitelist.is_whitelisted("http://other.eu"));
    }

    #[test]
    fn can_drop_malformed_entries() {
        let too_long = format!("http://{}.eu", "a".repeat(MAX_WHITELIST_URI_LENGTH));
        let whitelist = MetadataWhitelist::parse(&format!("not a uri;{too_long};https://ok.eu;https://ok.eu"));
        assert_eq!(whitelist.iter().collect::<Vec<_>>(), vec!["https://ok.eu"]);
        assert!(MetadataWhitelist::parse("").is_empty());
    }

    #[test]
    fn can_hash_entries() {
        let hashes = MetadataWhitelist::parse("https://ok.eu").hashes();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].len(), 44);
    }
}
