//! KV store URL parsing.

use super::backend::KvError;

/// Parsed `scheme://host1,host2/chroot` store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    addresses: Vec<String>,
    chroot: String,
}

impl Endpoint {
    /// Parse a store URL.
    ///
    /// The path becomes the chroot with leading and trailing slashes removed.
    pub fn parse(url: &str) -> Result<Self, KvError> {
        let invalid = |reason: &str| KvError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("malformed scheme"));
        }

        let (hosts, path) = match rest.split_once('/') {
            Some((hosts, path)) => (hosts, path),
            None => (rest, ""),
        };
        let addresses: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if addresses.is_empty() {
            return Err(invalid("no hosts"));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            addresses,
            chroot: path.trim_matches('/').to_string(),
        })
    }

    /// Store flavour.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Store addresses in the order given.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Key prefix every read and write is confined to.
    pub fn chroot(&self) -> &str {
        &self.chroot
    }
}

/// Join key segments with `/`, skipping empty ones.
pub fn join_key(root: &str, key: &str) -> String {
    let root = root.trim_matches('/');
    let key = key.trim_matches('/');
    match (root.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => root.to_string(),
        _ => format!("{root}/{key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_multiple_hosts() {
        let endpoint = Endpoint::parse("consul://10.0.0.1:8500,10.0.0.2:8500/plinth/prod/").unwrap();
        assert_eq!(endpoint.scheme(), "consul");
        assert_eq!(endpoint.addresses(), ["10.0.0.1:8500", "10.0.0.2:8500"]);
        assert_eq!(endpoint.chroot(), "plinth/prod");
    }

    #[test]
    fn test_parse_without_chroot() {
        let endpoint = Endpoint::parse("memory://local").unwrap();
        assert_eq!(endpoint.addresses(), ["local"]);
        assert_eq!(endpoint.chroot(), "");
    }

    #[rstest]
    #[case("127.0.0.1:8500/plinth")]
    #[case("://127.0.0.1:8500")]
    #[case("consul:///plinth")]
    #[case("con sul://127.0.0.1")]
    fn test_parse_rejects(#[case] url: &str) {
        assert!(matches!(Endpoint::parse(url), Err(KvError::InvalidUrl { .. })));
    }

    #[rstest]
    #[case("plinth", "nodes", "plinth/nodes")]
    #[case("", "nodes", "nodes")]
    #[case("plinth/", "/nodes/a", "plinth/nodes/a")]
    #[case("plinth", "", "plinth")]
    fn test_join_key(#[case] root: &str, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(join_key(root, key), expected);
    }
}
