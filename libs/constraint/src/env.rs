//! Flat environments and `${...}` interpolation.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

/// Flat key/value environment.
///
/// Ordered so that hashing and constraint iteration are deterministic.
pub type FlatMap = BTreeMap<String, String>;

static REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z0-9_/\-.|]+)\}").expect("invalid interpolation pattern")
});

/// Interpolate `${name}` references in `source` against `envs`.
///
/// Environments are consulted in order and the first hit wins. A reference
/// may declare a default after `|`; references that resolve nowhere and
/// carry no default are left untouched.
pub fn interpolate(source: &str, envs: &[&FlatMap]) -> String {
    REF_RE
        .replace_all(source, |caps: &Captures<'_>| {
            let inner = &caps[1];
            let (name, default) = match inner.split_once('|') {
                Some((name, default)) => (name, Some(default)),
                None => (inner, None),
            };
            envs.iter()
                .find_map(|env| env.get(name).cloned())
                .or_else(|| default.map(str::to_string))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Names referenced by `source`, in order of appearance.
///
/// Defaults are kept as part of the name (`meta.zone|eu`).
pub fn extract_refs(source: &str) -> Vec<String> {
    REF_RE
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Merge maps left to right; later maps override earlier ones.
pub fn merge_maps<'a, I>(maps: I) -> FlatMap
where
    I: IntoIterator<Item = &'a FlatMap>,
{
    let mut res = FlatMap::new();
    for map in maps {
        res.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    res
}

/// Return a copy of `map` with its own JSON encoding stored under `key`.
pub fn with_json(map: &FlatMap, key: &str) -> FlatMap {
    let mut res = map.clone();
    let encoded = serde_json::to_string(map).unwrap_or_default();
    res.insert(key.to_string(), encoded);
    res
}

/// Stable content hash of a flat map.
///
/// Entries are length-prefixed so that `{"a": "bc"}` and `{"ab": "c"}`
/// never collide structurally.
pub fn content_hash(map: &FlatMap) -> u64 {
    let mut hasher = Sha256::new();
    for (k, v) in map {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v.as_bytes());
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env(pairs: &[(&str, &str)]) -> FlatMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_interpolate_resolves_and_leaves_unknown() {
        let e = env(&[("meta.zone", "eu"), ("agent.id", "node-1")]);
        assert_eq!(
            interpolate("${agent.id} in ${meta.zone} on ${meta.rack}", &[&e]),
            "node-1 in eu on ${meta.rack}"
        );
    }

    #[test]
    fn test_interpolate_default_value() {
        let e = env(&[("meta.zone", "eu")]);
        assert_eq!(interpolate("${meta.zone|us}", &[&e]), "eu");
        assert_eq!(interpolate("${meta.rack|r1}", &[&e]), "r1");
        assert_eq!(interpolate("${meta.rack|}", &[&e]), "");
    }

    #[test]
    fn test_interpolate_env_order() {
        let first = env(&[("a.b", "first")]);
        let second = env(&[("a.b", "second"), ("a.c", "only")]);
        assert_eq!(interpolate("${a.b}/${a.c}", &[&first, &second]), "first/only");
    }

    #[test]
    fn test_extract_refs() {
        assert_eq!(
            extract_refs("${meta.a} and ${agent.drain|false} but not $meta.b"),
            vec!["meta.a".to_string(), "agent.drain|false".to_string()]
        );
    }

    #[test]
    fn test_merge_maps_later_wins() {
        let a = env(&[("k", "1"), ("x", "a")]);
        let b = env(&[("k", "2")]);
        let merged = merge_maps([&a, &b]);
        assert_eq!(merged, env(&[("k", "2"), ("x", "a")]));
    }

    #[test]
    fn test_with_json() {
        let a = env(&[("id", "node-1")]);
        let res = with_json(&a, "__json");
        assert_eq!(res["__json"], r#"{"id":"node-1"}"#);
        assert_eq!(res["id"], "node-1");
    }

    #[test]
    fn test_content_hash_is_stable_and_discriminating() {
        let a = env(&[("a", "bc")]);
        let b = env(&[("ab", "c")]);
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&FlatMap::new()), content_hash(&a));
    }

    proptest! {
        #[test]
        fn prop_interpolate_without_refs_is_identity(s in "[^$]*") {
            let e = env(&[("meta.a", "x")]);
            prop_assert_eq!(interpolate(&s, &[&e]), s);
        }
    }
}
