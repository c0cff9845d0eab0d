//! Content-addressed fingerprints (`CacheKey`) and their diff relation.
//!
//! A [`CacheKey`] canonicalises a set of named, textual input components into
//! a stable 40-hex-character SHA-1 digest. The digest is a pure function of
//! the component `{name -> value}` mapping: insertion order and annotations
//! never affect it.

use std::collections::BTreeMap;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail, eyre};
use derive_more::Display;
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A component value plus optional human-readable context.
///
/// Only [`AnnotatedValue::value`] participates in hashing; `annotation` is
/// round-tripped through JSON but never affects the digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotatedValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub annotation: Option<String>,
}

impl AnnotatedValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), annotation: None }
    }

    pub fn with_annotation(value: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self { value: value.into(), annotation: Some(annotation.into()) }
    }
}

/// One entry in the result of [`CacheKey::diff`].
///
/// `ours`/`theirs` are `None` when the component is absent on that side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub key: String,
    pub ours: Option<AnnotatedValue>,
    pub theirs: Option<AnnotatedValue>,
}

fn type_pattern() -> &'static lazy_regex::Regex {
    regex!(r"^[A-Za-z0-9]{1,32}$")
}

fn hash_pattern() -> &'static lazy_regex::Regex {
    regex!(r"^[0-9a-f]{40}$")
}

/// `^(<type>_<hash>)` — matches the cache-key prefix at the start of a
/// filename, capturing it so callers can recover `type` and `hash` from a
/// marker or output filename.
pub fn filename_prefix_pattern() -> &'static lazy_regex::Regex {
    regex!(r"^([A-Za-z0-9]{1,32}_[0-9a-f]{40})")
}

/// Parse a cache-key prefix (`<type>_<hash>`) out of the start of `filename`.
///
/// Returns `None` if `filename` does not begin with a well-formed prefix.
pub fn parse_filename_prefix(filename: &str) -> Option<(&str, &str)> {
    let caps = filename_prefix_pattern().captures(filename)?;
    let prefix = caps.get(1)?.as_str();
    prefix.split_once('_')
}

/// A content-addressed fingerprint: a type tag, its SHA-1 digest over the
/// canonicalised components, and the components themselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "RawCacheKey", into = "RawCacheKey")]
#[display("{}_{}", r#type, hash_value)]
pub struct CacheKey {
    r#type: String,
    hash_value: String,
    components: BTreeMap<String, AnnotatedValue>,
}

impl CacheKey {
    /// Build a fresh key, computing `hash_value` from `components`.
    ///
    /// Fails with an error if `type` does not match `[A-Za-z0-9]{1,32}`.
    pub fn new(
        r#type: impl Into<String>,
        components: BTreeMap<String, AnnotatedValue>,
    ) -> Result<Self> {
        let r#type = r#type.into();
        validate_type(&r#type)?;
        let hash_value = canonical_hash(&components);
        Ok(Self { r#type, hash_value, components })
    }

    /// Rebuild a key from its parts, validating `type` and `hash_value`
    /// against their grammars and recomputing the digest from `components` to
    /// confirm it matches — a `CacheKey` can never exist with a `hash_value`
    /// that isn't a pure function of its own components.
    pub fn from_parts(
        r#type: impl Into<String>,
        hash_value: impl Into<String>,
        components: BTreeMap<String, AnnotatedValue>,
    ) -> Result<Self> {
        let r#type = r#type.into();
        let hash_value = hash_value.into();
        validate_type(&r#type)?;
        validate_hash(&hash_value)?;
        let expected = canonical_hash(&components);
        if expected != hash_value {
            bail!("invalid key: hash_value {hash_value:?} does not match recomputed digest {expected:?}");
        }
        Ok(Self { r#type, hash_value, components })
    }

    pub fn type_name(&self) -> &str {
        &self.r#type
    }

    pub fn hash_value(&self) -> &str {
        &self.hash_value
    }

    pub fn components(&self) -> &BTreeMap<String, AnnotatedValue> {
        &self.components
    }

    /// The cache-key string: `type + "_" + hash_value`, used as the prefix
    /// for every file belonging to this key.
    pub fn to_key_string(&self) -> String {
        format!("{}_{}", self.r#type, self.hash_value)
    }

    /// Compute the set of differing/missing components between `self` and
    /// `other`. Order of the returned deltas is unspecified.
    pub fn diff(&self, other: &Self) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for (name, ours) in &self.components {
            match other.components.get(name) {
                Some(theirs) if theirs.value == ours.value => continue,
                Some(theirs) => deltas.push(Delta {
                    key: name.clone(),
                    ours: Some(ours.clone()),
                    theirs: Some(theirs.clone()),
                }),
                None => deltas.push(Delta {
                    key: name.clone(),
                    ours: Some(ours.clone()),
                    theirs: None,
                }),
            }
        }
        for (name, theirs) in &other.components {
            if !self.components.contains_key(name) {
                deltas.push(Delta { key: name.clone(), ours: None, theirs: Some(theirs.clone()) });
            }
        }
        deltas
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialise cache key")
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("deserialise cache key")
    }
}

fn validate_type(r#type: &str) -> Result<()> {
    if !type_pattern().is_match(r#type) {
        bail!("invalid key: type {type:?} does not match [A-Za-z0-9]{{1,32}}");
    }
    Ok(())
}

fn validate_hash(hash_value: &str) -> Result<()> {
    if !hash_pattern().is_match(hash_value) {
        bail!("invalid key: hash_value {hash_value:?} does not match [0-9a-f]{{40}}");
    }
    Ok(())
}

/// Canonical hash recipe (byte-exact interop contract): sort components by
/// name, render `name: value` per entry, join with `\n`, SHA-1 over the
/// UTF-8 bytes, lowercase 40-hex.
fn canonical_hash(components: &BTreeMap<String, AnnotatedValue>) -> String {
    let joined = components
        .iter()
        .map(|(name, av)| format!("{name}: {}", av.value))
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// JSON-shaped mirror of [`CacheKey`] used only for serde's `try_from`/`into`
/// hooks, so that deserialisation always re-validates `type`/`hash_value`.
#[derive(Serialize, Deserialize)]
struct RawCacheKey {
    r#type: String,
    #[serde(rename = "hashValue")]
    hash_value: String,
    components: BTreeMap<String, AnnotatedValue>,
}

impl TryFrom<RawCacheKey> for CacheKey {
    type Error = color_eyre::eyre::Error;

    fn try_from(raw: RawCacheKey) -> Result<Self> {
        validate_type(&raw.r#type).map_err(|_| eyre!("invalid key: type {:?}", raw.r#type))?;
        validate_hash(&raw.hash_value)
            .map_err(|_| eyre!("invalid key: hash_value {:?}", raw.hash_value))?;
        // The digest is re-derived rather than trusted from the wire, so a
        // hand-edited marker can never desync from its own components.
        let expected = canonical_hash(&raw.components);
        if expected != raw.hash_value {
            bail!(
                "invalid key: hash_value {:?} does not match recomputed digest {expected:?}",
                raw.hash_value
            );
        }
        Ok(Self { r#type: raw.r#type, hash_value: raw.hash_value, components: raw.components })
    }
}

impl From<CacheKey> for RawCacheKey {
    fn from(key: CacheKey) -> Self {
        Self { r#type: key.r#type, hash_value: key.hash_value, components: key.components }
    }
}
