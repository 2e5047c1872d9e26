//! Canonical byte encoding for fingerprints
//!
//! Every hash in Gantry is computed over bytes produced by this encoder.
//! The layout is part of the cache-key contract: strings are length-prefixed
//! (u64 big-endian), sequences are element-counted, maps are encoded as
//! key-sorted `(key, value)` lists, and nested structures are framed by
//! their byte length. Changing any of it invalidates every cache entry.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use gantry_core::pipeline::{PristinePipeline, TaskDefinition, TaskOutputs};

/// A 16-char lowercase-hex content fingerprint (64 bits of a Sha256 digest)
pub type Fingerprint = String;

/// Types that know how to write themselves into a capsule
pub trait Encode {
    fn encode(&self, cap: &mut Capsule);
}

/// Accumulates the canonical byte form of a value tree
#[derive(Debug, Default)]
pub struct Capsule {
    buf: Vec<u8>,
}

impl Capsule {
    /// Start an empty capsule
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fixed-width big-endian integer
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a single byte flag
    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(u8::from(v));
        self
    }

    /// Append a length-prefixed string
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.u64(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Append a counted sequence of strings, in the order given
    pub fn seq<I, S>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<S> = items.into_iter().collect();
        self.u64(items.len() as u64);
        for item in items {
            self.string(item.as_ref());
        }
        self
    }

    /// Append a map as a key-sorted `(key, value)` list. Accepts any
    /// iteration order; keys are sorted here so the contract cannot depend
    /// on the caller's container.
    pub fn map<I, K, V>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.u64(sorted.len() as u64);
        for (k, v) in &sorted {
            self.string(k);
            self.string(v);
        }
        self
    }

    /// Append a nested value as a length-framed sub-capsule
    pub fn nested(&mut self, value: &impl Encode) -> &mut Self {
        let mut inner = Capsule::new();
        value.encode(&mut inner);
        self.u64(inner.buf.len() as u64);
        self.buf.extend_from_slice(&inner.buf);
        self
    }

    /// The encoded bytes
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish: 64-bit fingerprint of the encoded bytes, 16-char lowercase hex
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(&self.buf);
        let mut out = String::with_capacity(16);
        for byte in &digest[..8] {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl Encode for TaskOutputs {
    fn encode(&self, cap: &mut Capsule) {
        cap.seq(&self.inclusions);
        cap.seq(&self.exclusions);
    }
}

impl Encode for TaskDefinition {
    fn encode(&self, cap: &mut Capsule) {
        cap.seq(&self.depends_on);
        cap.seq(&self.inputs);
        cap.nested(&self.outputs);
        cap.seq(&self.env);
        cap.bool(self.cache);
    }
}

impl Encode for PristinePipeline {
    fn encode(&self, cap: &mut Capsule) {
        cap.u64(self.0.len() as u64);
        for (name, definition) in &self.0 {
            cap.string(name);
            cap.nested(definition);
        }
    }
}
