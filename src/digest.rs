use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Incremental SHA-256 over typed fields. Strings are length-prefixed and
/// floats are hashed by bit pattern, so two digests match only when every
/// field is bit-identical.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new(domain: &str) -> Self {
        let mut out = Self::default();
        out.push_str(domain);
        out
    }

    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.inner.update((value.len() as u64).to_le_bytes());
        self.inner.update(value.as_bytes());
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn push_i64(&mut self, value: i64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn push_f64(&mut self, value: f64) -> &mut Self {
        self.inner.update(value.to_bits().to_le_bytes());
        self
    }

    pub fn push_bool(&mut self, value: bool) -> &mut Self {
        self.inner.update([u8::from(value)]);
        self
    }

    pub fn finish(self) -> String {
        URL_SAFE_NO_PAD.encode(self.inner.finalize())
    }
}
