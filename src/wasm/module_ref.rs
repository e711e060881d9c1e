//! Deferred access to a module's bytes, with optional digest pinning.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

enum ModuleSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
    Provider(Arc<dyn Fn() -> anyhow::Result<Vec<u8>> + Send + Sync>),
}

/// Names a WebAssembly module and yields its bytes on demand. When a SHA-256
/// digest is pinned, the bytes are verified before every compile.
#[derive(Clone)]
pub struct ModuleRef {
    name: String,
    source: Arc<ModuleSource>,
    digest_sha256: Option<String>,
}

impl ModuleRef {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(ModuleSource::Bytes(bytes.into().into())),
            digest_sha256: None,
        }
    }

    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(ModuleSource::File(path.into())),
            digest_sha256: None,
        }
    }

    pub fn from_provider(
        name: impl Into<String>,
        provider: impl Fn() -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(ModuleSource::Provider(Arc::new(provider))),
            digest_sha256: None,
        }
    }

    /// Pin the module to a hex-encoded SHA-256 digest.
    pub fn with_digest(mut self, digest_hex: impl Into<String>) -> Self {
        self.digest_sha256 = Some(digest_hex.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = match &*self.source {
            ModuleSource::Bytes(bytes) => bytes.to_vec(),
            ModuleSource::File(path) => std::fs::read(path)
                .with_context(|| format!("read module file: {}", path.display()))?,
            ModuleSource::Provider(provider) => provider()
                .with_context(|| format!("module provider for '{}' failed", self.name))?,
        };
        if let Some(expected) = &self.digest_sha256 {
            let got = hex::encode(Sha256::digest(&bytes));
            if !expected.eq_ignore_ascii_case(&got) {
                bail!(
                    "module '{}' digest mismatch: expected {expected}, got {got}",
                    self.name
                );
            }
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("name", &self.name)
            .field("digest_sha256", &self.digest_sha256)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_pinning_detects_mismatch_and_match() {
        let bytes = b"\0asm fake module".to_vec();
        let good = hex::encode(Sha256::digest(&bytes));

        let pinned = ModuleRef::from_bytes("m", bytes.clone()).with_digest(good);
        assert_eq!(pinned.bytes().expect("matching digest"), bytes);

        let pinned = ModuleRef::from_bytes("m", bytes).with_digest("deadbeef");
        let err = pinned.bytes().expect_err("mismatched digest must fail");
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn provider_errors_carry_the_module_name() {
        let lazy = ModuleRef::from_provider("broken", || bail!("backing store offline"));
        let err = lazy.bytes().expect_err("provider failure must propagate");
        assert!(format!("{err:#}").contains("broken"));
    }
}
