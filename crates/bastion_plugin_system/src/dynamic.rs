//! # Dynamic (User-Supplied) Plugin Loading
//!
//! User plugins arrive as dynamic libraries next to a detached ed25519
//! signature. Loading is a gauntlet, in order:
//!
//! 1. **Signature** — the library bytes must verify against one of the
//!    panel's trusted public keys; an unsigned or tampered blob never
//!    reaches the loader.
//! 2. **SDK version** — the manifest's declared SDK version must have the
//!    same major as the host and a minor no greater than the host's.
//! 3. **Manifest** — the library exports `bastion_plugin_manifest`
//!    returning JSON with id, version, SDK version, required features and
//!    connectors, and subscribed events. The manifest is what the feature
//!    gateway enforces at runtime.
//! 4. **Factory** — `bastion_create_plugin` constructs the boxed reactor.
//!
//! Unloading is best-effort: libraries are kept alive until shutdown and
//! dropped only after their instances, and process-wide dynamic code may not
//! be fully unloadable. This is a documented, accepted limitation.

use crate::definition::Feature;
use crate::error::PluginError;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use libloading::{Library, Symbol};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// SDK version this host offers to plugins.
pub const HOST_SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Banner string a plugin library must echo back from its
/// `bastion_sdk_banner` export, proving it was built against this SDK line.
pub const SDK_SYMBOL_BANNER: &str = const_format::concatcp!("bastion-sdk-", env!("CARGO_PKG_VERSION"));

/// Manifest embedded in a dynamic plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub version: String,
    pub author: String,
    /// SDK version the plugin was built against.
    pub sdk_version: String,
    #[serde(default)]
    pub required_features: Vec<Feature>,
    #[serde(default)]
    pub required_connectors: Vec<String>,
    /// Subscribed event names (`CHAT_MESSAGE`, ...).
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub allow_multiple_instances: bool,
    #[serde(default)]
    pub long_running: bool,
}

/// Checks a plugin's declared SDK version against the host's.
///
/// Compatible iff the majors are equal and the plugin's minor does not
/// exceed the host's: a plugin built against a newer minor may call APIs
/// this host does not have.
pub fn sdk_compatible(plugin_sdk: &str, host_sdk: &str) -> Result<(), PluginError> {
    let parse = |v: &str| -> Option<(u32, u32)> {
        let mut parts = v.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    };
    let (plugin_major, plugin_minor) = parse(plugin_sdk)
        .ok_or_else(|| PluginError::LoadError(format!("unparseable SDK version '{plugin_sdk}'")))?;
    let (host_major, host_minor) = parse(host_sdk)
        .ok_or_else(|| PluginError::LoadError(format!("unparseable host SDK version '{host_sdk}'")))?;

    if plugin_major != host_major {
        return Err(PluginError::LoadError(format!(
            "SDK major mismatch: plugin {plugin_sdk}, host {host_sdk}"
        )));
    }
    if plugin_minor > host_minor {
        return Err(PluginError::LoadError(format!(
            "plugin SDK minor {plugin_minor} is newer than host minor {host_minor}"
        )));
    }
    Ok(())
}

/// Verifies the library bytes against the trusted signer keys.
pub fn verify_signature(
    blob: &[u8],
    signature_bytes: &[u8],
    trusted_keys: &[VerifyingKey],
) -> Result<(), PluginError> {
    let signature = Signature::from_slice(signature_bytes)
        .map_err(|e| PluginError::LoadError(format!("malformed signature: {e}")))?;
    for key in trusted_keys {
        if key.verify(blob, &signature).is_ok() {
            return Ok(());
        }
    }
    Err(PluginError::LoadError(
        "signature does not verify against any trusted key".to_string(),
    ))
}

/// A verified, loaded plugin library.
#[derive(Debug)]
pub struct LoadedLibrary {
    pub manifest: PluginManifest,
    library: Library,
}

impl LoadedLibrary {
    /// Constructs a plugin instance through the library's factory export.
    ///
    /// # Safety contract
    ///
    /// The factory symbol hands over an owned trait object; the SDK macro on
    /// the plugin side guarantees the pointer is a `Box::into_raw` of a
    /// `Box<dyn Plugin>` built against a compatible SDK (enforced by the
    /// version gate before any symbol is touched).
    pub fn create_plugin(&self) -> Result<Box<dyn crate::definition::Plugin>, PluginError> {
        let factory: Symbol<unsafe extern "C" fn() -> *mut dyn crate::definition::Plugin> = unsafe {
            self.library.get(b"bastion_create_plugin").map_err(|e| {
                PluginError::LoadError(format!("missing 'bastion_create_plugin' export: {e}"))
            })?
        };
        let raw = unsafe { factory() };
        if raw.is_null() {
            return Err(PluginError::LoadError(
                "plugin factory returned null".to_string(),
            ));
        }
        Ok(unsafe { Box::from_raw(raw) })
    }
}

/// Loader holding the trusted keys and keeping verified libraries alive.
pub struct DynamicPluginLoader {
    trusted_keys: Vec<VerifyingKey>,
    loaded: Vec<LoadedLibrary>,
}

impl DynamicPluginLoader {
    pub fn new(trusted_keys: Vec<VerifyingKey>) -> Self {
        Self {
            trusted_keys,
            loaded: Vec::new(),
        }
    }

    /// Runs the full gauntlet on one library file and its detached
    /// signature. On success the library is retained and its manifest
    /// returned for definition registration.
    pub fn load(
        &mut self,
        library_path: &Path,
        signature_path: &Path,
    ) -> Result<&LoadedLibrary, PluginError> {
        let blob = std::fs::read(library_path)
            .map_err(|e| PluginError::LoadError(format!("read {library_path:?}: {e}")))?;
        let signature = std::fs::read(signature_path)
            .map_err(|e| PluginError::LoadError(format!("read {signature_path:?}: {e}")))?;
        verify_signature(&blob, &signature, &self.trusted_keys)?;

        let library = unsafe {
            Library::new(library_path)
                .map_err(|e| PluginError::LoadError(format!("load {library_path:?}: {e}")))?
        };

        check_sdk_banner(&library)?;
        let manifest = read_manifest(&library)?;
        sdk_compatible(&manifest.sdk_version, HOST_SDK_VERSION)?;

        info!(
            "🧩 Dynamic plugin '{}' v{} verified and loaded",
            manifest.plugin_id, manifest.version
        );
        self.loaded.push(LoadedLibrary { manifest, library });
        Ok(self
            .loaded
            .last()
            .ok_or_else(|| PluginError::LoadError("loader bookkeeping failed".to_string()))?)
    }

    pub fn loaded(&self) -> &[LoadedLibrary] {
        &self.loaded
    }

    /// Best-effort unload: drops libraries in reverse load order. Callers
    /// must have stopped every instance first; any code still referenced by
    /// the process keeps its pages alive regardless.
    pub fn unload_all(&mut self) {
        for loaded in self.loaded.drain(..).rev() {
            warn!(
                "Unloading dynamic plugin library '{}' (best effort)",
                loaded.manifest.plugin_id
            );
            drop(loaded.library);
        }
    }
}

/// Confirms the library is a Bastion plugin at all: its banner export must
/// carry the SDK marker. Version arbitration happens afterwards through the
/// manifest's `sdk_version`.
fn check_sdk_banner(library: &Library) -> Result<(), PluginError> {
    let banner_fn: Symbol<unsafe extern "C" fn() -> *const std::os::raw::c_char> = unsafe {
        library.get(b"bastion_sdk_banner").map_err(|e| {
            PluginError::LoadError(format!("missing 'bastion_sdk_banner' export: {e}"))
        })?
    };
    let raw = unsafe { banner_fn() };
    if raw.is_null() {
        return Err(PluginError::LoadError("null SDK banner".to_string()));
    }
    let banner = unsafe { std::ffi::CStr::from_ptr(raw) }
        .to_str()
        .map_err(|e| PluginError::LoadError(format!("SDK banner is not UTF-8: {e}")))?;
    if !banner.starts_with("bastion-sdk-") {
        return Err(PluginError::LoadError(format!(
            "library banner '{banner}' is not a Bastion SDK marker (host: {SDK_SYMBOL_BANNER})"
        )));
    }
    Ok(())
}

fn read_manifest(library: &Library) -> Result<PluginManifest, PluginError> {
    let manifest_fn: Symbol<unsafe extern "C" fn() -> *const std::os::raw::c_char> = unsafe {
        library.get(b"bastion_plugin_manifest").map_err(|e| {
            PluginError::LoadError(format!("missing 'bastion_plugin_manifest' export: {e}"))
        })?
    };
    let raw = unsafe { manifest_fn() };
    if raw.is_null() {
        return Err(PluginError::LoadError(
            "plugin manifest export returned null".to_string(),
        ));
    }
    let json = unsafe { std::ffi::CStr::from_ptr(raw) }
        .to_str()
        .map_err(|e| PluginError::LoadError(format!("manifest is not UTF-8: {e}")))?;
    serde_json::from_str(json)
        .map_err(|e| PluginError::LoadError(format!("manifest does not parse: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn key_pair(seed: u8) -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn signature_verifies_against_the_signing_key() {
        let (signing, verifying) = key_pair(7);
        let blob = b"plugin library bytes";
        let signature = signing.sign(blob);
        assert!(verify_signature(blob, &signature.to_bytes(), &[verifying]).is_ok());
    }

    #[test]
    fn tampered_blob_fails_verification() {
        let (signing, verifying) = key_pair(7);
        let signature = signing.sign(b"original bytes");
        let err = verify_signature(b"tampered bytes", &signature.to_bytes(), &[verifying]);
        assert!(err.is_err());
    }

    #[test]
    fn untrusted_key_fails_verification() {
        let (signing, _) = key_pair(7);
        let (_, other_verifying) = key_pair(9);
        let blob = b"plugin library bytes";
        let signature = signing.sign(blob);
        assert!(verify_signature(blob, &signature.to_bytes(), &[other_verifying]).is_err());
    }

    #[test]
    fn malformed_signature_is_a_load_error() {
        let (_, verifying) = key_pair(7);
        let err = verify_signature(b"blob", &[1, 2, 3], &[verifying]).unwrap_err();
        assert!(matches!(err, PluginError::LoadError(_)));
    }

    #[test]
    fn sdk_gate_requires_major_match_and_minor_at_most_host() {
        assert!(sdk_compatible("0.3.0", "0.3.4").is_ok());
        assert!(sdk_compatible("0.2.9", "0.3.0").is_ok()); // older minor is fine
        assert!(sdk_compatible("0.3.5", "0.3.4").is_err()); // plugin minor too new
        assert!(sdk_compatible("1.0.0", "0.3.0").is_err()); // major mismatch
        assert!(sdk_compatible("garbage", "0.3.0").is_err());
    }

    #[test]
    fn manifest_json_shape_parses() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{
                "plugin_id": "auto_balance",
                "version": "1.2.0",
                "author": "community",
                "sdk_version": "0.3.0",
                "required_features": ["rcon", "log"],
                "required_connectors": ["kv_store"],
                "events": ["PLAYER_DIED", "NEW_GAME"],
                "long_running": true
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.plugin_id, "auto_balance");
        assert_eq!(manifest.required_features, vec![Feature::Rcon, Feature::Log]);
        assert!(manifest.long_running);
        assert!(!manifest.allow_multiple_instances);
    }

    #[test]
    fn missing_files_surface_as_load_errors() {
        let mut loader = DynamicPluginLoader::new(vec![]);
        let err = loader
            .load(Path::new("/nonexistent/plugin.so"), Path::new("/nonexistent/plugin.sig"))
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadError(_)));
    }
}
