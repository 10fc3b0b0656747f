// Capability registry - what the loader offers before any instance exists
//
// Populated once: the Vulkan library is loaded, and the instance-level
// extensions, layers and version are cached. Read-only afterwards.

use ash::Entry;
use parking_lot::RwLock;
use std::os::raw::c_char;
use std::sync::Arc;

use super::error::{Error, Result};
use super::version::ApiVersion;

/// Name and spec version of an instance extension or layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub name: String,
    pub spec_version: u32,
    pub description: String,
}

impl CapabilityRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec_version: 1,
            description: String::new(),
        }
    }
}

/// Plain snapshot of what the loader reports. Negotiation runs on this so it
/// can be exercised without a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalCapabilities {
    pub instance_version: ApiVersion,
    pub extensions: Vec<CapabilityRecord>,
    pub layers: Vec<CapabilityRecord>,
}

impl GlobalCapabilities {
    pub fn new<E, L>(instance_version: ApiVersion, extensions: E, layers: L) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            instance_version,
            extensions: extensions.into_iter().map(CapabilityRecord::named).collect(),
            layers: layers.into_iter().map(CapabilityRecord::named).collect(),
        }
    }

    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.extension(name).is_some()
    }

    pub fn is_layer_supported(&self, name: &str) -> bool {
        self.layer(name).is_some()
    }

    pub fn extension(&self, name: &str) -> Option<&CapabilityRecord> {
        self.extensions.iter().find(|e| e.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&CapabilityRecord> {
        self.layers.iter().find(|l| l.name == name)
    }
}

/// Loaded Vulkan library plus the cached global capabilities.
pub struct CapabilityRegistry {
    entry: Entry,
    capabilities: GlobalCapabilities,
}

static REGISTRY: RwLock<Option<Arc<CapabilityRegistry>>> = parking_lot::const_rwlock(None);

impl CapabilityRegistry {
    /// Load the Vulkan library and query the global capabilities.
    pub fn load() -> Result<Self> {
        let entry = unsafe { Entry::load() }?;

        let instance_version = match entry.try_enumerate_instance_version() {
            Ok(Some(version)) => ApiVersion(version),
            // 1.0 loaders do not export vkEnumerateInstanceVersion
            Ok(None) => ApiVersion::V1_0,
            Err(result) => return Err(Error::query("instance version", result)),
        };

        let extensions = entry
            .enumerate_instance_extension_properties(None)
            .map_err(|result| Error::query("instance extensions", result))?
            .iter()
            .map(|props| CapabilityRecord {
                name: fixed_str(&props.extension_name),
                spec_version: props.spec_version,
                description: String::new(),
            })
            .collect::<Vec<_>>();

        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(|result| Error::query("instance layers", result))?
            .iter()
            .map(|props| CapabilityRecord {
                name: fixed_str(&props.layer_name),
                spec_version: props.spec_version,
                description: fixed_str(&props.description),
            })
            .collect::<Vec<_>>();

        log::info!(
            "Vulkan loader: instance version {}, {} extensions, {} layers",
            instance_version,
            extensions.len(),
            layers.len()
        );

        Ok(Self {
            entry,
            capabilities: GlobalCapabilities {
                instance_version,
                extensions,
                layers,
            },
        })
    }

    /// Load the process-wide registry. Calling it again is a no-op.
    pub fn initialize() -> Result<Arc<Self>> {
        let mut slot = REGISTRY.write();
        if let Some(registry) = slot.as_ref() {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(Self::load()?);
        *slot = Some(Arc::clone(&registry));
        Ok(registry)
    }

    /// Release the process-wide registry. Safe to call without `initialize`.
    pub fn terminate() {
        if REGISTRY.write().take().is_some() {
            log::debug!("Capability registry released");
        }
    }

    pub fn is_initialized() -> bool {
        REGISTRY.read().is_some()
    }

    pub fn global() -> Result<Arc<Self>> {
        REGISTRY.read().as_ref().map(Arc::clone).ok_or_else(|| {
            Error::InvalidConfiguration(
                "capability registry used before CapabilityRegistry::initialize".into(),
            )
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn capabilities(&self) -> &GlobalCapabilities {
        &self.capabilities
    }

    pub fn instance_version(&self) -> ApiVersion {
        self.capabilities.instance_version
    }

    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.capabilities.is_extension_supported(name)
    }

    pub fn is_layer_supported(&self, name: &str) -> bool {
        self.capabilities.is_layer_supported(name)
    }

    pub fn extension(&self, name: &str) -> Option<&CapabilityRecord> {
        self.capabilities.extension(name)
    }

    pub fn layer(&self, name: &str) -> Option<&CapabilityRecord> {
        self.capabilities.layer(name)
    }
}

/// Decode a fixed-size, NUL-terminated driver string.
pub(crate) fn fixed_str(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_match_by_name() {
        let caps = GlobalCapabilities::new(
            ApiVersion::V1_2,
            ["VK_KHR_surface", "VK_EXT_debug_utils"],
            ["VK_LAYER_KHRONOS_validation"],
        );
        assert!(caps.is_extension_supported("VK_KHR_surface"));
        assert!(!caps.is_extension_supported("VK_KHR_xcb_surface"));
        assert!(caps.is_layer_supported("VK_LAYER_KHRONOS_validation"));
        assert_eq!(
            caps.extension("VK_EXT_debug_utils").map(|e| e.spec_version),
            Some(1)
        );
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let mut raw = [0 as c_char; 16];
        for (dst, src) in raw.iter_mut().zip(b"VK_KHR_surface") {
            *dst = *src as c_char;
        }
        assert_eq!(fixed_str(&raw), "VK_KHR_surface");
    }

    #[test]
    fn terminate_without_initialize_is_harmless() {
        CapabilityRegistry::terminate();
        assert!(!CapabilityRegistry::is_initialized());
        assert!(CapabilityRegistry::global().is_err());
        CapabilityRegistry::terminate();
        assert!(!CapabilityRegistry::is_initialized());
    }
}
