// Context Builder - driver connection (VkInstance)
//
// Responsibilities:
// - Negotiate API version, instance extensions and layers (tiered)
// - Add presentation, portability and properties2 extensions as needed
// - Create the instance and, if negotiated, the debug messenger
// - Never leak the instance when a later step fails

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{GetPhysicalDeviceProperties2, Surface};
use ash::{vk, Entry};
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use super::dispatch;
use super::error::{CapabilityKind, Error, Result};
use super::registry::{CapabilityRegistry, GlobalCapabilities};
use super::tier::{Tiered, TieredList};
use super::undo::UndoStack;
use super::version::ApiVersion;

pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
pub const DEBUG_UTILS_EXTENSION: &str = "VK_EXT_debug_utils";
pub const SURFACE_EXTENSION: &str = "VK_KHR_surface";
pub const PROPERTIES2_EXTENSION: &str = "VK_KHR_get_physical_device_properties2";
pub const PORTABILITY_ENUMERATION_EXTENSION: &str = "VK_KHR_portability_enumeration";

/// Platform presentation extensions, in preference order. The first one the
/// loader supports is enabled.
pub fn platform_surface_extensions() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["VK_KHR_win32_surface"]
    }
    #[cfg(target_os = "android")]
    {
        &["VK_KHR_android_surface"]
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        &["VK_EXT_metal_surface"]
    }
    #[cfg(all(
        unix,
        not(target_os = "android"),
        not(target_os = "macos"),
        not(target_os = "ios")
    ))]
    {
        &[
            "VK_KHR_xcb_surface",
            "VK_KHR_xlib_surface",
            "VK_KHR_wayland_surface",
        ]
    }
    #[cfg(not(any(unix, target_os = "windows")))]
    {
        &[]
    }
}

/// Whether to enable the validation layer + debug messenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Diagnostics {
    #[default]
    Disabled,
    /// Enable when available, otherwise continue without.
    Requested,
    /// Fail the build when unavailable.
    Required,
}

/// Outcome of instance negotiation, before anything native is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePlan {
    pub api_version: ApiVersion,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
    pub flags: vk::InstanceCreateFlags,
    pub headless: bool,
    pub diagnostics: bool,
    pub properties2: bool,
    /// False when some requested (non-required) item was unavailable.
    pub optimal: bool,
}

/// Fluent builder for [`Connection`]. Nothing is validated until
/// [`negotiate`](Self::negotiate) or [`build`](Self::build).
pub struct ConnectionBuilder {
    application_name: String,
    application_version: u32,
    engine_name: String,
    engine_version: u32,
    version: Tiered<ApiVersion>,
    extensions: TieredList<String>,
    layers: TieredList<String>,
    headless: bool,
    diagnostics: Diagnostics,
    debug_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    debug_types: vk::DebugUtilsMessageTypeFlagsEXT,
    debug_callback: vk::PFN_vkDebugUtilsMessengerCallbackEXT,
    debug_user_data: *mut c_void,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new("vk-provision")
    }
}

impl ConnectionBuilder {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            application_version: vk::make_api_version(0, 0, 1, 0),
            engine_name: "vk-provision".to_string(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            version: Tiered::new(ApiVersion::V1_0),
            extensions: TieredList::default(),
            layers: TieredList::default(),
            headless: false,
            diagnostics: Diagnostics::Disabled,
            debug_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            debug_types: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            debug_callback: Some(default_debug_callback),
            debug_user_data: std::ptr::null_mut(),
        }
    }

    pub fn application_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = vk::make_api_version(0, major, minor, patch);
        self
    }

    pub fn engine_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    pub fn engine_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.engine_version = vk::make_api_version(0, major, minor, patch);
        self
    }

    pub fn require_api_version(mut self, version: ApiVersion) -> Self {
        self.version.require(version);
        self
    }

    pub fn request_api_version(mut self, version: ApiVersion) -> Self {
        self.version.request(version);
        self
    }

    pub fn require_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.require(name.into());
        self
    }

    pub fn request_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.request(name.into());
        self
    }

    pub fn require_layer(mut self, name: impl Into<String>) -> Self {
        self.layers.require(name.into());
        self
    }

    pub fn request_layer(mut self, name: impl Into<String>) -> Self {
        self.layers.request(name.into());
        self
    }

    /// Skip the surface extensions; the connection can't present.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn debug_messenger_severity(mut self, severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        self.debug_severity = severity;
        self
    }

    pub fn debug_messenger_types(mut self, types: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        self.debug_types = types;
        self
    }

    /// Replace the default `log`-forwarding callback.
    pub fn debug_callback(
        mut self,
        callback: vk::PFN_vkDebugUtilsMessengerCallbackEXT,
        user_data: *mut c_void,
    ) -> Self {
        self.debug_callback = callback;
        self.debug_user_data = user_data;
        self
    }

    pub fn api_version(&self) -> Tiered<ApiVersion> {
        self.version
    }

    /// Resolve what the instance will be created with.
    pub fn negotiate(&self, available: &GlobalCapabilities) -> Result<InstancePlan> {
        let mut plan = InstancePlan {
            api_version: self.resolve_version(available.instance_version)?,
            extensions: Vec::new(),
            layers: Vec::new(),
            flags: vk::InstanceCreateFlags::empty(),
            headless: self.headless,
            diagnostics: false,
            properties2: false,
            optimal: true,
        };

        for name in self.extensions.required() {
            if !available.is_extension_supported(name) {
                return Err(Error::missing("instance", CapabilityKind::Extension, name.as_str()));
            }
        }
        for name in self.layers.required() {
            if !available.is_layer_supported(name) {
                return Err(Error::missing("instance", CapabilityKind::Layer, name.as_str()));
            }
        }

        for name in self.extensions.required() {
            push_unique(&mut plan.extensions, name);
        }
        for name in self.layers.required() {
            push_unique(&mut plan.layers, name);
        }
        for name in self.extensions.requested() {
            if available.is_extension_supported(name) {
                push_unique(&mut plan.extensions, name);
            } else {
                log::warn!("Requested instance extension {} is not available", name);
                plan.optimal = false;
            }
        }
        for name in self.layers.requested() {
            if available.is_layer_supported(name) {
                push_unique(&mut plan.layers, name);
            } else {
                log::warn!("Requested instance layer {} is not available", name);
                plan.optimal = false;
            }
        }

        if self.diagnostics != Diagnostics::Disabled {
            let has_utils = available.is_extension_supported(DEBUG_UTILS_EXTENSION);
            let has_layer = available.is_layer_supported(VALIDATION_LAYER);
            if has_utils && has_layer {
                push_unique(&mut plan.extensions, DEBUG_UTILS_EXTENSION);
                push_unique(&mut plan.layers, VALIDATION_LAYER);
                plan.diagnostics = true;
            } else if self.diagnostics == Diagnostics::Required {
                let (kind, name) = if has_utils {
                    (CapabilityKind::Layer, VALIDATION_LAYER)
                } else {
                    (CapabilityKind::Extension, DEBUG_UTILS_EXTENSION)
                };
                return Err(Error::missing("instance", kind, name));
            } else {
                log::warn!(
                    "Validation requested but {} / {} are not both available; continuing without",
                    DEBUG_UTILS_EXTENSION,
                    VALIDATION_LAYER
                );
                plan.optimal = false;
            }
        }

        if !self.headless {
            if !available.is_extension_supported(SURFACE_EXTENSION) {
                return Err(Error::missing("instance", CapabilityKind::Extension, SURFACE_EXTENSION));
            }
            push_unique(&mut plan.extensions, SURFACE_EXTENSION);

            let candidates = platform_surface_extensions();
            let platform = candidates
                .iter()
                .find(|name| available.is_extension_supported(name))
                .ok_or_else(|| {
                    Error::missing(
                        "instance",
                        CapabilityKind::Extension,
                        format!("platform surface extension (one of {:?})", candidates),
                    )
                })?;
            push_unique(&mut plan.extensions, platform);
        }

        if plan.api_version < ApiVersion::V1_1 && available.is_extension_supported(PROPERTIES2_EXTENSION) {
            push_unique(&mut plan.extensions, PROPERTIES2_EXTENSION);
            plan.properties2 = true;
        }

        if available.is_extension_supported(PORTABILITY_ENUMERATION_EXTENSION) {
            push_unique(&mut plan.extensions, PORTABILITY_ENUMERATION_EXTENSION);
            plan.flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        Ok(plan)
    }

    fn resolve_version(&self, available: ApiVersion) -> Result<ApiVersion> {
        if available >= self.version.requested() {
            return Ok(self.version.requested());
        }
        if available < self.version.required() {
            return Err(Error::UnsupportedVersion {
                subject: "instance".into(),
                required: self.version.required(),
                available,
            });
        }
        log::warn!(
            "Requested Vulkan {} but the loader only offers {}; falling back",
            self.version.requested(),
            available
        );
        Ok(available)
    }

    /// Build against the process-wide registry.
    pub fn build(&self) -> Result<Connection> {
        let registry = CapabilityRegistry::global()?;
        self.build_with(&registry)
    }

    pub fn build_with(&self, registry: &CapabilityRegistry) -> Result<Connection> {
        let plan = self.negotiate(registry.capabilities())?;
        let entry = registry.entry().clone();

        let app_name = to_cstring(&self.application_name)?;
        let engine_name = to_cstring(&self.engine_name)?;
        let extension_names = plan
            .extensions
            .iter()
            .map(|name| to_cstring(name))
            .collect::<Result<Vec<_>>>()?;
        let layer_names = plan
            .layers
            .iter()
            .map(|name| to_cstring(name))
            .collect::<Result<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|n| n.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(self.application_version)
            .engine_name(&engine_name)
            .engine_version(self.engine_version)
            .api_version(plan.api_version.raw());

        // Chained into the create info as well so instance creation and
        // destruction are covered by the messenger.
        let mut debug_info = self.debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs)
            .flags(plan.flags);
        if plan.diagnostics {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|result| Error::creation("instance", result))?;

        let mut undo = UndoStack::new();
        {
            let instance = instance.clone();
            undo.push("instance", move |_| unsafe { instance.destroy_instance(None) });
        }

        let debug = if plan.diagnostics {
            if let Err(err) = dispatch::require_instance_fns(&entry, instance.handle(), dispatch::DEBUG_UTILS_FNS) {
                undo.unwind_all();
                return Err(err);
            }
            let debug_utils = DebugUtils::new(&entry, &instance);
            match unsafe { debug_utils.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(result) => {
                    undo.unwind_all();
                    return Err(Error::creation("debug messenger", result));
                }
            }
        } else {
            None
        };
        undo.commit();

        let surface_loader = plan
            .extensions
            .iter()
            .any(|name| name == SURFACE_EXTENSION)
            .then(|| Surface::new(&entry, &instance));
        let properties2_loader = plan
            .properties2
            .then(|| GetPhysicalDeviceProperties2::new(&entry, &instance));

        let info = ConnectionInfo::from_plan(&self.application_name, &plan);
        log::info!(
            "Created Vulkan instance {} (API {}, {} extensions, {} layers{})",
            info.application_name,
            info.api_version,
            info.enabled_extensions.len(),
            info.enabled_layers.len(),
            if info.diagnostics { ", validation on" } else { "" }
        );
        log::debug!("Instance extensions: {:?}", info.enabled_extensions);

        Ok(Connection {
            entry,
            instance,
            info,
            surface_loader,
            properties2_loader,
            debug,
        })
    }

    fn debug_messenger_info(&self) -> vk::DebugUtilsMessengerCreateInfoEXT {
        vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(self.debug_severity)
            .message_type(self.debug_types)
            .pfn_user_callback(self.debug_callback)
            .user_data(self.debug_user_data)
            .build()
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

pub(crate) fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidConfiguration(format!("name contains a NUL byte: {:?}", name)))
}

/// Immutable description of a created connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub application_name: String,
    pub api_version: ApiVersion,
    pub enabled_extensions: Vec<String>,
    pub enabled_layers: Vec<String>,
    pub headless: bool,
    pub diagnostics: bool,
    pub properties2: bool,
    pub optimal: bool,
}

impl ConnectionInfo {
    pub fn from_plan(application_name: &str, plan: &InstancePlan) -> Self {
        Self {
            application_name: application_name.to_string(),
            api_version: plan.api_version,
            enabled_extensions: plan.extensions.clone(),
            enabled_layers: plan.layers.clone(),
            headless: plan.headless,
            diagnostics: plan.diagnostics,
            properties2: plan.properties2,
            optimal: plan.optimal,
        }
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.iter().any(|e| e == name)
    }

    pub fn is_layer_enabled(&self, name: &str) -> bool {
        self.enabled_layers.iter().any(|l| l == name)
    }

    /// (base surface extension, platform surface extension) enablement.
    pub fn presentation_extensions(&self) -> (bool, bool) {
        let base = self.is_extension_enabled(SURFACE_EXTENSION);
        let platform = platform_surface_extensions()
            .iter()
            .any(|name| self.is_extension_enabled(name));
        (base, platform)
    }
}

/// Live driver connection. Destroy explicitly, after every device and
/// surface created from it.
pub struct Connection {
    entry: Entry,
    instance: ash::Instance,
    info: ConnectionInfo,
    surface_loader: Option<Surface>,
    properties2_loader: Option<GetPhysicalDeviceProperties2>,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Connection {
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn api_version(&self) -> ApiVersion {
        self.info.api_version
    }

    pub fn is_headless(&self) -> bool {
        self.info.headless
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.info.is_extension_enabled(name)
    }

    pub fn is_layer_enabled(&self, name: &str) -> bool {
        self.info.is_layer_enabled(name)
    }

    /// Surface queries; `None` on a headless connection.
    pub fn surface_loader(&self) -> Option<&Surface> {
        self.surface_loader.as_ref()
    }

    pub(crate) fn properties2_loader(&self) -> Option<&GetPhysicalDeviceProperties2> {
        self.properties2_loader.as_ref()
    }

    pub fn destroy(mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Default messenger callback: forwards driver messages to `log`.
pub unsafe extern "system" fn default_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(version: ApiVersion, extensions: &[&str], layers: &[&str]) -> GlobalCapabilities {
        GlobalCapabilities::new(version, extensions.iter().copied(), layers.iter().copied())
    }

    #[test]
    fn requested_version_wins_when_supported() {
        let plan = ConnectionBuilder::new("t")
            .headless(true)
            .request_api_version(ApiVersion::V1_2)
            .negotiate(&loader(ApiVersion::new(1, 3, 250), &[], &[]))
            .unwrap();
        assert_eq!(plan.api_version, ApiVersion::V1_2);
    }

    #[test]
    fn falls_back_to_loader_version_above_required() {
        let plan = ConnectionBuilder::new("t")
            .headless(true)
            .require_api_version(ApiVersion::V1_1)
            .request_api_version(ApiVersion::V1_3)
            .negotiate(&loader(ApiVersion::new(1, 2, 198), &[], &[]))
            .unwrap();
        assert_eq!(plan.api_version, ApiVersion::new(1, 2, 198));
    }

    #[test]
    fn version_below_required_is_rejected() {
        let err = ConnectionBuilder::new("t")
            .headless(true)
            .require_api_version(ApiVersion::V1_3)
            .negotiate(&loader(ApiVersion::V1_1, &[], &[]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::backend::error::ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn missing_requested_extension_only_costs_optimality() {
        let plan = ConnectionBuilder::new("t")
            .headless(true)
            .request_extension("VK_EXT_swapchain_colorspace")
            .negotiate(&loader(ApiVersion::V1_1, &[], &[]))
            .unwrap();
        assert!(!plan.optimal);
        assert!(plan.extensions.is_empty());
    }

    #[test]
    fn required_list_is_deduplicated() {
        let plan = ConnectionBuilder::new("t")
            .headless(true)
            .require_extension(DEBUG_UTILS_EXTENSION)
            .diagnostics(Diagnostics::Requested)
            .negotiate(&loader(
                ApiVersion::V1_1,
                &[DEBUG_UTILS_EXTENSION],
                &[VALIDATION_LAYER],
            ))
            .unwrap();
        assert_eq!(plan.extensions, vec![DEBUG_UTILS_EXTENSION.to_string()]);
        assert_eq!(plan.layers, vec![VALIDATION_LAYER.to_string()]);
        assert!(plan.diagnostics);
    }

    #[test]
    fn portability_enumeration_sets_flag() {
        let plan = ConnectionBuilder::new("t")
            .headless(true)
            .negotiate(&loader(
                ApiVersion::V1_0,
                &[PORTABILITY_ENUMERATION_EXTENSION, PROPERTIES2_EXTENSION],
                &[],
            ))
            .unwrap();
        assert!(plan.flags.contains(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR));
        assert!(plan.properties2);
    }
}
