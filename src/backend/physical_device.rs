// Device Selector - judging and ordering physical devices
//
// Every enumerated device is snapshotted, judged against the selection
// criteria, and returned either as a candidate or as the reason it was
// rejected. Candidates that met every requested tier come first.
//
// Queue roles for compute and transfer use a fixed tie-break:
//   Dedicated  - supports the role, none of the other classes
//   Separate   - supports the role, not graphics
//   Compatible - supports the role

use ash::prelude::VkResult;
use ash::vk;
use std::fmt;

use super::capabilities::{CapabilitySet, DeviceProperties, FeatureChain, PropertyChain};
use super::error::{CapabilityKind, Error, Result};
use super::instance::Connection;
use super::registry::fixed_str;
use super::tier::{Tiered, TieredList};
use super::version::ApiVersion;

pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";
pub const PORTABILITY_SUBSET_EXTENSION: &str = "VK_KHR_portability_subset";

/// Queue roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [
        QueueRole::Graphics,
        QueueRole::Compute,
        QueueRole::Transfer,
        QueueRole::Present,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueRole::Graphics => "graphics",
            QueueRole::Compute => "compute",
            QueueRole::Transfer => "transfer",
            QueueRole::Present => "present",
        })
    }
}

/// One queue family as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Can present to the surface the selector was given.
    pub present: bool,
}

impl QueueFamily {
    pub fn new(index: u32, flags: vk::QueueFlags, queue_count: u32) -> Self {
        Self {
            index,
            flags,
            queue_count,
            present: false,
        }
    }

    pub fn with_present(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    pub fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// How well a family fits a role, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueMatch {
    Dedicated,
    Separate,
    Compatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleBinding {
    pub family: u32,
    pub quality: QueueMatch,
}

/// Family index chosen for each role, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleAssignment {
    bindings: [Option<RoleBinding>; 4],
}

impl RoleAssignment {
    /// Derive every role from the family table.
    /// Families that expose no queues are skipped.
    pub fn derive(families: &[QueueFamily]) -> Self {
        let families: Vec<QueueFamily> = families
            .iter()
            .copied()
            .filter(|f| f.queue_count > 0)
            .collect();
        let families = families.as_slice();
        let mut roles = Self::default();
        roles.bindings[QueueRole::Graphics.index()] = families
            .iter()
            .find(|f| f.supports(vk::QueueFlags::GRAPHICS))
            .map(|f| RoleBinding {
                family: f.index,
                quality: QueueMatch::Compatible,
            });
        roles.bindings[QueueRole::Compute.index()] =
            offload_family(families, vk::QueueFlags::COMPUTE, vk::QueueFlags::TRANSFER);
        roles.bindings[QueueRole::Transfer.index()] =
            offload_family(families, vk::QueueFlags::TRANSFER, vk::QueueFlags::COMPUTE);
        roles.bindings[QueueRole::Present.index()] =
            families.iter().find(|f| f.present).map(|f| RoleBinding {
                family: f.index,
                quality: QueueMatch::Compatible,
            });
        roles
    }

    pub fn binding(&self, role: QueueRole) -> Option<RoleBinding> {
        self.bindings[role.index()]
    }

    pub fn family(&self, role: QueueRole) -> Option<u32> {
        self.binding(role).map(|b| b.family)
    }

    /// Roles served by `family`.
    pub fn roles_for_family(&self, family: u32) -> impl Iterator<Item = QueueRole> + '_ {
        QueueRole::ALL
            .into_iter()
            .filter(move |&role| self.family(role) == Some(family))
    }
}

/// Pick a family for a non-graphics role: dedicated, then separate, then any.
fn offload_family(
    families: &[QueueFamily],
    target: vk::QueueFlags,
    other: vk::QueueFlags,
) -> Option<RoleBinding> {
    let dedicated = families.iter().find(|f| {
        f.supports(target) && !f.flags.intersects(vk::QueueFlags::GRAPHICS | other)
    });
    let separate = || {
        families
            .iter()
            .find(|f| f.supports(target) && !f.supports(vk::QueueFlags::GRAPHICS))
    };
    let compatible = || families.iter().find(|f| f.supports(target));

    if let Some(f) = dedicated {
        return Some(RoleBinding {
            family: f.index,
            quality: QueueMatch::Dedicated,
        });
    }
    if let Some(f) = separate() {
        return Some(RoleBinding {
            family: f.index,
            quality: QueueMatch::Separate,
        });
    }
    compatible().map(|f| RoleBinding {
        family: f.index,
        quality: QueueMatch::Compatible,
    })
}

/// Requirement on where a compute or transfer queue comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueRequirement {
    #[default]
    None,
    /// Any family supporting the role.
    Any,
    /// A family without graphics.
    Separate,
    /// A family supporting nothing but the role (plus sparse/protected bits).
    Dedicated,
}

impl QueueRequirement {
    pub fn is_met_by(self, binding: Option<RoleBinding>) -> bool {
        match (self, binding) {
            (QueueRequirement::None, _) => true,
            (_, None) => false,
            (QueueRequirement::Any, Some(_)) => true,
            (QueueRequirement::Separate, Some(b)) => b.quality <= QueueMatch::Separate,
            (QueueRequirement::Dedicated, Some(b)) => b.quality == QueueMatch::Dedicated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyRequirements {
    pub graphics: bool,
    pub present: bool,
    pub compute: QueueRequirement,
    pub transfer: QueueRequirement,
}

impl Default for TopologyRequirements {
    fn default() -> Self {
        Self {
            graphics: true,
            present: false,
            compute: QueueRequirement::None,
            transfer: QueueRequirement::None,
        }
    }
}

impl TopologyRequirements {
    /// Description of the first unmet requirement, if any.
    fn first_unmet(&self, roles: &RoleAssignment) -> Option<String> {
        if self.graphics && roles.family(QueueRole::Graphics).is_none() {
            return Some("no graphics queue family".into());
        }
        for (role, requirement) in [
            (QueueRole::Compute, self.compute),
            (QueueRole::Transfer, self.transfer),
        ] {
            if !requirement.is_met_by(roles.binding(role)) {
                let what = match requirement {
                    QueueRequirement::Dedicated => "dedicated ",
                    QueueRequirement::Separate => "separate ",
                    _ => "",
                };
                return Some(format!("no {}{} queue family", what, role));
            }
        }
        if self.present && roles.family(QueueRole::Present).is_none() {
            return Some("no queue family can present to the surface".into());
        }
        None
    }
}

/// Coarse device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    Other,
    Integrated,
    #[default]
    Discrete,
    Virtual,
    Cpu,
}

impl DeviceClass {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "other" => Some(DeviceClass::Other),
            "integrated" => Some(DeviceClass::Integrated),
            "discrete" => Some(DeviceClass::Discrete),
            "virtual" => Some(DeviceClass::Virtual),
            "cpu" => Some(DeviceClass::Cpu),
            _ => None,
        }
    }
}

impl From<vk::PhysicalDeviceType> for DeviceClass {
    fn from(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceClass::Integrated,
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceClass::Discrete,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceClass::Virtual,
            vk::PhysicalDeviceType::CPU => DeviceClass::Cpu,
            _ => DeviceClass::Other,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceClass::Other => "other",
            DeviceClass::Integrated => "integrated GPU",
            DeviceClass::Discrete => "discrete GPU",
            DeviceClass::Virtual => "virtual GPU",
            DeviceClass::Cpu => "CPU",
        })
    }
}

/// What a judged candidate can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suitability {
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub present: bool,
    pub dedicated_compute: bool,
    pub dedicated_transfer: bool,
    pub separate_compute: bool,
    pub separate_transfer: bool,
    pub portability_subset: bool,
    pub optimal: bool,
}

impl Suitability {
    fn from_roles(roles: &RoleAssignment) -> Self {
        let quality = |role| roles.binding(role).map(|b| b.quality);
        Self {
            graphics: roles.family(QueueRole::Graphics).is_some(),
            compute: roles.family(QueueRole::Compute).is_some(),
            transfer: roles.family(QueueRole::Transfer).is_some(),
            present: roles.family(QueueRole::Present).is_some(),
            dedicated_compute: quality(QueueRole::Compute) == Some(QueueMatch::Dedicated),
            dedicated_transfer: quality(QueueRole::Transfer) == Some(QueueMatch::Dedicated),
            separate_compute: QueueRequirement::Separate.is_met_by(roles.binding(QueueRole::Compute)),
            separate_transfer: QueueRequirement::Separate.is_met_by(roles.binding(QueueRole::Transfer)),
            portability_subset: false,
            optimal: false,
        }
    }
}

/// Surface formats, present modes and capabilities for one device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    fn validate(&self, subject: &str) -> Result<()> {
        if self.formats.is_empty() {
            return Err(Error::missing(subject, CapabilityKind::Presentation, "surface reports no formats"));
        }
        if self.present_modes.is_empty() {
            return Err(Error::missing(subject, CapabilityKind::Presentation, "surface reports no present modes"));
        }
        Ok(())
    }
}

/// Query the surface triple for `physical_device`.
pub(crate) fn query_surface_support(
    connection: &Connection,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<SurfaceSupport> {
    let loader = connection.surface_loader().ok_or_else(|| {
        Error::InvalidConfiguration("surface queries need a connection built without headless".into())
    })?;
    unsafe {
        Ok(SurfaceSupport {
            capabilities: loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(|result| Error::query("surface capabilities", result))?,
            formats: loader
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(|result| Error::query("surface formats", result))?,
            present_modes: loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(|result| Error::query("surface present modes", result))?,
        })
    }
}

/// Everything the judge looks at, captured up front.
#[derive(Debug)]
pub struct DeviceSnapshot {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub class: DeviceClass,
    pub api_version: ApiVersion,
    pub properties: DeviceProperties,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub extensions: Vec<String>,
    pub features: CapabilitySet,
    pub families: Vec<QueueFamily>,
    /// `None` when no surface was given to the selector.
    pub surface: Option<Result<SurfaceSupport>>,
}

impl DeviceSnapshot {
    pub fn new(name: impl Into<String>, class: DeviceClass, api_version: ApiVersion) -> Self {
        Self {
            handle: vk::PhysicalDevice::null(),
            name: name.into(),
            class,
            api_version,
            properties: DeviceProperties::default(),
            memory: vk::PhysicalDeviceMemoryProperties::default(),
            extensions: Vec::new(),
            features: CapabilitySet::empty(),
            families: Vec::new(),
            surface: None,
        }
    }

    pub fn with_extensions<I>(mut self, extensions: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_features(mut self, features: CapabilitySet) -> Self {
        self.features = features;
        self
    }

    pub fn with_families(mut self, families: Vec<QueueFamily>) -> Self {
        self.families = families;
        self
    }

    /// Heaps as (size, device local) pairs.
    pub fn with_memory_heaps(mut self, heaps: &[(u64, bool)]) -> Self {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        for (slot, &(size, device_local)) in memory.memory_heaps.iter_mut().zip(heaps) {
            slot.size = size;
            slot.flags = if device_local {
                vk::MemoryHeapFlags::DEVICE_LOCAL
            } else {
                vk::MemoryHeapFlags::empty()
            };
        }
        memory.memory_heap_count = heaps.len().min(vk::MAX_MEMORY_HEAPS) as u32;
        self.memory = memory;
        self
    }

    pub fn with_surface(mut self, surface: Result<SurfaceSupport>) -> Self {
        self.surface = Some(surface);
        self
    }

    fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// Largest device-local heap, if there is one.
fn largest_device_local_heap(memory: &vk::PhysicalDeviceMemoryProperties) -> Option<u64> {
    let count = (memory.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS);
    memory.memory_heaps[..count]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .max()
}

/// Criteria a device is judged against. Plain data; see [`DeviceSelector`]
/// for the fluent front end.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub name: Option<String>,
    pub preferred_class: DeviceClass,
    pub allow_any_class: bool,
    pub version: Tiered<ApiVersion>,
    pub extensions: TieredList<String>,
    pub features: CapabilitySet,
    pub memory: Tiered<u64>,
    pub topology: TopologyRequirements,
    pub portability_subset: bool,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            name: None,
            preferred_class: DeviceClass::Discrete,
            allow_any_class: true,
            version: Tiered::new(ApiVersion::V1_0),
            extensions: TieredList::default(),
            features: CapabilitySet::empty(),
            memory: Tiered::new(0),
            topology: TopologyRequirements::default(),
            portability_subset: false,
        }
    }
}

impl SelectionCriteria {
    /// Judge one device. `Err` is the reason it was rejected.
    pub fn judge(&self, snapshot: DeviceSnapshot) -> Result<PhysicalDevice> {
        let subject = format!("device '{}'", snapshot.name);
        let mut optimal = true;

        if let Some(name) = &self.name {
            if *name != snapshot.name {
                return Err(Error::missing(
                    subject,
                    CapabilityKind::DeviceName,
                    format!("name does not match '{}'", name),
                ));
            }
        }

        let mut enabled_extensions: Vec<String> = Vec::new();
        let presentation = self.topology.present.then_some(SWAPCHAIN_EXTENSION);
        for name in self.extensions.required().iter().map(String::as_str).chain(presentation) {
            if !snapshot.supports_extension(name) {
                return Err(Error::missing(subject, CapabilityKind::Extension, name));
            }
            if !enabled_extensions.iter().any(|e| e == name) {
                enabled_extensions.push(name.to_string());
            }
        }
        for name in self.extensions.requested() {
            if snapshot.supports_extension(name) {
                if !enabled_extensions.contains(name) {
                    enabled_extensions.push(name.clone());
                }
            } else {
                log::debug!("{}: requested extension {} is not available", subject, name);
                optimal = false;
            }
        }
        let portability_subset =
            self.portability_subset && snapshot.supports_extension(PORTABILITY_SUBSET_EXTENSION);
        if portability_subset && !enabled_extensions.iter().any(|e| e == PORTABILITY_SUBSET_EXTENSION) {
            enabled_extensions.push(PORTABILITY_SUBSET_EXTENSION.to_string());
        }

        let roles = RoleAssignment::derive(&snapshot.families);

        if let Some(reason) = self.topology.first_unmet(&roles) {
            return Err(Error::missing(subject, CapabilityKind::QueueTopology, reason));
        }

        let surface = if self.topology.present {
            match snapshot.surface {
                Some(Ok(support)) => {
                    support.validate(&subject)?;
                    Some(support)
                }
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(Error::missing(
                        subject,
                        CapabilityKind::Presentation,
                        "surface support could not be queried",
                    ))
                }
            }
        } else {
            snapshot.surface.and_then(|s| s.ok())
        };

        if let Some(tier) = snapshot.features.first_unmet(&self.features) {
            return Err(Error::missing(
                subject,
                CapabilityKind::Feature,
                format!("{} features", tier),
            ));
        }

        if snapshot.api_version < self.version.required() {
            return Err(Error::UnsupportedVersion {
                subject,
                required: self.version.required(),
                available: snapshot.api_version,
            });
        }
        if snapshot.api_version < self.version.requested() {
            log::debug!(
                "{}: supports Vulkan {}, {} was requested",
                subject,
                snapshot.api_version,
                self.version.requested()
            );
            optimal = false;
        }

        let heap = largest_device_local_heap(&snapshot.memory).ok_or_else(|| {
            Error::missing(subject.clone(), CapabilityKind::Memory, "no device-local memory heap")
        })?;
        if heap < self.memory.required() {
            return Err(Error::missing(
                subject,
                CapabilityKind::Memory,
                format!(
                    "largest device-local heap is {} bytes, {} required",
                    heap,
                    self.memory.required()
                ),
            ));
        }
        if heap < self.memory.requested() {
            log::debug!(
                "{}: largest device-local heap is {} bytes, {} requested",
                subject,
                heap,
                self.memory.requested()
            );
            optimal = false;
        }

        if snapshot.class != self.preferred_class {
            if !self.allow_any_class {
                return Err(Error::missing(
                    subject,
                    CapabilityKind::DeviceClass,
                    format!("is a {}, {} required", snapshot.class, self.preferred_class),
                ));
            }
            optimal = false;
        }

        let mut suitability = Suitability::from_roles(&roles);
        suitability.portability_subset = portability_subset;
        suitability.optimal = optimal;

        Ok(PhysicalDevice {
            handle: snapshot.handle,
            name: snapshot.name,
            class: snapshot.class,
            api_version: snapshot.api_version,
            properties: snapshot.properties,
            memory: snapshot.memory,
            available_extensions: snapshot.extensions,
            enabled_extensions,
            available_features: snapshot.features,
            enabled_features: self.features.clone(),
            families: snapshot.families,
            roles,
            suitability,
            surface,
        })
    }
}

/// Judge snapshots in enumeration order, then order them best first. A
/// failed snapshot stays in the list as that device's rejection.
pub fn judge_all(
    criteria: &SelectionCriteria,
    snapshots: Vec<Result<DeviceSnapshot>>,
) -> Result<Vec<Result<PhysicalDevice>>> {
    if snapshots.is_empty() {
        return Err(Error::NoCandidate("no Vulkan physical devices were found".into()));
    }

    let judged = snapshots
        .into_iter()
        .map(|snapshot| {
            let verdict = snapshot.and_then(|snapshot| criteria.judge(snapshot));
            match &verdict {
                Ok(device) => log::debug!(
                    "Candidate {} ({}, Vulkan {}){}",
                    device.name(),
                    device.class(),
                    device.api_version(),
                    if device.is_optimal() { "" } else { " [not optimal]" }
                ),
                Err(err) => log::debug!("Rejected: {}", err),
            }
            verdict
        })
        .collect();

    Ok(order_candidates(judged))
}

/// First accepted device of an ordered list, else the first rejection.
pub fn pick_candidate(mut ordered: Vec<Result<PhysicalDevice>>) -> Result<PhysicalDevice> {
    if let Some(position) = ordered.iter().position(|r| r.is_ok()) {
        let device = ordered.swap_remove(position)?;
        log::info!(
            "Selected GPU: {} ({}, Vulkan {})",
            device.name(),
            device.class(),
            device.api_version()
        );
        return Ok(device);
    }
    match ordered.into_iter().next() {
        Some(rejection) => rejection,
        None => Err(Error::NoCandidate("no Vulkan physical devices were found".into())),
    }
}

/// A failed present query counts as no present support for that family.
fn family_present(result: VkResult<bool>, device_name: &str, family: u32) -> bool {
    match result {
        Ok(supported) => supported,
        Err(err) => {
            log::warn!(
                "{}: present support query for family {} failed: {}",
                device_name,
                family,
                err
            );
            false
        }
    }
}

/// Optimal candidates first, then everything else; enumeration order is
/// kept within each group.
pub fn order_candidates(judged: Vec<Result<PhysicalDevice>>) -> Vec<Result<PhysicalDevice>> {
    let (mut ordered, rest): (Vec<_>, Vec<_>) = judged
        .into_iter()
        .partition(|result| matches!(result, Ok(device) if device.is_optimal()));
    ordered.extend(rest);
    ordered
}

/// A judged, accepted physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    name: String,
    class: DeviceClass,
    api_version: ApiVersion,
    properties: DeviceProperties,
    memory: vk::PhysicalDeviceMemoryProperties,
    available_extensions: Vec<String>,
    enabled_extensions: Vec<String>,
    available_features: CapabilitySet,
    enabled_features: CapabilitySet,
    families: Vec<QueueFamily>,
    roles: RoleAssignment,
    suitability: Suitability,
    surface: Option<SurfaceSupport>,
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties.core
    }

    /// Core properties plus whichever 1.1 / 1.2 / 1.3 structs were queried.
    pub fn device_properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory
    }

    pub fn largest_device_local_heap(&self) -> u64 {
        largest_device_local_heap(&self.memory).unwrap_or(0)
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    pub fn queue_family(&self, index: u32) -> Option<&QueueFamily> {
        self.families.iter().find(|f| f.index == index)
    }

    pub fn roles(&self) -> &RoleAssignment {
        &self.roles
    }

    pub fn suitability(&self) -> Suitability {
        self.suitability
    }

    pub fn is_optimal(&self) -> bool {
        self.suitability.optimal
    }

    /// Surface triple captured during selection, if a surface was given.
    pub fn surface_support(&self) -> Option<&SurfaceSupport> {
        self.surface.as_ref()
    }

    pub fn query_surface_support(
        &self,
        connection: &Connection,
        surface: vk::SurfaceKHR,
    ) -> Result<SurfaceSupport> {
        query_surface_support(connection, self.handle, surface)
    }

    pub fn available_extensions(&self) -> &[String] {
        &self.available_extensions
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }

    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.available_extensions.iter().any(|e| e == name)
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.iter().any(|e| e == name)
    }

    /// Enable an extension after selection. Returns false if unsupported.
    pub fn enable_extension(&mut self, name: &str) -> bool {
        if !self.is_extension_supported(name) {
            log::warn!("{}: cannot enable unsupported extension {}", self.name, name);
            return false;
        }
        if !self.is_extension_enabled(name) {
            self.enabled_extensions.push(name.to_string());
        }
        true
    }

    pub fn available_features(&self) -> &CapabilitySet {
        &self.available_features
    }

    pub fn enabled_features(&self) -> &CapabilitySet {
        &self.enabled_features
    }

    pub fn are_features_supported(&self, features: &CapabilitySet) -> bool {
        self.available_features.satisfies(features)
    }

    pub fn are_features_enabled(&self, features: &CapabilitySet) -> bool {
        self.enabled_features.satisfies(features)
    }

    /// Enable more features after selection. Returns false (and changes
    /// nothing) if any of them is unsupported.
    pub fn enable_features(&mut self, features: &CapabilitySet) -> bool {
        if let Some(tier) = self.available_features.first_unmet(features) {
            log::warn!("{}: cannot enable unsupported {} features", self.name, tier);
            return false;
        }
        self.enabled_features.merge(features);
        true
    }
}

/// Fluent front end over [`SelectionCriteria`] bound to a connection.
pub struct DeviceSelector<'a> {
    connection: &'a Connection,
    criteria: SelectionCriteria,
    surface: Option<vk::SurfaceKHR>,
}

impl<'a> DeviceSelector<'a> {
    /// A non-headless connection implies a present queue requirement.
    pub fn new(connection: &'a Connection) -> Self {
        let mut criteria = SelectionCriteria::default();
        criteria.topology.present = !connection.is_headless();
        Self {
            connection,
            criteria,
            surface: None,
        }
    }

    /// Replace all criteria at once, the present requirement included.
    pub fn criteria(mut self, criteria: SelectionCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.criteria.name = Some(name.into());
        self
    }

    pub fn preferred_class(mut self, class: DeviceClass) -> Self {
        self.criteria.preferred_class = class;
        self
    }

    pub fn allow_any_class(mut self, allow: bool) -> Self {
        self.criteria.allow_any_class = allow;
        self
    }

    pub fn require_api_version(mut self, version: ApiVersion) -> Self {
        self.criteria.version.require(version);
        self
    }

    pub fn request_api_version(mut self, version: ApiVersion) -> Self {
        self.criteria.version.request(version);
        self
    }

    pub fn require_extension(mut self, name: impl Into<String>) -> Self {
        self.criteria.extensions.require(name.into());
        self
    }

    pub fn request_extension(mut self, name: impl Into<String>) -> Self {
        self.criteria.extensions.request(name.into());
        self
    }

    pub fn require_features(mut self, features: &CapabilitySet) -> Self {
        self.criteria.features.merge(features);
        self
    }

    pub fn require_memory(mut self, bytes: u64) -> Self {
        self.criteria.memory.require(bytes);
        self
    }

    pub fn request_memory(mut self, bytes: u64) -> Self {
        self.criteria.memory.request(bytes);
        self
    }

    pub fn require_graphics_queue(mut self, require: bool) -> Self {
        self.criteria.topology.graphics = require;
        self
    }

    pub fn require_present_queue(mut self, require: bool) -> Self {
        self.criteria.topology.present = require;
        self
    }

    pub fn compute_queue(mut self, requirement: QueueRequirement) -> Self {
        self.criteria.topology.compute = requirement;
        self
    }

    pub fn transfer_queue(mut self, requirement: QueueRequirement) -> Self {
        self.criteria.topology.transfer = requirement;
        self
    }

    pub fn portability_subset(mut self, enable: bool) -> Self {
        self.criteria.portability_subset = enable;
        self
    }

    pub fn surface(mut self, surface: vk::SurfaceKHR) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn selection_criteria(&self) -> &SelectionCriteria {
        &self.criteria
    }

    /// Judge every device, best first. One entry per enumerated device.
    pub fn enumerate(&self) -> Result<Vec<Result<PhysicalDevice>>> {
        if self.criteria.topology.present && self.surface.is_none() {
            return Err(Error::InvalidConfiguration(
                "a present queue is required but no surface was given".into(),
            ));
        }

        let handles = unsafe { self.connection.instance().enumerate_physical_devices() }
            .map_err(|result| Error::query("physical devices", result))?;
        let snapshots = handles.into_iter().map(|handle| self.snapshot(handle)).collect();
        judge_all(&self.criteria, snapshots)
    }

    /// Best candidate. When nothing is acceptable the first rejection is
    /// returned.
    pub fn select(&self) -> Result<PhysicalDevice> {
        pick_candidate(self.enumerate()?)
    }

    fn snapshot(&self, handle: vk::PhysicalDevice) -> Result<DeviceSnapshot> {
        let instance = self.connection.instance();
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let memory = unsafe { instance.get_physical_device_memory_properties(handle) };
        let api_version = ApiVersion(properties.api_version);
        let name = fixed_str(&properties.device_name);

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }
            .map_err(|result| Error::query(format!("extensions of '{}'", name), result))?
            .iter()
            .map(|props| fixed_str(&props.extension_name))
            .collect();

        let mut families: Vec<QueueFamily> =
            unsafe { instance.get_physical_device_queue_family_properties(handle) }
                .iter()
                .enumerate()
                .map(|(index, props)| QueueFamily::new(index as u32, props.queue_flags, props.queue_count))
                .collect();

        let mut surface = None;
        if let (Some(surface_handle), Some(loader)) = (self.surface, self.connection.surface_loader()) {
            for family in &mut families {
                family.present = family_present(
                    unsafe {
                        loader.get_physical_device_surface_support(handle, family.index, surface_handle)
                    },
                    &name,
                    family.index,
                );
            }
            surface = Some(query_surface_support(self.connection, handle, surface_handle));
        }

        let features = self.query_features(handle, api_version);
        let class = DeviceClass::from(properties.device_type);
        let properties = self.query_properties(handle, api_version, properties);

        Ok(DeviceSnapshot {
            handle,
            name,
            class,
            api_version,
            properties,
            memory,
            extensions,
            features,
            families,
            surface,
        })
    }

    /// Same gating as the feature query; 1.0 keeps the core properties.
    fn query_properties(
        &self,
        handle: vk::PhysicalDevice,
        device_version: ApiVersion,
        core: vk::PhysicalDeviceProperties,
    ) -> DeviceProperties {
        let instance = self.connection.instance();
        let version = device_version.min(self.connection.api_version());
        if version >= ApiVersion::V1_1 {
            let mut chain = PropertyChain::for_query(version);
            unsafe { instance.get_physical_device_properties2(handle, chain.head_mut()) };
            chain.into_properties()
        } else if let Some(loader) = self.connection.properties2_loader() {
            let mut chain = PropertyChain::for_query(ApiVersion::V1_0);
            unsafe { loader.get_physical_device_properties2(handle, chain.head_mut()) };
            chain.into_properties()
        } else {
            DeviceProperties::from_core(core)
        }
    }

    fn query_features(&self, handle: vk::PhysicalDevice, device_version: ApiVersion) -> CapabilitySet {
        let instance = self.connection.instance();
        let version = device_version.min(self.connection.api_version());
        if version >= ApiVersion::V1_1 {
            let mut chain = FeatureChain::for_query(version);
            unsafe { instance.get_physical_device_features2(handle, chain.head_mut()) };
            chain.to_set()
        } else if let Some(loader) = self.connection.properties2_loader() {
            let mut chain = FeatureChain::for_query(ApiVersion::V1_0);
            unsafe { loader.get_physical_device_features2(handle, chain.head_mut()) };
            chain.to_set()
        } else {
            let core = unsafe { instance.get_physical_device_features(handle) };
            CapabilitySet::empty().with_core(core)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags) -> QueueFamily {
        QueueFamily::new(index, flags, 4)
    }

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn dedicated_beats_separate_beats_compatible() {
        let families = [
            family(0, G | C | T),
            family(1, C | T),
            family(2, C),
            family(3, T),
        ];
        let roles = RoleAssignment::derive(&families);
        assert_eq!(roles.family(QueueRole::Graphics), Some(0));
        assert_eq!(
            roles.binding(QueueRole::Compute),
            Some(RoleBinding { family: 2, quality: QueueMatch::Dedicated })
        );
        assert_eq!(
            roles.binding(QueueRole::Transfer),
            Some(RoleBinding { family: 3, quality: QueueMatch::Dedicated })
        );
    }

    #[test]
    fn separate_family_still_shares_the_other_class() {
        let roles = RoleAssignment::derive(&[family(0, G | C | T), family(1, C | T)]);
        assert_eq!(
            roles.binding(QueueRole::Compute),
            Some(RoleBinding { family: 1, quality: QueueMatch::Separate })
        );
        assert_eq!(
            roles.binding(QueueRole::Transfer),
            Some(RoleBinding { family: 1, quality: QueueMatch::Separate })
        );
    }

    #[test]
    fn single_family_is_only_compatible() {
        let roles = RoleAssignment::derive(&[family(0, G | C | T).with_present(true)]);
        for role in QueueRole::ALL {
            assert_eq!(roles.family(role), Some(0));
        }
        assert_eq!(roles.roles_for_family(0).count(), 4);
        assert!(!QueueRequirement::Separate.is_met_by(roles.binding(QueueRole::Compute)));
        assert!(QueueRequirement::Any.is_met_by(roles.binding(QueueRole::Compute)));
    }

    #[test]
    fn dedicated_satisfies_separate() {
        let binding = Some(RoleBinding { family: 1, quality: QueueMatch::Dedicated });
        assert!(QueueRequirement::Separate.is_met_by(binding));
        assert!(QueueRequirement::Dedicated.is_met_by(binding));
        assert!(!QueueRequirement::Dedicated.is_met_by(None));
        assert!(QueueRequirement::None.is_met_by(None));
    }

    #[test]
    fn largest_heap_ignores_host_heaps() {
        let snapshot = DeviceSnapshot::new("gpu", DeviceClass::Discrete, ApiVersion::V1_3)
            .with_memory_heaps(&[(1 << 34, false), (1 << 30, true), (1 << 32, true)]);
        assert_eq!(largest_device_local_heap(&snapshot.memory), Some(1 << 32));
        let host_only = DeviceSnapshot::new("cpu", DeviceClass::Cpu, ApiVersion::V1_3)
            .with_memory_heaps(&[(1 << 34, false)]);
        assert_eq!(largest_device_local_heap(&host_only.memory), None);
    }

    #[test]
    fn empty_families_never_take_a_role() {
        let families = [
            QueueFamily::new(0, G | C | T, 0).with_present(true),
            family(1, G | C | T),
            QueueFamily::new(2, C, 0),
            family(3, C | T).with_present(true),
        ];
        let roles = RoleAssignment::derive(&families);
        assert_eq!(roles.family(QueueRole::Graphics), Some(1));
        assert_eq!(
            roles.binding(QueueRole::Compute),
            Some(RoleBinding { family: 3, quality: QueueMatch::Separate })
        );
        assert_eq!(roles.family(QueueRole::Present), Some(3));

        let none = RoleAssignment::derive(&[QueueFamily::new(0, G | C | T, 0)]);
        for role in QueueRole::ALL {
            assert_eq!(none.family(role), None);
        }
    }

    #[test]
    fn failed_present_query_means_no_present_support() {
        assert!(family_present(Ok(true), "gpu", 0));
        assert!(!family_present(Ok(false), "gpu", 0));
        assert!(!family_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR), "gpu", 1));
    }
}
