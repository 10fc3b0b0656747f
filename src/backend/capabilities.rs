// Capability sets - version-gated feature tiers
//
// Device features are held as an ordered list of flat boolean tiers (core,
// then the Vulkan 1.1 / 1.2 / 1.3 feature structs). Comparison and chain
// assembly are loops over the tiers gated by the API version. Feature and
// property chains share one pNext linker.

use ash::vk;
use std::mem::{offset_of, size_of};

use super::version::ApiVersion;

/// One feature tier. Order matters: tiers are walked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    Core,
    Vulkan11,
    Vulkan12,
    Vulkan13,
}

impl TierKind {
    pub const ALL: [TierKind; 4] = [
        TierKind::Core,
        TierKind::Vulkan11,
        TierKind::Vulkan12,
        TierKind::Vulkan13,
    ];

    /// Lowest API version at which this tier's struct may be chained.
    /// `VkPhysicalDeviceVulkan11Features` itself only exists from 1.2 on.
    pub fn min_version(self) -> ApiVersion {
        match self {
            TierKind::Core => ApiVersion::V1_0,
            TierKind::Vulkan11 | TierKind::Vulkan12 => ApiVersion::V1_2,
            TierKind::Vulkan13 => ApiVersion::V1_3,
        }
    }

    pub fn is_available_at(self, version: ApiVersion) -> bool {
        version.without_patch() >= self.min_version()
    }

    /// Number of boolean flags in the tier's native struct.
    pub fn flag_count(self) -> usize {
        self.layout().count
    }

    fn index(self) -> usize {
        self as usize
    }

    fn layout(self) -> TierLayout {
        match self {
            TierKind::Core => TierLayout {
                offset: offset_of!(vk::PhysicalDeviceFeatures, robust_buffer_access),
                count: 55,
                size: size_of::<vk::PhysicalDeviceFeatures>(),
            },
            TierKind::Vulkan11 => TierLayout {
                offset: offset_of!(
                    vk::PhysicalDeviceVulkan11Features,
                    storage_buffer16_bit_access
                ),
                count: 12,
                size: size_of::<vk::PhysicalDeviceVulkan11Features>(),
            },
            TierKind::Vulkan12 => TierLayout {
                offset: offset_of!(
                    vk::PhysicalDeviceVulkan12Features,
                    sampler_mirror_clamp_to_edge
                ),
                count: 47,
                size: size_of::<vk::PhysicalDeviceVulkan12Features>(),
            },
            TierKind::Vulkan13 => TierLayout {
                offset: offset_of!(vk::PhysicalDeviceVulkan13Features, robust_image_access),
                count: 15,
                size: size_of::<vk::PhysicalDeviceVulkan13Features>(),
            },
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TierKind::Core => "core",
            TierKind::Vulkan11 => "Vulkan 1.1",
            TierKind::Vulkan12 => "Vulkan 1.2",
            TierKind::Vulkan13 => "Vulkan 1.3",
        })
    }
}

/// Where the run of `VkBool32` members sits inside a native feature struct.
#[derive(Debug, Clone, Copy)]
struct TierLayout {
    offset: usize,
    count: usize,
    size: usize,
}

impl TierLayout {
    fn read<T>(self, raw: &T) -> Vec<bool> {
        debug_assert!(self.offset + self.count * size_of::<vk::Bool32>() <= self.size);
        // SAFETY: every feature struct used here is `repr(C)` with `count`
        // consecutive `VkBool32` members starting at `offset`.
        let flags = unsafe {
            let base = (raw as *const T as *const u8).add(self.offset) as *const vk::Bool32;
            std::slice::from_raw_parts(base, self.count)
        };
        flags.iter().map(|&flag| flag != vk::FALSE).collect()
    }

    fn write<T>(self, raw: &mut T, flags: &[bool]) {
        debug_assert!(self.offset + self.count * size_of::<vk::Bool32>() <= self.size);
        // SAFETY: see `read`.
        let dst = unsafe {
            let base = (raw as *mut T as *mut u8).add(self.offset) as *mut vk::Bool32;
            std::slice::from_raw_parts_mut(base, self.count)
        };
        for (dst, &flag) in dst.iter_mut().zip(flags) {
            *dst = if flag { vk::TRUE } else { vk::FALSE };
        }
    }
}

/// Full set of device features across all tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    tiers: [Vec<bool>; 4],
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::empty()
    }
}

impl CapabilitySet {
    /// Every flag false.
    pub fn empty() -> Self {
        Self {
            tiers: TierKind::ALL.map(|kind| vec![false; kind.flag_count()]),
        }
    }

    pub fn tier(&self, kind: TierKind) -> &[bool] {
        &self.tiers[kind.index()]
    }

    pub fn flag(&self, kind: TierKind, index: usize) -> bool {
        self.tiers[kind.index()].get(index).copied().unwrap_or(false)
    }

    pub fn set_flag(&mut self, kind: TierKind, index: usize, value: bool) {
        if let Some(flag) = self.tiers[kind.index()].get_mut(index) {
            *flag = value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().flatten().all(|&flag| !flag)
    }

    /// Highest tier holding any set flag.
    pub fn highest_used_tier(&self) -> Option<TierKind> {
        TierKind::ALL
            .into_iter()
            .rev()
            .find(|&kind| self.tier(kind).iter().any(|&flag| flag))
    }

    pub fn with_core(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.tiers[TierKind::Core.index()] = TierKind::Core.layout().read(&features);
        self
    }

    pub fn with_vulkan11(mut self, features: vk::PhysicalDeviceVulkan11Features) -> Self {
        self.tiers[TierKind::Vulkan11.index()] = TierKind::Vulkan11.layout().read(&features);
        self
    }

    pub fn with_vulkan12(mut self, features: vk::PhysicalDeviceVulkan12Features) -> Self {
        self.tiers[TierKind::Vulkan12.index()] = TierKind::Vulkan12.layout().read(&features);
        self
    }

    pub fn with_vulkan13(mut self, features: vk::PhysicalDeviceVulkan13Features) -> Self {
        self.tiers[TierKind::Vulkan13.index()] = TierKind::Vulkan13.layout().read(&features);
        self
    }

    pub fn core(&self) -> vk::PhysicalDeviceFeatures {
        let mut raw = vk::PhysicalDeviceFeatures::default();
        TierKind::Core.layout().write(&mut raw, self.tier(TierKind::Core));
        raw
    }

    pub fn vulkan11(&self) -> vk::PhysicalDeviceVulkan11Features {
        let mut raw = vk::PhysicalDeviceVulkan11Features::default();
        TierKind::Vulkan11.layout().write(&mut raw, self.tier(TierKind::Vulkan11));
        raw
    }

    pub fn vulkan12(&self) -> vk::PhysicalDeviceVulkan12Features {
        let mut raw = vk::PhysicalDeviceVulkan12Features::default();
        TierKind::Vulkan12.layout().write(&mut raw, self.tier(TierKind::Vulkan12));
        raw
    }

    pub fn vulkan13(&self) -> vk::PhysicalDeviceVulkan13Features {
        let mut raw = vk::PhysicalDeviceVulkan13Features::default();
        TierKind::Vulkan13.layout().write(&mut raw, self.tier(TierKind::Vulkan13));
        raw
    }

    /// Set every flag that is set in `other`.
    pub fn merge(&mut self, other: &CapabilitySet) {
        for (mine, theirs) in self.tiers.iter_mut().zip(&other.tiers) {
            for (dst, &src) in mine.iter_mut().zip(theirs) {
                *dst |= src;
            }
        }
    }

    /// Clear every tier the given version cannot express.
    pub fn restrict_to(&mut self, version: ApiVersion) {
        for kind in TierKind::ALL {
            if !kind.is_available_at(version) {
                self.tiers[kind.index()].fill(false);
            }
        }
    }

    /// First tier in which `requested` asks for something `self` lacks.
    pub fn first_unmet(&self, requested: &CapabilitySet) -> Option<TierKind> {
        TierKind::ALL.into_iter().find(|&kind| {
            self.tier(kind)
                .iter()
                .zip(requested.tier(kind))
                .any(|(&have, &want)| want && !have)
        })
    }

    pub fn satisfies(&self, requested: &CapabilitySet) -> bool {
        compare(self, requested)
    }
}

/// False iff some flag is false in `supported` and true in `requested`.
pub fn compare(supported: &CapabilitySet, requested: &CapabilitySet) -> bool {
    supported.first_unmet(requested).is_none()
}

/// Link `head` to the 1.1 / 1.2 / 1.3 nodes the version allows, in order,
/// and terminate the chain.
///
/// # Safety
/// Every pointer must refer to a live struct that starts with the
/// sType/pNext header.
unsafe fn link_tiers(
    head: *mut vk::BaseOutStructure,
    tiers: [*mut vk::BaseOutStructure; 3],
    version: ApiVersion,
) {
    let mut links = Vec::with_capacity(4);
    links.push(head);
    for (kind, node) in [TierKind::Vulkan11, TierKind::Vulkan12, TierKind::Vulkan13]
        .into_iter()
        .zip(tiers)
    {
        if kind.is_available_at(version) {
            links.push(node);
        }
    }
    for pair in links.windows(2) {
        (*pair[0]).p_next = pair[1];
    }
    if let Some(&last) = links.last() {
        (*last).p_next = std::ptr::null_mut();
    }
}

/// Native feature structs linked through `p_next`, used both to query a
/// device's features and to activate them at device creation.
///
/// The structs are boxed so their addresses stay put once linked.
pub struct FeatureChain {
    head: Box<vk::PhysicalDeviceFeatures2>,
    vulkan11: Box<vk::PhysicalDeviceVulkan11Features>,
    vulkan12: Box<vk::PhysicalDeviceVulkan12Features>,
    vulkan13: Box<vk::PhysicalDeviceVulkan13Features>,
    version: ApiVersion,
}

impl FeatureChain {
    /// Chain of all-false structs, for querying.
    pub fn for_query(version: ApiVersion) -> Self {
        Self::from_set(&CapabilitySet::empty(), version)
    }

    /// Chain populated from `set`, for activation. Tiers above `version` are
    /// left out of the chain.
    pub fn from_set(set: &CapabilitySet, version: ApiVersion) -> Self {
        let mut chain = Self {
            head: Box::new(vk::PhysicalDeviceFeatures2 {
                features: set.core(),
                ..Default::default()
            }),
            vulkan11: Box::new(set.vulkan11()),
            vulkan12: Box::new(set.vulkan12()),
            vulkan13: Box::new(set.vulkan13()),
            version,
        };
        chain.link();
        chain
    }

    fn link(&mut self) {
        let head = std::ptr::addr_of_mut!(*self.head).cast();
        let vulkan11 = std::ptr::addr_of_mut!(*self.vulkan11).cast();
        let vulkan12 = std::ptr::addr_of_mut!(*self.vulkan12).cast();
        let vulkan13 = std::ptr::addr_of_mut!(*self.vulkan13).cast();
        // SAFETY: every node is a boxed, live struct owned by `self`.
        unsafe { link_tiers(head, [vulkan11, vulkan12, vulkan13], self.version) };
    }

    /// Head of the chain, to pass to `vkGetPhysicalDeviceFeatures2` or to
    /// hang off `VkDeviceCreateInfo::pNext`.
    pub fn head_mut(&mut self) -> &mut vk::PhysicalDeviceFeatures2 {
        &mut self.head
    }

    pub fn head_ptr(&self) -> *const std::ffi::c_void {
        &*self.head as *const vk::PhysicalDeviceFeatures2 as *const _
    }

    /// Read the (possibly driver-filled) chain back into a capability set.
    pub fn to_set(&self) -> CapabilitySet {
        let mut set = CapabilitySet::empty().with_core(self.head.features);
        if TierKind::Vulkan11.is_available_at(self.version) {
            set = set.with_vulkan11(*self.vulkan11);
        }
        if TierKind::Vulkan12.is_available_at(self.version) {
            set = set.with_vulkan12(*self.vulkan12);
        }
        if TierKind::Vulkan13.is_available_at(self.version) {
            set = set.with_vulkan13(*self.vulkan13);
        }
        set
    }
}

/// Device properties, including the 1.1 / 1.2 / 1.3 property structs when
/// the device and connection versions allow them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceProperties {
    pub core: vk::PhysicalDeviceProperties,
    pub vulkan11: Option<vk::PhysicalDeviceVulkan11Properties>,
    pub vulkan12: Option<vk::PhysicalDeviceVulkan12Properties>,
    pub vulkan13: Option<vk::PhysicalDeviceVulkan13Properties>,
}

// SAFETY: every `p_next` is nulled before the structs leave the chain, so
// the value holds no pointers.
unsafe impl Send for DeviceProperties {}
unsafe impl Sync for DeviceProperties {}

impl DeviceProperties {
    /// Core properties only, as reported by a 1.0 query.
    pub fn from_core(core: vk::PhysicalDeviceProperties) -> Self {
        Self {
            core,
            ..Default::default()
        }
    }
}

/// Native property structs linked through `p_next` for
/// `vkGetPhysicalDeviceProperties2`.
pub struct PropertyChain {
    head: Box<vk::PhysicalDeviceProperties2>,
    vulkan11: Box<vk::PhysicalDeviceVulkan11Properties>,
    vulkan12: Box<vk::PhysicalDeviceVulkan12Properties>,
    vulkan13: Box<vk::PhysicalDeviceVulkan13Properties>,
    version: ApiVersion,
}

impl PropertyChain {
    /// Empty chain for querying. Tiers above `version` are left out.
    pub fn for_query(version: ApiVersion) -> Self {
        let mut chain = Self {
            head: Box::default(),
            vulkan11: Box::default(),
            vulkan12: Box::default(),
            vulkan13: Box::default(),
            version,
        };
        let head = std::ptr::addr_of_mut!(*chain.head).cast();
        let vulkan11 = std::ptr::addr_of_mut!(*chain.vulkan11).cast();
        let vulkan12 = std::ptr::addr_of_mut!(*chain.vulkan12).cast();
        let vulkan13 = std::ptr::addr_of_mut!(*chain.vulkan13).cast();
        // SAFETY: every node is a boxed, live struct owned by `chain`.
        unsafe { link_tiers(head, [vulkan11, vulkan12, vulkan13], version) };
        chain
    }

    pub fn head_mut(&mut self) -> &mut vk::PhysicalDeviceProperties2 {
        &mut self.head
    }

    /// Copy the driver-filled structs out, with every `p_next` cleared.
    pub fn into_properties(self) -> DeviceProperties {
        let tier = |kind: TierKind| kind.is_available_at(self.version);
        DeviceProperties {
            core: self.head.properties,
            vulkan11: tier(TierKind::Vulkan11).then(|| {
                let mut props = *self.vulkan11;
                props.p_next = std::ptr::null_mut();
                props
            }),
            vulkan12: tier(TierKind::Vulkan12).then(|| {
                let mut props = *self.vulkan12;
                props.p_next = std::ptr::null_mut();
                props
            }),
            vulkan13: tier(TierKind::Vulkan13).then(|| {
                let mut props = *self.vulkan13;
                props.p_next = std::ptr::null_mut();
                props
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anisotropy() -> CapabilitySet {
        CapabilitySet::empty().with_core(vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        })
    }

    #[test]
    fn empty_request_is_always_satisfied() {
        assert!(compare(&CapabilitySet::empty(), &CapabilitySet::empty()));
        assert!(compare(&anisotropy(), &CapabilitySet::empty()));
    }

    #[test]
    fn missing_flag_fails_comparison() {
        assert!(!compare(&CapabilitySet::empty(), &anisotropy()));
        assert_eq!(
            CapabilitySet::empty().first_unmet(&anisotropy()),
            Some(TierKind::Core)
        );
    }

    #[test]
    fn extra_supported_flags_do_not_matter() {
        let mut supported = anisotropy().with_vulkan12(vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        });
        assert!(compare(&supported, &anisotropy()));
        supported.set_flag(TierKind::Core, 0, true);
        assert!(compare(&supported, &anisotropy()));
    }

    #[test]
    fn unmet_flag_reports_its_tier() {
        let wanted = CapabilitySet::empty().with_vulkan13(vk::PhysicalDeviceVulkan13Features {
            dynamic_rendering: vk::TRUE,
            ..Default::default()
        });
        assert_eq!(anisotropy().first_unmet(&wanted), Some(TierKind::Vulkan13));
        assert_eq!(wanted.highest_used_tier(), Some(TierKind::Vulkan13));
    }

    #[test]
    fn native_round_trip_keeps_named_flags() {
        let set = CapabilitySet::empty().with_vulkan12(vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            buffer_device_address: vk::TRUE,
            ..Default::default()
        });
        let raw = set.vulkan12();
        assert_eq!(raw.timeline_semaphore, vk::TRUE);
        assert_eq!(raw.buffer_device_address, vk::TRUE);
        assert_eq!(raw.descriptor_indexing, vk::FALSE);
        assert_eq!(raw.s_type, vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES);
        assert_eq!(set.tier(TierKind::Vulkan12).iter().filter(|&&f| f).count(), 2);
    }

    #[test]
    fn restrict_clears_tiers_above_version() {
        let mut set = anisotropy().with_vulkan13(vk::PhysicalDeviceVulkan13Features {
            synchronization2: vk::TRUE,
            ..Default::default()
        });
        set.restrict_to(ApiVersion::new(1, 2, 200));
        assert_eq!(set, anisotropy());
    }

    #[test]
    fn chain_links_only_tiers_the_version_allows() {
        let chain = FeatureChain::for_query(ApiVersion::V1_2);
        assert_eq!(
            chain.head.p_next as *const u8,
            &*chain.vulkan11 as *const _ as *const u8
        );
        assert_eq!(
            chain.vulkan11.p_next as *const u8,
            &*chain.vulkan12 as *const _ as *const u8
        );
        assert!(chain.vulkan12.p_next.is_null());

        let old = FeatureChain::for_query(ApiVersion::V1_1);
        assert!(old.head.p_next.is_null());
    }

    #[test]
    fn chain_reads_back_activated_flags() {
        let set = anisotropy().with_vulkan13(vk::PhysicalDeviceVulkan13Features {
            maintenance4: vk::TRUE,
            ..Default::default()
        });
        assert_eq!(FeatureChain::from_set(&set, ApiVersion::V1_3).to_set(), set);
        assert_eq!(
            FeatureChain::from_set(&set, ApiVersion::V1_2).to_set(),
            anisotropy()
        );
    }

    #[test]
    fn property_chain_links_only_tiers_the_version_allows() {
        let chain = PropertyChain::for_query(ApiVersion::V1_3);
        assert_eq!(
            chain.head.p_next as *const u8,
            &*chain.vulkan11 as *const _ as *const u8
        );
        assert_eq!(
            chain.vulkan12.p_next as *const u8,
            &*chain.vulkan13 as *const _ as *const u8
        );
        assert!(chain.vulkan13.p_next.is_null());

        assert!(PropertyChain::for_query(ApiVersion::V1_1).head.p_next.is_null());
    }

    #[test]
    fn properties_keep_only_queried_tiers_and_drop_links() {
        let mut chain = PropertyChain::for_query(ApiVersion::V1_2);
        chain.head.properties.api_version = ApiVersion::V1_2.0;
        chain.vulkan11.max_multiview_view_count = 6;
        chain.vulkan12.max_update_after_bind_descriptors_in_all_pools = 1 << 20;

        let properties = chain.into_properties();
        assert_eq!(properties.core.api_version, ApiVersion::V1_2.0);
        let vulkan11 = properties.vulkan11.expect("1.1 properties");
        assert_eq!(vulkan11.max_multiview_view_count, 6);
        assert!(vulkan11.p_next.is_null());
        let vulkan12 = properties.vulkan12.expect("1.2 properties");
        assert_eq!(vulkan12.max_update_after_bind_descriptors_in_all_pools, 1 << 20);
        assert!(vulkan12.p_next.is_null());
        assert!(properties.vulkan13.is_none());
    }
}
