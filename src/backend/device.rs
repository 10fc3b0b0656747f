// Execution Context - logical device + role-assigned queues
//
// Responsibilities:
// - Turn per-family queue requests into clamped create infos
// - Activate the selected extensions and feature tiers
// - Check the device dispatch table for mandatory entry points
// - Create one queue object per native queue, shared across roles
// - Destroy whatever was already created when a later step fails

use ash::extensions::khr::Swapchain;
use ash::vk;
use std::os::raw::c_char;
use std::sync::Arc;

use super::capabilities::{CapabilitySet, FeatureChain};
use super::dispatch;
use super::error::{CapabilityKind, Error, Result};
use super::instance::{to_cstring, Connection};
use super::physical_device::{
    query_surface_support, PhysicalDevice, QueueFamily, QueueRole, RoleAssignment, SurfaceSupport,
    SWAPCHAIN_EXTENSION,
};
use super::queue::Queue;
use super::undo::UndoStack;
use super::version::ApiVersion;

/// Priorities for queues wanted from one family. Required queues come first
/// in the final priority array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuePriorities {
    pub required: Vec<f32>,
    pub requested: Vec<f32>,
}

impl QueuePriorities {
    pub fn required(priorities: &[f32]) -> Self {
        Self {
            required: priorities.to_vec(),
            requested: Vec::new(),
        }
    }

    pub fn requested(priorities: &[f32]) -> Self {
        Self {
            required: Vec::new(),
            requested: priorities.to_vec(),
        }
    }

    pub fn total(&self) -> usize {
        self.required.len() + self.requested.len()
    }
}

/// Queues to create from one family.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyPlan {
    pub family: u32,
    pub priorities: Vec<f32>,
}

impl FamilyPlan {
    pub fn queue_count(&self) -> u32 {
        self.priorities.len() as u32
    }
}

/// Resolved queue layout: what to create, and how many queues each role gets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueLayout {
    pub families: Vec<FamilyPlan>,
    pub role_counts: [u32; 4],
}

/// Unique native queues and, per role, indices into that list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSlots {
    pub unique: Vec<(u32, u32)>,
    pub by_role: [Vec<usize>; 4],
}

impl QueueLayout {
    pub fn role_count(&self, role: QueueRole) -> u32 {
        self.role_counts[role.index()]
    }

    /// One slot per (role, n); roles landing on the same (family, index)
    /// share a slot.
    pub fn slots(&self, roles: &RoleAssignment) -> QueueSlots {
        let mut slots = QueueSlots::default();
        for role in QueueRole::ALL {
            let Some(family) = roles.family(role) else {
                continue;
            };
            for index in 0..self.role_count(role) {
                let key = (family, index);
                let slot = match slots.unique.iter().position(|&existing| existing == key) {
                    Some(slot) => slot,
                    None => {
                        slots.unique.push(key);
                        slots.unique.len() - 1
                    }
                };
                slots.by_role[role.index()].push(slot);
            }
        }
        slots
    }
}

/// Clamp and merge queue requests against the family table.
pub fn plan_queues(
    families: &[QueueFamily],
    roles: &RoleAssignment,
    requests: &[(u32, QueuePriorities)],
) -> Result<QueueLayout> {
    let mut merged: Vec<(u32, QueuePriorities)> = Vec::new();
    for (family, priorities) in requests {
        match merged.iter_mut().find(|(f, _)| f == family) {
            Some((_, existing)) => {
                existing.required.extend_from_slice(&priorities.required);
                existing.requested.extend_from_slice(&priorities.requested);
            }
            None => merged.push((*family, priorities.clone())),
        }
    }

    let mut layout = QueueLayout::default();
    for (index, priorities) in merged {
        if priorities.total() == 0 {
            continue;
        }
        let family = families
            .iter()
            .find(|f| f.index == index)
            .ok_or_else(|| Error::InvalidConfiguration(format!("queue family {} does not exist", index)))?;
        let capacity = family.queue_count as usize;
        if priorities.required.len() > capacity {
            return Err(Error::missing(
                format!("queue family {}", index),
                CapabilityKind::QueueTopology,
                format!(
                    "{} queues required, only {} available",
                    priorities.required.len(),
                    capacity
                ),
            ));
        }
        let count = priorities.total().min(capacity);
        if count < priorities.total() {
            log::warn!(
                "Queue family {}: {} queues wanted, clamped to {}",
                index,
                priorities.total(),
                capacity
            );
        }

        let mut ordered = priorities.required;
        ordered.extend(priorities.requested);
        ordered.truncate(count);

        for role in roles.roles_for_family(index) {
            layout.role_counts[role.index()] += count as u32;
        }
        layout.families.push(FamilyPlan {
            family: index,
            priorities: ordered,
        });
    }
    Ok(layout)
}

/// Where a queue request goes: a role's family or an explicit family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTarget {
    Role(QueueRole),
    Family(u32),
}

/// Fluent builder for [`ExecutionContext`].
pub struct ExecutionContextBuilder<'a> {
    connection: &'a Connection,
    physical_device: &'a PhysicalDevice,
    requests: Vec<(QueueTarget, QueuePriorities)>,
}

impl<'a> ExecutionContextBuilder<'a> {
    pub fn new(connection: &'a Connection, physical_device: &'a PhysicalDevice) -> Self {
        Self {
            connection,
            physical_device,
            requests: Vec::new(),
        }
    }

    pub fn require_queues(mut self, role: QueueRole, priorities: &[f32]) -> Self {
        self.requests
            .push((QueueTarget::Role(role), QueuePriorities::required(priorities)));
        self
    }

    pub fn request_queues(mut self, role: QueueRole, priorities: &[f32]) -> Self {
        self.requests
            .push((QueueTarget::Role(role), QueuePriorities::requested(priorities)));
        self
    }

    pub fn require_family_queues(mut self, family: u32, priorities: &[f32]) -> Self {
        self.requests
            .push((QueueTarget::Family(family), QueuePriorities::required(priorities)));
        self
    }

    pub fn request_family_queues(mut self, family: u32, priorities: &[f32]) -> Self {
        self.requests
            .push((QueueTarget::Family(family), QueuePriorities::requested(priorities)));
        self
    }

    /// Resolve role targets to families. With no requests at all, every
    /// assigned role gets one queue.
    fn family_requests(&self) -> Result<Vec<(u32, QueuePriorities)>> {
        let roles = self.physical_device.roles();
        if self.requests.is_empty() {
            return Ok(QueueRole::ALL
                .into_iter()
                .filter_map(|role| roles.family(role))
                .map(|family| (family, QueuePriorities::required(&[1.0])))
                .fold(Vec::new(), |mut acc, request| {
                    if !acc.iter().any(|(f, _)| *f == request.0) {
                        acc.push(request);
                    }
                    acc
                }));
        }
        self.requests
            .iter()
            .map(|(target, priorities)| match *target {
                QueueTarget::Family(family) => Ok((family, priorities.clone())),
                QueueTarget::Role(role) => roles
                    .family(role)
                    .map(|family| (family, priorities.clone()))
                    .ok_or_else(|| {
                        Error::missing(
                            format!("device '{}'", self.physical_device.name()),
                            CapabilityKind::QueueTopology,
                            format!("no {} queue family", role),
                        )
                    }),
            })
            .collect()
    }

    pub fn plan(&self) -> Result<QueueLayout> {
        plan_queues(
            self.physical_device.queue_families(),
            self.physical_device.roles(),
            &self.family_requests()?,
        )
    }

    pub fn build(&self) -> Result<ExecutionContext> {
        let instance = self.connection.instance();
        let candidate = self.physical_device;
        let layout = self.plan()?;
        let slots = layout.slots(candidate.roles());

        let version = candidate.api_version().min(self.connection.api_version());
        let mut features = candidate.enabled_features().clone();
        features.restrict_to(version);
        let use_features2 = version >= ApiVersion::V1_1 || self.connection.info().properties2;
        let chain = FeatureChain::from_set(&features, if version >= ApiVersion::V1_1 { version } else { ApiVersion::V1_0 });
        let core_features = features.core();

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = layout
            .families
            .iter()
            .map(|plan| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(plan.family)
                    .queue_priorities(&plan.priorities)
                    .build()
            })
            .collect();

        let extension_names = candidate
            .enabled_extensions()
            .iter()
            .map(|name| to_cstring(name))
            .collect::<Result<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = device_create_info(
            &queue_infos,
            &extension_ptrs,
            if use_features2 { FeatureSource::Chain(&chain) } else { FeatureSource::Core(&core_features) },
        );

        let device = unsafe { instance.create_device(candidate.handle(), &create_info, None) }
            .map_err(|result| Error::creation("logical device", result))?;

        let mut undo = UndoStack::new();
        {
            let device = device.clone();
            undo.push("logical device", move |_| unsafe { device.destroy_device(None) });
        }

        let timeline_enabled = version >= ApiVersion::V1_2 && features.vulkan12().timeline_semaphore == vk::TRUE;
        let mut mandatory = dispatch::DEVICE_CORE_FNS.to_vec();
        if timeline_enabled {
            mandatory.extend_from_slice(dispatch::TIMELINE_FNS);
        }
        if let Err(err) = dispatch::require_device_fns(instance, device.handle(), &mandatory) {
            undo.unwind_all();
            return Err(err);
        }

        let swapchain_loader = if candidate.is_extension_enabled(SWAPCHAIN_EXTENSION) {
            match dispatch::require_device_fns(instance, device.handle(), dispatch::SWAPCHAIN_FNS) {
                Ok(()) => Some(Swapchain::new(instance, &device)),
                Err(err) => {
                    log::warn!("{}; presentation will be unavailable", err);
                    None
                }
            }
        } else {
            None
        };

        let mut queues: Vec<Arc<Queue>> = Vec::with_capacity(slots.unique.len());
        for &(family, index) in &slots.unique {
            let handle = unsafe { device.get_device_queue(family, index) };
            let timeline = if timeline_enabled {
                match create_timeline(&device) {
                    Ok(semaphore) => {
                        let device = device.clone();
                        undo.push("queue timeline", move |_| unsafe {
                            device.destroy_semaphore(semaphore, None)
                        });
                        Some(semaphore)
                    }
                    Err(err) => {
                        undo.unwind_all();
                        return Err(err);
                    }
                }
            } else {
                None
            };
            queues.push(Arc::new(Queue::new(handle, family, index, timeline)));
        }
        undo.commit();

        for role in QueueRole::ALL {
            let count = slots.by_role[role.index()].len();
            if count > 0 {
                log::debug!(
                    "{} role: {} queue(s) on family {:?}",
                    role,
                    count,
                    candidate.roles().family(role)
                );
            }
        }
        log::info!(
            "Created logical device on {} ({} queue(s), {} extension(s){})",
            candidate.name(),
            queues.len(),
            candidate.enabled_extensions().len(),
            if timeline_enabled { ", timelines" } else { "" }
        );

        Ok(ExecutionContext {
            device,
            instance: instance.clone(),
            physical_device: candidate.clone(),
            api_version: version,
            enabled_features: features,
            swapchain_loader,
            queues,
            by_role: slots.by_role,
            layout,
        })
    }
}

/// Where enabled features travel at device creation.
enum FeatureSource<'b> {
    Core(&'b vk::PhysicalDeviceFeatures),
    Chain(&'b FeatureChain),
}

/// Assemble `VkDeviceCreateInfo`. Device layers are left empty: loaders
/// ignore them since 1.0.13 and apply the instance layers instead.
fn device_create_info(
    queue_infos: &[vk::DeviceQueueCreateInfo],
    extension_ptrs: &[*const c_char],
    features: FeatureSource<'_>,
) -> vk::DeviceCreateInfo {
    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(queue_infos)
        .enabled_extension_names(extension_ptrs);
    match features {
        FeatureSource::Core(core) => create_info.enabled_features(core).build(),
        FeatureSource::Chain(chain) => {
            let mut create_info = create_info.build();
            create_info.p_next = chain.head_ptr();
            create_info
        }
    }
}

fn create_timeline(device: &ash::Device) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
    unsafe { device.create_semaphore(&create_info, None) }
        .map_err(|result| Error::creation("timeline semaphore", result))
}

/// Pick the first candidate format whose tiling features contain `features`.
pub fn pick_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Logical device with its queues. Destroy explicitly, after every ring
/// built on it and before the connection.
pub struct ExecutionContext {
    device: ash::Device,
    instance: ash::Instance,
    physical_device: PhysicalDevice,
    api_version: ApiVersion,
    enabled_features: CapabilitySet,
    swapchain_loader: Option<Swapchain>,
    queues: Vec<Arc<Queue>>,
    by_role: [Vec<usize>; 4],
    layout: QueueLayout,
}

impl ExecutionContext {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    /// Version the device was created against: min(device, connection).
    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub fn enabled_features(&self) -> &CapabilitySet {
        &self.enabled_features
    }

    pub fn queue_layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn swapchain_loader(&self) -> Result<&Swapchain> {
        self.swapchain_loader.as_ref().ok_or_else(|| {
            if self.physical_device.is_extension_enabled(SWAPCHAIN_EXTENSION) {
                Error::IncompatibleDriver("vkCreateSwapchainKHR".into())
            } else {
                Error::missing(
                    format!("device '{}'", self.physical_device.name()),
                    CapabilityKind::Extension,
                    SWAPCHAIN_EXTENSION,
                )
            }
        })
    }

    /// `n`-th queue for `role`.
    pub fn queue(&self, role: QueueRole, n: usize) -> Option<&Arc<Queue>> {
        self.by_role[role.index()]
            .get(n)
            .and_then(|&slot| self.queues.get(slot))
    }

    pub fn queues(&self, role: QueueRole) -> impl Iterator<Item = &Arc<Queue>> + '_ {
        self.by_role[role.index()]
            .iter()
            .filter_map(move |&slot| self.queues.get(slot))
    }

    pub fn queue_count(&self, role: QueueRole) -> usize {
        self.by_role[role.index()].len()
    }

    /// Every distinct native queue.
    pub fn all_queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        let handle = self.physical_device.handle();
        pick_supported_format(candidates, tiling, features, |format| unsafe {
            self.instance.get_physical_device_format_properties(handle, format)
        })
    }

    pub fn query_surface_support(&self, connection: &Connection, surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        query_surface_support(connection, self.physical_device.handle(), surface)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|result| Error::query("device idle wait", result))
    }

    pub fn destroy(self) {
        log::info!("Destroying logical device...");
        if let Err(err) = self.wait_idle() {
            log::warn!("{}", err);
        }
        for queue in &self.queues {
            queue.destroy_timeline(&self.device);
        }
        unsafe { self.device.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_never_carries_device_layers() {
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(0)
            .queue_priorities(&priorities)
            .build()];
        let name = c"VK_KHR_swapchain";
        let extension_ptrs = [name.as_ptr()];
        let chain = FeatureChain::for_query(ApiVersion::V1_3);

        let info = device_create_info(&queue_infos, &extension_ptrs, FeatureSource::Chain(&chain));
        assert_eq!(info.enabled_layer_count, 0);
        assert!(info.pp_enabled_layer_names.is_null());
        assert_eq!(info.enabled_extension_count, 1);
        assert_eq!(info.p_next, chain.head_ptr());
        assert!(info.p_enabled_features.is_null());

        let core = vk::PhysicalDeviceFeatures::default();
        let info = device_create_info(&queue_infos, &extension_ptrs, FeatureSource::Core(&core));
        assert_eq!(info.enabled_layer_count, 0);
        assert!(info.p_next.is_null());
        assert_eq!(info.p_enabled_features, &core as *const _);
    }

    #[test]
    fn picks_first_format_with_optimal_support() {
        let picked = pick_supported_format(
            &[vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D32_SFLOAT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| vk::FormatProperties {
                optimal_tiling_features: if format == vk::Format::D32_SFLOAT {
                    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                } else {
                    vk::FormatFeatureFlags::empty()
                },
                ..Default::default()
            },
        );
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn linear_features_do_not_count_for_optimal() {
        let picked = pick_supported_format(
            &[vk::Format::D32_SFLOAT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties {
                linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
        );
        assert_eq!(picked, None);
    }
}
