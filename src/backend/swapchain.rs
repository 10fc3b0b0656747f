// Presentation Ring - swapchain plus per-image resources
//
// Negotiation (format, present mode, image count, extent) is pure and runs
// on a `SurfaceSupport` snapshot. Provisioning goes through the `RingDevice`
// trait and registers every created object on an undo stack, so a failure
// at any slot tears down everything built before it.

use ash::vk;

use super::allocator::{AllocationHandle, DepthAllocator};
use super::device::ExecutionContext;
use super::error::{CapabilityKind, Error, Result};
use super::instance::Connection;
use super::physical_device::{QueueRole, SurfaceSupport};
use super::queue::Queue;
use super::sync::FrameSync;
use super::tier::Tiered;
use super::undo::UndoStack;

pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

pub const DEFAULT_PRESENT_MODES: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];

pub const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 512,
    height: 512,
};

/// Optional per-slot and per-frame resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxResources {
    pub image_views: bool,
    pub depth_buffers: bool,
    pub framebuffers: bool,
    pub sync_objects: bool,
}

impl Default for AuxResources {
    fn default() -> Self {
        Self {
            image_views: true,
            depth_buffers: false,
            framebuffers: false,
            sync_objects: false,
        }
    }
}

// ============================================================================
// Negotiation
// ============================================================================

/// First desired format the surface supports. An empty wish list means the
/// default sRGB BGRA8 format.
pub fn select_surface_format(
    supported: &[vk::SurfaceFormatKHR],
    desired: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR> {
    let desired = if desired.is_empty() {
        std::slice::from_ref(&DEFAULT_SURFACE_FORMAT)
    } else {
        desired
    };
    desired
        .iter()
        .copied()
        .find(|want| {
            supported
                .iter()
                .any(|have| have.format == want.format && have.color_space == want.color_space)
        })
        .ok_or_else(|| {
            Error::missing(
                "surface",
                CapabilityKind::SurfaceFormat,
                format!("none of {:?}", desired.iter().map(|f| f.format).collect::<Vec<_>>()),
            )
        })
}

/// First desired present mode the surface supports. An empty wish list means
/// mailbox, then FIFO.
pub fn select_present_mode(
    supported: &[vk::PresentModeKHR],
    desired: &[vk::PresentModeKHR],
) -> Result<vk::PresentModeKHR> {
    let desired = if desired.is_empty() {
        &DEFAULT_PRESENT_MODES[..]
    } else {
        desired
    };
    desired
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .ok_or_else(|| Error::missing("surface", CapabilityKind::PresentMode, format!("none of {:?}", desired)))
}

/// Image count within the surface bounds. A `max_image_count` of 0 means
/// unbounded.
///
/// The requested count wins when in range. Otherwise, with no required
/// count (0), min+1 capped at max; with one, the required count or an error.
pub fn resolve_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, count: Tiered<u32>) -> Result<u32> {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    let in_range = |n: u32| n >= min && (max == 0 || n <= max);

    if in_range(count.requested()) {
        return Ok(count.requested());
    }
    if count.required() == 0 {
        let fallback = if max > 0 { (min + 1).min(max) } else { min + 1 };
        if count.requested() != 0 {
            log::warn!(
                "Requested {} swapchain images, surface allows [{}, {}]; using {}",
                count.requested(),
                min,
                max,
                fallback
            );
        }
        return Ok(fallback);
    }
    if in_range(count.required()) {
        log::warn!(
            "Requested {} swapchain images is out of range; using the required {}",
            count.requested(),
            count.required()
        );
        return Ok(count.required());
    }
    Err(Error::missing(
        "surface",
        CapabilityKind::ImageCount,
        format!("{} images required, surface allows [{}, {}]", count.required(), min, max),
    ))
}

/// The surface's current extent, or the desired extent clamped into bounds
/// when the surface leaves it to us (either current dimension is u32::MAX).
pub fn resolve_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    let current = capabilities.current_extent;
    if current.width != u32::MAX && current.height != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width.max(capabilities.min_image_extent.width),
        ),
        height: desired.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height.max(capabilities.min_image_extent.height),
        ),
    }
}

/// Everything the ring is created with, once negotiated.
#[derive(Debug, Clone)]
pub struct RingParameters {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub image_usage: vk::ImageUsageFlags,
    pub array_layers: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub clipped: bool,
    /// Two distinct families means concurrent sharing.
    pub sharing_families: Vec<u32>,
    pub old_swapchain: vk::SwapchainKHR,
    pub aux: AuxResources,
    pub depth_format: Option<vk::Format>,
    pub render_pass: Option<vk::RenderPass>,
    pub frames_in_flight: u32,
}

impl RingParameters {
    pub fn sharing_mode(&self) -> vk::SharingMode {
        if self.sharing_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }
}

/// Plain-data side of the ring builder.
#[derive(Debug, Clone)]
pub struct RingSettings {
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub image_count: Tiered<u32>,
    pub extent: vk::Extent2D,
    pub image_usage: vk::ImageUsageFlags,
    pub array_layers: u32,
    pub pre_transform: Option<vk::SurfaceTransformFlagsKHR>,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub clipped: bool,
    pub old_swapchain: vk::SwapchainKHR,
    pub aux: AuxResources,
    pub depth_formats: Vec<vk::Format>,
    pub render_pass: Option<vk::RenderPass>,
    pub frames_in_flight: u32,
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            formats: Vec::new(),
            present_modes: Vec::new(),
            image_count: Tiered::new(0),
            extent: DEFAULT_EXTENT,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            array_layers: 1,
            pre_transform: None,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            clipped: true,
            old_swapchain: vk::SwapchainKHR::null(),
            aux: AuxResources::default(),
            depth_formats: vec![vk::Format::D32_SFLOAT],
            render_pass: None,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
        }
    }
}

impl RingSettings {
    /// Resolve the ring against a surface snapshot.
    ///
    /// `graphics_family`/`present_family` decide the sharing mode;
    /// `depth_format` is the already-negotiated depth format when depth
    /// buffers are on.
    pub fn negotiate(
        &self,
        support: &SurfaceSupport,
        graphics_family: Option<u32>,
        present_family: Option<u32>,
        depth_format: Option<vk::Format>,
    ) -> Result<RingParameters> {
        if self.aux.framebuffers && !self.aux.image_views {
            return Err(Error::InvalidConfiguration("framebuffers need image views".into()));
        }
        if self.aux.framebuffers && self.render_pass.is_none() {
            return Err(Error::InvalidConfiguration("framebuffers need a render pass".into()));
        }
        if self.aux.depth_buffers && depth_format.is_none() {
            return Err(Error::InvalidConfiguration("depth buffers need a depth format".into()));
        }
        if self.array_layers == 0 {
            return Err(Error::InvalidConfiguration("swapchain needs at least one array layer".into()));
        }

        let caps = &support.capabilities;
        let surface_format = select_surface_format(&support.formats, &self.formats)?;
        let present_mode = select_present_mode(&support.present_modes, &self.present_modes)?;
        let image_count = resolve_image_count(caps, self.image_count)?;
        let extent = resolve_extent(caps, self.extent);

        let sharing_families = match (graphics_family, present_family) {
            (Some(graphics), Some(present)) if graphics != present => vec![graphics, present],
            (Some(family), _) | (None, Some(family)) => vec![family],
            (None, None) => Vec::new(),
        };

        let frames_in_flight = self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if frames_in_flight != self.frames_in_flight {
            log::warn!(
                "{} frames in flight is out of range; using {}",
                self.frames_in_flight,
                frames_in_flight
            );
        }

        Ok(RingParameters {
            surface_format,
            present_mode,
            image_count,
            extent,
            image_usage: self.image_usage,
            array_layers: self.array_layers.min(caps.max_image_array_layers.max(1)),
            pre_transform: self.pre_transform.unwrap_or(caps.current_transform),
            composite_alpha: self.composite_alpha,
            clipped: self.clipped,
            sharing_families,
            old_swapchain: self.old_swapchain,
            aux: self.aux,
            depth_format: if self.aux.depth_buffers { depth_format } else { None },
            render_pass: self.render_pass,
            frames_in_flight,
        })
    }
}

// ============================================================================
// Provisioning
// ============================================================================

/// Native calls the ring is built from. Each create has a matching destroy.
pub trait RingDevice {
    fn create_swapchain(&mut self, surface: vk::SurfaceKHR, params: &RingParameters) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        layers: u32,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn create_depth_image(&mut self, format: vk::Format, extent: vk::Extent2D) -> Result<(vk::Image, AllocationHandle)>;
    fn destroy_depth_image(&mut self, image: vk::Image, allocation: AllocationHandle);

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        layers: u32,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);

    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);
    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: AllocationHandle,
}

/// One ring image and whatever was created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSlot {
    pub image: vk::Image,
    pub view: Option<vk::ImageView>,
    pub depth: Option<DepthBuffer>,
    pub framebuffer: Option<vk::Framebuffer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingResources {
    pub swapchain: vk::SwapchainKHR,
    pub slots: Vec<RingSlot>,
    pub frame_sync: Vec<FrameSync>,
}

/// Create the ring and its sub-resources. On error nothing created here is
/// left alive.
pub fn provision<D: RingDevice>(
    device: &mut D,
    surface: vk::SurfaceKHR,
    params: &RingParameters,
) -> Result<RingResources> {
    let mut undo = UndoStack::new();
    match provision_steps(device, surface, params, &mut undo) {
        Ok(resources) => {
            undo.commit();
            Ok(resources)
        }
        Err(err) => {
            undo.unwind(device);
            Err(err)
        }
    }
}

fn provision_steps<'a, D: RingDevice + 'a>(
    device: &mut D,
    surface: vk::SurfaceKHR,
    params: &RingParameters,
    undo: &mut UndoStack<'a, D>,
) -> Result<RingResources> {
    let swapchain = device.create_swapchain(surface, params)?;
    undo.push("swapchain", move |d: &mut D| d.destroy_swapchain(swapchain));

    let images = device.swapchain_images(swapchain)?;
    let format = params.surface_format.format;

    let mut slots = Vec::with_capacity(images.len());
    for image in images {
        let view = if params.aux.image_views {
            let view = device.create_image_view(image, format, vk::ImageAspectFlags::COLOR, params.array_layers)?;
            undo.push("image view", move |d: &mut D| d.destroy_image_view(view));
            Some(view)
        } else {
            None
        };

        let depth = match params.depth_format {
            Some(depth_format) => {
                let (depth_image, allocation) = device.create_depth_image(depth_format, params.extent)?;
                undo.push("depth image", move |d: &mut D| d.destroy_depth_image(depth_image, allocation));
                let depth_view =
                    device.create_image_view(depth_image, depth_format, vk::ImageAspectFlags::DEPTH, 1)?;
                undo.push("depth view", move |d: &mut D| d.destroy_image_view(depth_view));
                Some(DepthBuffer {
                    image: depth_image,
                    view: depth_view,
                    allocation,
                })
            }
            None => None,
        };

        let framebuffer = match (params.aux.framebuffers, params.render_pass) {
            (true, Some(render_pass)) => {
                let attachments: Vec<vk::ImageView> =
                    view.into_iter().chain(depth.map(|d| d.view)).collect();
                let framebuffer =
                    device.create_framebuffer(render_pass, &attachments, params.extent, params.array_layers)?;
                undo.push("framebuffer", move |d: &mut D| d.destroy_framebuffer(framebuffer));
                Some(framebuffer)
            }
            _ => None,
        };

        slots.push(RingSlot {
            image,
            view,
            depth,
            framebuffer,
        });
    }

    let mut frame_sync = Vec::new();
    if params.aux.sync_objects {
        for _ in 0..params.frames_in_flight {
            frame_sync.push(FrameSync::create(device, undo)?);
        }
    }

    Ok(RingResources {
        swapchain,
        slots,
        frame_sync,
    })
}

/// Destroy everything `provision` created, newest first.
pub fn teardown<D: RingDevice>(device: &mut D, resources: &RingResources) {
    for sync in resources.frame_sync.iter().rev() {
        sync.destroy(device);
    }
    for slot in resources.slots.iter().rev() {
        if let Some(framebuffer) = slot.framebuffer {
            device.destroy_framebuffer(framebuffer);
        }
        if let Some(depth) = slot.depth {
            device.destroy_image_view(depth.view);
            device.destroy_depth_image(depth.image, depth.allocation);
        }
        if let Some(view) = slot.view {
            device.destroy_image_view(view);
        }
    }
    device.destroy_swapchain(resources.swapchain);
}

/// `RingDevice` over a live logical device.
pub struct NativeRingDevice<'a, 'm> {
    device: &'a ash::Device,
    loader: &'a ash::extensions::khr::Swapchain,
    allocator: Option<&'m mut dyn DepthAllocator>,
}

impl<'a, 'm> NativeRingDevice<'a, 'm> {
    pub fn new(
        device: &'a ash::Device,
        loader: &'a ash::extensions::khr::Swapchain,
        allocator: Option<&'m mut dyn DepthAllocator>,
    ) -> Self {
        Self {
            device,
            loader,
            allocator,
        }
    }
}

impl RingDevice for NativeRingDevice<'_, '_> {
    fn create_swapchain(&mut self, surface: vk::SurfaceKHR, params: &RingParameters) -> Result<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(params.image_count)
            .image_format(params.surface_format.format)
            .image_color_space(params.surface_format.color_space)
            .image_extent(params.extent)
            .image_array_layers(params.array_layers)
            .image_usage(params.image_usage)
            .image_sharing_mode(params.sharing_mode())
            .queue_family_indices(&params.sharing_families)
            .pre_transform(params.pre_transform)
            .composite_alpha(params.composite_alpha)
            .present_mode(params.present_mode)
            .clipped(params.clipped)
            .old_swapchain(params.old_swapchain);

        unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|result| Error::creation("swapchain", result))
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        unsafe { self.loader.get_swapchain_images(swapchain) }
            .map_err(|result| Error::query("swapchain images", result))
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        unsafe { self.loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        layers: u32,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(if layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: layers,
            });

        unsafe { self.device.create_image_view(&create_info, None) }
            .map_err(|result| Error::creation("image view", result))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_depth_image(&mut self, format: vk::Format, extent: vk::Extent2D) -> Result<(vk::Image, AllocationHandle)> {
        let allocator = self
            .allocator
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidConfiguration("depth buffers need an allocator".into()))?;
        allocator.create_depth_image(self.device, format, extent)
    }

    fn destroy_depth_image(&mut self, image: vk::Image, allocation: AllocationHandle) {
        match self.allocator.as_deref_mut() {
            Some(allocator) => allocator.destroy_depth_image(self.device, image, allocation),
            None => log::error!("Depth image {:?} leaked: no allocator to release it", image),
        }
    }

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        layers: u32,
    ) -> Result<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);

        unsafe { self.device.create_framebuffer(&create_info, None) }
            .map_err(|result| Error::creation("framebuffer", result))
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None) }
            .map_err(|result| Error::creation("semaphore", result))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
            .map_err(|result| Error::creation("fence", result))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent builder for [`Swapchain`].
pub struct SwapchainBuilder<'a> {
    connection: &'a Connection,
    context: &'a ExecutionContext,
    surface: vk::SurfaceKHR,
    settings: RingSettings,
}

impl<'a> SwapchainBuilder<'a> {
    pub fn new(connection: &'a Connection, context: &'a ExecutionContext, surface: vk::SurfaceKHR) -> Self {
        Self {
            connection,
            context,
            surface,
            settings: RingSettings::default(),
        }
    }

    /// Replace all settings at once.
    pub fn settings(mut self, settings: RingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Most preferred so far.
    pub fn request_surface_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.settings.formats.insert(0, format);
        self
    }

    /// Least preferred so far.
    pub fn allow_surface_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.settings.formats.push(format);
        self
    }

    pub fn request_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.settings.present_modes.insert(0, mode);
        self
    }

    pub fn allow_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.settings.present_modes.push(mode);
        self
    }

    pub fn require_image_count(mut self, count: u32) -> Self {
        self.settings.image_count.require(count);
        self
    }

    pub fn request_image_count(mut self, count: u32) -> Self {
        self.settings.image_count.request(count);
        self
    }

    pub fn extent(mut self, width: u32, height: u32) -> Self {
        self.settings.extent = vk::Extent2D { width, height };
        self
    }

    pub fn image_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.settings.image_usage = usage;
        self
    }

    pub fn array_layers(mut self, layers: u32) -> Self {
        self.settings.array_layers = layers;
        self
    }

    pub fn clipped(mut self, clipped: bool) -> Self {
        self.settings.clipped = clipped;
        self
    }

    pub fn composite_alpha(mut self, alpha: vk::CompositeAlphaFlagsKHR) -> Self {
        self.settings.composite_alpha = alpha;
        self
    }

    pub fn pre_transform(mut self, transform: vk::SurfaceTransformFlagsKHR) -> Self {
        self.settings.pre_transform = Some(transform);
        self
    }

    pub fn old_swapchain(mut self, old: &Swapchain) -> Self {
        self.settings.old_swapchain = old.handle();
        self
    }

    pub fn create_image_views(mut self, enable: bool) -> Self {
        self.settings.aux.image_views = enable;
        self
    }

    pub fn create_depth_buffers(mut self, enable: bool) -> Self {
        self.settings.aux.depth_buffers = enable;
        self
    }

    pub fn request_depth_format(mut self, format: vk::Format) -> Self {
        self.settings.depth_formats.insert(0, format);
        self
    }

    pub fn allow_depth_format(mut self, format: vk::Format) -> Self {
        self.settings.depth_formats.push(format);
        self
    }

    /// Create one framebuffer per image against `render_pass`.
    pub fn create_framebuffers(mut self, render_pass: vk::RenderPass) -> Self {
        self.settings.aux.framebuffers = true;
        self.settings.render_pass = Some(render_pass);
        self
    }

    pub fn create_sync_objects(mut self, enable: bool) -> Self {
        self.settings.aux.sync_objects = enable;
        self
    }

    pub fn frames_in_flight(mut self, frames: u32) -> Self {
        self.settings.frames_in_flight = frames;
        self
    }

    /// Negotiate and create the ring. `allocator` is needed only for depth
    /// buffers and must be passed again to [`Swapchain::destroy`].
    pub fn build(&self, allocator: Option<&mut dyn DepthAllocator>) -> Result<Swapchain> {
        let context = self.context;
        let loader = context.swapchain_loader()?;
        let support = context.query_surface_support(self.connection, self.surface)?;

        let depth_format = if self.settings.aux.depth_buffers {
            if allocator.is_none() {
                return Err(Error::InvalidConfiguration("depth buffers need an allocator".into()));
            }
            let format = context
                .find_supported_format(
                    &self.settings.depth_formats,
                    vk::ImageTiling::OPTIMAL,
                    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                )
                .ok_or_else(|| {
                    Error::missing(
                        format!("device '{}'", context.physical_device().name()),
                        CapabilityKind::DepthFormat,
                        format!("none of {:?}", self.settings.depth_formats),
                    )
                })?;
            Some(format)
        } else {
            None
        };

        let roles = context.physical_device().roles();
        let params = self.settings.negotiate(
            &support,
            roles.family(QueueRole::Graphics),
            roles.family(QueueRole::Present),
            depth_format,
        )?;

        let mut native = NativeRingDevice::new(context.device(), loader, allocator);
        let resources = provision(&mut native, self.surface, &params)?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?} / {:?}",
            params.extent.width,
            params.extent.height,
            resources.slots.len(),
            params.surface_format.format,
            params.present_mode
        );

        Ok(Swapchain {
            loader: loader.clone(),
            params,
            resources,
        })
    }
}

/// A provisioned presentation ring. Destroy explicitly before the context.
pub struct Swapchain {
    loader: ash::extensions::khr::Swapchain,
    params: RingParameters,
    resources: RingResources,
}

impl Swapchain {
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.resources.swapchain
    }

    pub fn info(&self) -> &RingParameters {
        &self.params
    }

    pub fn format(&self) -> vk::Format {
        self.params.surface_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.params.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.params.present_mode
    }

    pub fn slots(&self) -> &[RingSlot] {
        &self.resources.slots
    }

    pub fn frame_sync(&self) -> &[FrameSync] {
        &self.resources.frame_sync
    }

    /// Acquire next image for rendering. Returns the index and whether the
    /// ring is suboptimal for the surface.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.resources.swapchain, timeout, semaphore, fence)
        }
        .map_err(|result| Error::query("next swapchain image", result))
    }

    /// Present an image. Hold `queue.lock()` around this call. Returns true
    /// when the ring should be recreated.
    pub fn present(&self, queue: &Queue, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let swapchains = [self.resources.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue.handle(), &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(result) => Err(Error::query("presentation", result)),
        }
    }

    /// Destroy all ring resources. Pass the allocator the ring was built with.
    pub fn destroy(self, context: &ExecutionContext, allocator: Option<&mut dyn DepthAllocator>) {
        let mut native = NativeRingDevice::new(context.device(), &self.loader, allocator);
        teardown(&mut native, &self.resources);
        log::debug!("Destroyed swapchain with {} images", self.resources.slots.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            max_image_array_layers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn unbounded_max_accepts_large_requests() {
        let count = Tiered::new(0).with_requested(16);
        assert_eq!(resolve_image_count(&caps(2, 0), count).unwrap(), 16);
    }

    #[test]
    fn required_count_is_the_fallback() {
        let count = Tiered::new(0).with_required(4).with_requested(9);
        assert_eq!(resolve_image_count(&caps(2, 4), count).unwrap(), 4);

        let count = Tiered::new(0).with_required(6).with_requested(9);
        let err = resolve_image_count(&caps(2, 4), count).unwrap_err();
        assert_eq!(err.kind(), crate::backend::error::ErrorKind::MissingCapability);
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let extent = resolve_extent(&caps(2, 3), vk::Extent2D { width: 8000, height: 10 });
        assert_eq!((extent.width, extent.height), (4096, 64));

        let mut fixed = caps(2, 3);
        fixed.current_extent = vk::Extent2D { width: 800, height: 600 };
        let extent = resolve_extent(&fixed, DEFAULT_EXTENT);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn undefined_height_alone_defers_to_desired_extent() {
        let mut surface = caps(2, 3);
        surface.current_extent = vk::Extent2D {
            width: 800,
            height: u32::MAX,
        };
        let extent = resolve_extent(&surface, vk::Extent2D { width: 1024, height: 768 });
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn present_mode_falls_back_along_the_wish_list() {
        let mode = select_present_mode(&[vk::PresentModeKHR::FIFO], &[]).unwrap();
        assert_eq!(mode, vk::PresentModeKHR::FIFO);
        assert!(select_present_mode(&[vk::PresentModeKHR::FIFO], &[vk::PresentModeKHR::IMMEDIATE]).is_err());
    }

    #[test]
    fn format_must_match_color_space_too() {
        let supported = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        }];
        assert!(select_surface_format(&supported, &[]).is_err());
    }
}
