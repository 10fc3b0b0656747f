// tests/test_ring.rs - Presentation ring negotiation and rollback.
//
// `MockDevice` hands out sequential raw handles and records which ones are
// still alive, so a failed build can be checked for leaks.

use ash::vk;
use ash::vk::Handle;
use vk_provision::backend::allocator::AllocationHandle;
use vk_provision::backend::physical_device::SurfaceSupport;
use vk_provision::backend::swapchain::{
    provision, resolve_image_count, teardown, AuxResources, RingDevice, RingParameters, RingSettings,
};
use vk_provision::backend::{CapabilityKind, Error, ErrorKind, Result, Tiered};

#[derive(Default)]
struct MockDevice {
    next: u64,
    images: u32,
    live: Vec<(&'static str, u64)>,
    destroyed: Vec<&'static str>,
    views: usize,
    fail_view: Option<usize>,
}

impl MockDevice {
    fn with_images(images: u32) -> Self {
        Self {
            images,
            ..Default::default()
        }
    }

    fn create(&mut self, kind: &'static str) -> u64 {
        self.next += 1;
        self.live.push((kind, self.next));
        self.next
    }

    fn destroy(&mut self, kind: &'static str, raw: u64) {
        let position = self
            .live
            .iter()
            .position(|&(k, r)| k == kind && r == raw)
            .unwrap_or_else(|| panic!("{} {} destroyed twice or never created", kind, raw));
        self.live.remove(position);
        self.destroyed.push(kind);
    }

    fn count(&self, kind: &str) -> usize {
        self.live.iter().filter(|(k, _)| *k == kind).count()
    }
}

impl RingDevice for MockDevice {
    fn create_swapchain(&mut self, _surface: vk::SurfaceKHR, _params: &RingParameters) -> Result<vk::SwapchainKHR> {
        Ok(vk::SwapchainKHR::from_raw(self.create("swapchain")))
    }

    fn swapchain_images(&mut self, _swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok((0..self.images).map(|i| vk::Image::from_raw(1000 + i as u64)).collect())
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.destroy("swapchain", swapchain.as_raw());
    }

    fn create_image_view(
        &mut self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
        _layers: u32,
    ) -> Result<vk::ImageView> {
        if self.fail_view == Some(self.views) {
            return Err(Error::Creation {
                what: "image view".into(),
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        self.views += 1;
        Ok(vk::ImageView::from_raw(self.create("view")))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.destroy("view", view.as_raw());
    }

    fn create_depth_image(&mut self, _format: vk::Format, _extent: vk::Extent2D) -> Result<(vk::Image, AllocationHandle)> {
        let raw = self.create("depth");
        Ok((vk::Image::from_raw(raw), AllocationHandle(raw)))
    }

    fn destroy_depth_image(&mut self, image: vk::Image, allocation: AllocationHandle) {
        assert_eq!(image.as_raw(), allocation.0);
        self.destroy("depth", image.as_raw());
    }

    fn create_framebuffer(
        &mut self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
        _layers: u32,
    ) -> Result<vk::Framebuffer> {
        assert_eq!(attachments.len(), 2);
        Ok(vk::Framebuffer::from_raw(self.create("framebuffer")))
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.destroy("framebuffer", framebuffer.as_raw());
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.create("semaphore")))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.destroy("semaphore", semaphore.as_raw());
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        assert!(signaled);
        Ok(vk::Fence::from_raw(self.create("fence")))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        self.destroy("fence", fence.as_raw());
    }
}

fn support(min: u32, max: u32) -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO],
    }
}

fn parameters(settings: &RingSettings, depth: Option<vk::Format>) -> RingParameters {
    settings.negotiate(&support(2, 4), Some(0), Some(0), depth).unwrap()
}

#[test]
fn out_of_range_request_without_floor_uses_min_plus_one() {
    let caps = support(2, 4).capabilities;
    let count = Tiered::new(0).with_requested(8);
    assert_eq!(resolve_image_count(&caps, count).unwrap(), 3);
}

#[test]
fn negotiation_picks_defaults_the_surface_supports() {
    let params = parameters(&RingSettings::default(), None);
    assert_eq!(params.surface_format.format, vk::Format::B8G8R8A8_SRGB);
    assert_eq!(params.present_mode, vk::PresentModeKHR::FIFO);
    assert_eq!(params.image_count, 3);
    assert_eq!((params.extent.width, params.extent.height), (1280, 720));
    assert_eq!(params.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
    assert_eq!(params.sharing_mode(), vk::SharingMode::EXCLUSIVE);
}

#[test]
fn distinct_families_share_concurrently() {
    let params = RingSettings::default()
        .negotiate(&support(2, 4), Some(0), Some(2), None)
        .unwrap();
    assert_eq!(params.sharing_families, vec![0, 2]);
    assert_eq!(params.sharing_mode(), vk::SharingMode::CONCURRENT);
}

#[test]
fn unsupported_format_wish_list_fails() {
    let settings = RingSettings {
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }],
        ..Default::default()
    };
    match settings.negotiate(&support(2, 4), Some(0), Some(0), None).unwrap_err() {
        Error::MissingCapability { kind, .. } => assert_eq!(kind, CapabilityKind::SurfaceFormat),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn framebuffers_without_render_pass_are_rejected() {
    let settings = RingSettings {
        aux: AuxResources {
            framebuffers: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let err = settings.negotiate(&support(2, 4), Some(0), Some(0), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
}

#[test]
fn frames_in_flight_are_clamped() {
    let settings = RingSettings {
        frames_in_flight: 9,
        ..Default::default()
    };
    assert_eq!(parameters(&settings, None).frames_in_flight, 4);
}

#[test]
fn failed_view_rolls_back_everything() {
    let mut settings = RingSettings::default();
    settings.image_count.request(4);
    let params = parameters(&settings, None);
    assert_eq!(params.image_count, 4);

    let mut device = MockDevice::with_images(4);
    device.fail_view = Some(2);

    let err = provision(&mut device, vk::SurfaceKHR::null(), &params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Creation);
    assert!(device.live.is_empty(), "leaked: {:?}", device.live);
    assert_eq!(device.destroyed, vec!["view", "view", "swapchain"]);
}

#[test]
fn full_ring_is_provisioned_and_torn_down() {
    let settings = RingSettings {
        aux: AuxResources {
            image_views: true,
            depth_buffers: true,
            framebuffers: true,
            sync_objects: true,
        },
        render_pass: Some(vk::RenderPass::from_raw(77)),
        frames_in_flight: 2,
        ..Default::default()
    };
    let params = parameters(&settings, Some(vk::Format::D32_SFLOAT));

    let mut device = MockDevice::with_images(3);
    let resources = provision(&mut device, vk::SurfaceKHR::null(), &params).unwrap();

    assert_eq!(resources.slots.len(), 3);
    assert_eq!(resources.frame_sync.len(), 2);
    assert!(resources.slots.iter().all(|s| s.view.is_some() && s.depth.is_some() && s.framebuffer.is_some()));
    assert_eq!(device.count("view"), 6);
    assert_eq!(device.count("depth"), 3);
    assert_eq!(device.count("framebuffer"), 3);
    assert_eq!(device.count("semaphore"), 4);
    assert_eq!(device.count("fence"), 2);

    teardown(&mut device, &resources);
    assert!(device.live.is_empty(), "leaked: {:?}", device.live);
    assert_eq!(device.destroyed.last(), Some(&"swapchain"));
}

#[test]
fn depth_buffers_are_released_on_failure() {
    let settings = RingSettings {
        aux: AuxResources {
            image_views: true,
            depth_buffers: true,
            framebuffers: false,
            sync_objects: true,
        },
        ..Default::default()
    };
    let params = parameters(&settings, Some(vk::Format::D32_SFLOAT));

    // Two views per slot (color + depth); the fifth view is slot 2's color view.
    let mut device = MockDevice::with_images(3);
    device.fail_view = Some(4);

    assert!(provision(&mut device, vk::SurfaceKHR::null(), &params).is_err());
    assert!(device.live.is_empty(), "leaked: {:?}", device.live);
    assert_eq!(device.count("depth"), 0);
}
