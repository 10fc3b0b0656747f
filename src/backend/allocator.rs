// Depth image allocation
//
// Ring provisioning never touches device memory directly. It asks a
// `DepthAllocator` for a bound depth image and gets back an opaque handle
// to give back on destruction. `GpuDepthAllocator` is the gpu-allocator
// backed implementation.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;

use super::device::ExecutionContext;
use super::error::{Error, Result};
use super::instance::Connection;
use super::physical_device::PhysicalDevice;

/// Opaque token for memory owned by a [`DepthAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(pub u64);

pub trait DepthAllocator {
    /// Create a depth image with bound memory.
    fn create_depth_image(
        &mut self,
        device: &ash::Device,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<(vk::Image, AllocationHandle)>;

    fn destroy_depth_image(&mut self, device: &ash::Device, image: vk::Image, allocation: AllocationHandle);
}

pub struct GpuDepthAllocator {
    allocator: Allocator,
    live: HashMap<u64, Allocation>,
    next_id: u64,
}

/// Create the external allocator for a context.
pub fn create_allocator(
    connection: &Connection,
    physical_device: &PhysicalDevice,
    context: &ExecutionContext,
) -> Result<GpuDepthAllocator> {
    let allocator = Allocator::new(&AllocatorCreateDesc {
        instance: connection.instance().clone(),
        device: context.device().clone(),
        physical_device: physical_device.handle(),
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    })
    .map_err(|source| Error::Allocation {
        what: "GPU allocator".into(),
        source,
    })?;

    Ok(GpuDepthAllocator {
        allocator,
        live: HashMap::new(),
        next_id: 1,
    })
}

impl DepthAllocator for GpuDepthAllocator {
    fn create_depth_image(
        &mut self,
        device: &ash::Device,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<(vk::Image, AllocationHandle)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|result| Error::creation("depth image", result))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name: "depth buffer",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(source) => {
                unsafe { device.destroy_image(image, None) };
                return Err(Error::Allocation {
                    what: "depth image memory".into(),
                    source,
                });
            }
        };

        if let Err(result) = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_image(image, None) };
            if let Err(err) = self.allocator.free(allocation) {
                log::warn!("Failed to free depth image memory: {}", err);
            }
            return Err(Error::creation("depth image memory binding", result));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, allocation);
        Ok((image, AllocationHandle(id)))
    }

    fn destroy_depth_image(&mut self, device: &ash::Device, image: vk::Image, allocation: AllocationHandle) {
        unsafe { device.destroy_image(image, None) };
        match self.live.remove(&allocation.0) {
            Some(allocation) => {
                if let Err(err) = self.allocator.free(allocation) {
                    log::warn!("Failed to free depth image memory: {}", err);
                }
            }
            None => log::warn!("Unknown depth allocation {:?}", allocation),
        }
    }
}
