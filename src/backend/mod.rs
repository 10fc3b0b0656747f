// Backend module - Vulkan bootstrap negotiation
//
// Registry -> Connection -> PhysicalDevice -> ExecutionContext -> Swapchain.
// Each stage negotiates tiered requirements against what the driver reports
// and owns the native objects it creates.

pub mod allocator;
pub mod capabilities;
pub mod device;
pub(crate) mod dispatch;
pub mod error;
pub mod instance;
pub mod physical_device;
pub mod queue;
pub mod registry;
pub mod swapchain;
pub mod sync;
pub mod tier;
pub mod undo;
pub mod version;

pub use allocator::{create_allocator, AllocationHandle, DepthAllocator, GpuDepthAllocator};
pub use capabilities::{compare, CapabilitySet, DeviceProperties, TierKind};
pub use device::{ExecutionContext, ExecutionContextBuilder, QueueLayout};
pub use error::{CapabilityKind, Error, ErrorKind, Result};
pub use instance::{Connection, ConnectionBuilder, ConnectionInfo, Diagnostics};
pub use physical_device::{
    pick_candidate, DeviceClass, DeviceSelector, PhysicalDevice, QueueRequirement, QueueRole,
    SelectionCriteria,
};
pub use queue::Queue;
pub use registry::{CapabilityRegistry, GlobalCapabilities};
pub use swapchain::{RingSettings, Swapchain, SwapchainBuilder};
pub use sync::FrameSync;
pub use tier::{Tiered, TieredList};
pub use undo::UndoStack;
pub use version::ApiVersion;
