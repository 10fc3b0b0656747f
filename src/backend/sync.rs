// Synchronization primitives
//
// Per frame in flight: one semaphore signalled on image acquisition, one
// signalled when rendering finishes, and a fence created signalled so the
// first wait on it returns immediately.

use ash::vk;

use super::error::Result;
use super::swapchain::RingDevice;
use super::undo::UndoStack;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    /// Create the three objects, registering each with `undo` as it lands.
    pub(crate) fn create<'a, D: RingDevice + 'a>(device: &mut D, undo: &mut UndoStack<'a, D>) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        undo.push("image-available semaphore", move |d: &mut D| d.destroy_semaphore(image_available));

        let render_finished = device.create_semaphore()?;
        undo.push("render-finished semaphore", move |d: &mut D| d.destroy_semaphore(render_finished));

        let in_flight_fence = device.create_fence(true)?;
        undo.push("in-flight fence", move |d: &mut D| d.destroy_fence(in_flight_fence));

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub(crate) fn destroy<D: RingDevice>(&self, device: &mut D) {
        device.destroy_fence(self.in_flight_fence);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
    }
}
