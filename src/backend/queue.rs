// Queue objects
//
// One `Queue` per native queue. Roles that resolve to the same (family,
// index) share the object, and with it the submission lock.

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{Error, Result};

pub struct Queue {
    handle: vk::Queue,
    family: u32,
    index: u32,
    submissions: AtomicU64,
    timeline: Option<vk::Semaphore>,
    lock: Mutex<()>,
}

impl Queue {
    pub(crate) fn new(handle: vk::Queue, family: u32, index: u32, timeline: Option<vk::Semaphore>) -> Self {
        Self {
            handle,
            family,
            index,
            submissions: AtomicU64::new(0),
            timeline,
            lock: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Timeline semaphore counting completed submissions, when negotiated.
    pub fn timeline(&self) -> Option<vk::Semaphore> {
        self.timeline
    }

    /// Serializes access to the native queue. Hold it around `submit`,
    /// `wait_idle` and presentation; nothing here takes it for you.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Acquire)
    }

    /// Value the next submission should signal on the timeline.
    pub fn next_timeline_value(&self) -> u64 {
        self.submission_count() + 1
    }

    /// Submit a batch and bump the submission counter. When a timeline is
    /// attached, the batch is expected to signal it with
    /// [`next_timeline_value`](Self::next_timeline_value).
    ///
    /// Returns the new submission count.
    pub fn submit(&self, device: &ash::Device, submits: &[vk::SubmitInfo], fence: vk::Fence) -> Result<u64> {
        unsafe { device.queue_submit(self.handle, submits, fence) }
            .map_err(|result| Error::query("queue submission", result))?;
        Ok(self.submissions.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Submissions the GPU has finished, read from the timeline without
    /// blocking. `None` when no timeline is attached.
    pub fn completed_submissions(&self, device: &ash::Device) -> Result<Option<u64>> {
        let Some(timeline) = self.timeline else {
            return Ok(None);
        };
        let value = unsafe { device.get_semaphore_counter_value(timeline) }
            .map_err(|result| Error::query("timeline semaphore value", result))?;
        Ok(Some(value))
    }

    /// Submissions still in flight. `None` when no timeline is attached.
    pub fn pending_submissions(&self, device: &ash::Device) -> Result<Option<u64>> {
        Ok(self
            .completed_submissions(device)?
            .map(|completed| self.submission_count().saturating_sub(completed)))
    }

    pub fn wait_idle(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.queue_wait_idle(self.handle) }
            .map_err(|result| Error::query("queue idle wait", result))
    }

    pub(crate) fn destroy_timeline(&self, device: &ash::Device) {
        if let Some(timeline) = self.timeline {
            unsafe { device.destroy_semaphore(timeline, None) };
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("family", &self.family)
            .field("index", &self.index)
            .field("submissions", &self.submission_count())
            .field("timeline", &self.timeline.is_some())
            .finish_non_exhaustive()
    }
}
