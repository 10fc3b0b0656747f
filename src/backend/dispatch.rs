// Entry-point resolution checks
//
// ash fills its dispatch tables with panicking stubs when the driver returns
// NULL for a function. These helpers ask the loader directly so a missing
// mandatory entry point turns into an `IncompatibleDriver` error instead.

use ash::{vk, Entry};
use std::ffi::CStr;

use super::error::{Error, Result};

pub(crate) fn instance_fn_present(entry: &Entry, instance: vk::Instance, name: &CStr) -> bool {
    let resolved = unsafe { (entry.static_fn().get_instance_proc_addr)(instance, name.as_ptr()) };
    resolved.is_some()
}

pub(crate) fn device_fn_present(instance: &ash::Instance, device: vk::Device, name: &CStr) -> bool {
    let resolved = unsafe { (instance.fp_v1_0().get_device_proc_addr)(device, name.as_ptr()) };
    resolved.is_some()
}

/// Fail on the first instance-level function in `names` the loader cannot resolve.
pub(crate) fn require_instance_fns(
    entry: &Entry,
    instance: vk::Instance,
    names: &[&CStr],
) -> Result<()> {
    match names.iter().find(|name| !instance_fn_present(entry, instance, name)) {
        Some(name) => Err(Error::IncompatibleDriver(name.to_string_lossy().into_owned())),
        None => Ok(()),
    }
}

/// Fail on the first device-level function in `names` the driver cannot resolve.
pub(crate) fn require_device_fns(
    instance: &ash::Instance,
    device: vk::Device,
    names: &[&CStr],
) -> Result<()> {
    match names.iter().find(|name| !device_fn_present(instance, device, name)) {
        Some(name) => Err(Error::IncompatibleDriver(name.to_string_lossy().into_owned())),
        None => Ok(()),
    }
}

pub(crate) const DEBUG_UTILS_FNS: &[&CStr] = &[
    c"vkCreateDebugUtilsMessengerEXT",
    c"vkDestroyDebugUtilsMessengerEXT",
];

pub(crate) const DEVICE_CORE_FNS: &[&CStr] = &[
    c"vkGetDeviceQueue",
    c"vkDestroyDevice",
    c"vkDeviceWaitIdle",
    c"vkQueueSubmit",
    c"vkQueueWaitIdle",
    c"vkCreateSemaphore",
    c"vkDestroySemaphore",
];

pub(crate) const TIMELINE_FNS: &[&CStr] = &[c"vkGetSemaphoreCounterValue", c"vkWaitSemaphores"];

pub(crate) const SWAPCHAIN_FNS: &[&CStr] = &[
    c"vkCreateSwapchainKHR",
    c"vkDestroySwapchainKHR",
    c"vkGetSwapchainImagesKHR",
    c"vkAcquireNextImageKHR",
    c"vkQueuePresentKHR",
];
