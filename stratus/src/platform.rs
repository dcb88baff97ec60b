// This module handles flagging the available behaviors
// supported by the device. Things like dmabuf import, swapchain
// support, exportable sync-fd fences, etc.
use ash::extensions::khr;
use ash::{vk, Instance};

use std::ffi::CStr;
use utils::log;

/// The available vulkan capabilities.
///
/// This is composed of two parts: flags for available features, and
/// lists of extensions to enable. The extension lists are kept so the
/// logical device can be created with exactly the extensions that were
/// found.
pub struct DeviceCapabilities {
    /// Does this device support VkSwapchain
    pub supports_swapchain: bool,
    /// Does this device allow importing client buffers through dmabuf
    /// handles
    pub supports_dmabuf: bool,
    /// Can fences be exported as sync file descriptors
    pub supports_external_fence_fd: bool,

    // The following are the lists of extensions that map to the above
    // features
    swapchain_exts: [*const i8; 1],
    dmabuf_exts: [*const i8; 3],
    external_fence_exts: [*const i8; 2],
}

unsafe impl Send for DeviceCapabilities {}
unsafe impl Sync for DeviceCapabilities {}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    let mut count = 0;

    for r in req.iter() {
        let rstr = unsafe { CStr::from_ptr(*r as *const std::os::raw::c_char) };

        for e in exts {
            let estr = unsafe { CStr::from_ptr(&e.extension_name as *const std::os::raw::c_char) };
            if rstr == estr {
                // increment our count, once we have verified all
                // extensions are present then return true
                count += 1;
                if count == req.len() {
                    return true;
                }
                break;
            }
        }
    }

    return false;
}

impl DeviceCapabilities {
    pub fn new(inst: &Instance, pdev: vk::PhysicalDevice) -> Self {
        let mut ret = Self {
            supports_swapchain: false,
            supports_dmabuf: false,
            supports_external_fence_fd: false,
            swapchain_exts: [khr::Swapchain::name().as_ptr()],
            dmabuf_exts: [
                vk::ExtExternalMemoryDmaBufFn::name().as_ptr(),
                khr::ExternalMemoryFd::name().as_ptr(),
                vk::ExtQueueFamilyForeignFn::name().as_ptr(),
            ],
            external_fence_exts: [
                khr::ExternalFenceFd::name().as_ptr(),
                vk::KhrExternalFenceFn::name().as_ptr(),
            ],
        };

        let exts = match unsafe { inst.enumerate_device_extension_properties(pdev) } {
            Ok(e) => e,
            Err(_) => {
                log::error!("Could not enumerate device extensions");
                return ret;
            }
        };

        match contains_extensions(exts.as_slice(), &ret.swapchain_exts) {
            true => ret.supports_swapchain = true,
            false => log::error!("This vulkan device does not support VkSwapchain"),
        }
        match contains_extensions(exts.as_slice(), &ret.dmabuf_exts) {
            true => ret.supports_dmabuf = true,
            false => log::info!("This vulkan device does not support dmabuf import"),
        }
        match contains_extensions(exts.as_slice(), &ret.external_fence_exts) {
            true => ret.supports_external_fence_fd = true,
            false => log::info!("This vulkan device does not support sync fd fence export"),
        }

        return ret;
    }

    /// The extension list to hand to vkCreateDevice, built from the
    /// capabilities that were actually found.
    pub fn get_device_extensions(&self) -> Vec<*const i8> {
        let mut ret = Vec::new();

        if self.supports_swapchain {
            for e in self.swapchain_exts.iter() {
                ret.push(*e)
            }
        }
        if self.supports_dmabuf {
            for e in self.dmabuf_exts.iter() {
                ret.push(*e)
            }
        }
        if self.supports_external_fence_fd {
            for e in self.external_fence_exts.iter() {
                ret.push(*e)
            }
        }

        return ret;
    }
}
