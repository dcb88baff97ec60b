// Vulkan bootstrap for the compositor
//
// This owns the instance, the physical and logical devices, and the
// one graphics queue everything renders on. Creation failure is
// sticky: once `is_failed()` returns true the compositor is expected
// to fall back to another render backend.

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::platform::DeviceCapabilities;
use crate::{Result, StratusError};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// this happy little debug callback is from the ash examples
// all it does is forward validation warnings/errors into our log
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING)
        || message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
    {
        log::error!(
            "[VK][{:?}][{:?}] {:?}",
            message_severity,
            message_types,
            CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
        );
    }
    vk::FALSE
}

/// The process-wide Vulkan backend
///
/// This holds our basic vulkan session data: the instance, the chosen
/// physical device, the logical device, and the single graphics queue
/// family the compositor renders and presents on. The queue family
/// index and queue handle are stable for the backend's lifetime.
pub struct Backend {
    /// the entry just loads function pointers from the dynamic library
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
    /// debug callback sugar mentioned earlier
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the physical device selected to render with
    pub(crate) pdev: vk::PhysicalDevice,
    /// the logical device we are using
    pub(crate) dev: ash::Device,

    graphics_queue_family: u32,
    graphics_queue: vk::Queue,

    /// Details about what this device supports
    pub(crate) caps: DeviceCapabilities,

    /// loader for exporting fences as sync fds, present only when the
    /// matching device extension was enabled
    external_fence_fd: Option<khr::ExternalFenceFd>,
    /// loader for querying dmabuf fd memory properties
    external_memory_fd: Option<khr::ExternalMemoryFd>,

    /// Sticky failure flag. Set on device loss or bootstrap failure,
    /// gates all further operations.
    failed: AtomicBool,
}

impl Backend {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        return (dr_loader, callback);
    }

    /// Create a vkInstance
    ///
    /// `surface_extensions` names the platform surface extensions the
    /// output layer needs (VK_KHR_surface + VK_KHR_xcb_surface for the
    /// X11 overlay path). Validation layers and the debug messenger
    /// are only enabled in debug builds.
    fn create_instance(entry: &Entry, surface_extensions: &[*const i8]) -> Result<ash::Instance> {
        let app_name = CString::new("stratus").unwrap();

        let layer_names: Vec<CString> = vec![
            #[cfg(debug_assertions)]
            CString::new("VK_LAYER_KHRONOS_validation").unwrap(),
        ];
        let layer_names_raw: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let mut extension_names_raw = surface_extensions.to_vec();
        if cfg!(debug_assertions) {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    /// Choose a vkPhysicalDevice and its graphics queue family.
    ///
    /// Picks the first device which exposes a queue family with
    /// GRAPHICS support. Whether that family can present to the X11
    /// surface is verified later, once the surface exists.
    fn select_pdev(inst: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(StratusError::INIT_FAILED))?
        };

        for pdev in pdevices.iter() {
            let families = unsafe { inst.get_physical_device_queue_family_properties(*pdev) };
            for (index, info) in families.iter().enumerate() {
                if info.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    let props = unsafe { inst.get_physical_device_properties(*pdev) };
                    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                    log::debug!("Selected Vulkan device: {:?}", name);
                    return Ok((*pdev, index as u32));
                }
            }
        }

        log::error!("Could not find a GPU with a graphics queue");
        Err(StratusError::INIT_FAILED)
    }

    /// Create a logical device for interfacing with the physical
    /// device. The extension list is built from the capabilities that
    /// were actually probed, so enabling never fails for a missing
    /// extension.
    fn create_device(
        caps: &DeviceCapabilities,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = caps.get_device_extensions();

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let features = vk::PhysicalDeviceFeatures::builder();

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features);

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    /// Create a new backend for the given platform surface extensions.
    pub fn new(surface_extensions: &[*const i8]) -> Result<Arc<Backend>> {
        let entry = Entry::linked();
        let inst = Self::create_instance(&entry, surface_extensions)?;

        let debug = match cfg!(debug_assertions) {
            true => Some(Self::setup_debug(&entry, &inst)),
            false => None,
        };

        let (pdev, graphics_queue_family) = Self::select_pdev(&inst)?;

        let caps = DeviceCapabilities::new(&inst, pdev);
        if !caps.supports_swapchain {
            return Err(StratusError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }

        let dev = Self::create_device(&caps, &inst, pdev, graphics_queue_family)?;
        let graphics_queue = unsafe { dev.get_device_queue(graphics_queue_family, 0) };

        let external_fence_fd = match caps.supports_external_fence_fd {
            true => Some(khr::ExternalFenceFd::new(&inst, &dev)),
            false => None,
        };
        let external_memory_fd = match caps.supports_dmabuf {
            true => Some(khr::ExternalMemoryFd::new(&inst, &dev)),
            false => None,
        };

        Ok(Arc::new(Backend {
            loader: entry,
            inst: inst,
            debug: debug,
            pdev: pdev,
            dev: dev,
            graphics_queue_family: graphics_queue_family,
            graphics_queue: graphics_queue,
            caps: caps,
            external_fence_fd: external_fence_fd,
            external_memory_fd: external_memory_fd,
            failed: AtomicBool::new(false),
        }))
    }

    pub fn device(&self) -> &ash::Device {
        &self.dev
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.inst
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdev
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn supports_dmabuf(&self) -> bool {
        self.caps.supports_dmabuf
    }

    pub fn supports_external_fence_fd(&self) -> bool {
        self.caps.supports_external_fence_fd && self.external_fence_fd.is_some()
    }

    pub(crate) fn external_fence_fd_loader(&self) -> Option<&khr::ExternalFenceFd> {
        self.external_fence_fd.as_ref()
    }

    pub(crate) fn external_memory_fd_loader(&self) -> Option<&khr::ExternalMemoryFd> {
        self.external_memory_fd.as_ref()
    }

    /// Mark the backend as failed.
    ///
    /// After this returns, `is_failed` is true forever and the
    /// compositor should tear this backend down.
    pub fn set_failed(&self, reason: &str) {
        log::error!("Vulkan backend failed: {}", reason);
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Check if the graphics device was lost.
    ///
    /// Device loss is fatal for this backend; the compositor reacts by
    /// switching to its other render backend.
    pub fn check_graphics_reset(&self) -> bool {
        let res = unsafe { self.dev.device_wait_idle() };
        if res == Err(vk::Result::ERROR_DEVICE_LOST) {
            self.set_failed("device lost");
            return true;
        }
        false
    }

}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            let _ = self.dev.device_wait_idle();
            self.dev.destroy_device(None);

            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
