//! Vulkan context management
//!
//! Headless instance, physical device selection and logical device creation,
//! plus the error types shared by the whole Vulkan backend.
//!
//! The engine targets Vulkan 1.3 and relies on three feature groups that are
//! checked during device selection and enabled on the logical device:
//!
//! - descriptor indexing with update-after-bind (bindless table)
//! - buffer device address (`gpu_address`)
//! - dynamic rendering (no render pass objects)

use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{c_void, CStr, CString};
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::ContextConfig;

const VALIDATION_LAYER_NAME: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// A size, offset, count or range is outside what the resource or device allows
    #[error("Argument out of range: {0}")]
    ArgumentOutOfRange(String),

    /// An argument is malformed
    #[error("Invalid argument: {0}")]
    ArgumentInvalid(String),

    /// A required argument is missing
    #[error("Missing argument: {0}")]
    ArgumentNull(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// The device lacks a required capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The request is valid but cannot be satisfied on this device
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse result classification exposed to callers that only branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// See [`VulkanError::ArgumentOutOfRange`]
    ArgumentOutOfRange,
    /// See [`VulkanError::ArgumentInvalid`]
    ArgumentInvalid,
    /// See [`VulkanError::ArgumentNull`]
    ArgumentNull,
    /// See [`VulkanError::InvalidOperation`]
    InvalidOperation,
    /// See [`VulkanError::Unsupported`]
    Unsupported,
    /// Driver failures and unsatisfiable requests
    RuntimeError,
}

impl VulkanError {
    /// Classify this error
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::ArgumentOutOfRange(_) => ResultCode::ArgumentOutOfRange,
            Self::ArgumentInvalid(_) | Self::Config(_) => ResultCode::ArgumentInvalid,
            Self::ArgumentNull(_) => ResultCode::ArgumentNull,
            Self::InvalidOperation { .. } => ResultCode::InvalidOperation,
            Self::Unsupported(_) => ResultCode::Unsupported,
            Self::Api(_)
            | Self::RuntimeError(_)
            | Self::InitializationFailed(_)
            | Self::NoSuitableMemoryType => ResultCode::RuntimeError,
        }
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// State read by the validation callback through the messenger user data
struct ValidationState {
    terminate_on_error: bool,
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension, when available
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle, when validation is enabled
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    // Referenced by the messenger; must outlive it
    _validation_state: Box<ValidationState>,
}

impl VulkanInstance {
    /// Create a headless Vulkan 1.3 instance
    pub fn new(config: &ContextConfig) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(VulkanError::Api)?
            .unwrap_or(vk::API_VERSION_1_0);
        if api_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::Unsupported(format!(
                "Vulkan 1.3 instance required, loader reports {}.{}",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version)
            )));
        }

        let app_name_cstr = CString::new(config.application_name.as_str())
            .map_err(|_| {
                VulkanError::ArgumentInvalid("Application name contains NUL".to_string())
            })?;
        let engine_name_cstr = CString::new("gpu_engine").map_err(|_| {
            VulkanError::InitializationFailed("Invalid engine name".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(config.application_version)
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let available_extensions = entry
            .enumerate_instance_extension_properties(None)
            .map_err(VulkanError::Api)?;
        let has_debug_utils = available_extensions.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == DebugUtils::name()
        });

        let enable_validation = config.validation_enabled() && {
            let layers = entry
                .enumerate_instance_layer_properties()
                .map_err(VulkanError::Api)?;
            let found = layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == VALIDATION_LAYER_NAME
            });
            if !found {
                log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
            found
        };

        let mut extensions: Vec<*const i8> = Vec::new();
        if has_debug_utils {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layer_names_ptrs: Vec<*const i8> = if enable_validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut validation_state = Box::new(ValidationState {
            terminate_on_error: config.terminate_on_validation_error,
        });

        let debug_utils = has_debug_utils.then(|| DebugUtils::new(&entry, &instance));
        let debug_messenger = match (&debug_utils, enable_validation) {
            (Some(debug_utils), true) => {
                let user_data =
                    (validation_state.as_mut() as *mut ValidationState).cast::<c_void>();
                match Self::setup_debug_messenger(debug_utils, user_data) {
                    Ok(messenger) => Some(messenger),
                    Err(e) => {
                        unsafe { instance.destroy_instance(None) };
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        log::info!(
            "Created Vulkan instance (validation: {}, debug utils: {})",
            enable_validation,
            has_debug_utils
        );

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            _validation_state: validation_state,
        })
    }

    fn setup_debug_messenger(
        debug_utils: &DebugUtils,
        user_data: *mut c_void,
    ) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Attach a debug name to a Vulkan object; a no-op without debug utils
    pub fn set_debug_name<H: vk::Handle>(&self, device: &Device, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name_cstr) = CString::new(name) else {
            log::warn!("Debug name {name:?} contains NUL, skipped");
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name_cstr);

        let result =
            unsafe { debug_utils.set_debug_utils_object_name(device.handle(), &name_info) };
        if let Err(e) = result {
            log::debug!("Failed to set debug name {name:?}: {e:?}");
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, self.debug_messenger.take()) {
                debug_utils.destroy_debug_utils_messenger(debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
        let state = user_data.cast::<ValidationState>();
        if !state.is_null() && (*state).terminate_on_error {
            log::error!("Terminating on validation error");
            std::process::abort();
        }
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Update-after-bind descriptor limits used to size the bindless table
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateAfterBindLimits {
    /// `maxDescriptorSetUpdateAfterBindSampledImages`
    pub max_sampled_images: u32,
    /// `maxDescriptorSetUpdateAfterBindSamplers`
    pub max_samplers: u32,
    /// `maxDescriptorSetUpdateAfterBindStorageImages`
    pub max_storage_images: u32,
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Human-readable device name
    pub name: String,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Bindless sizing limits
    pub update_after_bind_limits: UpdateAfterBindLimits,
    /// Whether `samplerAnisotropy` can be enabled
    pub supports_anisotropy: bool,
    /// Index of the graphics + compute queue family
    pub queue_family: u32,
    /// Valid timestamp bits of the queue family, zero when timestamps are unsupported
    pub timestamp_valid_bits: u32,
}

impl PhysicalDeviceInfo {
    /// Select the best suitable physical device
    pub fn select_suitable_device(
        instance: &Instance,
        prefer_discrete: bool,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance.enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut best: Option<(u32, Self)> = None;
        for device in devices {
            match Self::evaluate_device(instance, device) {
                Ok(info) => {
                    let score = device_type_score(info.properties.device_type, prefer_discrete);
                    if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                        best = Some((score, info));
                    }
                }
                Err(e) => {
                    let properties = unsafe { instance.get_physical_device_properties(device) };
                    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
                    log::debug!("Skipping GPU {}: {}", name.to_string_lossy(), e);
                }
            }
        }

        let (_, info) = best.ok_or_else(|| VulkanError::InitializationFailed(
            "No suitable GPU found".to_string()
        ))?;
        log::info!("Selected GPU: {}", info.name);
        Ok(info)
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::Unsupported("Vulkan 1.3 device required".to_string()));
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let features = {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
            features2.features
        };

        let missing: Vec<&str> = [
            (features12.descriptor_indexing, "descriptorIndexing"),
            (
                features12.shader_sampled_image_array_non_uniform_indexing,
                "shaderSampledImageArrayNonUniformIndexing",
            ),
            (
                features12.descriptor_binding_sampled_image_update_after_bind,
                "descriptorBindingSampledImageUpdateAfterBind",
            ),
            (
                features12.descriptor_binding_storage_image_update_after_bind,
                "descriptorBindingStorageImageUpdateAfterBind",
            ),
            (
                features12.descriptor_binding_update_unused_while_pending,
                "descriptorBindingUpdateUnusedWhilePending",
            ),
            (features12.descriptor_binding_partially_bound, "descriptorBindingPartiallyBound"),
            (features12.runtime_descriptor_array, "runtimeDescriptorArray"),
            (features12.buffer_device_address, "bufferDeviceAddress"),
            (features13.dynamic_rendering, "dynamicRendering"),
        ]
        .into_iter()
        .filter(|(supported, _)| *supported == vk::FALSE)
        .map(|(_, name)| name)
        .collect();
        if !missing.is_empty() {
            return Err(VulkanError::Unsupported(format!(
                "Missing features: {}",
                missing.join(", ")
            )));
        }

        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(device)
        };
        let (queue_family, family) = queue_families
            .iter()
            .enumerate()
            .find(|(_, family)| {
                family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .ok_or_else(|| {
                VulkanError::Unsupported("No graphics + compute queue family found".to_string())
            })?;

        let mut properties12 = vk::PhysicalDeviceVulkan12Properties::default();
        {
            let mut properties2 =
                vk::PhysicalDeviceProperties2::builder().push_next(&mut properties12);
            unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
        }

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            device,
            name,
            properties,
            memory_properties,
            update_after_bind_limits: UpdateAfterBindLimits {
                max_sampled_images: properties12
                    .max_descriptor_set_update_after_bind_sampled_images,
                max_samplers: properties12.max_descriptor_set_update_after_bind_samplers,
                max_storage_images: properties12
                    .max_descriptor_set_update_after_bind_storage_images,
            },
            supports_anisotropy: features.sampler_anisotropy == vk::TRUE,
            queue_family: queue_family as u32,
            timestamp_valid_bits: family.timestamp_valid_bits,
        })
    }

    /// Device limits
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Whether `format` supports `features` for optimal tiling
    pub fn supports_format(
        &self,
        instance: &Instance,
        format: vk::Format,
        features: vk::FormatFeatureFlags,
    ) -> bool {
        let props = unsafe { instance.get_physical_device_format_properties(self.device, format) };
        props.optimal_tiling_features.contains(features)
    }
}

fn device_type_score(device_type: vk::PhysicalDeviceType, prefer_discrete: bool) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 4,
        vk::PhysicalDeviceType::DISCRETE_GPU | vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics + compute queue
    pub queue: vk::Queue,
    /// Index of the queue family
    pub queue_family: u32,
}

impl LogicalDevice {
    /// Create a logical device with bindless, device address and dynamic rendering enabled
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> VulkanResult<Self> {
        let queue_priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device_info.queue_family)
            .queue_priorities(&queue_priorities)
            .build()];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_partially_bound(true)
            .runtime_descriptor_array(true)
            .buffer_device_address(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .features(
                vk::PhysicalDeviceFeatures::builder()
                    .sampler_anisotropy(physical_device_info.supports_anisotropy)
                    .build(),
            )
            .push_next(&mut features12)
            .push_next(&mut features13);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features2);

        let device = unsafe {
            instance.create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let queue = unsafe {
            device.get_device_queue(physical_device_info.queue_family, 0)
        };

        Ok(Self {
            device,
            queue,
            queue_family: physical_device_info.queue_family,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            VulkanError::ArgumentOutOfRange("x".into()).code(),
            ResultCode::ArgumentOutOfRange
        );
        assert_eq!(VulkanError::ArgumentInvalid("x".into()).code(), ResultCode::ArgumentInvalid);
        assert_eq!(VulkanError::ArgumentNull("x".into()).code(), ResultCode::ArgumentNull);
        assert_eq!(
            VulkanError::InvalidOperation { reason: "x".into() }.code(),
            ResultCode::InvalidOperation
        );
        assert_eq!(VulkanError::Unsupported("x".into()).code(), ResultCode::Unsupported);
        assert_eq!(VulkanError::RuntimeError("x".into()).code(), ResultCode::RuntimeError);
        assert_eq!(
            VulkanError::Api(vk::Result::ERROR_DEVICE_LOST).code(),
            ResultCode::RuntimeError
        );
        assert_eq!(VulkanError::NoSuitableMemoryType.code(), ResultCode::RuntimeError);
        assert_eq!(
            VulkanError::from(ConfigError::Parse("bad".into())).code(),
            ResultCode::ArgumentInvalid
        );
    }

    #[test]
    fn test_error_messages() {
        let err = VulkanError::ArgumentOutOfRange("Out of range".into());
        assert_eq!(err.to_string(), "Argument out of range: Out of range");
        let err = VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(err.to_string().contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn test_device_ranking() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU, true);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU, true);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU, true);
        assert!(discrete > integrated);
        assert!(integrated > cpu);

        assert_eq!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU, false)
        );
    }
}
