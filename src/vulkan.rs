//! Vulkan context and initialization for video decoding.
//!
//! Note: Vulkan p_next chaining requires creating default structs and then assigning p_next,
//! which triggers clippy::field_reassign_with_default. This is the correct pattern for Vulkan.
#![allow(clippy::field_reassign_with_default)]

use crate::decoder::Codec;
use crate::error::{FrameForgeError, Result};
use ash::vk;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use tracing::{debug, info, warn};

/// Builder for creating a VideoContext.
#[must_use]
pub struct VideoContextBuilder {
    app_name: String,
    app_version: (u32, u32, u32),
    enable_validation: bool,
    required_decode_codecs: Vec<Codec>,
}

impl Default for VideoContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoContextBuilder {
    /// Create a new VideoContextBuilder with default settings.
    pub fn new() -> Self {
        Self {
            app_name: "FrameForge".to_string(),
            app_version: (1, 0, 0),
            enable_validation: false,
            required_decode_codecs: Vec::new(),
        }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_string();
        self
    }

    /// Set the application version.
    pub fn app_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.app_version = (major, minor, patch);
        self
    }

    /// Enable or disable validation layers.
    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require video decode support for a codec.
    pub fn require_decode(mut self, codec: Codec) -> Self {
        self.required_decode_codecs.push(codec);
        self
    }

    /// Build the VideoContext.
    pub fn build(self) -> Result<VideoContext> {
        VideoContext::new(self)
    }
}

/// Inner struct holding the actual Vulkan resources.
struct VideoContextInner {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    video_decode_queue_family: u32,
    video_decode_queues: Vec<vk::Queue>,
    video_decode_default_queue_index: u32,
    transfer_queue_family: u32,
    transfer_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_properties: vk::PhysicalDeviceProperties,
    supported_decode_codecs: Vec<Codec>,
}

impl Drop for VideoContextInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Holds the Vulkan context for video decode operations.
///
/// This type is cheaply cloneable - clones share the same underlying Vulkan resources.
#[derive(Clone)]
pub struct VideoContext {
    inner: std::sync::Arc<VideoContextInner>,
}

/// Provide access to inner fields through deref-like accessors.
impl VideoContext {
    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.inner.instance
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.inner.device
    }

    /// Get the video decode queue family index.
    pub fn video_decode_queue_family(&self) -> u32 {
        self.inner.video_decode_queue_family
    }

    /// Get the number of queues available in the decode queue family.
    pub fn video_decode_num_queues(&self) -> usize {
        self.inner.video_decode_queues.len()
    }

    /// Get the default decode queue index.
    pub fn video_decode_default_queue_index(&self) -> u32 {
        self.inner.video_decode_default_queue_index
    }

    /// Get a decode queue by index.
    ///
    /// When the device offers more than one decode queue, the index wraps
    /// modulo the available queue count.
    pub fn video_decode_queue(&self, index: u32) -> vk::Queue {
        let count = self.inner.video_decode_queues.len();
        self.inner.video_decode_queues[index as usize % count]
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.inner.transfer_queue_family
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.inner.transfer_queue
    }

    /// Get the physical device handle.
    ///
    /// This can be used to query device capabilities and properties.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    /// Get the physical device properties.
    ///
    /// Contains information about the GPU such as device name, limits, and supported Vulkan version.
    pub fn device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.inner.device_properties
    }
}

impl VideoContext {
    fn new(builder: VideoContextBuilder) -> Result<Self> {
        // Load Vulkan.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| FrameForgeError::InstanceCreation(e.to_string()))?;

        // Create instance.
        let app_name = CString::new(builder.app_name.clone()).expect("Invalid app name");
        let engine_name = CString::new("FrameForge").expect("Invalid engine name");

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(
                0,
                builder.app_version.0,
                builder.app_version.1,
                builder.app_version.2,
            ))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut layer_names: Vec<*const c_char> = Vec::new();
        let validation_layer =
            CString::new("VK_LAYER_KHRONOS_validation").expect("Invalid layer name");
        if builder.enable_validation {
            layer_names.push(validation_layer.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| FrameForgeError::InstanceCreation(e.to_string()))?;

        info!("Created Vulkan instance");

        // Find physical device with video decode support.
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| FrameForgeError::NoSuitableDevice(e.to_string()))?;

        let mut selected_device = None;
        let mut video_decode_queue_family = u32::MAX;
        let mut video_decode_queue_count = 0u32;
        let mut transfer_queue_family = u32::MAX;
        let mut supported_decode_codecs = Vec::new();

        for physical_device in physical_devices {
            let props = unsafe { instance.get_physical_device_properties(physical_device) };
            let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .to_string();
            debug!("Checking device: {}", device_name);

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

            // Find queue families.
            let mut decode_queue = None;
            let mut decode_queue_count = 0u32;
            let mut transfer_q = u32::MAX;

            for (idx, props) in queue_families.iter().enumerate() {
                debug!(
                    "Queue family {}: flags={:?}, count={}",
                    idx, props.queue_flags, props.queue_count
                );

                // Check for video decode queue.
                if props.queue_flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR)
                    && decode_queue.is_none()
                {
                    decode_queue = Some(idx as u32);
                    decode_queue_count = props.queue_count;
                    debug!(
                        "Found video decode queue family {} with {} queues",
                        idx, props.queue_count
                    );
                }

                // Check for transfer queue.
                if props.queue_flags.contains(vk::QueueFlags::TRANSFER) {
                    transfer_q = idx as u32;
                }
            }

            // Check codec support for decoding.
            let mut decode_codecs = Vec::new();
            if decode_queue.is_some() {
                // Get list of available device extensions
                let available_extensions = unsafe {
                    instance
                        .enumerate_device_extension_properties(physical_device)
                        .unwrap_or_default()
                };

                let has_extension = |name: &std::ffi::CStr| -> bool {
                    available_extensions.iter().any(|ext| {
                        let ext_name =
                            unsafe { std::ffi::CStr::from_ptr(ext.extension_name.as_ptr()) };
                        ext_name == name
                    })
                };

                // Only check codec support if the extension exists
                if has_extension(ash::khr::video_decode_h264::NAME)
                    && Self::check_decode_support(&entry, &instance, physical_device, Codec::H264)
                {
                    decode_codecs.push(Codec::H264);
                    debug!("Device {} supports H.264 decode", device_name);
                }
                if has_extension(ash::khr::video_decode_h265::NAME)
                    && Self::check_decode_support(&entry, &instance, physical_device, Codec::H265)
                {
                    decode_codecs.push(Codec::H265);
                    debug!("Device {} supports H.265 decode", device_name);
                }
                if has_extension(ash::khr::video_decode_av1::NAME)
                    && Self::check_decode_support(&entry, &instance, physical_device, Codec::AV1)
                {
                    decode_codecs.push(Codec::AV1);
                    debug!("Device {} supports AV1 decode", device_name);
                }
            }

            // Check if all required decode codecs are supported.
            let decode_supported = builder
                .required_decode_codecs
                .iter()
                .all(|codec| decode_codecs.contains(codec));

            if decode_queue.is_some() && decode_supported {
                selected_device = Some(physical_device);
                video_decode_queue_family = decode_queue.unwrap_or(0);
                video_decode_queue_count = decode_queue_count;
                transfer_queue_family = if transfer_q != u32::MAX {
                    transfer_q
                } else {
                    video_decode_queue_family
                };
                supported_decode_codecs = decode_codecs;
                info!("Selected device: {}", device_name);
                break;
            }
        }

        let physical_device = selected_device.ok_or_else(|| {
            FrameForgeError::NoSuitableDevice(
                "No device with required video decode support found".to_string(),
            )
        })?;

        // Get device properties and memory properties.
        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        // Create logical device with video decode extensions. Request every
        // queue the decode family offers so callers can spread submissions.
        let decode_queue_priorities = vec![1.0f32; video_decode_queue_count.max(1) as usize];
        let transfer_queue_priorities = [1.0f32];

        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(video_decode_queue_family)
            .queue_priorities(&decode_queue_priorities)];
        if transfer_queue_family != video_decode_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_queue_family)
                    .queue_priorities(&transfer_queue_priorities),
            );
        }

        // Required device extensions for video decoding.
        let mut extension_names = vec![
            ash::khr::video_queue::NAME.as_ptr(),
            ash::khr::video_decode_queue::NAME.as_ptr(),
            ash::khr::synchronization2::NAME.as_ptr(),
        ];

        let mut push_ext = |name: *const i8| {
            if !extension_names.contains(&name) {
                extension_names.push(name);
            }
        };
        if supported_decode_codecs.contains(&Codec::H264) {
            push_ext(ash::khr::video_decode_h264::NAME.as_ptr());
        }
        if supported_decode_codecs.contains(&Codec::H265) {
            push_ext(ash::khr::video_decode_h265::NAME.as_ptr());
        }
        if supported_decode_codecs.contains(&Codec::AV1) {
            push_ext(ash::khr::video_decode_av1::NAME.as_ptr());
        }

        // Enable synchronization2 feature.
        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);

        // Enable sampler YCbCr conversion feature (required for multi-planar
        // YUV image views used as decode output).
        let mut ycbcr_features = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default()
            .sampler_ycbcr_conversion(true);

        // Chain: sync2_features -> ycbcr_features
        sync2_features.p_next =
            (&mut ycbcr_features as *mut vk::PhysicalDeviceSamplerYcbcrConversionFeatures).cast();

        // Log all extensions being enabled
        debug!("Enabling {} device extensions:", extension_names.len());
        for ext_name_ptr in &extension_names {
            let ext_name = unsafe { std::ffi::CStr::from_ptr(*ext_name_ptr) };
            debug!("  - {}", ext_name.to_string_lossy());
        }

        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);

        // Attach the chain to device_create_info.
        device_create_info.p_next =
            (&mut sync2_features as *mut vk::PhysicalDeviceSynchronization2Features).cast();

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| FrameForgeError::DeviceCreation(e.to_string()))?;

        // Get queues.
        let video_decode_queues: Vec<vk::Queue> = (0..video_decode_queue_count.max(1))
            .map(|i| unsafe { device.get_device_queue(video_decode_queue_family, i) })
            .collect();
        let transfer_queue = unsafe { device.get_device_queue(transfer_queue_family, 0) };

        info!(
            "Video decode queue family: {} ({} queues)",
            video_decode_queue_family,
            video_decode_queues.len()
        );
        info!("Transfer queue family: {}", transfer_queue_family);
        info!("Created Vulkan device with video decode support");

        Ok(Self {
            inner: std::sync::Arc::new(VideoContextInner {
                entry,
                instance,
                physical_device,
                device,
                video_decode_queue_family,
                video_decode_queues,
                video_decode_default_queue_index: 0,
                transfer_queue_family,
                transfer_queue,
                memory_properties,
                device_properties,
                supported_decode_codecs,
            }),
        })
    }

    fn check_decode_support(
        entry: &ash::Entry,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        codec: Codec,
    ) -> bool {
        // Create video queue instance extension.
        let video_queue = ash::khr::video_queue::Instance::new(entry, instance);

        // Codec-specific profile info (must stay alive during the call).
        let mut h264_profile = vk::VideoDecodeH264ProfileInfoKHR::default()
            .std_profile_idc(ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_MAIN)
            .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE);
        let mut h265_profile = vk::VideoDecodeH265ProfileInfoKHR::default().std_profile_idc(
            ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN,
        );
        let mut av1_profile = vk::VideoDecodeAV1ProfileInfoKHR::default()
            .std_profile(ash::vk::native::StdVideoAV1Profile_STD_VIDEO_AV1_PROFILE_MAIN);

        // Video profile info for decode with typical 8-bit 4:2:0.
        let mut profile_info = vk::VideoProfileInfoKHR::default()
            .video_codec_operation(codec.decode_operation())
            .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
            .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8);

        // Chain the codec-specific profile into profile_info.
        profile_info.p_next = match codec {
            Codec::H264 => (&mut h264_profile as *mut vk::VideoDecodeH264ProfileInfoKHR).cast(),
            Codec::H265 => (&mut h265_profile as *mut vk::VideoDecodeH265ProfileInfoKHR).cast(),
            Codec::AV1 => (&mut av1_profile as *mut vk::VideoDecodeAV1ProfileInfoKHR).cast(),
        };

        // Create capabilities structures.
        let mut decode_capabilities = vk::VideoDecodeCapabilitiesKHR::default();
        let mut capabilities = vk::VideoCapabilitiesKHR::default();
        capabilities.p_next =
            &mut decode_capabilities as *mut vk::VideoDecodeCapabilitiesKHR as *mut _;

        // Query capabilities.
        let result = unsafe {
            (video_queue.fp().get_physical_device_video_capabilities_khr)(
                physical_device,
                &profile_info,
                &mut capabilities,
            )
        };

        match result {
            vk::Result::SUCCESS => {
                debug!(
                    "{:?} decode supported: max {}x{}, {} DPB slots",
                    codec,
                    capabilities.max_coded_extent.width,
                    capabilities.max_coded_extent.height,
                    capabilities.max_dpb_slots
                );
                true
            }
            vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR => {
                debug!("{:?} decode not supported on this device", codec);
                false
            }
            err => {
                warn!("Failed to query {:?} decode capabilities: {:?}", codec, err);
                false
            }
        }
    }

    /// Check if a codec is supported for decoding.
    pub fn supports_decode(&self, codec: Codec) -> bool {
        self.inner.supported_decode_codecs.contains(&codec)
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.inner.entry
    }

    /// Find a memory type that satisfies the requirements.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.inner.memory_properties.memory_type_count).find(|&i| {
            (type_filter & (1 << i)) != 0
                && self.inner.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }
}
