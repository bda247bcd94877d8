//! Hardware video decode session.
//!
//! A session is bound to one negotiated codec profile, chroma format, bit
//! depth, and coded resolution. It is created once per sequence and torn
//! down and recreated when the sequence signals an incompatible format
//! change.
//!
//! Note: Vulkan p_next chaining requires creating default structs and then assigning p_next,
//! which triggers clippy::field_reassign_with_default. This is the correct pattern for Vulkan.
#![allow(clippy::field_reassign_with_default)]

use crate::decoder::params::{ParameterSetData, PictureParameterSet};
use crate::decoder::{BitDepth, ChromaFormat, Codec, VideoFormat};
use crate::error::{FrameForgeError, Result};
use crate::vulkan::VideoContext;
use ash::vk;
use std::ptr;
use tracing::{debug, info};

/// Device limits and alignments for a decode profile.
#[derive(Debug, Clone, Copy)]
pub struct DecodeCapabilities {
    /// Largest coded extent the device decodes for this profile.
    pub max_coded_extent: vk::Extent2D,
    /// Maximum number of DPB slots the session may address.
    pub max_dpb_slots: u32,
    /// Maximum number of active reference pictures per decode op.
    pub max_active_references: u32,
    /// Required alignment of bitstream buffer offsets.
    pub min_bitstream_buffer_offset_alignment: u64,
    /// Required alignment of bitstream buffer range sizes.
    pub min_bitstream_buffer_size_alignment: u64,
    /// Decode capability flags; tells us whether DPB and output images may
    /// coincide or must be distinct.
    pub flags: vk::VideoDecodeCapabilityFlagsKHR,
}

impl DecodeCapabilities {
    /// Whether the hardware requires output images distinct from the DPB.
    pub fn requires_distinct_output(&self) -> bool {
        !self
            .flags
            .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE)
    }
}

/// Build the Vulkan video profile chain for `format` on the stack and hand
/// it to `f`. The codec-specific profile struct must outlive the base
/// profile that points at it, which a callback scope guarantees.
pub fn with_video_profile<R>(
    format: &VideoFormat,
    f: impl FnOnce(&vk::VideoProfileInfoKHR) -> R,
) -> R {
    let mut h264_profile = vk::VideoDecodeH264ProfileInfoKHR::default()
        .std_profile_idc(ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_MAIN)
        .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE);
    let mut h265_profile = vk::VideoDecodeH265ProfileInfoKHR::default().std_profile_idc(
        ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN,
    );
    let mut av1_profile = vk::VideoDecodeAV1ProfileInfoKHR::default()
        .std_profile(ash::vk::native::StdVideoAV1Profile_STD_VIDEO_AV1_PROFILE_MAIN);

    let mut profile_info = vk::VideoProfileInfoKHR::default()
        .video_codec_operation(format.codec.decode_operation())
        .chroma_subsampling(format.chroma_format.into())
        .luma_bit_depth(format.bit_depth_luma.into())
        .chroma_bit_depth(format.bit_depth_chroma.into());

    profile_info.p_next = match format.codec {
        Codec::H264 => (&mut h264_profile as *mut vk::VideoDecodeH264ProfileInfoKHR).cast(),
        Codec::H265 => (&mut h265_profile as *mut vk::VideoDecodeH265ProfileInfoKHR).cast(),
        Codec::AV1 => (&mut av1_profile as *mut vk::VideoDecodeAV1ProfileInfoKHR).cast(),
    };

    f(&profile_info)
}

/// Query decode capabilities for a format's profile.
///
/// Fails with [`FrameForgeError::FormatUnsupported`] when the device does
/// not decode this profile at all.
pub fn query_decode_capabilities(
    context: &VideoContext,
    format: &VideoFormat,
) -> Result<DecodeCapabilities> {
    let video_queue_fn = ash::khr::video_queue::Instance::new(context.entry(), context.instance());

    with_video_profile(format, |profile_info| {
        let mut decode_capabilities = vk::VideoDecodeCapabilitiesKHR::default();
        let mut capabilities = vk::VideoCapabilitiesKHR::default();
        capabilities.p_next =
            &mut decode_capabilities as *mut vk::VideoDecodeCapabilitiesKHR as *mut _;

        let result = unsafe {
            (video_queue_fn.fp().get_physical_device_video_capabilities_khr)(
                context.physical_device(),
                profile_info,
                &mut capabilities,
            )
        };

        match result {
            vk::Result::SUCCESS => {
                debug!(
                    "{} decode caps: max {}x{}, {} DPB slots, {} active refs",
                    format.codec.name(),
                    capabilities.max_coded_extent.width,
                    capabilities.max_coded_extent.height,
                    capabilities.max_dpb_slots,
                    capabilities.max_active_reference_pictures
                );
                Ok(DecodeCapabilities {
                    max_coded_extent: capabilities.max_coded_extent,
                    max_dpb_slots: capabilities.max_dpb_slots,
                    max_active_references: capabilities.max_active_reference_pictures,
                    min_bitstream_buffer_offset_alignment: capabilities
                        .min_bitstream_buffer_offset_alignment,
                    min_bitstream_buffer_size_alignment: capabilities
                        .min_bitstream_buffer_size_alignment,
                    flags: decode_capabilities.flags,
                })
            }
            vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR
            | vk::Result::ERROR_VIDEO_PROFILE_FORMAT_NOT_SUPPORTED_KHR => {
                Err(FrameForgeError::FormatUnsupported(format!(
                    "{} {}x{} is not decodable on this device: {:?}",
                    format.codec.name(),
                    format.coded_width,
                    format.coded_height,
                    result
                )))
            }
            err => Err(FrameForgeError::Vulkan(err)),
        }
    })
}

/// The decode output/DPB image format for a chroma format and bit depth.
pub fn get_decode_image_format(chroma: ChromaFormat, bit_depth: BitDepth) -> Result<vk::Format> {
    match (chroma, bit_depth) {
        (ChromaFormat::Yuv420, BitDepth::Eight) => Ok(vk::Format::G8_B8R8_2PLANE_420_UNORM),
        (ChromaFormat::Yuv420, BitDepth::Ten) => {
            Ok(vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16)
        }
        (ChromaFormat::Yuv444, BitDepth::Eight) => Ok(vk::Format::G8_B8R8_2PLANE_444_UNORM),
        (ChromaFormat::Yuv444, BitDepth::Ten) => {
            Ok(vk::Format::G10X6_B10X6R10X6_2PLANE_444_UNORM_3PACK16)
        }
        _ => Err(FrameForgeError::FormatUnsupported(format!(
            "Unsupported chroma format / bit depth combination: {:?} / {:?}",
            chroma, bit_depth
        ))),
    }
}

/// Create a codec std-header name array for Vulkan from a string.
fn make_codec_name(codec_name: &[u8]) -> [i8; 256] {
    let mut name = [0i8; 256];
    for (i, &byte) in codec_name.iter().enumerate() {
        if i < 255 {
            name[i] = byte as i8;
        }
    }
    name
}

fn std_header_version(codec: Codec) -> vk::ExtensionProperties {
    let name: &[u8] = match codec {
        Codec::H264 => b"VK_STD_vulkan_video_codec_h264_decode",
        Codec::H265 => b"VK_STD_vulkan_video_codec_h265_decode",
        Codec::AV1 => b"VK_STD_vulkan_video_codec_av1_decode",
    };
    vk::ExtensionProperties {
        extension_name: make_codec_name(name),
        spec_version: vk::make_api_version(0, 1, 0, 0),
    }
}

/// Owns the hardware video decode session and its bound memory.
pub struct DecodeSession {
    context: VideoContext,
    video_queue_fn: ash::khr::video_queue::Device,
    session: vk::VideoSessionKHR,
    session_memory: Vec<vk::DeviceMemory>,
    parameters: vk::VideoSessionParametersKHR,
    format: VideoFormat,
    capabilities: DecodeCapabilities,
    max_dpb_slots: u32,
}

impl DecodeSession {
    /// Create a session for `format` with `max_dpb_slots` reference slots.
    pub fn create(
        context: VideoContext,
        format: VideoFormat,
        capabilities: DecodeCapabilities,
        max_dpb_slots: u32,
    ) -> Result<Self> {
        if format.coded_width > capabilities.max_coded_extent.width
            || format.coded_height > capabilities.max_coded_extent.height
        {
            return Err(FrameForgeError::FormatUnsupported(format!(
                "Coded extent {}x{} exceeds device maximum {}x{}",
                format.coded_width,
                format.coded_height,
                capabilities.max_coded_extent.width,
                capabilities.max_coded_extent.height
            )));
        }

        let video_queue_fn =
            ash::khr::video_queue::Device::new(context.instance(), context.device());

        let picture_format = get_decode_image_format(format.chroma_format, format.bit_depth_luma)?;
        let header_version = std_header_version(format.codec);

        let session = with_video_profile(&format, |profile_info| -> Result<vk::VideoSessionKHR> {
            let session_create_info = vk::VideoSessionCreateInfoKHR::default()
                .queue_family_index(context.video_decode_queue_family())
                .flags(vk::VideoSessionCreateFlagsKHR::empty())
                .video_profile(profile_info)
                .picture_format(picture_format)
                .max_coded_extent(vk::Extent2D {
                    width: format.coded_width,
                    height: format.coded_height,
                })
                .reference_picture_format(picture_format)
                .max_dpb_slots(max_dpb_slots)
                .max_active_reference_pictures(capabilities.max_active_references.min(max_dpb_slots))
                .std_header_version(&header_version);

            let mut session = vk::VideoSessionKHR::null();
            let result = unsafe {
                (video_queue_fn.fp().create_video_session_khr)(
                    context.device().handle(),
                    &session_create_info,
                    ptr::null(),
                    &mut session,
                )
            };
            if result != vk::Result::SUCCESS {
                return Err(FrameForgeError::VideoSessionCreation(format!(
                    "{:?}",
                    result
                )));
            }
            Ok(session)
        })?;

        // Query and bind session memory.
        let session_memory = match allocate_session_memory(&context, session, &video_queue_fn) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe {
                    (video_queue_fn.fp().destroy_video_session_khr)(
                        context.device().handle(),
                        session,
                        ptr::null(),
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Created {} decode session: {}x{}, {} DPB slots",
            format.codec.name(),
            format.coded_width,
            format.coded_height,
            max_dpb_slots
        );

        Ok(Self {
            context,
            video_queue_fn,
            session,
            session_memory,
            parameters: vk::VideoSessionParametersKHR::null(),
            format,
            capabilities,
            max_dpb_slots,
        })
    }

    /// The raw session handle.
    pub fn handle(&self) -> vk::VideoSessionKHR {
        self.session
    }

    /// The active session parameters object, if any set has been bound.
    pub fn parameters(&self) -> vk::VideoSessionParametersKHR {
        self.parameters
    }

    /// The format the session was created against.
    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    /// Device limits the session was negotiated under.
    pub fn capabilities(&self) -> &DecodeCapabilities {
        &self.capabilities
    }

    /// Number of DPB slots the session addresses.
    pub fn max_dpb_slots(&self) -> u32 {
        self.max_dpb_slots
    }

    /// Whether this session can decode a sequence with `format` without
    /// being recreated.
    pub fn is_compatible(&self, format: &VideoFormat) -> bool {
        self.format.is_compatible_with(format)
    }

    /// Bind an activated parameter set to the session, replacing any
    /// previously bound parameters object.
    ///
    /// The set's std headers are chained into the parameters object through
    /// the codec-specific create-info, so the hardware sees the parser's
    /// SPS/PPS (or AV1 sequence header) content.
    pub fn bind_parameters(&mut self, set: &PictureParameterSet) -> Result<()> {
        if set.codec() != self.format.codec {
            return Err(FrameForgeError::InvalidInput(format!(
                "Parameter set codec {:?} does not match session codec {:?}",
                set.codec(),
                self.format.codec
            )));
        }

        let mut create_info =
            vk::VideoSessionParametersCreateInfoKHR::default().video_session(self.session);

        let mut parameters = vk::VideoSessionParametersKHR::null();
        let create = |create_info: &vk::VideoSessionParametersCreateInfoKHR,
                      parameters: &mut vk::VideoSessionParametersKHR| {
            unsafe {
                (self.video_queue_fn.fp().create_video_session_parameters_khr)(
                    self.context.device().handle(),
                    create_info,
                    ptr::null(),
                    parameters,
                )
            }
        };

        let result = match set.data() {
            ParameterSetData::H264 { sps, pps } => {
                let add_info = vk::VideoDecodeH264SessionParametersAddInfoKHR::default()
                    .std_sp_ss(sps)
                    .std_pp_ss(pps);
                let mut h264_create_info =
                    vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
                        .max_std_sps_count(sps.len() as u32)
                        .max_std_pps_count(pps.len() as u32)
                        .parameters_add_info(&add_info);
                create_info.p_next = (&mut h264_create_info
                    as *mut vk::VideoDecodeH264SessionParametersCreateInfoKHR)
                    .cast();
                create(&create_info, &mut parameters)
            }
            ParameterSetData::H265 { vps, sps, pps } => {
                let add_info = vk::VideoDecodeH265SessionParametersAddInfoKHR::default()
                    .std_vp_ss(vps)
                    .std_sp_ss(sps)
                    .std_pp_ss(pps);
                let mut h265_create_info =
                    vk::VideoDecodeH265SessionParametersCreateInfoKHR::default()
                        .max_std_vps_count(vps.len() as u32)
                        .max_std_sps_count(sps.len() as u32)
                        .max_std_pps_count(pps.len() as u32)
                        .parameters_add_info(&add_info);
                create_info.p_next = (&mut h265_create_info
                    as *mut vk::VideoDecodeH265SessionParametersCreateInfoKHR)
                    .cast();
                create(&create_info, &mut parameters)
            }
            ParameterSetData::AV1 { sequence_header } => {
                let mut av1_create_info =
                    vk::VideoDecodeAV1SessionParametersCreateInfoKHR::default()
                        .std_sequence_header(sequence_header);
                create_info.p_next = (&mut av1_create_info
                    as *mut vk::VideoDecodeAV1SessionParametersCreateInfoKHR)
                    .cast();
                create(&create_info, &mut parameters)
            }
        };
        if result != vk::Result::SUCCESS {
            return Err(FrameForgeError::SessionParametersCreation(format!(
                "{:?}",
                result
            )));
        }

        self.destroy_parameters();
        self.parameters = parameters;
        debug!(
            "Bound parameter set {} to decode session",
            set.update_sequence()
        );
        Ok(())
    }

    fn destroy_parameters(&mut self) {
        if self.parameters != vk::VideoSessionParametersKHR::null() {
            unsafe {
                (self.video_queue_fn.fp().destroy_video_session_parameters_khr)(
                    self.context.device().handle(),
                    self.parameters,
                    ptr::null(),
                );
            }
            self.parameters = vk::VideoSessionParametersKHR::null();
        }
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.destroy_parameters();
        unsafe {
            (self.video_queue_fn.fp().destroy_video_session_khr)(
                self.context.device().handle(),
                self.session,
                ptr::null(),
            );
            for memory in self.session_memory.drain(..) {
                self.context.device().free_memory(memory, None);
            }
        }
        debug!("Destroyed decode session");
    }
}

/// Allocate and bind memory for a video session.
///
/// Returns the allocated device memory handles.
fn allocate_session_memory(
    context: &VideoContext,
    session: vk::VideoSessionKHR,
    video_queue_fn: &ash::khr::video_queue::Device,
) -> Result<Vec<vk::DeviceMemory>> {
    // Query memory requirements count.
    let mut memory_requirements_count = 0u32;
    let result = unsafe {
        (video_queue_fn
            .fp()
            .get_video_session_memory_requirements_khr)(
            context.device().handle(),
            session,
            &mut memory_requirements_count,
            ptr::null_mut(),
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(FrameForgeError::MemoryAllocation(format!("{:?}", result)));
    }

    // Query actual requirements.
    let mut memory_requirements =
        vec![vk::VideoSessionMemoryRequirementsKHR::default(); memory_requirements_count as usize];
    let result = unsafe {
        (video_queue_fn
            .fp()
            .get_video_session_memory_requirements_khr)(
            context.device().handle(),
            session,
            &mut memory_requirements_count,
            memory_requirements.as_mut_ptr(),
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(FrameForgeError::MemoryAllocation(format!("{:?}", result)));
    }

    // Allocate and bind memory for each requirement.
    let mut session_memory = Vec::new();
    let mut bind_infos = Vec::new();

    for req in &memory_requirements {
        let memory_type_index = context
            .find_memory_type(
                req.memory_requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                context.find_memory_type(
                    req.memory_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                )
            })
            .ok_or_else(|| {
                FrameForgeError::MemoryAllocation(format!(
                    "No suitable memory type for video session (type_bits: 0x{:x})",
                    req.memory_requirements.memory_type_bits
                ))
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(req.memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { context.device().allocate_memory(&alloc_info, None) }
            .map_err(|e| FrameForgeError::MemoryAllocation(e.to_string()))?;

        bind_infos.push(
            vk::BindVideoSessionMemoryInfoKHR::default()
                .memory_bind_index(req.memory_bind_index)
                .memory(memory)
                .memory_offset(0)
                .memory_size(req.memory_requirements.size),
        );

        session_memory.push(memory);
    }

    // Bind all memory to the session.
    let result = unsafe {
        (video_queue_fn.fp().bind_video_session_memory_khr)(
            context.device().handle(),
            session,
            bind_infos.len() as u32,
            bind_infos.as_ptr(),
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(FrameForgeError::MemoryAllocation(format!("{:?}", result)));
    }

    Ok(session_memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_image_formats() {
        assert_eq!(
            get_decode_image_format(ChromaFormat::Yuv420, BitDepth::Eight).unwrap(),
            vk::Format::G8_B8R8_2PLANE_420_UNORM
        );
        assert_eq!(
            get_decode_image_format(ChromaFormat::Yuv420, BitDepth::Ten).unwrap(),
            vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
        );
    }

    #[test]
    fn test_unsupported_decode_image_format() {
        assert!(matches!(
            get_decode_image_format(ChromaFormat::Yuv422, BitDepth::Eight),
            Err(FrameForgeError::FormatUnsupported(_))
        ));
    }

    #[test]
    fn test_distinct_output_detection() {
        let caps = DecodeCapabilities {
            max_coded_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_dpb_slots: 16,
            max_active_references: 15,
            min_bitstream_buffer_offset_alignment: 256,
            min_bitstream_buffer_size_alignment: 256,
            flags: vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_DISTINCT,
        };
        assert!(caps.requires_distinct_output());

        let coincide = DecodeCapabilities {
            flags: vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE,
            ..caps
        };
        assert!(!coincide.requires_distinct_output());
    }
}
