//! Decode session orchestrator.
//!
//! Owns the hardware decode session and is the sole entry point for
//! starting a sequence and submitting pictures. The hot path
//! ([`VideoDecoder::decode_picture_with_parameters`]) claims a free decode
//! slot, records the decode commands against the currently active parameter
//! set, and submits to the hardware decode queue without ever blocking on
//! completion - the frame-buffer collaborator observes the per-picture
//! fence out-of-band and feeds the release path back in through
//! [`VideoDecoder::observe_completion`].
//!
//! Note: Vulkan p_next chaining requires creating default structs and then assigning p_next,
//! which triggers clippy::field_reassign_with_default. This is the correct pattern for Vulkan.
#![allow(clippy::field_reassign_with_default)]

use crate::decoder::bitstream::BitstreamBuffer;
use crate::decoder::framebuffer::{PictureResource, VideoFrameBuffer};
use crate::decoder::output::{OutputPathSelector, OutputRoute};
use crate::decoder::params::{ParameterSetCache, ParameterUpdate, PictureParameterSet};
use crate::decoder::pool::RefCountedPool;
use crate::decoder::session::{query_decode_capabilities, DecodeSession};
use crate::decoder::slots::{DecodeFrameData, InFlightTracker};
use crate::decoder::{
    ChromaFormat, DecoderConfig, VideoFormat, BITSTREAM_POOL_CAPACITY, MAX_RENDER_TARGETS,
};
use crate::error::{FrameForgeError, Result};
use crate::vulkan::VideoContext;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Starting size for bitstream buffers when no larger request has been
/// seen yet (a 1080p picture rarely exceeds this compressed).
const DEFAULT_BITSTREAM_BUFFER_SIZE: usize = 2 << 20;

/// Round `value` up to the next multiple of `alignment` (a power of two).
fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Both alignments must be nonzero powers of two; two powers of two are
/// always jointly satisfiable by rounding up to each.
fn validate_alignments(offset_alignment: usize, size_alignment: usize) -> Result<()> {
    let ok = |a: usize| a != 0 && a.is_power_of_two();
    if ok(offset_alignment) && ok(size_alignment) {
        Ok(())
    } else {
        Err(FrameForgeError::AlignmentUnsatisfiable {
            offset_alignment,
            size_alignment,
        })
    }
}

/// Clamp the requested in-flight depth to what the hardware can address.
fn negotiate_in_flight_depth(requested: u32, min_required: u32, max_dpb_slots: u32) -> u32 {
    requested
        .max(min_required)
        .min(max_dpb_slots)
        .min(MAX_RENDER_TARGETS)
        .max(1)
}

/// Per-plane copy extents for the linear output path (2-plane YCbCr
/// formats only). Validated before any commands are recorded so a
/// rejection degrades to optimal-only output.
fn linear_plane_extents(format: &VideoFormat) -> Result<(vk::Extent3D, vk::Extent3D)> {
    let luma = vk::Extent3D {
        width: format.coded_width,
        height: format.coded_height,
        depth: 1,
    };
    let chroma = match format.chroma_format {
        ChromaFormat::Yuv420 => vk::Extent3D {
            width: format.coded_width / 2,
            height: format.coded_height / 2,
            depth: 1,
        },
        ChromaFormat::Yuv444 => luma,
        _ => {
            return Err(FrameForgeError::CopyFailed(format!(
                "Linear output is not supported for {:?}",
                format.chroma_format
            )))
        }
    };
    Ok((luma, chroma))
}

/// The picture-resource binding for a decode target or reference image.
fn picture_resource_info(
    resource: &PictureResource,
    coded_extent: vk::Extent2D,
) -> vk::VideoPictureResourceInfoKHR<'static> {
    vk::VideoPictureResourceInfoKHR::default()
        .coded_offset(vk::Offset2D { x: 0, y: 0 })
        .coded_extent(coded_extent)
        .base_array_layer(resource.base_array_layer)
        .image_view_binding(resource.image_view)
}

/// A DPB slot binding for the video coding scope.
fn reference_slot_info<'a>(
    slot_index: i32,
    resource: &'a vk::VideoPictureResourceInfoKHR,
) -> vk::VideoReferenceSlotInfoKHR<'a> {
    vk::VideoReferenceSlotInfoKHR::default()
        .slot_index(slot_index)
        .picture_resource(resource)
}

/// A reference picture an inter-coded picture predicts from.
#[derive(Debug, Clone, Copy)]
pub struct DecodeReference {
    /// DPB slot index the reference occupies in the active session.
    pub slot_index: i32,
    /// Frame-buffer picture index holding the reference picture.
    pub picture_index: u32,
}

/// Per-picture decode parameters produced by the parser.
pub struct PerFrameDecodeParameters {
    /// Decode target / DPB slot index for this picture, in
    /// `[0, accepted in-flight depth)`.
    pub picture_index: u32,
    /// Buffer holding the picture's compressed data, previously obtained
    /// from [`VideoDecoderHandler::get_bitstream_buffer`].
    pub bitstream_buffer: Arc<BitstreamBuffer>,
    /// Byte offset of the picture's data within the buffer.
    pub bitstream_data_offset: vk::DeviceSize,
    /// Byte length of the picture's data (already size-aligned).
    pub bitstream_data_size: vk::DeviceSize,
    /// Reference pictures this picture predicts from; empty for intra
    /// pictures.
    pub references: Vec<DecodeReference>,
}

/// Display metadata accompanying a picture submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodePictureInfo {
    pub display_width: u32,
    pub display_height: u32,
    pub timestamp: i64,
    /// Whether the picture is held as a reference for later pictures.
    pub is_reference: bool,
}

/// A bitstream buffer handed out to the parser, with its aligned placement.
pub struct BitstreamBufferAllocation {
    pub buffer: Arc<BitstreamBuffer>,
    /// Offset at which the parser should place picture data; a multiple of
    /// the requested offset alignment.
    pub offset: usize,
    /// Usable size; a multiple of the requested size alignment.
    pub size: usize,
}

/// The parser-facing capability interface: the entire boundary a
/// parser-side driver needs.
pub trait VideoDecoderHandler {
    /// Called when decoding of a sequence starts and the format is known.
    /// Returns the accepted in-flight depth.
    fn start_video_sequence(&mut self, format: &VideoFormat) -> Result<u32>;

    /// Called whenever stream metadata changes.
    fn update_picture_parameters(
        &mut self,
        set: Arc<PictureParameterSet>,
    ) -> Result<ParameterUpdate>;

    /// Called when a picture is ready to be decoded. Returns the picture's
    /// decode order count.
    fn decode_picture_with_parameters(
        &mut self,
        pic_params: PerFrameDecodeParameters,
        picture_info: &DecodePictureInfo,
    ) -> Result<i32>;

    /// Obtain a bitstream buffer of at least `size` bytes honoring the
    /// given offset and size alignments, optionally pre-filled with
    /// `initial_bytes`.
    fn get_bitstream_buffer(
        &mut self,
        size: usize,
        offset_alignment: usize,
        size_alignment: usize,
        initial_bytes: Option<&[u8]>,
    ) -> Result<BitstreamBufferAllocation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Uninitialized,
    SequenceActive,
}

/// Per-slot resources pinned for the duration of one in-flight picture.
struct SlotPins {
    bitstream_buffer: Option<Arc<BitstreamBuffer>>,
    parameter_sequence: Option<u64>,
}

/// Hardware-accelerated video decoder on the GPU's dedicated decode queue.
///
/// Not internally thread-safe: a single submitting thread drives the four
/// handler operations, while [`VideoDecoder::observe_completion`] is the
/// only entry that may be invoked from the completion-notification context.
pub struct VideoDecoder {
    context: VideoContext,
    config: DecoderConfig,
    video_queue_index: u32,
    video_queue_fn: ash::khr::video_queue::Device,
    video_decode_fn: ash::khr::video_decode_queue::Device,
    state: DecoderState,
    session: Option<DecodeSession>,
    frame_buffer: Box<dyn VideoFrameBuffer>,
    frames_data: DecodeFrameData,
    in_flight: Arc<InFlightTracker>,
    slot_pins: Vec<std::sync::Mutex<SlotPins>>,
    bitstream_pool: RefCountedPool<BitstreamBuffer>,
    parameter_cache: ParameterSetCache,
    output_path: OutputPathSelector,
    accepted_in_flight: u32,
    decode_pic_count: i32,
    max_stream_buffer_size: usize,
    /// First submission after (re)creating the session must reset the
    /// hardware coding state.
    pending_session_reset: bool,
    /// Latest linear-copy degradation, reported out-of-band: the decode it
    /// belongs to still completed through the optimal path.
    last_copy_error: Option<FrameForgeError>,
}

impl VideoDecoder {
    /// Create a decoder bound to the device's video decode queue.
    pub fn new(
        context: VideoContext,
        frame_buffer: Box<dyn VideoFrameBuffer>,
        config: DecoderConfig,
    ) -> Result<Self> {
        let num_queues = context.video_decode_num_queues() as u32;
        let video_queue_index = if config.video_queue_index < 0 {
            context.video_decode_default_queue_index()
        } else {
            // Wrap requested index modulo the available decode queues.
            config.video_queue_index as u32 % num_queues.max(1)
        };

        let video_queue_fn =
            ash::khr::video_queue::Device::new(context.instance(), context.device());
        let video_decode_fn =
            ash::khr::video_decode_queue::Device::new(context.instance(), context.device());

        let output_path =
            OutputPathSelector::new(config.use_separate_output_images, config.use_linear_output);

        Ok(Self {
            frames_data: DecodeFrameData::new(context.clone()),
            context,
            video_queue_index,
            video_queue_fn,
            video_decode_fn,
            state: DecoderState::Uninitialized,
            session: None,
            frame_buffer,
            in_flight: Arc::new(InFlightTracker::new(0)),
            slot_pins: Vec::new(),
            bitstream_pool: RefCountedPool::new(BITSTREAM_POOL_CAPACITY),
            parameter_cache: ParameterSetCache::new(),
            output_path,
            accepted_in_flight: 0,
            decode_pic_count: 0,
            max_stream_buffer_size: 0,
            pending_session_reset: true,
            last_copy_error: None,
            config,
        })
    }

    /// Number of pictures decoded since the decoder was created.
    pub fn decode_pic_count(&self) -> i32 {
        self.decode_pic_count
    }

    /// Number of pictures currently submitted but not completed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.in_flight_count()
    }

    /// The negotiated in-flight depth of the active sequence.
    pub fn accepted_in_flight_depth(&self) -> u32 {
        self.accepted_in_flight
    }

    /// Take the most recent linear-copy failure, if any.
    ///
    /// A copy failure never fails the decode that triggered it; the picture
    /// is still produced through the optimal path and this channel carries
    /// the degradation to the caller.
    pub fn take_copy_error(&mut self) -> Option<FrameForgeError> {
        self.last_copy_error.take()
    }

    /// Release path, invoked by the frame-buffer collaborator once a
    /// picture's completion fence has signalled.
    ///
    /// Returns the slot and its pinned bitstream buffer to their pools and
    /// retires the picture's parameter-set reference, which may activate a
    /// deferred parameter update.
    pub fn observe_completion(&mut self, slot: usize) -> Result<()> {
        if slot >= self.slot_pins.len() {
            return Err(FrameForgeError::InvalidInput(format!(
                "Completion observed for slot {} out of range ({} slots)",
                slot,
                self.slot_pins.len()
            )));
        }
        if !self.in_flight.in_use(slot) {
            return Err(FrameForgeError::InvalidInput(format!(
                "Completion observed for slot {} with no picture in flight",
                slot
            )));
        }

        let retired_sequence = {
            let mut pins = self.slot_pins[slot].lock().unwrap();
            pins.bitstream_buffer = None;
            pins.parameter_sequence.take()
        };

        if let Some(sequence) = retired_sequence {
            let before = self
                .parameter_cache
                .current()
                .map(|s| s.update_sequence());
            self.parameter_cache.retire(sequence);
            let after = self
                .parameter_cache
                .current()
                .map(|s| s.update_sequence());
            // A deferred set became active; bind it to the session.
            if before != after {
                if let (Some(session), Some(current)) =
                    (self.session.as_mut(), self.parameter_cache.current())
                {
                    session.bind_parameters(current)?;
                }
            }
        }

        self.in_flight.release(slot);
        Ok(())
    }

    /// Tear down the session, slot table, and pools after draining all
    /// in-flight pictures. Blocks until the collaborator has observed every
    /// outstanding completion signal.
    fn reset_sequence(&mut self) -> Result<()> {
        info!("Resetting decode sequence");
        self.frame_buffer.wait_idle()?;

        // Drain release bookkeeping for anything the collaborator finished
        // while we were blocking.
        for slot in 0..self.in_flight.len() {
            if self.in_flight.in_use(slot) {
                self.observe_completion(slot)?;
            }
        }

        self.parameter_cache.reset();
        self.session = None;
        self.frames_data.deinit();
        self.in_flight = Arc::new(InFlightTracker::new(0));
        self.slot_pins.clear();
        self.bitstream_pool = RefCountedPool::new(BITSTREAM_POOL_CAPACITY);
        self.pending_session_reset = true;
        self.state = DecoderState::Uninitialized;
        Ok(())
    }

    fn decode_image_usage(&self) -> vk::ImageUsageFlags {
        let mut usage =
            vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR | vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR;
        if self.output_path.separate_output_images() {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        usage
    }

    /// Record the optimal-to-linear image copy for a picture, gated on the
    /// decode having finished within the same submission.
    ///
    /// Inputs are validated before recording starts; by the time this runs
    /// the copy cannot fail, so the command buffer never ends up half
    /// recorded.
    fn record_linear_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &PictureResource,
        dst: &PictureResource,
        luma_extent: vk::Extent3D,
        chroma_extent: vk::Extent3D,
    ) {
        let device = self.context.device();
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: src.base_array_layer,
            layer_count: 1,
        };

        // Wait for the decode write, then move both images into transfer
        // layouts.
        let src_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::VIDEO_DECODE_DST_KHR)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(src.image)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ);

        let dst_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(dst.current_layout)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(vk::ImageSubresourceRange {
                base_array_layer: dst.base_array_layer,
                ..subresource_range
            })
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[src_barrier, dst_barrier],
            );
        }

        // Per-plane copy (2-plane YCbCr formats).
        let plane_region = |aspect: vk::ImageAspectFlags, extent: vk::Extent3D| vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: src.base_array_layer,
                layer_count: 1,
            },
            src_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: dst.base_array_layer,
                layer_count: 1,
            },
            dst_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            extent,
        };

        let regions = [
            plane_region(vk::ImageAspectFlags::PLANE_0, luma_extent),
            plane_region(vk::ImageAspectFlags::PLANE_1, chroma_extent),
        ];

        unsafe {
            device.cmd_copy_image(
                command_buffer,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }

        // Make the linear image readable by external consumers and return
        // the decode target to its decode layout.
        let src_back = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::VIDEO_DECODE_DST_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(src.image)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);

        let dst_done = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(vk::ImageSubresourceRange {
                base_array_layer: dst.base_array_layer,
                ..subresource_range
            })
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ);

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[src_back, dst_done],
            );
        }
    }
}

impl VideoDecoderHandler for VideoDecoder {
    fn start_video_sequence(&mut self, format: &VideoFormat) -> Result<u32> {
        if !self.context.supports_decode(format.codec) {
            return Err(FrameForgeError::FormatUnsupported(format!(
                "Device does not decode {}",
                format.codec.name()
            )));
        }

        info!(
            "Video sequence: {} {}x{} ({}, {:?} luma), display {}x{}",
            format.codec.name(),
            format.coded_width,
            format.coded_height,
            format.chroma_format.name(),
            format.bit_depth_luma,
            format.display_rect.width(),
            format.display_rect.height()
        );

        // An existing compatible session is reused untouched: slot identity
        // is preserved and a repeated start with the same format is a no-op.
        match self.session.as_ref().map(|s| s.is_compatible(format)) {
            Some(true) => {
                debug!("Reusing existing decode session");
                return Ok(self.accepted_in_flight);
            }
            Some(false) => {
                // Incompatible format change: the only teardown path. Blocks
                // until every submitted picture's completion has been
                // observed.
                self.reset_sequence()?;
            }
            None => {}
        }

        let capabilities = query_decode_capabilities(&self.context, format)?;

        let accepted = negotiate_in_flight_depth(
            self.config.num_decode_images_in_flight,
            format.min_num_decode_surfaces,
            capabilities.max_dpb_slots,
        );
        if accepted < self.config.num_decode_images_in_flight {
            warn!(
                "In-flight depth clamped from {} to {} by device limits",
                self.config.num_decode_images_in_flight, accepted
            );
        }

        let image_count = if self.config.num_decode_images_to_preallocate < 0 {
            accepted
        } else {
            (self.config.num_decode_images_to_preallocate as u32).min(accepted)
        };

        let session = DecodeSession::create(
            self.context.clone(),
            *format,
            capabilities,
            accepted,
        )?;

        let slot_count = self
            .frames_data
            .resize(accepted as usize, self.context.video_decode_queue_family())?;

        self.frame_buffer
            .configure_images(format, image_count, self.decode_image_usage())?;

        // Preallocate bitstream buffers sized to the largest request seen
        // so far, or a sensible floor before any request.
        let buffer_size = self
            .max_stream_buffer_size
            .max(DEFAULT_BITSTREAM_BUFFER_SIZE);
        let context = self.context.clone();
        let fmt = *format;
        self.bitstream_pool.preallocate(
            self.config.num_bitstream_buffers_to_preallocate as usize,
            buffer_size,
            |size| BitstreamBuffer::new(context.clone(), fmt, size),
        )?;

        self.session = Some(session);
        self.in_flight = Arc::new(InFlightTracker::new(slot_count));
        self.slot_pins = (0..slot_count)
            .map(|_| {
                std::sync::Mutex::new(SlotPins {
                    bitstream_buffer: None,
                    parameter_sequence: None,
                })
            })
            .collect();
        self.accepted_in_flight = slot_count as u32;
        self.pending_session_reset = true;
        self.state = DecoderState::SequenceActive;

        // A parameter set registered before sequence start binds now.
        if let Some(current) = self.parameter_cache.current() {
            let current = Arc::clone(current);
            if let Some(session) = self.session.as_mut() {
                session.bind_parameters(&current)?;
            }
        }

        Ok(self.accepted_in_flight)
    }

    fn update_picture_parameters(
        &mut self,
        set: Arc<PictureParameterSet>,
    ) -> Result<ParameterUpdate> {
        let outcome = self.parameter_cache.update(set);
        if outcome == ParameterUpdate::Active {
            if let (Some(session), Some(current)) =
                (self.session.as_mut(), self.parameter_cache.current())
            {
                session.bind_parameters(current)?;
            }
        }
        Ok(outcome)
    }

    fn decode_picture_with_parameters(
        &mut self,
        pic_params: PerFrameDecodeParameters,
        picture_info: &DecodePictureInfo,
    ) -> Result<i32> {
        if self.state != DecoderState::SequenceActive {
            return Err(FrameForgeError::InvalidInput(
                "decode_picture_with_parameters called with no active sequence".to_string(),
            ));
        }

        // Claim a free slot; all slots busy is the caller-visible
        // backpressure signal that the configured in-flight depth is
        // insufficient for the submission rate.
        let slot = self
            .in_flight
            .claim()
            .ok_or(FrameForgeError::NoFreeSlot(self.in_flight.len()))?;

        let result = self.record_and_submit(slot, &pic_params, picture_info);
        match result {
            Ok(count) => Ok(count),
            Err(e) => {
                // Unpin whatever was pinned before the failure.
                let sequence = {
                    let mut pins = self.slot_pins[slot].lock().unwrap();
                    pins.bitstream_buffer = None;
                    pins.parameter_sequence.take()
                };
                if let Some(sequence) = sequence {
                    self.parameter_cache.retire(sequence);
                }
                self.in_flight.release(slot);
                if matches!(e, FrameForgeError::Vulkan(_)) {
                    // A queue that rejects commands invalidates the hardware
                    // coding state; the next submission resets it.
                    warn!("Decode submission failed; forcing coding-state reset");
                    self.pending_session_reset = true;
                }
                Err(e)
            }
        }
    }

    fn get_bitstream_buffer(
        &mut self,
        size: usize,
        offset_alignment: usize,
        size_alignment: usize,
        initial_bytes: Option<&[u8]>,
    ) -> Result<BitstreamBufferAllocation> {
        validate_alignments(offset_alignment, size_alignment)?;

        let aligned_size = align_up(size, size_alignment);
        if aligned_size > self.max_stream_buffer_size {
            self.max_stream_buffer_size = aligned_size;
        }

        let format = self.session.as_ref().map(|s| *s.format()).ok_or_else(|| {
            FrameForgeError::InvalidInput(
                "get_bitstream_buffer called before a sequence was started".to_string(),
            )
        })?;

        let context = self.context.clone();
        let buffer = self
            .bitstream_pool
            .acquire(aligned_size, |size| {
                BitstreamBuffer::new(context.clone(), format, size)
            })
            .map_err(|e| match e {
                // Backpressure propagates typed; real allocation failures
                // are rewrapped for the caller.
                FrameForgeError::PoolExhausted(_) => e,
                other => FrameForgeError::AllocationFailed(other.to_string()),
            })?;

        // Buffers start at offset 0, which satisfies any power-of-two
        // offset alignment.
        if let Some(bytes) = initial_bytes {
            buffer.write(0, bytes)?;
        }

        Ok(BitstreamBufferAllocation {
            buffer,
            offset: 0,
            size: aligned_size,
        })
    }
}

impl VideoDecoder {
    fn record_and_submit(
        &mut self,
        slot: usize,
        pic_params: &PerFrameDecodeParameters,
        picture_info: &DecodePictureInfo,
    ) -> Result<i32> {
        let session = self.session.as_ref().ok_or_else(|| {
            FrameForgeError::InvalidInput("no decode session".to_string())
        })?;
        if session.parameters() == vk::VideoSessionParametersKHR::null() {
            return Err(FrameForgeError::InvalidInput(
                "no active picture parameter set".to_string(),
            ));
        }

        // Pin the active parameter set so a concurrent update cannot alter
        // this picture's recorded parameters.
        let pinned_set = self.parameter_cache.pin_current().ok_or_else(|| {
            FrameForgeError::InvalidInput("no active picture parameter set".to_string())
        })?;

        let frame_slot = self.frames_data.slot(slot).ok_or_else(|| {
            FrameForgeError::InvalidInput(format!("slot {} out of range", slot))
        })?;

        let sync_info = self.frame_buffer.reserve_picture(pic_params.picture_index)?;
        let dst = self.frame_buffer.picture_resource(pic_params.picture_index)?;

        // Resolve every reference picture before recording starts; a
        // missing reference rejects the picture with nothing recorded.
        let reference_pictures = pic_params
            .references
            .iter()
            .map(|r| Ok((r.slot_index, self.frame_buffer.picture_resource(r.picture_index)?)))
            .collect::<Result<Vec<(i32, PictureResource)>>>()?;

        debug!(
            "Decoding picture {} (slot {}, target {}, {} bytes, ts {})",
            self.decode_pic_count,
            slot,
            pic_params.picture_index,
            pic_params.bitstream_data_size,
            picture_info.timestamp
        );

        let device = self.context.device();
        let command_buffer = frame_slot.command_buffer;
        let format = *session.format();

        // Resolve the linear copy target before recording. A failure here
        // degrades to optimal-only output for this picture - the decode
        // itself proceeds - and is reported through the copy-error channel.
        let linear_copy = if self.output_path.route() == OutputRoute::Linear {
            let prepared = linear_plane_extents(&format).and_then(|(luma, chroma)| {
                let linear = self.frame_buffer.linear_resource(pic_params.picture_index)?;
                Ok((linear, luma, chroma))
            });
            match prepared {
                Ok(prepared) => Some(prepared),
                Err(e) => {
                    let e = match e {
                        FrameForgeError::CopyFailed(_) => e,
                        other => FrameForgeError::CopyFailed(other.to_string()),
                    };
                    warn!(
                        "Linear output unavailable for picture {}: {}",
                        pic_params.picture_index, e
                    );
                    self.last_copy_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| FrameForgeError::CommandBuffer(e.to_string()))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(|e| FrameForgeError::CommandBuffer(e.to_string()))?;
        }

        let coded_extent = vk::Extent2D {
            width: format.coded_width,
            height: format.coded_height,
        };

        let dst_picture_resource = picture_resource_info(&dst, coded_extent);

        let setup_reference_slot =
            reference_slot_info(pic_params.picture_index as i32, &dst_picture_resource);

        let reference_resources: Vec<vk::VideoPictureResourceInfoKHR> = reference_pictures
            .iter()
            .map(|(_, resource)| picture_resource_info(resource, coded_extent))
            .collect();
        let reference_slots: Vec<vk::VideoReferenceSlotInfoKHR> = reference_pictures
            .iter()
            .zip(&reference_resources)
            .map(|((slot_index, _), resource)| reference_slot_info(*slot_index, resource))
            .collect();

        // Begin-coding binds the session, the referenced DPB slots, and the
        // slot this picture sets up.
        let mut bound_slots = reference_slots.clone();
        bound_slots.push(setup_reference_slot);
        let begin_coding_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(session.handle())
            .video_session_parameters(session.parameters())
            .reference_slots(&bound_slots);

        unsafe {
            (self.video_queue_fn.fp().cmd_begin_video_coding_khr)(
                command_buffer,
                &begin_coding_info,
            );
        }

        if self.pending_session_reset {
            let control_info = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::RESET);
            unsafe {
                (self.video_queue_fn.fp().cmd_control_video_coding_khr)(
                    command_buffer,
                    &control_info,
                );
            }
            self.pending_session_reset = false;
        }

        let decode_info = vk::VideoDecodeInfoKHR::default()
            .src_buffer(pic_params.bitstream_buffer.buffer())
            .src_buffer_offset(pic_params.bitstream_data_offset)
            .src_buffer_range(pic_params.bitstream_data_size)
            .dst_picture_resource(dst_picture_resource)
            .setup_reference_slot(&setup_reference_slot)
            .reference_slots(&reference_slots);

        unsafe {
            (self.video_decode_fn.fp().cmd_decode_video_khr)(command_buffer, &decode_info);
            let end_coding_info = vk::VideoEndCodingInfoKHR::default();
            (self.video_queue_fn.fp().cmd_end_video_coding_khr)(command_buffer, &end_coding_info);
        }

        // Linear output rides in the same submission, ordered after the
        // decode by the recorded barriers.
        if let Some((linear, luma, chroma)) = linear_copy {
            self.record_linear_copy(command_buffer, &dst, &linear, luma, chroma);
        }

        unsafe {
            device
                .end_command_buffer(command_buffer)
                .map_err(|e| FrameForgeError::CommandBuffer(e.to_string()))?;
        }

        // Submit, signalling the picture's completion handles. The call
        // returns once submitted - completion is observed out-of-band.
        let command_buffers = [command_buffer];
        let signal_semaphores: Vec<vk::Semaphore> =
            if sync_info.frame_complete_semaphore != vk::Semaphore::null() {
                vec![sync_info.frame_complete_semaphore]
            } else {
                Vec::new()
            };
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = self.context.video_decode_queue(self.video_queue_index);
        unsafe {
            device.queue_submit(queue, &[submit_info], sync_info.frame_complete_fence)?;
        }

        // Pin the buffer and parameter set until completion is observed.
        {
            let mut pins = self.slot_pins[slot].lock().unwrap();
            pins.bitstream_buffer = Some(Arc::clone(&pic_params.bitstream_buffer));
            pins.parameter_sequence = Some(pinned_set.update_sequence());
        }

        self.decode_pic_count += 1;
        Ok(self.decode_pic_count - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod alignment_tests {
        use super::*;

        #[test]
        fn test_align_up() {
            assert_eq!(align_up(100, 16), 112);
            assert_eq!(align_up(112, 16), 112);
            assert_eq!(align_up(1, 256), 256);
            assert_eq!(align_up(0, 16), 0);
        }

        #[test]
        fn test_requested_size_rounds_to_size_alignment() {
            // size=100, sizeAlign=16 -> next multiple of 16 >= 100 is 112.
            let size = align_up(100, 16);
            assert_eq!(size, 112);
            assert_eq!(size % 16, 0);
            // Buffers are placed at offset 0, a multiple of any alignment.
            assert_eq!(0 % 32, 0);
        }

        #[test]
        fn test_valid_alignments_accepted() {
            assert!(validate_alignments(32, 16).is_ok());
            assert!(validate_alignments(1, 1).is_ok());
            assert!(validate_alignments(256, 256).is_ok());
        }

        #[test]
        fn test_zero_alignment_rejected() {
            assert!(matches!(
                validate_alignments(0, 16),
                Err(FrameForgeError::AlignmentUnsatisfiable { .. })
            ));
        }

        #[test]
        fn test_non_power_of_two_alignment_rejected() {
            assert!(matches!(
                validate_alignments(32, 24),
                Err(FrameForgeError::AlignmentUnsatisfiable { .. })
            ));
        }
    }

    mod linear_copy_tests {
        use super::*;
        use crate::decoder::Codec;

        #[test]
        fn test_yuv420_chroma_plane_is_quarter_size() {
            let format = VideoFormat::new(Codec::H264, 1920, 1080);
            let (luma, chroma) = linear_plane_extents(&format).unwrap();
            assert_eq!((luma.width, luma.height), (1920, 1080));
            assert_eq!((chroma.width, chroma.height), (960, 540));
        }

        #[test]
        fn test_yuv444_chroma_plane_is_full_size() {
            let mut format = VideoFormat::new(Codec::H265, 1280, 720);
            format.chroma_format = ChromaFormat::Yuv444;
            let (luma, chroma) = linear_plane_extents(&format).unwrap();
            assert_eq!((chroma.width, chroma.height), (luma.width, luma.height));
        }

        #[test]
        fn test_unsupported_chroma_degrades_with_copy_failed() {
            // The rejection happens before any commands are recorded, so
            // the decode can still proceed through the optimal path.
            for chroma in [ChromaFormat::Yuv422, ChromaFormat::Monochrome] {
                let mut format = VideoFormat::new(Codec::H264, 1920, 1080);
                format.chroma_format = chroma;
                assert!(matches!(
                    linear_plane_extents(&format),
                    Err(FrameForgeError::CopyFailed(_))
                ));
            }
        }
    }

    mod reference_slot_tests {
        use super::*;

        fn resource(layer: u32) -> PictureResource {
            PictureResource {
                image: vk::Image::null(),
                image_view: vk::ImageView::null(),
                base_array_layer: layer,
                current_layout: vk::ImageLayout::UNDEFINED,
            }
        }

        #[test]
        fn test_picture_resource_info_carries_binding() {
            let extent = vk::Extent2D {
                width: 1920,
                height: 1080,
            };
            let info = picture_resource_info(&resource(3), extent);
            assert_eq!(info.coded_extent.width, 1920);
            assert_eq!(info.coded_extent.height, 1080);
            assert_eq!(info.base_array_layer, 3);
        }

        #[test]
        fn test_reference_slot_binds_resource() {
            let extent = vk::Extent2D {
                width: 640,
                height: 480,
            };
            let info = picture_resource_info(&resource(0), extent);
            let slot = reference_slot_info(5, &info);
            assert_eq!(slot.slot_index, 5);
            assert!(!slot.p_picture_resource.is_null());
        }

        #[test]
        fn test_reference_list_preserves_slot_indexes() {
            // Inter-coded pictures bind every referenced DPB slot; the
            // slot indexes come straight from the parser's reference list.
            let extent = vk::Extent2D {
                width: 1920,
                height: 1080,
            };
            let references = [(2_i32, resource(2)), (7_i32, resource(7))];
            let resources: Vec<vk::VideoPictureResourceInfoKHR> = references
                .iter()
                .map(|(_, r)| picture_resource_info(r, extent))
                .collect();
            let slots: Vec<vk::VideoReferenceSlotInfoKHR> = references
                .iter()
                .zip(&resources)
                .map(|((idx, _), r)| reference_slot_info(*idx, r))
                .collect();
            assert_eq!(slots.len(), 2);
            assert_eq!(slots[0].slot_index, 2);
            assert_eq!(slots[1].slot_index, 7);
            assert!(slots.iter().all(|s| !s.p_picture_resource.is_null()));
        }
    }

    mod depth_negotiation_tests {
        use super::*;

        #[test]
        fn test_requested_depth_accepted_within_limits() {
            assert_eq!(negotiate_in_flight_depth(8, 1, 16), 8);
        }

        #[test]
        fn test_depth_clamped_to_dpb_slots() {
            assert_eq!(negotiate_in_flight_depth(8, 1, 4), 4);
        }

        #[test]
        fn test_depth_raised_to_stream_minimum() {
            assert_eq!(negotiate_in_flight_depth(2, 6, 16), 6);
        }

        #[test]
        fn test_depth_capped_at_max_render_targets() {
            assert_eq!(negotiate_in_flight_depth(64, 1, 64), MAX_RENDER_TARGETS);
        }

        #[test]
        fn test_depth_never_zero() {
            assert_eq!(negotiate_in_flight_depth(0, 0, 16), 1);
        }
    }
}
