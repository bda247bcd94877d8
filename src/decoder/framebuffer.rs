//! Interface to the external frame-buffer / reference-picture store.
//!
//! The frame buffer owns the decoded output and reference images, performs
//! cross-picture synchronization and image layout transitions, and produces
//! the per-picture completion signals the decoder gates resource reuse on.
//! This crate consumes it purely through this trait; the implementation
//! lives with the presentation side.

use crate::decoder::VideoFormat;
use crate::error::Result;
use ash::vk;

/// Per-picture completion synchronization handles.
///
/// The decoder signals these as part of its submission so downstream
/// consumers (presentation, linear copy) order correctly after hardware
/// decode finishes, and waits on the fence before reusing the picture's
/// slot and bitstream buffer. Null handles mean the corresponding signal is
/// not used for this picture.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSynchronizationInfo {
    /// Signalled by the decode submission once the hardware completes.
    pub frame_complete_fence: vk::Fence,
    /// Signalled alongside the fence, for queue-to-queue ordering.
    pub frame_complete_semaphore: vk::Semaphore,
    /// Signalled by the downstream consumer once it is done reading the
    /// picture; gates handing the image back out as a decode target.
    pub frame_consumer_done_fence: vk::Fence,
    /// Semaphore counterpart of the consumer-done fence.
    pub frame_consumer_done_semaphore: vk::Semaphore,
}

/// A decode target or output image owned by the frame buffer.
#[derive(Debug, Clone, Copy)]
pub struct PictureResource {
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    /// Layer within an image array, 0 for discrete images.
    pub base_array_layer: u32,
    /// The image's current layout, maintained by the frame buffer.
    pub current_layout: vk::ImageLayout,
}

/// The frame-buffer/reference-picture collaborator consumed by the decoder.
pub trait VideoFrameBuffer: Send {
    /// (Re)create the decode images for a new sequence.
    ///
    /// Returns the number of images actually created, which may be less
    /// than requested when device limits are lower.
    fn configure_images(
        &mut self,
        format: &VideoFormat,
        image_count: u32,
        image_usage: vk::ImageUsageFlags,
    ) -> Result<u32>;

    /// Reserve a picture index for an imminent decode submission and hand
    /// back its completion synchronization handles.
    fn reserve_picture(&mut self, picture_index: u32) -> Result<FrameSynchronizationInfo>;

    /// The optimal-layout decode target for a picture index.
    fn picture_resource(&self, picture_index: u32) -> Result<PictureResource>;

    /// The linearly addressable output image for a picture index, when the
    /// decoder was configured for linear output.
    fn linear_resource(&self, picture_index: u32) -> Result<PictureResource>;

    /// Block until the completion signals of every outstanding picture have
    /// been observed. Used by the decoder's sequence-reset path before
    /// tearing down the session and pools.
    fn wait_idle(&mut self) -> Result<()>;
}
