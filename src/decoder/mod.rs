//! Decoder types, configuration, and shared utilities.
//!
//! This module provides:
//! - Core decoder types (`Codec`, `ChromaFormat`, `BitDepth`, `VideoFormat`).
//! - The decoder configuration record (`DecoderConfig`).
//! - The submodules implementing the decode pipeline: the bounded bitstream
//!   buffer pool (`pool`), the per-picture decode slot table (`slots`), the
//!   picture parameter set cache (`params`), the hardware session wrapper
//!   (`session`), the frame-buffer collaborator interface (`framebuffer`),
//!   the output path policy (`output`), and the orchestrator (`decode`).

pub mod bitstream;
pub mod decode;
pub mod framebuffer;
pub mod output;
pub mod params;
pub mod pool;
pub mod session;
pub mod slots;

use ash::vk;

// Default decoder configuration constants.

/// Default number of pictures that may be submitted but not yet completed.
pub const DEFAULT_DECODE_IMAGES_IN_FLIGHT: u32 = 8;

/// Default number of bitstream buffers created up front at sequence start.
pub const DEFAULT_BITSTREAM_BUFFERS_TO_PREALLOCATE: u32 = 8;

/// Fixed capacity of the bitstream buffer pool.
pub const BITSTREAM_POOL_CAPACITY: usize = 64;

/// Upper bound on decode render targets (used as a u32 bitmask of active targets).
pub const MAX_RENDER_TARGETS: u32 = 32;

/// Video codec types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// H.264/AVC codec.
    H264,
    /// H.265/HEVC codec.
    H265,
    /// AV1 codec.
    AV1,
}

impl Codec {
    /// The Vulkan decode operation for this codec.
    pub fn decode_operation(&self) -> vk::VideoCodecOperationFlagsKHR {
        match self {
            Codec::H264 => vk::VideoCodecOperationFlagsKHR::DECODE_H264,
            Codec::H265 => vk::VideoCodecOperationFlagsKHR::DECODE_H265,
            Codec::AV1 => vk::VideoCodecOperationFlagsKHR::DECODE_AV1,
        }
    }

    /// Human-readable codec name.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "AVC/H.264",
            Codec::H265 => "HEVC/H.265",
            Codec::AV1 => "AV1",
        }
    }
}

/// Chroma subsampling of the coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaFormat {
    /// Monochrome (luma only).
    Monochrome,
    /// YUV 4:2:0 (half horizontal and vertical chroma resolution).
    #[default]
    Yuv420,
    /// YUV 4:2:2 (half horizontal chroma resolution).
    Yuv422,
    /// YUV 4:4:4 (full chroma resolution).
    Yuv444,
}

impl From<ChromaFormat> for vk::VideoChromaSubsamplingFlagsKHR {
    fn from(format: ChromaFormat) -> Self {
        match format {
            ChromaFormat::Monochrome => vk::VideoChromaSubsamplingFlagsKHR::MONOCHROME,
            ChromaFormat::Yuv420 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_420,
            ChromaFormat::Yuv422 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_422,
            ChromaFormat::Yuv444 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_444,
        }
    }
}

impl ChromaFormat {
    /// Human-readable chroma format name.
    pub fn name(&self) -> &'static str {
        match self {
            ChromaFormat::Monochrome => "Monochrome",
            ChromaFormat::Yuv420 => "YCbCr 420",
            ChromaFormat::Yuv422 => "YCbCr 422",
            ChromaFormat::Yuv444 => "YCbCr 444",
        }
    }
}

/// Bit depth of the coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit per component (standard).
    #[default]
    Eight,
    /// 10-bit per component (HDR, Main10 profile).
    Ten,
    /// 12-bit per component.
    Twelve,
}

impl From<BitDepth> for vk::VideoComponentBitDepthFlagsKHR {
    fn from(depth: BitDepth) -> Self {
        match depth {
            BitDepth::Eight => vk::VideoComponentBitDepthFlagsKHR::TYPE_8,
            BitDepth::Ten => vk::VideoComponentBitDepthFlagsKHR::TYPE_10,
            BitDepth::Twelve => vk::VideoComponentBitDepthFlagsKHR::TYPE_12,
        }
    }
}

/// Display rectangle within the coded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DisplayRect {
    /// Display width in pixels.
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    /// Display height in pixels.
    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

/// Immutable snapshot of the negotiated stream format.
///
/// Derived once per sequence-start callback from the parser's detected
/// format; read by all downstream sizing decisions (slot count, buffer
/// sizing, session creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    /// Video codec of the sequence.
    pub codec: Codec,
    /// Coded picture width in pixels.
    pub coded_width: u32,
    /// Coded picture height in pixels.
    pub coded_height: u32,
    /// Visible rectangle within the coded picture.
    pub display_rect: DisplayRect,
    /// Chroma subsampling.
    pub chroma_format: ChromaFormat,
    /// Bit depth of luma samples.
    pub bit_depth_luma: BitDepth,
    /// Bit depth of chroma samples.
    pub bit_depth_chroma: BitDepth,
    /// Minimum number of decode surfaces the stream requires (DPB + display).
    pub min_num_decode_surfaces: u32,
}

impl VideoFormat {
    /// Create a format snapshot for a full-frame progressive stream.
    pub fn new(codec: Codec, coded_width: u32, coded_height: u32) -> Self {
        Self {
            codec,
            coded_width,
            coded_height,
            display_rect: DisplayRect {
                left: 0,
                top: 0,
                right: coded_width as i32,
                bottom: coded_height as i32,
            },
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: BitDepth::Eight,
            bit_depth_chroma: BitDepth::Eight,
            min_num_decode_surfaces: 1,
        }
    }

    /// Whether an existing decode session created for `other` can decode
    /// this sequence without being torn down and recreated.
    ///
    /// The session is bound to one codec profile, chroma format, bit depth,
    /// and coded resolution; any mismatch forces a reset.
    pub fn is_compatible_with(&self, other: &VideoFormat) -> bool {
        self.codec == other.codec
            && self.coded_width == other.coded_width
            && self.coded_height == other.coded_height
            && self.chroma_format == other.chroma_format
            && self.bit_depth_luma == other.bit_depth_luma
            && self.bit_depth_chroma == other.bit_depth_chroma
    }
}

/// Decoder configuration.
///
/// Immutable policy decided at decoder construction; the output-path flags
/// are never toggled after the decoder exists.
#[derive(Debug, Clone)]
#[must_use]
pub struct DecoderConfig {
    /// Index of the decode queue to submit on. A negative value selects the
    /// device's default decode queue; otherwise the index wraps modulo the
    /// number of decode queues the device offers.
    pub video_queue_index: i32,
    /// Route decoded pictures through a copy to a linearly addressable image.
    pub use_linear_output: bool,
    /// Decode into images separate from the DPB (required when the hardware
    /// reports DISTINCT output, or when linear output is requested).
    pub use_separate_output_images: bool,
    /// How many pictures may be submitted but not yet completed.
    pub num_decode_images_in_flight: u32,
    /// How many decode images to create up front. -1 preallocates the
    /// maximum feasible count.
    pub num_decode_images_to_preallocate: i32,
    /// How many bitstream buffers to create up front at sequence start.
    pub num_bitstream_buffers_to_preallocate: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderConfig {
    /// Create a decoder configuration with default settings.
    pub fn new() -> Self {
        Self {
            video_queue_index: 0,
            use_linear_output: false,
            use_separate_output_images: false,
            num_decode_images_in_flight: DEFAULT_DECODE_IMAGES_IN_FLIGHT,
            num_decode_images_to_preallocate: -1,
            num_bitstream_buffers_to_preallocate: DEFAULT_BITSTREAM_BUFFERS_TO_PREALLOCATE,
        }
    }

    /// Select the decode queue index.
    pub fn with_video_queue_index(mut self, index: i32) -> Self {
        self.video_queue_index = index;
        self
    }

    /// Enable linear output. This implies separate output images.
    pub fn with_linear_output(mut self, enable: bool) -> Self {
        self.use_linear_output = enable;
        if enable {
            self.use_separate_output_images = true;
        }
        self
    }

    /// Set the in-flight depth.
    pub fn with_images_in_flight(mut self, count: u32) -> Self {
        self.num_decode_images_in_flight = count;
        self
    }

    /// Set the decode image preallocation count (-1 for maximum).
    pub fn with_images_to_preallocate(mut self, count: i32) -> Self {
        self.num_decode_images_to_preallocate = count;
        self
    }

    /// Set the bitstream buffer preallocation count.
    pub fn with_bitstream_buffers_to_preallocate(mut self, count: u32) -> Self {
        self.num_bitstream_buffers_to_preallocate = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod codec_tests {
        use super::*;

        #[test]
        fn test_decode_operations() {
            assert_eq!(
                Codec::H264.decode_operation(),
                vk::VideoCodecOperationFlagsKHR::DECODE_H264
            );
            assert_eq!(
                Codec::H265.decode_operation(),
                vk::VideoCodecOperationFlagsKHR::DECODE_H265
            );
            assert_eq!(
                Codec::AV1.decode_operation(),
                vk::VideoCodecOperationFlagsKHR::DECODE_AV1
            );
        }

        #[test]
        fn test_codec_names() {
            assert_eq!(Codec::H264.name(), "AVC/H.264");
            assert_eq!(Codec::H265.name(), "HEVC/H.265");
            assert_eq!(Codec::AV1.name(), "AV1");
        }
    }

    mod chroma_format_tests {
        use super::*;

        #[test]
        fn test_default() {
            assert_eq!(ChromaFormat::default(), ChromaFormat::Yuv420);
        }

        #[test]
        fn test_vk_chroma_subsampling_conversion() {
            let vk_420: vk::VideoChromaSubsamplingFlagsKHR = ChromaFormat::Yuv420.into();
            assert_eq!(vk_420, vk::VideoChromaSubsamplingFlagsKHR::TYPE_420);

            let vk_422: vk::VideoChromaSubsamplingFlagsKHR = ChromaFormat::Yuv422.into();
            assert_eq!(vk_422, vk::VideoChromaSubsamplingFlagsKHR::TYPE_422);

            let vk_444: vk::VideoChromaSubsamplingFlagsKHR = ChromaFormat::Yuv444.into();
            assert_eq!(vk_444, vk::VideoChromaSubsamplingFlagsKHR::TYPE_444);
        }
    }

    mod bit_depth_tests {
        use super::*;

        #[test]
        fn test_default() {
            assert_eq!(BitDepth::default(), BitDepth::Eight);
        }

        #[test]
        fn test_vk_bit_depth_conversion() {
            let vk_8: vk::VideoComponentBitDepthFlagsKHR = BitDepth::Eight.into();
            assert_eq!(vk_8, vk::VideoComponentBitDepthFlagsKHR::TYPE_8);

            let vk_10: vk::VideoComponentBitDepthFlagsKHR = BitDepth::Ten.into();
            assert_eq!(vk_10, vk::VideoComponentBitDepthFlagsKHR::TYPE_10);
        }
    }

    mod video_format_tests {
        use super::*;

        #[test]
        fn test_new_sets_full_display_rect() {
            let format = VideoFormat::new(Codec::H264, 1920, 1080);
            assert_eq!(format.display_rect.width(), 1920);
            assert_eq!(format.display_rect.height(), 1080);
        }

        #[test]
        fn test_same_format_is_compatible() {
            let a = VideoFormat::new(Codec::H264, 1920, 1080);
            let b = VideoFormat::new(Codec::H264, 1920, 1080);
            assert!(a.is_compatible_with(&b));
        }

        #[test]
        fn test_resolution_change_is_incompatible() {
            let a = VideoFormat::new(Codec::H264, 1920, 1080);
            let b = VideoFormat::new(Codec::H264, 3840, 2160);
            assert!(!a.is_compatible_with(&b));
        }

        #[test]
        fn test_codec_change_is_incompatible() {
            let a = VideoFormat::new(Codec::H264, 1920, 1080);
            let b = VideoFormat::new(Codec::H265, 1920, 1080);
            assert!(!a.is_compatible_with(&b));
        }

        #[test]
        fn test_bit_depth_change_is_incompatible() {
            let a = VideoFormat::new(Codec::H265, 1920, 1080);
            let mut b = a;
            b.bit_depth_luma = BitDepth::Ten;
            assert!(!a.is_compatible_with(&b));
        }

        #[test]
        fn test_display_rect_does_not_affect_compatibility() {
            let a = VideoFormat::new(Codec::H264, 1920, 1088);
            let mut b = a;
            b.display_rect.bottom = 1080;
            assert!(a.is_compatible_with(&b));
        }
    }

    mod decoder_config_tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = DecoderConfig::new();
            assert_eq!(config.video_queue_index, 0);
            assert!(!config.use_linear_output);
            assert!(!config.use_separate_output_images);
            assert_eq!(config.num_decode_images_in_flight, 8);
            assert_eq!(config.num_decode_images_to_preallocate, -1);
            assert_eq!(config.num_bitstream_buffers_to_preallocate, 8);
        }

        #[test]
        fn test_linear_output_implies_separate_output_images() {
            let config = DecoderConfig::new().with_linear_output(true);
            assert!(config.use_linear_output);
            assert!(config.use_separate_output_images);
        }

        #[test]
        fn test_builder_chaining() {
            let config = DecoderConfig::new()
                .with_video_queue_index(1)
                .with_images_in_flight(4)
                .with_images_to_preallocate(16)
                .with_bitstream_buffers_to_preallocate(4);
            assert_eq!(config.video_queue_index, 1);
            assert_eq!(config.num_decode_images_in_flight, 4);
            assert_eq!(config.num_decode_images_to_preallocate, 16);
            assert_eq!(config.num_bitstream_buffers_to_preallocate, 4);
        }
    }
}
