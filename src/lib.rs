//! FrameForge - hardware-accelerated video decoding on Vulkan.
//!
//! FrameForge drives the Vulkan video decode queue: it owns the decode
//! session, a bounded pool of reusable bitstream buffers, a slot table of
//! per-picture command resources, and the picture parameter set lifecycle.
//! An external parser feeds it sequence starts, parameter updates, and
//! picture submissions through [`VideoDecoderHandler`]; an external frame
//! buffer consumes decoded pictures through [`VideoFrameBuffer`] and feeds
//! completion signals back.
//!
//! Submission never blocks on hardware completion: each picture carries its
//! own fence and semaphore, and resources are recycled only once the
//! completion signal has been observed.

pub mod decoder;
pub mod error;
pub mod vulkan;

pub use decoder::decode::{
    BitstreamBufferAllocation, DecodePictureInfo, DecodeReference, PerFrameDecodeParameters,
    VideoDecoder, VideoDecoderHandler,
};
pub use decoder::framebuffer::{FrameSynchronizationInfo, PictureResource, VideoFrameBuffer};
pub use decoder::params::{
    ParameterSetCache, ParameterSetData, ParameterUpdate, PictureParameterSet,
};
pub use decoder::session::{query_decode_capabilities, DecodeCapabilities, DecodeSession};
pub use decoder::{
    BitDepth, ChromaFormat, Codec, DecoderConfig, DisplayRect, VideoFormat,
    DEFAULT_BITSTREAM_BUFFERS_TO_PREALLOCATE, DEFAULT_DECODE_IMAGES_IN_FLIGHT,
};
pub use error::{FrameForgeError, Result};
pub use vulkan::{VideoContext, VideoContextBuilder};
