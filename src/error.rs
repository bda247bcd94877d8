//! Error types for FrameForge.

use thiserror::Error;

/// Main error type for FrameForge operations.
#[derive(Error, Debug)]
pub enum FrameForgeError {
    /// Vulkan instance creation failed.
    #[error("Failed to create Vulkan instance: {0}")]
    InstanceCreation(String),

    /// Vulkan physical device selection failed.
    #[error("No suitable Vulkan physical device found: {0}")]
    NoSuitableDevice(String),

    /// Vulkan logical device creation failed.
    #[error("Failed to create Vulkan device: {0}")]
    DeviceCreation(String),

    /// Video session creation failed.
    #[error("Failed to create video session: {0}")]
    VideoSessionCreation(String),

    /// Video session parameters creation failed.
    #[error("Failed to create video session parameters: {0}")]
    SessionParametersCreation(String),

    /// The negotiated video format is not supported by the device.
    ///
    /// Fatal to the current sequence; the caller must stop or retry a
    /// sequence start with a compatible format.
    #[error("Video format not supported: {0}")]
    FormatUnsupported(String),

    /// All decode slots are claimed by in-flight pictures.
    ///
    /// Transient backpressure: retry after completions drain. Indicates the
    /// in-flight depth negotiated at sequence start is insufficient for the
    /// submission rate.
    #[error("No free decode slot (all {0} slots in flight)")]
    NoFreeSlot(usize),

    /// The bitstream buffer pool has reached its fixed capacity and no
    /// buffer is unreferenced.
    ///
    /// Transient backpressure, like [`FrameForgeError::NoFreeSlot`].
    #[error("Bitstream buffer pool exhausted (capacity {0})")]
    PoolExhausted(usize),

    /// The requested offset/size alignments cannot be satisfied.
    #[error("Unsatisfiable bitstream alignment: offset={offset_alignment}, size={size_alignment}")]
    AlignmentUnsatisfiable {
        offset_alignment: usize,
        size_alignment: usize,
    },

    /// Bitstream buffer allocation failed.
    #[error("Bitstream buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// The optimal-to-linear output copy failed.
    ///
    /// The decoded picture remains valid via the optimal path; only the
    /// linear-output convenience is lost.
    #[error("Linear output copy failed: {0}")]
    CopyFailed(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// Resource creation failed (images, buffers, fences, command pools, etc.).
    #[error("Failed to create resource: {0}")]
    ResourceCreation(String),

    /// Command buffer operation failed.
    #[error("Command buffer error: {0}")]
    CommandBuffer(String),

    /// Invalid input (dimensions, data size, format, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Codec not supported.
    #[error("Codec not supported: {0}")]
    CodecNotSupported(String),

    /// Synchronization primitive error.
    #[error("Synchronization error: {0}")]
    Synchronization(String),

    /// Generic Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(ash::vk::Result),
}

impl From<ash::vk::Result> for FrameForgeError {
    fn from(result: ash::vk::Result) -> Self {
        FrameForgeError::Vulkan(result)
    }
}

/// Result type for FrameForge operations.
pub type Result<T> = std::result::Result<T, FrameForgeError>;
