//! Example: Query Decode Capabilities
//!
//! This example demonstrates how to query video decode capabilities
//! from the Vulkan video extensions.

use ash::vk;
use frameforge::{query_decode_capabilities, Codec, VideoContextBuilder, VideoFormat};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("FrameForge Decode Capabilities Example");
    println!("=======================================\n");

    // Build the video context.
    let context = VideoContextBuilder::new()
        .app_name("Decode Capabilities Example")
        .app_version(1, 0, 0)
        .enable_validation(cfg!(debug_assertions))
        .build()?;

    println!("Video Context Created\n");

    println!("Codec Support:");
    println!("--------------");

    let codecs = [Codec::H264, Codec::H265, Codec::AV1];

    for codec in codecs {
        println!("\n{:?}:", codec);

        let decode_supported = context.supports_decode(codec);
        println!(
            "  Decode: {}",
            if decode_supported {
                "✓ Supported"
            } else {
                "✗ Not supported"
            }
        );

        if decode_supported {
            query_detailed_capabilities(&context, codec)?;
        }
    }

    Ok(())
}

fn query_detailed_capabilities(
    context: &frameforge::VideoContext,
    codec: Codec,
) -> Result<(), Box<dyn std::error::Error>> {
    // A representative 1080p format; the profile limits reported apply to
    // the whole codec profile, not the extent queried with.
    let format = VideoFormat::new(codec, 1920, 1080);

    let caps = match query_decode_capabilities(context, &format) {
        Ok(caps) => caps,
        Err(e) => {
            println!("    Profile query failed: {}", e);
            return Ok(());
        }
    };

    println!(
        "    Max Dimensions: {}x{}",
        caps.max_coded_extent.width, caps.max_coded_extent.height
    );
    println!("    Max DPB Slots: {}", caps.max_dpb_slots);
    println!("    Max Active References: {}", caps.max_active_references);
    println!(
        "    Bitstream Alignment: offset {}, size {}",
        caps.min_bitstream_buffer_offset_alignment, caps.min_bitstream_buffer_size_alignment
    );
    println!(
        "    DPB/Output: {}",
        if caps.requires_distinct_output() {
            "distinct images required"
        } else {
            "may coincide"
        }
    );

    // Query the decode output image formats for this profile.
    let video_queue_fn = ash::khr::video_queue::Instance::new(context.entry(), context.instance());
    let physical_device = context.physical_device();

    frameforge::decoder::session::with_video_profile(&format, |profile_info| {
        let mut format_props_list =
            vk::VideoProfileListInfoKHR::default().profiles(std::slice::from_ref(profile_info));

        let mut format_info = vk::PhysicalDeviceVideoFormatInfoKHR::default()
            .image_usage(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR);
        format_info.p_next = (&mut format_props_list as *mut vk::VideoProfileListInfoKHR).cast();

        let mut format_props_count = 0;
        let result = unsafe {
            (video_queue_fn
                .fp()
                .get_physical_device_video_format_properties_khr)(
                physical_device,
                &format_info,
                &mut format_props_count,
                std::ptr::null_mut(),
            )
        };

        if result == vk::Result::SUCCESS {
            let mut format_props =
                vec![vk::VideoFormatPropertiesKHR::default(); format_props_count as usize];
            unsafe {
                let _ = (video_queue_fn
                    .fp()
                    .get_physical_device_video_format_properties_khr)(
                    physical_device,
                    &format_info,
                    &mut format_props_count,
                    format_props.as_mut_ptr(),
                );
            };
            println!("    Supported Output Formats (DST):");
            for prop in format_props {
                println!("      Format: {:?}", prop.format);
            }
        }
    });

    Ok(())
}
