//! Lists all suitable devices and their capabilities.

use ember::{
    enumerate_devices, get_device_info, get_subgroup_properties, get_supported_types,
    is_api_available,
};

fn main() {
    env_logger::init();

    if !is_api_available() {
        eprintln!("Vulkan is not available on this system");
        std::process::exit(1);
    }

    let devices = match enumerate_devices() {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("failed to enumerate devices: {err}");
            std::process::exit(1);
        }
    };
    if devices.is_empty() {
        println!("no suitable devices found");
        return;
    }

    for device in &devices {
        let info = get_device_info(device);
        let kind = if info.is_discrete { "discrete" } else { "integrated" };
        println!("{} ({kind})", info.name);

        let types = get_supported_types(device);
        println!(
            "  shader types: f16={} f64={} i8={} i16={} i64={}",
            types.float16, types.float64, types.int8, types.int16, types.int64
        );

        let subgroup = get_subgroup_properties(device);
        println!("  subgroup size: {}", subgroup.subgroup_size);

        let rt = ember::raytracing::get_ray_tracing_features(device);
        println!(
            "  ray tracing: query={} pipeline={} indirect={}",
            rt.query, rt.pipeline, rt.indirect_dispatch
        );
    }
}
