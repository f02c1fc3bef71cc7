fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/sha1_prefix_search.cl");

    #[cfg(feature = "opencl")]
    check_opencl_kernel();
}

// Compiles the kernel ahead of time so that errors in it fail the build instead of the first
// search. Machines without a GPU can still build the crate; they just skip the check.
#[cfg(feature = "opencl")]
fn check_opencl_kernel() {
    use ocl::{
        builders::DeviceSpecifier::TypeFlags, flags::DeviceType, Context, Platform, Program,
    };

    let device = match TypeFlags(DeviceType::GPU).to_device_list(None::<Platform>) {
        Ok(devices) if !devices.is_empty() => devices[0],
        _ => {
            println!("cargo:warning=no OpenCL GPU found, skipping the kernel compile check");
            return;
        }
    };

    if let Err(error) = Context::builder()
        .devices(device)
        .build()
        .and_then(|context| {
            Program::builder()
                .src(include_str!("src/sha1_prefix_search.cl"))
                .cmplr_opt("-Werror")
                .build(&context)
        })
    {
        panic!("sha1_prefix_search.cl failed to compile: {}", error);
    }
}
