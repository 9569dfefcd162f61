//! Dispatches a small compute kernel and times it with the stopwatch.
//!
//! The embedded SPIR-V is the precompiled form of
//!
//! ```glsl
//! #version 450
//! layout(local_size_x = 1) in;
//! layout(std430, binding = 0) buffer OutBuf { uint data[]; };
//! layout(push_constant) uniform Push { uint base; };
//! void main() {
//!     data[gl_GlobalInvocationID.x] = gl_GlobalInvocationID.x + base;
//! }
//! ```

use ember::{
    begin_sequence, create_context, retrieve_tensor, BindingTarget, CopyRegion, Program,
    StopWatch, Tensor, TypedBuffer,
};

#[rustfmt::skip]
static CODE: [u32; 165] = [
    0x07230203, 0x00010300, 0x00000000, 0x00000020, 0x00000000, 0x00020011,
    0x00000001, 0x0003000E, 0x00000000, 0x00000001, 0x0006000F, 0x00000005,
    0x00000014, 0x6E69616D, 0x00000000, 0x00000004, 0x00060010, 0x00000014,
    0x00000011, 0x00000001, 0x00000001, 0x00000001, 0x00040005, 0x00000006,
    0x4274754F, 0x00006675, 0x00040005, 0x00000008, 0x5F74756F, 0x00667562,
    0x00040047, 0x00000004, 0x0000000B, 0x0000001C, 0x00040047, 0x00000005,
    0x00000006, 0x00000004, 0x00050048, 0x00000006, 0x00000000, 0x00000023,
    0x00000000, 0x00030047, 0x00000006, 0x00000002, 0x00040047, 0x00000008,
    0x00000022, 0x00000000, 0x00040047, 0x00000008, 0x00000021, 0x00000000,
    0x00050048, 0x00000009, 0x00000000, 0x00000023, 0x00000000, 0x00030047,
    0x00000009, 0x00000002, 0x00040015, 0x00000001, 0x00000020, 0x00000000,
    0x00040017, 0x00000002, 0x00000001, 0x00000003, 0x00040020, 0x00000003,
    0x00000001, 0x00000002, 0x0004003B, 0x00000003, 0x00000004, 0x00000001,
    0x0003001D, 0x00000005, 0x00000001, 0x0003001E, 0x00000006, 0x00000005,
    0x00040020, 0x00000007, 0x0000000C, 0x00000006, 0x0004003B, 0x00000007,
    0x00000008, 0x0000000C, 0x0003001E, 0x00000009, 0x00000001, 0x00040020,
    0x0000000A, 0x00000009, 0x00000009, 0x0004003B, 0x0000000A, 0x0000000B,
    0x00000009, 0x00020013, 0x0000000C, 0x00030021, 0x0000000D, 0x0000000C,
    0x0004002B, 0x00000001, 0x0000000E, 0x00000000, 0x00040020, 0x0000000F,
    0x0000000C, 0x00000001, 0x00040020, 0x00000010, 0x00000009, 0x00000001,
    0x00040020, 0x00000011, 0x00000001, 0x00000001, 0x00050036, 0x0000000C,
    0x00000014, 0x00000000, 0x0000000D, 0x000200F8, 0x00000015, 0x00050041,
    0x00000011, 0x00000016, 0x00000004, 0x0000000E, 0x0004003D, 0x00000001,
    0x00000017, 0x00000016, 0x00050041, 0x00000010, 0x00000018, 0x0000000B,
    0x0000000E, 0x0004003D, 0x00000001, 0x00000019, 0x00000018, 0x00050080,
    0x00000001, 0x0000001A, 0x00000017, 0x00000019, 0x00060041, 0x0000000F,
    0x0000001B, 0x00000008, 0x0000000E, 0x00000017, 0x0003003E, 0x0000001B,
    0x0000001A, 0x000100FD, 0x00010038,
];

const COUNT: usize = 64;

fn main() -> ember::Result<()> {
    env_logger::init();

    let context = create_context(Vec::new())?;
    println!("Selected device: {}\n", context.device_info().name);

    // Allocate the output tensor and the readback buffer.
    let tensor = Tensor::new(&context, (COUNT * 4) as u64)?;
    let readback = TypedBuffer::<u32>::new(&context, COUNT)?;

    // Create the program and bind its single storage buffer.
    let mut program = Program::new(&context, &CODE)?;
    program.bind_parameter(&tensor, "OutBuf")?;

    println!("Dispatching...");

    let base = 1000u32;
    let watch = StopWatch::new(&context)?;
    let mut sequence = begin_sequence(&context)?;
    sequence
        .and(&watch.start())?
        .and(&program.dispatch_push(&base, COUNT as u32, 1, 1)?)?
        .and(&watch.stop())?
        .then(&retrieve_tensor(&tensor, &readback, CopyRegion::default()))?;
    sequence.submit()?.wait()?;

    let stamps = watch.timestamps(true)?;
    println!("Dispatched in {:.3} us\n", (stamps[1] - stamps[0]) * 1e-3);

    for (index, value) in readback.as_slice().iter().enumerate().take(8) {
        println!("data[{index}] = {value}");
    }
    println!("...");
    let expected = (0..COUNT as u32).map(|i| base + i).collect::<Vec<_>>();
    assert_eq!(readback.as_slice(), expected.as_slice());
    println!("All {COUNT} values check out.");
    Ok(())
}
