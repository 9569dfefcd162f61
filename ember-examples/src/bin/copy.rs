//! Round-trips data through a device tensor.

use ember::{
    begin_sequence_on, create_context, retrieve_tensor, update_tensor, CopyRegion, Tensor,
    Timeline, TypedBuffer,
};

fn main() -> ember::Result<()> {
    env_logger::init();

    let context = create_context(Vec::new())?;
    println!("Selected device: {}\n", context.device_info().name);

    let data: [u32; 10] = [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];
    let upload = TypedBuffer::from_data(&context, &data)?;
    let download = TypedBuffer::<u32>::new(&context, data.len())?;
    let tensor = Tensor::new(&context, (data.len() * 4) as u64)?;

    let timeline = Timeline::new(&context)?;
    let mut sequence = begin_sequence_on(&timeline, 0)?;
    sequence
        .and(&update_tensor(&upload, &tensor, CopyRegion::default()))?
        .then(&retrieve_tensor(&tensor, &download, CopyRegion::default()))?;
    let submission = sequence.submit()?;

    println!("Uploading data...");
    timeline.wait_value(1)?;
    println!("Fetching data...");
    timeline.wait_value(2)?;
    submission.wait()?;

    for value in download.as_slice() {
        println!("{value}");
    }
    Ok(())
}
