//! Command recording primitives.
//!
//! A [`Command`] records itself into a command buffer and accumulates the
//! pipeline stages it touches; the sequence engine later uses that mask as
//! the wait-destination for the timeline semaphore entering the step.

use std::sync::Arc;

use ash::vk;

use crate::context::{Context, ContextHandle};
use crate::error::{Error, Result};

/// Recording state handed to [`Command::record`].
pub struct CommandRecorder<'a> {
    pub(crate) context: &'a Context,
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) stage_mask: vk::PipelineStageFlags,
}

impl CommandRecorder<'_> {
    pub(crate) fn check_context(&self, other: &Arc<Context>) -> Result<()> {
        if std::ptr::eq(self.context, Arc::as_ptr(other)) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                "resource does not originate from the recording context".into(),
            ))
        }
    }
}

/// A single piece of device work.
pub trait Command {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()>;
}

/// A pre-recorded, reusable command buffer.
///
/// Recording commands costs CPU time; a subroutine amortizes it when the
/// same operation is submitted many times.
pub struct Subroutine {
    context: ContextHandle,
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) stage_mask: vk::PipelineStageFlags,
    simultaneous_use: bool,
}

impl Subroutine {
    pub fn simultaneous_use(&self) -> bool {
        self.simultaneous_use
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }
}

impl Drop for Subroutine {
    fn drop(&mut self) {
        let pool = self.context.subroutine_pool.lock().unwrap();
        unsafe {
            self.context
                .device
                .free_command_buffers(*pool, &[self.buffer]);
        }
    }
}

/// Records commands into a [`Subroutine`].
pub struct SubroutineBuilder {
    state: Option<(ContextHandle, vk::CommandBuffer)>,
    stage_mask: vk::PipelineStageFlags,
    simultaneous_use: bool,
}

impl SubroutineBuilder {
    pub fn new(context: ContextHandle) -> Result<Self> {
        Self::with_usage(context, false)
    }

    pub fn with_usage(context: ContextHandle, simultaneous_use: bool) -> Result<Self> {
        let pool = context.subroutine_pool.lock().unwrap();
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { context.device.allocate_command_buffers(&alloc) }
            .map_err(Error::from)?[0];

        let mut flags = vk::CommandBufferUsageFlags::empty();
        if simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        let begin = vk::CommandBufferBeginInfo::default().flags(flags);
        if let Err(err) = unsafe { context.device.begin_command_buffer(buffer, &begin) } {
            unsafe { context.device.free_command_buffers(*pool, &[buffer]) };
            return Err(err.into());
        }
        drop(pool);

        Ok(Self {
            state: Some((context, buffer)),
            stage_mask: vk::PipelineStageFlags::empty(),
            simultaneous_use,
        })
    }

    fn state(&self) -> Result<&(ContextHandle, vk::CommandBuffer)> {
        self.state.as_ref().ok_or(Error::AlreadySubmitted)
    }

    pub fn add_command(&mut self, command: &dyn Command) -> Result<&mut Self> {
        let (context, buffer) = {
            let (context, buffer) = self.state()?;
            (context.clone(), *buffer)
        };
        let mut recorder = CommandRecorder {
            context: context.as_ref(),
            buffer,
            stage_mask: self.stage_mask,
        };
        command.record(&mut recorder)?;
        self.stage_mask = recorder.stage_mask;
        Ok(self)
    }

    pub fn finish(mut self) -> Result<Subroutine> {
        let (context, buffer) = self.state.take().ok_or(Error::AlreadySubmitted)?;
        unsafe { context.device.end_command_buffer(buffer) }.map_err(Error::from)?;
        Ok(Subroutine {
            context,
            buffer,
            stage_mask: self.stage_mask,
            simultaneous_use: self.simultaneous_use,
        })
    }
}

impl Drop for SubroutineBuilder {
    fn drop(&mut self) {
        if let Some((context, buffer)) = self.state.take() {
            let pool = context.subroutine_pool.lock().unwrap();
            unsafe { context.device.free_command_buffers(*pool, &[buffer]) };
        }
    }
}

/// Builds a subroutine from a list of commands.
pub fn create_subroutine(
    context: ContextHandle,
    commands: &[&dyn Command],
    simultaneous_use: bool,
) -> Result<Subroutine> {
    let mut builder = SubroutineBuilder::with_usage(context, simultaneous_use)?;
    for command in commands {
        builder.add_command(*command)?;
    }
    builder.finish()
}

/// Runs a single command synchronously.
pub fn execute(context: &ContextHandle, command: &dyn Command) -> Result<()> {
    context.one_time_submit(|recorder| command.record(recorder))
}

/// Runs a list of commands synchronously in one submission.
pub fn execute_list(context: &ContextHandle, commands: &[&dyn Command]) -> Result<()> {
    context.one_time_submit(|recorder| {
        for command in commands {
            command.record(recorder)?;
        }
        Ok(())
    })
}

/// Records with a closure and runs synchronously.
pub fn execute_with(
    context: &ContextHandle,
    record: impl FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
) -> Result<()> {
    context.one_time_submit(record)
}

/// Runs a pre-recorded subroutine synchronously on the reusable fence.
pub fn execute_subroutine(context: &ContextHandle, subroutine: &Subroutine) -> Result<()> {
    if !Arc::ptr_eq(context, subroutine.context()) {
        return Err(Error::InvalidArgument(
            "subroutine does not originate from the given context".into(),
        ));
    }
    subroutine.context().submit_subroutine(subroutine.buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{clear_tensor, retrieve_tensor, ClearParams, CopyRegion, Tensor, TypedBuffer};
    use crate::testing::test_context;

    #[test]
    fn subroutines_amortize_recording() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 32).unwrap();
        let output = TypedBuffer::<u32>::new(&context, 8).unwrap();

        let clear = clear_tensor(
            &tensor,
            ClearParams {
                data: 0x0101_0101,
                ..ClearParams::default()
            },
        );
        let subroutine = create_subroutine(context.clone(), &[&clear], false).unwrap();
        assert!(!subroutine.simultaneous_use());

        // The same recording runs twice.
        execute_subroutine(&context, &subroutine).unwrap();
        execute_subroutine(&context, &subroutine).unwrap();

        execute(
            &context,
            &retrieve_tensor(&tensor, &output, CopyRegion::default()),
        )
        .unwrap();
        assert!(output.as_slice().iter().all(|&v| v == 0x0101_0101));
    }

    #[test]
    fn builders_record_then_finish() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let clear = clear_tensor(&tensor, ClearParams::default());

        let mut builder = SubroutineBuilder::new(context.clone()).unwrap();
        builder.add_command(&clear).unwrap();
        let subroutine = builder.finish().unwrap();
        execute_subroutine(&context, &subroutine).unwrap();
    }

    #[test]
    fn execute_list_records_in_order() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let output = TypedBuffer::<u32>::new(&context, 4).unwrap();
        let clear = clear_tensor(
            &tensor,
            ClearParams {
                data: 7,
                ..ClearParams::default()
            },
        );
        let retrieve = retrieve_tensor(&tensor, &output, CopyRegion::default());
        execute_list(&context, &[&clear, &retrieve]).unwrap();
        assert!(output.as_slice().iter().all(|&v| v == 7));
    }
}
