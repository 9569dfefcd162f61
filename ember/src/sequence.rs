//! Timeline counters, step-grouped sequences and submissions.
//!
//! A sequence assembles steps of concurrently running commands; steps are
//! chained through a monotonic timeline semaphore and submitted as one
//! batch per step. The submission returned by [`SequenceBuilder::submit`]
//! owns the recorded command buffers and returns the command pool to the
//! context's LIFO cache once the device is done with them.

use std::fmt::Write as _;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use crate::command::{Command, CommandRecorder, Subroutine};
use crate::context::ContextHandle;
use crate::error::{invalid_argument, Error, Result};

/// Shared handle to a [`Timeline`].
pub type TimelineHandle = Arc<Timeline>;

/// A monotonic 64-bit counter shared between CPU and GPU.
pub struct Timeline {
    context: ContextHandle,
    semaphore: vk::Semaphore,
}

impl Timeline {
    pub fn new(context: &ContextHandle) -> Result<TimelineHandle> {
        Self::with_initial_value(context, 0)
    }

    pub fn with_initial_value(context: &ContextHandle, initial: u64) -> Result<TimelineHandle> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { context.device.create_semaphore(&info, None) }
            .map_err(Error::from)?;
        Ok(Arc::new(Self {
            context: context.clone(),
            semaphore,
        }))
    }

    /// Stable identifier for printing and debugging.
    pub fn id(&self) -> u64 {
        self.semaphore.as_raw()
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn value(&self) -> Result<u64> {
        unsafe { self.context.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(Error::from)
    }

    /// Signals the counter from the host. The counter only moves forward;
    /// anything at or below the current value is rejected.
    pub fn set_value(&self, value: u64) -> Result<()> {
        let current = self.value()?;
        if value <= current {
            return Err(invalid_argument(format!(
                "timeline value can only increase (current {current}, requested {value})"
            )));
        }
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { self.context.device.signal_semaphore(&info) }.map_err(Error::from)
    }

    /// Blocks until the counter reaches `value`.
    pub fn wait_value(&self, value: u64) -> Result<()> {
        match self.wait_value_timeout(value, u64::MAX)? {
            true => Ok(()),
            false => Err(Error::Platform(vk::Result::TIMEOUT)),
        }
    }

    /// Blocks up to `timeout` nanoseconds; returns whether the value was
    /// reached.
    pub fn wait_value_timeout(&self, value: u64, timeout: u64) -> Result<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.context.device.wait_semaphores(&info, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeline.{:x}", self.id())
    }
}

struct SubmissionResources {
    pool: Option<vk::CommandPool>,
    buffers: Vec<vk::CommandBuffer>,
    subroutines: Vec<Arc<Subroutine>>,
}

/// Token for submitted work, tying the timeline to the counter value that
/// marks completion.
///
/// Dropping a submission that owns command buffers joins on completion
/// first; the device may still reference them.
pub struct Submission {
    timeline: TimelineHandle,
    final_step: u64,
    resources: Option<SubmissionResources>,
}

impl Submission {
    pub fn timeline(&self) -> &TimelineHandle {
        &self.timeline
    }

    /// Timeline value reached when the submission completes.
    pub fn final_step(&self) -> u64 {
        self.final_step
    }

    /// True when dropping the submission never blocks.
    pub fn forgettable(&self) -> bool {
        self.resources
            .as_ref()
            .map_or(true, |res| res.buffers.is_empty() && res.subroutines.is_empty())
    }

    pub fn wait(&self) -> Result<()> {
        if self.final_step > 0 {
            self.timeline.wait_value(self.final_step)?;
        }
        Ok(())
    }

    pub fn wait_timeout(&self, timeout: u64) -> Result<bool> {
        if self.final_step == 0 {
            return Ok(true);
        }
        self.timeline.wait_value_timeout(self.final_step, timeout)
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        let Some(resources) = self.resources.take() else {
            return;
        };
        if !resources.buffers.is_empty() || !resources.subroutines.is_empty() {
            if let Err(err) = self.wait() {
                log::error!("failed to join submission on drop: {err}");
            }
        }
        let context = self.timeline.context();
        if let Some(pool) = resources.pool {
            unsafe {
                if !resources.buffers.is_empty() {
                    context.device.free_command_buffers(pool, &resources.buffers);
                }
                let _ = context
                    .device
                    .reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES);
            }
            context.recycle_sequence_pool(pool);
        }
    }
}

struct Step {
    buffer: Option<vk::CommandBuffer>,
    stage_mask: vk::PipelineStageFlags,
    subroutines: Vec<vk::CommandBuffer>,
    command_count: u32,
    wait_value: u64,
    signal_value: u64,
    /// Additional waits on external timelines: (debug id, semaphore, value).
    extra_waits: Vec<(u64, vk::Semaphore, u64)>,
}

impl Step {
    fn new(wait_value: u64, signal_value: u64) -> Self {
        Self {
            buffer: None,
            stage_mask: vk::PipelineStageFlags::empty(),
            subroutines: Vec::new(),
            command_count: 0,
            wait_value,
            signal_value,
            extra_waits: Vec::new(),
        }
    }

    /// A step counts as empty while no inline command buffer was recorded;
    /// subroutines alone leave the step rewritable, so a following
    /// `wait_for` re-gates them in place instead of opening a new step.
    fn is_empty(&self) -> bool {
        self.buffer.is_none()
    }
}

struct Inner {
    context: ContextHandle,
    timeline: TimelineHandle,
    implicit: bool,
    pool: vk::CommandPool,
    steps: Vec<Step>,
    current_value: u64,
    subroutine_refs: Vec<Arc<Subroutine>>,
}

/// Records commands into step-grouped batches and submits them in one go.
pub struct SequenceBuilder {
    inner: Option<Inner>,
}

/// Starts a sequence on a fresh, sequence-owned timeline.
pub fn begin_sequence(context: &ContextHandle) -> Result<SequenceBuilder> {
    let timeline = Timeline::new(context)?;
    SequenceBuilder::create(context.clone(), timeline, true, 0)
}

/// Starts a sequence on an existing timeline at `start_value`.
pub fn begin_sequence_on(timeline: &TimelineHandle, start_value: u64) -> Result<SequenceBuilder> {
    SequenceBuilder::create(
        timeline.context().clone(),
        timeline.clone(),
        false,
        start_value,
    )
}

impl SequenceBuilder {
    fn create(
        context: ContextHandle,
        timeline: TimelineHandle,
        implicit: bool,
        start_value: u64,
    ) -> Result<Self> {
        let pool = context.fetch_sequence_pool()?;
        let steps = vec![Step::new(start_value, start_value + 1)];
        Ok(Self {
            inner: Some(Inner {
                context,
                timeline,
                implicit,
                pool,
                steps,
                current_value: start_value + 1,
                subroutine_refs: Vec::new(),
            }),
        })
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        self.inner.as_mut().ok_or(Error::AlreadySubmitted)
    }

    fn inner_ref(&self) -> Result<&Inner> {
        self.inner.as_ref().ok_or(Error::AlreadySubmitted)
    }

    /// Adds a command to the current step; commands of one step run
    /// concurrently on the device.
    pub fn and(&mut self, command: &dyn Command) -> Result<&mut Self> {
        let inner = self.inner.as_mut().ok_or(Error::AlreadySubmitted)?;
        let step = inner.steps.last_mut().expect("sequence always has a step");
        let buffer = match step.buffer {
            Some(buffer) => buffer,
            None => {
                let alloc = vk::CommandBufferAllocateInfo::default()
                    .command_pool(inner.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let buffer = unsafe { inner.context.device.allocate_command_buffers(&alloc) }
                    .map_err(Error::from)?[0];
                let begin = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { inner.context.device.begin_command_buffer(buffer, &begin) }
                    .map_err(Error::from)?;
                step.buffer = Some(buffer);
                buffer
            }
        };

        let mut recorder = CommandRecorder {
            context: inner.context.as_ref(),
            buffer,
            stage_mask: step.stage_mask,
        };
        command.record(&mut recorder)?;
        step.stage_mask = recorder.stage_mask;
        step.command_count += 1;
        Ok(self)
    }

    /// Adds a pre-recorded subroutine to the current step. The submission
    /// keeps the subroutine alive until it completed.
    pub fn and_subroutine(&mut self, subroutine: &Arc<Subroutine>) -> Result<&mut Self> {
        let inner = self.inner_mut()?;
        if !Arc::ptr_eq(&inner.context, subroutine.context()) {
            return Err(invalid_argument(
                "subroutine does not originate from the sequence context",
            ));
        }
        let step = inner.steps.last_mut().expect("sequence always has a step");
        step.subroutines.push(subroutine.buffer);
        step.stage_mask |= subroutine.stage_mask;
        step.command_count += 1;
        inner.subroutine_refs.push(subroutine.clone());
        Ok(self)
    }

    /// Adds every command of the list to the current step.
    pub fn and_list(&mut self, commands: &[&dyn Command]) -> Result<&mut Self> {
        for command in commands {
            self.and(*command)?;
        }
        Ok(self)
    }

    /// Closes the current step; following commands wait for it to finish.
    pub fn next_step(&mut self) -> Result<&mut Self> {
        let inner = self.inner_mut()?;
        let step = inner.steps.last_mut().expect("sequence always has a step");
        if let Some(buffer) = step.buffer {
            unsafe { inner.context.device.end_command_buffer(buffer) }.map_err(Error::from)?;
        }
        let wait = inner.current_value;
        inner.current_value += 1;
        inner.steps.push(Step::new(wait, inner.current_value));
        Ok(self)
    }

    /// Shorthand for [`next_step`](Self::next_step) followed by
    /// [`and`](Self::and).
    pub fn then(&mut self, command: &dyn Command) -> Result<&mut Self> {
        self.next_step()?;
        self.and(command)
    }

    pub fn then_subroutine(&mut self, subroutine: &Arc<Subroutine>) -> Result<&mut Self> {
        self.next_step()?;
        self.and_subroutine(subroutine)
    }

    /// Makes the next step additionally wait until the sequence timeline
    /// reaches `value`. Only meaningful on an explicit timeline; nothing
    /// else can advance an implicit one.
    pub fn wait_for(&mut self, value: u64) -> Result<&mut Self> {
        let inner = self.inner_mut()?;
        if inner.implicit {
            return Err(invalid_argument(
                "wait_for would deadlock on an implicit timeline",
            ));
        }
        if value < inner.current_value {
            return Err(invalid_argument(
                "wait value too low, the timeline only moves forward",
            ));
        }
        let step = inner.steps.last_mut().expect("sequence always has a step");
        if step.is_empty() {
            step.wait_value = value;
            step.signal_value = value + 1;
            inner.current_value = value + 1;
        } else {
            if let Some(buffer) = step.buffer {
                unsafe { inner.context.device.end_command_buffer(buffer) }
                    .map_err(Error::from)?;
            }
            inner.current_value = value + 1;
            inner.steps.push(Step::new(value, value + 1));
        }
        Ok(self)
    }

    /// Makes the next step additionally wait on an external timeline.
    pub fn wait_for_timeline(
        &mut self,
        timeline: &TimelineHandle,
        value: u64,
    ) -> Result<&mut Self> {
        {
            let inner = self.inner_ref()?;
            if timeline.id() == inner.timeline.id() {
                return self.wait_for(value);
            }
            if !Arc::ptr_eq(&inner.context, timeline.context()) {
                return Err(invalid_argument(
                    "timeline does not originate from the sequence context",
                ));
            }
        }
        {
            let step_open = !self
                .inner_ref()?
                .steps
                .last()
                .expect("sequence always has a step")
                .is_empty();
            if step_open {
                self.next_step()?;
            }
        }
        let inner = self.inner_mut()?;
        let step = inner.steps.last_mut().expect("sequence always has a step");
        step.extra_waits
            .push((timeline.id(), timeline.semaphore(), value));
        Ok(self)
    }

    /// Renders the wait graph, one line per step:
    /// `Timeline.<id>(wait) -> [n commands] -> Timeline.<id>(signal)`.
    pub fn print_wait_graph(&self) -> Result<String> {
        let inner = self.inner_ref()?;
        let id = inner.timeline.id();
        let mut out = String::new();
        for step in &inner.steps {
            let mut line = format!("Timeline.{id:x}({})", step.wait_value);
            for (extra_id, _, value) in &step.extra_waits {
                let _ = write!(line, " + Timeline.{extra_id:x}({value})");
            }
            let _ = writeln!(
                out,
                "{line} -> [{} commands] -> Timeline.{id:x}({})",
                step.command_count, step.signal_value
            );
        }
        Ok(out)
    }

    /// Validates, queues one submit batch per step and turns the builder
    /// into a [`Submission`]. The builder is spent afterwards; further
    /// calls fail with [`Error::AlreadySubmitted`].
    pub fn submit(&mut self) -> Result<Submission> {
        let mut inner = self.inner.take().ok_or(Error::AlreadySubmitted)?;

        // Close the open command buffer of the final step.
        if let Some(buffer) = inner.steps.last().and_then(|step| step.buffer) {
            unsafe { inner.context.device.end_command_buffer(buffer) }.map_err(Error::from)?;
        }

        struct StepData {
            buffers: Vec<vk::CommandBuffer>,
            wait_semaphores: Vec<vk::Semaphore>,
            wait_values: Vec<u64>,
            wait_stages: Vec<vk::PipelineStageFlags>,
            signal_semaphores: [vk::Semaphore; 1],
            signal_values: [u64; 1],
        }

        let own = inner.timeline.semaphore();
        let data: Vec<StepData> = inner
            .steps
            .iter()
            .map(|step| {
                let mut buffers = Vec::with_capacity(1 + step.subroutines.len());
                buffers.extend(step.buffer);
                buffers.extend_from_slice(&step.subroutines);

                let stage = if step.stage_mask.is_empty() {
                    vk::PipelineStageFlags::TOP_OF_PIPE
                } else {
                    step.stage_mask
                };
                let mut wait_semaphores = vec![own];
                let mut wait_values = vec![step.wait_value];
                let mut wait_stages = vec![stage];
                for (_, semaphore, value) in &step.extra_waits {
                    wait_semaphores.push(*semaphore);
                    wait_values.push(*value);
                    wait_stages.push(stage);
                }

                StepData {
                    buffers,
                    wait_semaphores,
                    wait_values,
                    wait_stages,
                    signal_semaphores: [own],
                    signal_values: [step.signal_value],
                }
            })
            .collect();

        let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo<'_>> = data
            .iter()
            .map(|step| {
                vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&step.wait_values)
                    .signal_semaphore_values(&step.signal_values)
            })
            .collect();
        let submits: Vec<vk::SubmitInfo<'_>> = data
            .iter()
            .zip(timeline_infos.iter_mut())
            .map(|(step, timeline_info)| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&step.wait_semaphores)
                    .wait_dst_stage_mask(&step.wait_stages)
                    .command_buffers(&step.buffers)
                    .signal_semaphores(&step.signal_semaphores)
                    .push_next(timeline_info)
            })
            .collect();

        unsafe {
            inner
                .context
                .device
                .queue_submit(inner.context.queue, &submits, vk::Fence::null())
        }
        .map_err(Error::from)?;

        let recorded: Vec<vk::CommandBuffer> = inner
            .steps
            .iter()
            .filter_map(|step| step.buffer)
            .collect();
        let pool = if recorded.is_empty() {
            // Nothing on the pool is in flight, hand it back right away.
            inner.context.recycle_sequence_pool(inner.pool);
            None
        } else {
            Some(inner.pool)
        };

        Ok(Submission {
            timeline: inner.timeline.clone(),
            final_step: inner.current_value,
            resources: Some(SubmissionResources {
                pool,
                buffers: recorded,
                subroutines: std::mem::take(&mut inner.subroutine_refs),
            }),
        })
    }
}

impl Drop for SequenceBuilder {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let device = &inner.context.device;
        unsafe {
            for step in &inner.steps {
                if let Some(buffer) = step.buffer {
                    device.free_command_buffers(inner.pool, &[buffer]);
                }
            }
            let _ = device
                .reset_command_pool(inner.pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES);
        }
        inner.context.recycle_sequence_pool(inner.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{
        clear_tensor, retrieve_tensor, update_tensor, ClearParams, CopyRegion, Tensor, TypedBuffer,
    };
    use crate::command::execute;
    use crate::testing::test_context;

    #[test]
    fn timeline_is_monotonic() {
        let Some(context) = test_context() else {
            return;
        };
        let timeline = Timeline::with_initial_value(&context, 2).unwrap();
        assert_eq!(timeline.value().unwrap(), 2);

        timeline.set_value(5).unwrap();
        assert_eq!(timeline.value().unwrap(), 5);

        assert!(matches!(
            timeline.set_value(3),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            timeline.set_value(5),
            Err(Error::InvalidArgument(_))
        ));

        assert!(timeline.wait_value_timeout(5, 0).unwrap());
        assert!(!timeline.wait_value_timeout(100, 1_000).unwrap());
    }

    #[test]
    fn buffers_round_trip_through_tensors() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let input = TypedBuffer::from_data(&context, &data).unwrap();
        let output = TypedBuffer::<i32>::new(&context, 10).unwrap();
        let tensor = Tensor::new(&context, 40).unwrap();

        let timeline = Timeline::new(&context).unwrap();
        let mut builder = begin_sequence_on(&timeline, 0).unwrap();
        builder
            .and(&update_tensor(&input, &tensor, CopyRegion::default()))
            .unwrap()
            .then(&retrieve_tensor(&tensor, &output, CopyRegion::default()))
            .unwrap();
        let submission = builder.submit().unwrap();
        submission.wait().unwrap();

        assert_eq!(output.as_slice(), &data);
    }

    #[test]
    fn unsafe_copies_match_safe_ones_across_submissions() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let input = TypedBuffer::from_data(&context, &data).unwrap();
        let output = TypedBuffer::<i32>::new(&context, 10).unwrap();
        let tensor = Tensor::new(&context, 40).unwrap();

        let region = CopyRegion {
            unchecked: true,
            ..CopyRegion::default()
        };
        // Separate submissions isolate the unsafe copies from each other.
        let timeline = Timeline::new(&context).unwrap();
        begin_sequence_on(&timeline, 0)
            .unwrap()
            .and(&update_tensor(&input, &tensor, region))
            .unwrap()
            .submit()
            .unwrap()
            .wait()
            .unwrap();
        begin_sequence_on(&timeline, 1)
            .unwrap()
            .and(&retrieve_tensor(&tensor, &output, region))
            .unwrap()
            .submit()
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(output.as_slice(), &data);
    }

    #[test]
    fn partial_copies_compose() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let input = TypedBuffer::from_data(&context, &data).unwrap();
        let mut output = TypedBuffer::<i32>::new(&context, 10).unwrap();
        output.as_mut_slice().fill(0);
        let tensor = Tensor::new(&context, 40).unwrap();

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&update_tensor(
                &input,
                &tensor,
                CopyRegion {
                    buffer_offset: 20,
                    size: 20,
                    ..CopyRegion::default()
                },
            ))
            .unwrap()
            .and(&update_tensor(
                &input,
                &tensor,
                CopyRegion {
                    tensor_offset: 20,
                    size: 20,
                    ..CopyRegion::default()
                },
            ))
            .unwrap()
            .then(&retrieve_tensor(
                &tensor,
                &output,
                CopyRegion {
                    buffer_offset: 8,
                    tensor_offset: 12,
                    size: 24,
                    ..CopyRegion::default()
                },
            ))
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        let expected: [i32; 10] = [0, 0, 1500, -45123, 10, -5, 6, 45, 0, 0];
        assert_eq!(output.as_slice(), &expected);
    }

    #[test]
    fn fill_covers_exactly_the_requested_range() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 64).unwrap();
        let output = TypedBuffer::<i32>::new(&context, 16).unwrap();

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&clear_tensor(
                &tensor,
                ClearParams {
                    data: 5,
                    ..ClearParams::default()
                },
            ))
            .unwrap()
            .then(&retrieve_tensor(&tensor, &output, CopyRegion::default()))
            .unwrap();
        builder.submit().unwrap().wait().unwrap();
        assert!(output.as_slice().iter().all(|&v| v == 5));

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&clear_tensor(
                &tensor,
                ClearParams {
                    offset: 32,
                    size: 16,
                    data: 12,
                    ..ClearParams::default()
                },
            ))
            .unwrap()
            .then(&retrieve_tensor(&tensor, &output, CopyRegion::default()))
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        let expected: [i32; 16] = [5, 5, 5, 5, 5, 5, 5, 5, 12, 12, 12, 12, 5, 5, 5, 5];
        assert_eq!(output.as_slice(), &expected);
    }

    #[test]
    fn builders_are_single_shot() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap();
        let submission = builder.submit().unwrap();

        assert!(matches!(builder.submit(), Err(Error::AlreadySubmitted)));
        assert!(matches!(builder.next_step(), Err(Error::AlreadySubmitted)));
        assert!(matches!(
            builder.print_wait_graph(),
            Err(Error::AlreadySubmitted)
        ));
        submission.wait().unwrap();
    }

    #[test]
    fn implicit_timelines_reject_wait_for() {
        let Some(context) = test_context() else {
            return;
        };
        let mut builder = begin_sequence(&context).unwrap();
        assert!(matches!(
            builder.wait_for(5),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_graph_shows_steps_and_values() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let timeline = Timeline::new(&context).unwrap();
        let mut builder = begin_sequence_on(&timeline, 0).unwrap();
        builder
            .and(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap()
            .then(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap()
            .wait_for(7)
            .unwrap();

        let graph = builder.print_wait_graph().unwrap();
        let id = timeline.id();
        let lines: Vec<&str> = graph.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            format!("Timeline.{id:x}(0) -> [1 commands] -> Timeline.{id:x}(1)")
        );
        assert_eq!(
            lines[1],
            format!("Timeline.{id:x}(1) -> [1 commands] -> Timeline.{id:x}(2)")
        );
        assert_eq!(
            lines[2],
            format!("Timeline.{id:x}(7) -> [0 commands] -> Timeline.{id:x}(8)")
        );

        // Still submittable; the trailing pure wait signals on its own.
        let submission = builder.submit().unwrap();
        timeline.set_value(7).unwrap();
        submission.wait().unwrap();
    }

    #[test]
    fn bare_subroutine_steps_are_regated_by_wait_for() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let output = TypedBuffer::<u32>::new(&context, 4).unwrap();
        let clear = clear_tensor(
            &tensor,
            ClearParams {
                data: 3,
                ..ClearParams::default()
            },
        );
        let subroutine =
            Arc::new(crate::command::create_subroutine(context.clone(), &[&clear], false).unwrap());

        // With no inline command recorded, wait_for rewrites the current
        // step in place, so the subroutine itself waits for the value.
        let timeline = Timeline::new(&context).unwrap();
        let mut builder = begin_sequence_on(&timeline, 0).unwrap();
        builder
            .and_subroutine(&subroutine)
            .unwrap()
            .wait_for(5)
            .unwrap();

        let graph = builder.print_wait_graph().unwrap();
        let id = timeline.id();
        let lines: Vec<&str> = graph.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            format!("Timeline.{id:x}(5) -> [1 commands] -> Timeline.{id:x}(6)")
        );

        let submission = builder.submit().unwrap();
        assert!(!submission.wait_timeout(2_000_000).unwrap());
        timeline.set_value(5).unwrap();
        submission.wait().unwrap();

        execute(
            &context,
            &retrieve_tensor(&tensor, &output, CopyRegion::default()),
        )
        .unwrap();
        assert!(output.as_slice().iter().all(|&v| v == 3));
    }

    #[test]
    fn external_timelines_gate_steps() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        let own = Timeline::new(&context).unwrap();
        let external = Timeline::new(&context).unwrap();

        let mut builder = begin_sequence_on(&own, 0).unwrap();
        builder
            .and(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap()
            .wait_for_timeline(&external, 3)
            .unwrap()
            .and(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap();
        let submission = builder.submit().unwrap();

        // The second step stays pending until the external timeline moves.
        assert!(!submission.wait_timeout(2_000_000).unwrap());
        external.set_value(3).unwrap();
        submission.wait().unwrap();
    }

    #[test]
    fn subroutines_join_sequence_steps() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 32).unwrap();
        let output = TypedBuffer::<u32>::new(&context, 8).unwrap();

        let clear = clear_tensor(
            &tensor,
            ClearParams {
                data: 9,
                ..ClearParams::default()
            },
        );
        let subroutine =
            Arc::new(crate::command::create_subroutine(context.clone(), &[&clear], false).unwrap());

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and_subroutine(&subroutine)
            .unwrap()
            .then(&retrieve_tensor(&tensor, &output, CopyRegion::default()))
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        assert!(output.as_slice().iter().all(|&v| v == 9));
    }

    #[test]
    fn pool_cache_stays_bounded() {
        let Some(context) = test_context() else {
            return;
        };
        let tensor = Tensor::new(&context, 16).unwrap();
        for _ in 0..8 {
            let mut builder = begin_sequence(&context).unwrap();
            builder
                .and(&clear_tensor(&tensor, ClearParams::default()))
                .unwrap();
            let submission = builder.submit().unwrap();
            submission.wait().unwrap();
            drop(submission);
        }
        // Sequential submissions reuse one cached pool.
        assert!(context.sequence_pool_count() <= 1);
    }
}
