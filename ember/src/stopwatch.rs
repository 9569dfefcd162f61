//! GPU timestamp stopwatch.

use ash::vk;

use crate::command::{Command, CommandRecorder};
use crate::context::ContextHandle;
use crate::error::{invalid_argument, Error, Result};

/// Measures device time spans with a timestamp query pool.
///
/// One `start` timestamp is written on TOP_OF_PIPE and up to `stops`
/// additional ones on BOTTOM_OF_PIPE; all commands are embedded into the
/// same sequences as the work they measure.
pub struct StopWatch {
    context: ContextHandle,
    query_pool: vk::QueryPool,
    count: u32,
    valid_bits: u32,
    period: f32,
}

impl StopWatch {
    pub fn new(context: &ContextHandle) -> Result<Self> {
        Self::with_stops(context, 1)
    }

    pub fn with_stops(context: &ContextHandle, stops: u32) -> Result<Self> {
        if stops == 0 {
            return Err(invalid_argument("a stopwatch needs at least one stop"));
        }
        let count = stops + 1;

        let instance = &context.instance.raw;
        let props = unsafe { instance.get_physical_device_properties(context.physical_device) };
        let families = unsafe {
            instance.get_physical_device_queue_family_properties(context.physical_device)
        };
        let valid_bits = families[context.queue_family as usize].timestamp_valid_bits;
        if valid_bits == 0 {
            return Err(invalid_argument(
                "the device queue does not support timestamps",
            ));
        }

        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        let query_pool = unsafe { context.device.create_query_pool(&info, None) }
            .map_err(Error::from)?;
        // Pools start in an undefined state and need one reset up front.
        unsafe { context.device.reset_query_pool(query_pool, 0, count) };

        Ok(Self {
            context: context.clone(),
            query_pool,
            count,
            valid_bits,
            period: props.limits.timestamp_period,
        })
    }

    /// Command writing the start timestamp.
    pub fn start(&self) -> TimestampCommand<'_> {
        TimestampCommand {
            watch: self,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            query: 0,
        }
    }

    /// Command writing the first stop timestamp.
    pub fn stop(&self) -> TimestampCommand<'_> {
        TimestampCommand {
            watch: self,
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            query: 1,
        }
    }

    /// Command writing stop number `index`.
    pub fn stop_at(&self, index: u32) -> Result<TimestampCommand<'_>> {
        if index + 1 >= self.count {
            return Err(invalid_argument(format!(
                "stop {index} is out of range, the stopwatch has {} stops",
                self.count - 1
            )));
        }
        Ok(TimestampCommand {
            watch: self,
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            query: index + 1,
        })
    }

    /// Host-side reset; the previous values become undefined.
    pub fn reset(&self) {
        unsafe {
            self.context
                .device
                .reset_query_pool(self.query_pool, 0, self.count)
        };
    }

    /// Timestamps in nanoseconds, `NaN` where a stop is unavailable.
    ///
    /// Masks to the queue's valid timestamp bits and scales by the
    /// device's tick period. With `wait` set, blocks until all written
    /// timestamps become available.
    pub fn timestamps(&self, wait: bool) -> Result<Vec<f64>> {
        #[repr(C)]
        #[derive(Clone, Copy, Default)]
        struct QuerySlot {
            ticks: u64,
            available: u64,
        }

        let mut flags = vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY;
        if wait {
            flags |= vk::QueryResultFlags::WAIT;
        }
        let mut slots = vec![QuerySlot::default(); self.count as usize];
        let fetched = unsafe {
            self.context
                .device
                .get_query_pool_results(self.query_pool, 0, &mut slots, flags)
        };
        match fetched {
            Ok(()) | Err(vk::Result::NOT_READY) => {}
            Err(err) => return Err(err.into()),
        }

        let mask = if self.valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.valid_bits) - 1
        };
        Ok(slots
            .iter()
            .map(|slot| {
                if slot.available != 0 {
                    (slot.ticks & mask) as f64 * self.period as f64
                } else {
                    f64::NAN
                }
            })
            .collect())
    }
}

impl Drop for StopWatch {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_query_pool(self.query_pool, None);
        }
    }
}

impl std::fmt::Debug for StopWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopWatch")
            .field("stops", &(self.count - 1))
            .finish()
    }
}

/// Writes one timestamp into the owning stopwatch's query pool.
pub struct TimestampCommand<'a> {
    watch: &'a StopWatch,
    stage: vk::PipelineStageFlags,
    query: u32,
}

impl Command for TimestampCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(&self.watch.context)?;
        cmd.stage_mask |= self.stage;
        unsafe {
            cmd.context.device.cmd_write_timestamp(
                cmd.buffer,
                self.stage,
                self.watch.query_pool,
                self.query,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{clear_tensor, ClearParams, Tensor};
    use crate::sequence::begin_sequence;
    use crate::testing::test_context;

    #[test]
    fn measures_a_submission() {
        let Some(context) = test_context() else {
            return;
        };
        let watch = StopWatch::new(&context).unwrap();
        let tensor = Tensor::new(&context, 256).unwrap();

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&watch.start())
            .unwrap()
            .and(&clear_tensor(&tensor, ClearParams::default()))
            .unwrap()
            .and(&watch.stop())
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        let stamps = watch.timestamps(true).unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps.iter().all(|v| v.is_finite()));
        assert!(stamps[1] >= stamps[0]);
    }

    #[test]
    fn unwritten_stops_read_as_nan() {
        let Some(context) = test_context() else {
            return;
        };
        let watch = StopWatch::with_stops(&context, 2).unwrap();
        let mut builder = begin_sequence(&context).unwrap();
        builder.and(&watch.start()).unwrap();
        builder.submit().unwrap().wait().unwrap();

        let stamps = watch.timestamps(false).unwrap();
        assert_eq!(stamps.len(), 3);
        assert!(stamps[0].is_finite());
        assert!(stamps[1].is_nan());
        assert!(stamps[2].is_nan());

        assert!(watch.stop_at(2).is_err());
    }
}
