//! Returning unused cached memory to the operating system.
//!
//! Each partition with `min_capacity < max_capacity` runs one uncommitter
//! thread. A cycle starts once `uncommit_delay` has passed since the last
//! capacity increase. It uncommits at most the cache's low watermark since
//! the previous cycle, never going below `max(used, min_capacity)`, in
//! chunks of about 1/128 of the max capacity. Chunks are paced so that the
//! cycle's work is spread over the delay window. A capacity increase
//! cancels the running cycle.

use std::time::{Duration, Instant};

use rand::Rng;

use super::Shared;
use crate::globals::{align_down, align_up};

/// Longest random delay added to the next cycle start.
const MAX_JITTER: Duration = Duration::from_secs(1);

/// Pause before the next chunk so that `remaining` bytes finish by the end
/// of the window.
///
/// `uncommitted` bytes took `work_time` so far; `time_left` is what is left
/// of the window. The slack beyond the estimated work time is divided evenly
/// between the remaining chunks.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn uncommit_pause(
    uncommitted: usize,
    work_time: Duration,
    time_left: Duration,
    remaining: usize,
    chunk: usize,
) -> Duration {
    if remaining == 0 || uncommitted == 0 || chunk == 0 {
        return Duration::ZERO;
    }

    let seconds = work_time.as_secs_f64().max(f64::EPSILON);
    let rate = uncommitted as f64 / seconds;
    let needed = Duration::from_secs_f64(remaining as f64 / rate);

    let Some(slack) = time_left.checked_sub(needed) else {
        return Duration::ZERO;
    };

    let chunks = remaining.div_ceil(chunk).min(u32::MAX as usize) as u32;
    slack / chunks
}

/// Random jitter in `[0, min(1s, delay))`.
fn jitter(rng: &mut impl Rng, delay: Duration) -> Duration {
    let max = delay.min(MAX_JITTER);
    if max.is_zero() {
        Duration::ZERO
    } else {
        rng.gen_range(Duration::ZERO..max)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Finished,
    Cancelled(Instant),
    Stopped,
}

impl Shared {
    /// Uncommitter thread body for partition `numa_id`.
    pub(crate) fn run_uncommitter(&self, numa_id: usize) {
        let delay = self.config.uncommit_delay;
        let mut rng = rand::thread_rng();
        let mut next_cycle = self.state.lock().partitions[numa_id].last_commit + delay;

        while let Some(epoch) = self.wait_for_uncommit_cycle(numa_id, next_cycle) {
            let cycle_start = Instant::now();
            let end = match epoch {
                Some(epoch) => self.uncommit_cycle(numa_id, epoch, cycle_start),
                None => CycleEnd::Finished,
            };

            next_cycle = match end {
                CycleEnd::Stopped => return,
                CycleEnd::Cancelled(at) => at + delay,
                CycleEnd::Finished => {
                    let last_commit = self.state.lock().partitions[numa_id].last_commit;
                    let now = Instant::now();
                    let base = if last_commit + delay > now {
                        last_commit + delay
                    } else {
                        now + delay
                    };
                    base + jitter(&mut rng, delay)
                }
            };
        }
    }

    /// Sleeps until `next_cycle`, pushed out by capacity increases, then
    /// starts a cycle.
    ///
    /// Returns `None` on shutdown, `Some(None)` if there was nothing to
    /// uncommit and `Some(Some(epoch))` for a started cycle.
    fn wait_for_uncommit_cycle(&self, numa_id: usize, next_cycle: Instant) -> Option<Option<u64>> {
        let delay = self.config.uncommit_delay;
        let partition = &self.partitions[numa_id];

        let mut state = self.state.lock();
        loop {
            if state.stop {
                return None;
            }

            let eligible = next_cycle.max(state.partitions[numa_id].last_commit + delay);
            if Instant::now() >= eligible {
                break;
            }
            self.uncommit_wakeup.wait_until(&mut state, eligible);
        }

        let floor = partition.used().max(partition.min_capacity());
        let pstate = &mut state.partitions[numa_id];
        let to_uncommit = pstate
            .cache
            .min_size_watermark()
            .min(partition.capacity().saturating_sub(floor));
        pstate.cache.reset_min_size_watermark();

        if to_uncommit == 0 {
            return Some(None);
        }
        Some(Some(pstate.uncommit.start(to_uncommit)))
    }

    fn uncommit_cycle(&self, numa_id: usize, epoch: u64, cycle_start: Instant) -> CycleEnd {
        let partition = &self.partitions[numa_id];
        let granule = self.config.granule_size;
        let delay = self.config.uncommit_delay;
        let chunk = align_up(partition.current_max_capacity() >> 7, granule).max(granule);

        let mut work_time = Duration::ZERO;
        let mut flushed_ranges = Vec::new();
        let mut kept_ranges = Vec::new();

        loop {
            // Take a chunk out of the cache
            let flushed = {
                let mut state = self.state.lock();
                if state.stop {
                    return CycleEnd::Stopped;
                }

                let floor = partition.used().max(partition.min_capacity());
                let limit = partition
                    .capacity()
                    .saturating_sub(partition.claimed())
                    .saturating_sub(floor);

                let pstate = &mut state.partitions[numa_id];
                if pstate.uncommit.epoch() != epoch {
                    let at = pstate.uncommit.cancel_time().unwrap_or_else(Instant::now);
                    crate::tracing::internal::log_uncommit_cycle_end(
                        numa_id,
                        pstate.uncommit.uncommitted(),
                        true,
                    );
                    return CycleEnd::Cancelled(at);
                }

                let size = chunk.min(pstate.uncommit.remaining()).min(limit);
                let flushed = if size == 0 {
                    0
                } else {
                    pstate.cache.remove_from_min(size, &mut flushed_ranges)
                };

                if flushed == 0 {
                    pstate.uncommit.finish();
                    crate::tracing::internal::log_uncommit_cycle_end(
                        numa_id,
                        pstate.uncommit.uncommitted(),
                        false,
                    );
                    return CycleEnd::Finished;
                }

                partition.increase_claimed(flushed);
                flushed
            };

            let work_start = Instant::now();
            let mut released = 0;
            for vmem in flushed_ranges.drain(..) {
                self.pmm.unmap(vmem);
                let done = align_down(self.pmm.uncommit(vmem), granule);
                if done > 0 {
                    let freed = vmem.first_part(done);
                    self.pmm.free(freed, numa_id);
                    self.vmm.free(freed);
                    released += done;
                }
                if done < vmem.size() {
                    // Still backed, so it goes back to the cache
                    let kept = vmem.last_part(done);
                    self.pmm.map(kept);
                    kept_ranges.push(kept);
                }
            }
            work_time += work_start.elapsed();

            let (uncommitted, remaining) = {
                let mut state = self.state.lock();
                let pstate = &mut state.partitions[numa_id];
                for vmem in kept_ranges.drain(..) {
                    pstate.cache.insert(vmem);
                }
                partition.decrease_claimed(flushed);
                partition.decrease_capacity(released, false);

                let cycle = &mut pstate.uncommit;
                if cycle.epoch() == epoch {
                    cycle.record(released);
                }
                (cycle.uncommitted(), cycle.remaining())
            };
            crate::tracing::internal::log_uncommit_chunk(numa_id, released, remaining);

            // The backend refused part of the chunk; retry next cycle
            if released < flushed {
                crate::tracing::internal::log_uncommit_failed(numa_id, flushed - released);
                let mut state = self.state.lock();
                let cycle = &mut state.partitions[numa_id].uncommit;
                if cycle.epoch() == epoch {
                    cycle.finish();
                    crate::tracing::internal::log_uncommit_cycle_end(
                        numa_id,
                        cycle.uncommitted(),
                        false,
                    );
                    return CycleEnd::Finished;
                }
                continue;
            }

            let window_end = cycle_start + delay;
            let time_left = window_end.saturating_duration_since(Instant::now());
            let pause = uncommit_pause(uncommitted, work_time, time_left, remaining, chunk);
            if !pause.is_zero() {
                self.pause_uncommit(numa_id, epoch, pause);
            }
        }
    }

    /// Sleeps for `pause` unless the cycle is cancelled or the allocator
    /// stops first.
    fn pause_uncommit(&self, numa_id: usize, epoch: u64, pause: Duration) {
        let deadline = Instant::now() + pause;
        let mut state = self.state.lock();
        while !state.stop && state.partitions[numa_id].uncommit.epoch() == epoch {
            if self.uncommit_wakeup.wait_until(&mut state, deadline).timed_out() {
                return;
            }
        }
    }
}
