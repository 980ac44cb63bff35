//! Heap configuration.

use std::time::Duration;

use crate::address::{MAX_HEAP_BASE_SHIFT, MIN_HEAP_BASE_SHIFT};
use crate::error::HeapError;
use crate::globals::{align_up, DEFAULT_GRANULE_SIZE, M};

/// Default floor the uncommitter never shrinks below.
pub const DEFAULT_MIN_CAPACITY: usize = 8 * M;
/// Default capacity committed at startup.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16 * M;
/// Default hard ceiling.
pub const DEFAULT_MAX_CAPACITY: usize = 256 * M;
/// Default virtual over-reservation factor.
pub const DEFAULT_VIRTUAL_TO_PHYSICAL_RATIO: usize = 16;
/// Default delay between the last capacity increase and uncommitting.
pub const DEFAULT_UNCOMMIT_DELAY: Duration = Duration::from_secs(300);
/// Default unmapper byte budget, as a percentage of the max capacity.
pub const DEFAULT_ASYNC_UNMAPPING_LIMIT_PERCENT: usize = 100;
/// Default relocation fragmentation limit.
pub const DEFAULT_FRAGMENTATION_LIMIT_PERCENT: f64 = 25.0;

/// Startup configuration of the page allocator.
///
/// Sizes are rounded up to the granule size by [`HeapConfig::normalized`],
/// which the allocator applies before use.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Capacity the uncommitter never shrinks below.
    pub min_capacity: usize,
    /// Capacity committed and cached at startup.
    pub initial_capacity: usize,
    /// Hard capacity ceiling.
    pub max_capacity: usize,
    /// Advisory ceiling reported to the collection driver.
    pub soft_max_capacity: usize,
    /// Number of NUMA partitions.
    pub numa_nodes: usize,
    /// Allocation and alignment unit, a power of two.
    pub granule_size: usize,
    /// Virtual address space reserved per byte of max capacity.
    pub virtual_to_physical_ratio: usize,
    /// Whether cached memory is returned to the operating system.
    pub uncommit: bool,
    /// Delay after the last capacity increase before uncommitting.
    pub uncommit_delay: Duration,
    /// Unmapper queue budget, as a percentage of the max capacity.
    pub async_unmapping_limit_percent: usize,
    /// Minimum reclaimable garbage, in percent, for relocation candidates.
    pub fragmentation_limit_percent: f64,
    /// Heap base shift override. Probed when `None`.
    pub heap_base_shift: Option<u32>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_capacity: DEFAULT_MIN_CAPACITY,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
            soft_max_capacity: DEFAULT_MAX_CAPACITY,
            numa_nodes: 1,
            granule_size: DEFAULT_GRANULE_SIZE,
            virtual_to_physical_ratio: DEFAULT_VIRTUAL_TO_PHYSICAL_RATIO,
            uncommit: true,
            uncommit_delay: DEFAULT_UNCOMMIT_DELAY,
            async_unmapping_limit_percent: DEFAULT_ASYNC_UNMAPPING_LIMIT_PERCENT,
            fragmentation_limit_percent: DEFAULT_FRAGMENTATION_LIMIT_PERCENT,
            heap_base_shift: None,
        }
    }
}

impl HeapConfig {
    /// Sets min, initial and max capacity at once. The soft max follows the
    /// max.
    #[must_use]
    pub const fn with_capacities(mut self, min: usize, initial: usize, max: usize) -> Self {
        self.min_capacity = min;
        self.initial_capacity = initial;
        self.max_capacity = max;
        self.soft_max_capacity = max;
        self
    }

    /// Sets the soft max capacity.
    #[must_use]
    pub const fn with_soft_max_capacity(mut self, soft_max: usize) -> Self {
        self.soft_max_capacity = soft_max;
        self
    }

    /// Sets the number of NUMA partitions.
    #[must_use]
    pub const fn with_numa_nodes(mut self, nodes: usize) -> Self {
        self.numa_nodes = nodes;
        self
    }

    /// Sets the granule size.
    #[must_use]
    pub const fn with_granule_size(mut self, granule: usize) -> Self {
        self.granule_size = granule;
        self
    }

    /// Sets the virtual over-reservation factor.
    #[must_use]
    pub const fn with_virtual_to_physical_ratio(mut self, ratio: usize) -> Self {
        self.virtual_to_physical_ratio = ratio;
        self
    }

    /// Enables or disables uncommitting.
    #[must_use]
    pub const fn with_uncommit(mut self, uncommit: bool) -> Self {
        self.uncommit = uncommit;
        self
    }

    /// Sets the uncommit delay.
    #[must_use]
    pub const fn with_uncommit_delay(mut self, delay: Duration) -> Self {
        self.uncommit_delay = delay;
        self
    }

    /// Sets the unmapper byte budget percentage.
    #[must_use]
    pub const fn with_async_unmapping_limit_percent(mut self, percent: usize) -> Self {
        self.async_unmapping_limit_percent = percent;
        self
    }

    /// Sets the relocation fragmentation limit.
    #[must_use]
    pub const fn with_fragmentation_limit_percent(mut self, percent: f64) -> Self {
        self.fragmentation_limit_percent = percent;
        self
    }

    /// Overrides the probed heap base shift.
    #[must_use]
    pub const fn with_heap_base_shift(mut self, shift: u32) -> Self {
        self.heap_base_shift = Some(shift);
        self
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] describing the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |msg: String| Err(HeapError::InvalidConfig(msg));

        if !self.granule_size.is_power_of_two() {
            return invalid(format!(
                "granule size {} is not a power of two",
                self.granule_size
            ));
        }
        if self.granule_size < sys_alloc::allocation_granularity() {
            return invalid(format!(
                "granule size {} is smaller than the system allocation granularity",
                self.granule_size
            ));
        }
        if self.numa_nodes == 0 {
            return invalid("at least one NUMA node is required".into());
        }
        if self.max_capacity == 0 {
            return invalid("max capacity must be non-zero".into());
        }
        if self.min_capacity > self.initial_capacity {
            return invalid(format!(
                "min capacity {} exceeds initial capacity {}",
                self.min_capacity, self.initial_capacity
            ));
        }
        if self.initial_capacity > self.max_capacity {
            return invalid(format!(
                "initial capacity {} exceeds max capacity {}",
                self.initial_capacity, self.max_capacity
            ));
        }
        if self.soft_max_capacity > self.max_capacity {
            return invalid(format!(
                "soft max capacity {} exceeds max capacity {}",
                self.soft_max_capacity, self.max_capacity
            ));
        }
        if self.virtual_to_physical_ratio == 0 {
            return invalid("virtual to physical ratio must be non-zero".into());
        }
        if !(0.0..=100.0).contains(&self.fragmentation_limit_percent) {
            return invalid(format!(
                "fragmentation limit {} is not a percentage",
                self.fragmentation_limit_percent
            ));
        }
        if self.async_unmapping_limit_percent > 100 {
            return invalid(format!(
                "async unmapping limit {} is not a percentage",
                self.async_unmapping_limit_percent
            ));
        }
        if let Some(shift) = self.heap_base_shift {
            if !(MIN_HEAP_BASE_SHIFT..=MAX_HEAP_BASE_SHIFT).contains(&shift) {
                return invalid(format!("heap base shift {shift} is out of range"));
            }
        }

        Ok(())
    }

    /// Returns a copy with every capacity rounded up to the granule size and
    /// with enough max capacity for one granule per NUMA node.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let granule = self.granule_size;
        let per_node = granule * self.numa_nodes.max(1);

        let max_capacity = align_up(self.max_capacity, granule).max(per_node);
        let initial_capacity = align_up(self.initial_capacity, granule).min(max_capacity);
        let min_capacity = align_up(self.min_capacity, granule).min(initial_capacity);
        let soft_max_capacity = align_up(self.soft_max_capacity, granule).min(max_capacity);

        Self {
            min_capacity,
            initial_capacity,
            max_capacity,
            soft_max_capacity,
            ..self.clone()
        }
    }
}
