//! Collection Statistics
//!
//! Filled into the caller's struct by `collect_garbage`. Sizes are
//! logical bytes; timings are per-phase microseconds.

/// Statistics for one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub num_objs_evacuated: u32,
    pub num_objs_freed: u32,
    pub num_objs_finalized: u32,
    pub num_pages_kept: u32,
    pub num_pages_freed: u32,

    pub size_evacuated: u32,
    pub size_freed: u32,
    pub size_kept: u32,

    pub initial_heap_size: u32,
    pub initial_used_heap_size: u32,
    pub initial_malloc_size: u32,
    pub heap_size: u32,
    pub used_heap_size: u32,
    pub malloc_size: u32,

    pub time_stop_us: u32,
    pub time_mark_us: u32,
    pub time_evac_us: u32,
    pub time_update_us: u32,
    pub time_finish_us: u32,
    pub time_total_us: u32,
}

impl GcStats {
    /// Bytes reclaimed by the cycle.
    pub fn reclaimed(&self) -> u32 {
        self.initial_used_heap_size.saturating_sub(self.used_heap_size)
    }
}
