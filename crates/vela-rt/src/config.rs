//! Runtime Configuration
//!
//! Heap sizing, GC policy knobs and instance flags. Most parameters
//! have defaults that suit tests and small embeddings; production
//! embedders tune the heap caps.

use crate::error::Error;
use crate::heap::PAGE_BYTES;

/// Instance behavior flags, combined with bitwise or.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceFlags(pub u32);

impl InstanceFlags {
    pub const NONE: InstanceFlags = InstanceFlags(0);
    /// Chatty module loading.
    pub const VERBOSE: InstanceFlags = InstanceFlags(1);
    /// Extra internal consistency checks.
    pub const DEBUG: InstanceFlags = InstanceFlags(2);
    /// Disassemble bytecode as modules are loaded.
    pub const DISASM: InstanceFlags = InstanceFlags(4);
    /// Never collect automatically; only on explicit request.
    pub const MANUAL_GC: InstanceFlags = InstanceFlags(8);
    /// Degrade TAIL.CALL to CALL + RETURN.
    pub const DISABLE_TAIL_CALL: InstanceFlags = InstanceFlags(16);

    pub fn contains(self, other: InstanceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for InstanceFlags {
    type Output = InstanceFlags;

    fn bitor(self, rhs: InstanceFlags) -> InstanceFlags {
        InstanceFlags(self.0 | rhs.0)
    }
}

/// Runtime configuration.
///
/// ```rust
/// use vela_rt::Config;
///
/// let config = Config {
///     max_heap_size: 64 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum bytes of page-backed heap. Allocation past this cap
    /// raises `OutOfMemory` after one forced collection attempt.
    pub max_heap_size: usize,

    /// Maximum bytes of side allocations: large objects, growable
    /// object storage and GC mark groups.
    pub max_malloc_size: usize,

    /// Used-heap level that triggers the first automatic collection.
    pub gc_threshold: usize,

    /// After a collection the next threshold is the surviving heap
    /// size plus this step.
    pub gc_step: usize,

    /// A page whose live bytes fall below this percentage of the page
    /// size has its objects evacuated during a collection.
    pub evac_density_pct: u32,

    /// Object references per mark group.
    pub mark_group_capacity: usize,

    /// Upper bound on GC helper threads. `None` sizes from the CPU
    /// count.
    pub gc_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_heap_size: 256 * 1024 * 1024,
            max_malloc_size: 256 * 1024 * 1024,
            gc_threshold: 4 * 1024 * 1024,
            gc_step: 4 * 1024 * 1024,
            evac_density_pct: 50,
            mark_group_capacity: 64,
            gc_threads: None,
        }
    }
}

impl Config {
    /// Check parameter consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_heap_size < PAGE_BYTES as usize * 2 {
            return Err(Error::Configuration(format!(
                "max_heap_size {} is below two pages",
                self.max_heap_size
            )));
        }
        if self.gc_threshold == 0 || self.gc_step == 0 {
            return Err(Error::Configuration(
                "gc_threshold and gc_step must be non-zero".into(),
            ));
        }
        if self.evac_density_pct > 100 {
            return Err(Error::Configuration(format!(
                "evac_density_pct {} exceeds 100",
                self.evac_density_pct
            )));
        }
        if self.mark_group_capacity == 0 {
            return Err(Error::Configuration("mark_group_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Number of helper threads a collection may spawn.
    pub fn helper_threads(&self) -> usize {
        match self.gc_threads {
            Some(n) => n.min(16),
            None => num_cpus::get().saturating_sub(1).clamp(1, 8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_heap_rejected() {
        let config = Config { max_heap_size: 1024, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_density_rejected() {
        let config = Config { evac_density_pct: 101, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flags_combine() {
        let flags = InstanceFlags::VERBOSE | InstanceFlags::MANUAL_GC;
        assert!(flags.contains(InstanceFlags::VERBOSE));
        assert!(flags.contains(InstanceFlags::MANUAL_GC));
        assert!(!flags.contains(InstanceFlags::DISASM));
    }
}
