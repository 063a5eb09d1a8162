/*!
 * Memory Manager Configuration
 *
 * Runtime configuration for the manager and for individual heaps.
 * Values come from defaults, JSON documents or environment variables.
 */

use crate::core::limits::{
    DEFAULT_BOOT_POOL_SIZE, DEFAULT_HEAP_SIZE, PRESSURE_CRITICAL, PRESSURE_MEDIUM,
    PRESSURE_WARNING,
};
use crate::core::types::{HeapId, Size};
use serde::{Deserialize, Serialize};

/// What happens when the integrity checker finds a smashed heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// Report and refuse to run the operation ("entering" failures only)
    Abort,
    /// Report and carry on
    Report,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            IntegrityPolicy::Abort
        } else {
            IntegrityPolicy::Report
        }
    }
}

/// How `free_ptr` treats the per-thread last-error slot on success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorResetPolicy {
    /// Leave the slot as the previous call left it
    #[default]
    Preserve,
    /// Reset the slot to `NoErr` after every successful free
    ResetOnFree,
}

/// Memory manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Run the heap integrity scan around mutating calls
    pub integrity_checks: bool,
    pub integrity_policy: IntegrityPolicy,
    pub error_reset_policy: ErrorResetPolicy,
    /// Stamp new blocks with a call-site hash as their debug name
    pub debug_names: bool,
    /// Capacity of the general heap created at startup
    pub default_heap_size: Size,
    /// Give the startup heap a semaphore
    pub default_heap_semaphore: bool,
    /// Capacity of the boot pool used before `start()`
    pub boot_pool_size: Size,
    /// Consider the OS running as soon as the manager exists
    pub start_running: bool,
    /// Heap usage ratio logged as medium pressure
    pub medium_threshold: f64,
    /// Heap usage ratio logged as a warning
    pub warning_threshold: f64,
    /// Heap usage ratio logged as critical
    pub critical_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            integrity_checks: cfg!(debug_assertions),
            integrity_policy: IntegrityPolicy::default(),
            error_reset_policy: ErrorResetPolicy::default(),
            debug_names: cfg!(debug_assertions),
            default_heap_size: DEFAULT_HEAP_SIZE,
            default_heap_semaphore: true,
            boot_pool_size: DEFAULT_BOOT_POOL_SIZE,
            start_running: true,
            medium_threshold: PRESSURE_MEDIUM,
            warning_threshold: PRESSURE_WARNING,
            critical_threshold: PRESSURE_CRITICAL,
        }
    }
}

impl MemoryConfig {
    /// Every check on, corruption aborts the call
    pub const fn debug() -> Self {
        Self {
            integrity_checks: true,
            integrity_policy: IntegrityPolicy::Abort,
            error_reset_policy: ErrorResetPolicy::Preserve,
            debug_names: true,
            default_heap_size: DEFAULT_HEAP_SIZE,
            default_heap_semaphore: true,
            boot_pool_size: DEFAULT_BOOT_POOL_SIZE,
            start_running: true,
            medium_threshold: PRESSURE_MEDIUM,
            warning_threshold: PRESSURE_WARNING,
            critical_threshold: PRESSURE_CRITICAL,
        }
    }

    /// No scans, no call-site hashing
    pub const fn release() -> Self {
        Self {
            integrity_checks: false,
            integrity_policy: IntegrityPolicy::Report,
            error_reset_policy: ErrorResetPolicy::Preserve,
            debug_names: false,
            default_heap_size: DEFAULT_HEAP_SIZE,
            default_heap_semaphore: true,
            boot_pool_size: DEFAULT_BOOT_POOL_SIZE,
            start_running: true,
            medium_threshold: PRESSURE_MEDIUM,
            warning_threshold: PRESSURE_WARNING,
            critical_threshold: PRESSURE_CRITICAL,
        }
    }

    pub fn with_heap_size(mut self, size: Size) -> Self {
        self.default_heap_size = size;
        self
    }

    pub fn with_integrity(mut self, enabled: bool, policy: IntegrityPolicy) -> Self {
        self.integrity_checks = enabled;
        self.integrity_policy = policy;
        self
    }

    pub fn with_error_reset(mut self, policy: ErrorResetPolicy) -> Self {
        self.error_reset_policy = policy;
        self
    }

    /// Start in boot mode: pointers come from the boot pool until `start()`
    pub fn booting(mut self) -> Self {
        self.start_running = false;
        self
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Defaults overridden by environment variables
    ///
    /// - NEWTON_MEMORY_INTEGRITY: off | report | abort
    /// - NEWTON_MEMORY_HEAP_SIZE: startup heap capacity in bytes
    /// - NEWTON_MEMORY_DEBUG_NAMES: 1/true to hash call sites
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("NEWTON_MEMORY_INTEGRITY") {
            match mode.to_ascii_lowercase().as_str() {
                "off" | "0" | "false" => config.integrity_checks = false,
                "report" => {
                    config.integrity_checks = true;
                    config.integrity_policy = IntegrityPolicy::Report;
                }
                "abort" => {
                    config.integrity_checks = true;
                    config.integrity_policy = IntegrityPolicy::Abort;
                }
                other => tracing::warn!(value = %other, "Ignoring unknown NEWTON_MEMORY_INTEGRITY"),
            }
        }

        if let Some(size) = std::env::var("NEWTON_MEMORY_HEAP_SIZE")
            .ok()
            .and_then(|v| v.parse::<Size>().ok())
        {
            config.default_heap_size = size;
        }

        if let Ok(v) = std::env::var("NEWTON_MEMORY_DEBUG_NAMES") {
            config.debug_names = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Configuration for one heap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapConfig {
    pub capacity: Size,
    /// Use the non-relocating safe pool
    pub safe: bool,
    /// Serialize mutations through a semaphore
    pub semaphore: bool,
    /// Heap receiving handles allocated while this heap is current (itself by default)
    pub relocation_heap: Option<HeapId>,
}

impl HeapConfig {
    pub fn new(capacity: Size) -> Self {
        Self {
            capacity,
            safe: false,
            semaphore: false,
            relocation_heap: None,
        }
    }

    pub fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    pub fn with_semaphore(mut self) -> Self {
        self.semaphore = true;
        self
    }

    pub fn relocating_into(mut self, heap: HeapId) -> Self {
        self.relocation_heap = Some(heap);
        self
    }
}
