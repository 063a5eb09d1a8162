/*!
 * Integrity Checker
 *
 * Consistency scan of a general heap, run around mutating calls when enabled.
 * Findings go to an injected `IntegrityReporter`; the configured policy decides
 * whether an "entering" failure stops the call.
 */

use super::config::IntegrityPolicy;
use super::heap::HeapState;
use super::types::{BlockKind, CheckPhase, MemoryError, MemoryResult};
use crate::core::limits::BLOCK_ALIGNMENT;
use crate::core::types::{Address, HeapId, Size};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of inconsistency found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCode {
    /// Block or free run outside the heap frontier
    OutOfBounds,
    Misaligned,
    /// Reserved bytes smaller than the payload
    BadExtent,
    /// Two regions claim the same bytes
    Overlap,
    /// Header points at another heap, or at none
    HeapBackReference,
    /// Live master pointer whose target is not its block
    DanglingMaster,
    /// Live-byte accounting disagrees with the block table
    Accounting,
}

impl IntegrityCode {
    pub fn code(self) -> i32 {
        match self {
            IntegrityCode::OutOfBounds => 1,
            IntegrityCode::Misaligned => 2,
            IntegrityCode::BadExtent => 3,
            IntegrityCode::Overlap => 4,
            IntegrityCode::HeapBackReference => 5,
            IntegrityCode::DanglingMaster => 6,
            IntegrityCode::Accounting => 7,
        }
    }
}

/// First inconsistency of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFault {
    pub code: IntegrityCode,
    pub address: Address,
}

/// What a reporter receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub heap: HeapId,
    pub phase: CheckPhase,
    pub code: IntegrityCode,
    pub address: Address,
}

/// Receiver of integrity reports
///
/// Called with the heap locked: implementations must not call back into the
/// memory manager.
pub trait IntegrityReporter: Send + Sync {
    fn report(&self, report: &IntegrityReport);
}

/// Default reporter: log through tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl IntegrityReporter for TracingReporter {
    fn report(&self, report: &IntegrityReport) {
        tracing::error!(
            heap = report.heap,
            phase = %report.phase,
            code = report.code.code(),
            address = format_args!("0x{:x}", report.address),
            "Heap integrity check failed"
        );
    }
}

/// Scan one general heap; `Ok` when consistent
pub(crate) fn scan(heap: &HeapState) -> Result<(), IntegrityFault> {
    let fault = |code, address| Err(IntegrityFault { code, address });
    let frontier = heap.arena.len();

    // (start offset, end offset, address reported on overlap)
    let mut regions: Vec<(Size, Size, Address)> =
        Vec::with_capacity(heap.blocks.len() + heap.free_list.len());
    let mut reserved_total: Size = 0;

    for (&address, header) in &heap.blocks {
        if address < heap.base || address - heap.base + header.reserved() > frontier {
            return fault(IntegrityCode::OutOfBounds, address);
        }
        let offset = address - heap.base;
        if offset % BLOCK_ALIGNMENT != 0 {
            return fault(IntegrityCode::Misaligned, address);
        }
        if header.reserved() < header.size() {
            return fault(IntegrityCode::BadExtent, address);
        }
        if header.heap() != Some(heap.id) {
            return fault(IntegrityCode::HeapBackReference, address);
        }
        if header.kind() == BlockKind::Handle {
            if let Some(slot) = header.master() {
                let owned = heap
                    .masters
                    .get(slot as usize)
                    .map_or(false, |m| m.live && m.target == Some(address));
                if !owned {
                    return fault(IntegrityCode::DanglingMaster, address);
                }
            }
        }
        reserved_total += header.reserved();
        regions.push((offset, offset + header.reserved(), address));
    }

    for free in heap.free_list.iter() {
        if free.end() > frontier {
            return fault(IntegrityCode::OutOfBounds, heap.base + free.offset);
        }
        regions.push((free.offset, free.end(), heap.base + free.offset));
    }

    regions.sort_unstable_by_key(|r| r.0);
    for pair in regions.windows(2) {
        if pair[1].0 < pair[0].1 {
            return fault(IntegrityCode::Overlap, pair[1].2);
        }
    }

    for (slot, master) in heap.masters.iter().enumerate() {
        let Some(target) = master.target.filter(|_| master.live) else {
            continue;
        };
        let attached = heap
            .blocks
            .get(&target)
            .map_or(false, |h| h.master() == Some(slot as u32));
        if !attached {
            return fault(IntegrityCode::DanglingMaster, target);
        }
    }

    if reserved_total != heap.reserved_live {
        return fault(IntegrityCode::Accounting, heap.base);
    }
    Ok(())
}

/// Gated integrity scanner
pub struct IntegrityChecker {
    enabled: AtomicBool,
    policy: RwLock<IntegrityPolicy>,
    reporter: RwLock<Arc<dyn IntegrityReporter>>,
    scans: AtomicU64,
    failures: AtomicU64,
}

impl IntegrityChecker {
    pub fn new(enabled: bool, policy: IntegrityPolicy) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            policy: RwLock::new(policy),
            reporter: RwLock::new(Arc::new(TracingReporter)),
            scans: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn policy(&self) -> IntegrityPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: IntegrityPolicy) {
        *self.policy.write() = policy;
    }

    pub fn set_reporter(&self, reporter: Arc<dyn IntegrityReporter>) {
        *self.reporter.write() = reporter;
    }

    /// Number of scans run so far
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Number of scans that found corruption
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Scan `heap` at `phase`
    ///
    /// Returns `HeapCorrupted` only for an "entering" failure under
    /// `IntegrityPolicy::Abort`; every other outcome lets the call proceed.
    pub(crate) fn check(&self, heap: &HeapState, phase: CheckPhase) -> MemoryResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.scans.fetch_add(1, Ordering::Relaxed);

        let Err(fault) = scan(heap) else {
            return Ok(());
        };
        self.failures.fetch_add(1, Ordering::Relaxed);

        let report = IntegrityReport {
            heap: heap.id,
            phase,
            code: fault.code,
            address: fault.address,
        };
        let reporter = self.reporter.read().clone();
        reporter.report(&report);

        if phase == CheckPhase::Entering && self.policy() == IntegrityPolicy::Abort {
            return Err(MemoryError::HeapCorrupted {
                heap: heap.id,
                phase,
                code: fault.code.code(),
                address: fault.address,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("enabled", &self.is_enabled())
            .field("policy", &self.policy())
            .field("scans", &self.scans())
            .field("failures", &self.failures())
            .finish()
    }
}
