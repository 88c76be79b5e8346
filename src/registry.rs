//! Process-wide registry of physical CPU records.
//!
//! One entry exists per hardware thread, created at boot and never
//! destroyed. Each CPU's thread of control claims its own entry exactly
//! once and keeps an exclusive handle to it; no implicit "current CPU"
//! lookup exists anywhere in the crate, identity is passed explicitly.
//! The registry also carries the only cross-CPU control state: the park
//! wake word, deactivation requests, and the withdrawn-from-service mark.

use alloc::vec::Vec;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};

/// Why a parked CPU was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A cell has been assigned to this CPU.
    NewCell,
    /// Host-wide shutdown or reset.
    Shutdown,
}

const WAKE_NONE: u8 = 0;
const WAKE_NEW_CELL: u8 = 1;
const WAKE_SHUTDOWN: u8 = 2;

struct CpuEntry {
    claimed: AtomicBool,
    wake: AtomicU8,
    deactivate: AtomicBool,
    withdrawn: AtomicBool,
}

impl CpuEntry {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            wake: AtomicU8::new(WAKE_NONE),
            deactivate: AtomicBool::new(false),
            withdrawn: AtomicBool::new(false),
        }
    }
}

/// The process-wide table of per-CPU records.
pub struct CpuRegistry {
    entries: Vec<CpuEntry>,
}

impl CpuRegistry {
    /// Creates a registry for `num_cpus` hardware threads.
    ///
    /// `num_cpus` is bounded by the width of a CPU bitmask.
    pub fn new(num_cpus: usize) -> Self {
        assert!(num_cpus <= usize::BITS as usize, "too many CPUs for one mask");
        let mut entries = Vec::with_capacity(num_cpus);
        entries.resize_with(num_cpus, CpuEntry::new);
        Self { entries }
    }

    /// Number of registered CPUs.
    pub fn num_cpus(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, cpu_id: usize) -> AxResult<&CpuEntry> {
        match self.entries.get(cpu_id) {
            Some(entry) => Ok(entry),
            None => ax_err!(InvalidInput, "cpu id out of range"),
        }
    }

    /// Claims the entry for `cpu_id`; each entry can be claimed once.
    pub(crate) fn claim(&self, cpu_id: usize) -> AxResult {
        let entry = self.entry(cpu_id)?;
        if entry
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ax_err!(ResourceBusy, "cpu entry already claimed");
        }
        Ok(())
    }

    /// Wakes a parked CPU.
    pub fn wake(&self, cpu_id: usize, reason: WakeReason) -> AxResult {
        let word = match reason {
            WakeReason::NewCell => WAKE_NEW_CELL,
            WakeReason::Shutdown => WAKE_SHUTDOWN,
        };
        self.entry(cpu_id)?.wake.store(word, Ordering::Release);
        Ok(())
    }

    /// Wakes every parked CPU, used for host-wide shutdown.
    pub fn wake_all(&self, reason: WakeReason) {
        for cpu_id in 0..self.entries.len() {
            let _ = self.wake(cpu_id, reason);
        }
    }

    /// Requests that `cpu_id` leave guest context at its next trap
    /// boundary.
    pub fn request_deactivate(&self, cpu_id: usize) -> AxResult {
        self.entry(cpu_id)?.deactivate.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn take_deactivate(&self, cpu_id: usize) -> bool {
        self.entries[cpu_id].deactivate.swap(false, Ordering::AcqRel)
    }

    /// Spins until a wake word is posted for `cpu_id`.
    pub(crate) fn wait_for_wake(&self, cpu_id: usize) -> WakeReason {
        loop {
            match self.entries[cpu_id].wake.swap(WAKE_NONE, Ordering::AcqRel) {
                WAKE_NEW_CELL => return WakeReason::NewCell,
                WAKE_SHUTDOWN => return WakeReason::Shutdown,
                _ => hint::spin_loop(),
            }
        }
    }

    /// Marks `cpu_id` as withdrawn from service after a fatal failure.
    pub(crate) fn withdraw(&self, cpu_id: usize) {
        if let Some(entry) = self.entries.get(cpu_id) {
            entry.withdrawn.store(true, Ordering::Release);
        }
    }

    /// Whether `cpu_id` has been withdrawn from service.
    pub fn is_withdrawn(&self, cpu_id: usize) -> bool {
        self.entries
            .get(cpu_id)
            .map(|e| e.withdrawn.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}
