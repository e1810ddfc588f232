//! Doorbell registers and the interrupt glue behind them.
//!
//! Each direction has one 32-bit register. The sender writes it to raise an
//! interrupt on the peer; the peer's interrupt handler clears it and wakes
//! the local workers. Per direction the register moves `Idle -> Signaled ->
//! Idle`; several rings before the handler runs collapse into one interrupt.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::signal::WakeSignal;

/// Firmware base address of the doorbell register bank.
pub const DEFAULT_MMIO_BASE: usize = 0x600c_0030;
/// Stride between consecutive doorbell registers.
pub const MMIO_STRIDE: usize = 4;

/// Observable state of one doorbell register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoorbellState {
    Idle,
    Signaled,
}

/// Sending half: raises the interrupt on the peer.
pub trait Doorbell: Send + Sync {
    /// Fire-and-forget; never blocks.
    fn ring(&self);
}

/// Receiving half: the pending bit the interrupt handler acknowledges.
pub trait DoorbellLatch: Send + Sync {
    /// Clears the pending bit, returning whether it was set.
    fn take_pending(&self) -> bool;
}

/// Memory-mapped doorbell register.
#[derive(Debug)]
pub struct MmioDoorbell {
    register: NonNull<u32>,
}

// SAFETY: the register is only touched with single volatile word accesses.
unsafe impl Send for MmioDoorbell {}
// SAFETY: as above.
unsafe impl Sync for MmioDoorbell {}

impl MmioDoorbell {
    /// # Safety
    ///
    /// `address` must be a mapped, 4-byte aligned doorbell register that stays
    /// valid for the lifetime of the handle.
    pub unsafe fn new(address: usize) -> Option<Self> {
        if address % 4 != 0 {
            return None;
        }
        NonNull::new(address as *mut u32).map(|register| Self { register })
    }

    /// Register `index` of the bank at `base`.
    ///
    /// # Safety
    ///
    /// Same as [`MmioDoorbell::new`] for `base + index * MMIO_STRIDE`.
    pub unsafe fn indexed(base: usize, index: usize) -> Option<Self> {
        Self::new(base.checked_add(index.checked_mul(MMIO_STRIDE)?)?)
    }
}

impl Doorbell for MmioDoorbell {
    #[inline]
    fn ring(&self) {
        // SAFETY: guaranteed valid by the constructor contract.
        unsafe { ptr::write_volatile(self.register.as_ptr(), 1) };
    }
}

impl DoorbellLatch for MmioDoorbell {
    #[inline]
    fn take_pending(&self) -> bool {
        // SAFETY: guaranteed valid by the constructor contract.
        unsafe {
            let pending = ptr::read_volatile(self.register.as_ptr()) != 0;
            ptr::write_volatile(self.register.as_ptr(), 0);
            pending
        }
    }
}

/// Atomic stand-in for a doorbell register, used by in-process links.
#[derive(Debug, Default)]
pub struct DoorbellRegister {
    pending: AtomicU32,
    raised: AtomicU64,
}

impl DoorbellRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pending bit; returns `true` on the `Idle -> Signaled` edge.
    pub fn raise(&self) -> bool {
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.pending.swap(1, Ordering::AcqRel) == 0
    }

    pub fn state(&self) -> DoorbellState {
        if self.pending.load(Ordering::Acquire) == 0 {
            DoorbellState::Idle
        } else {
            DoorbellState::Signaled
        }
    }

    /// Total number of times the register was written.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }
}

impl DoorbellLatch for DoorbellRegister {
    fn take_pending(&self) -> bool {
        self.pending.swap(0, Ordering::AcqRel) != 0
    }
}

/// Interrupt line of one incoming doorbell.
///
/// [`IrqLine::handle_irq`] is the whole interrupt service routine: it
/// acknowledges the register and wakes the receive worker, plus the transmit
/// worker since a peer interrupt usually means the peer consumed something
/// we can reclaim. It performs no allocation and never blocks.
pub struct IrqLine {
    latch: Arc<dyn DoorbellLatch>,
    rx_wake: Arc<WakeSignal>,
    tx_wake: Option<Arc<WakeSignal>>,
    handled: AtomicU64,
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqLine")
            .field("handled", &self.handled())
            .finish()
    }
}

impl IrqLine {
    pub fn new(
        latch: Arc<dyn DoorbellLatch>,
        rx_wake: Arc<WakeSignal>,
        tx_wake: Option<Arc<WakeSignal>>,
    ) -> Self {
        Self {
            latch,
            rx_wake,
            tx_wake,
            handled: AtomicU64::new(0),
        }
    }

    pub fn handle_irq(&self) {
        if !self.latch.take_pending() {
            return;
        }
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.rx_wake.notify();
        if let Some(tx) = &self.tx_wake {
            tx.notify();
        }
    }

    /// Interrupts that found the register signaled.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Doorbell whose "interrupt" is delivered synchronously to an in-process peer.
///
/// The peer's [`IrqLine`] usually exists only after both sides are built, so
/// it is attached afterwards with [`LoopbackDoorbell::connect`]. Rings before
/// that leave the register signaled and are delivered by the first
/// interrupt after connecting.
#[derive(Debug)]
pub struct LoopbackDoorbell {
    register: Arc<DoorbellRegister>,
    irq: OnceLock<Arc<IrqLine>>,
}

impl LoopbackDoorbell {
    pub fn new(register: Arc<DoorbellRegister>) -> Self {
        Self {
            register,
            irq: OnceLock::new(),
        }
    }

    /// The register this doorbell raises; hand it to the peer as its latch.
    pub fn register(&self) -> &Arc<DoorbellRegister> {
        &self.register
    }

    /// Attaches the peer's interrupt line. Later calls are ignored.
    pub fn connect(&self, irq: Arc<IrqLine>) {
        if self.irq.set(irq).is_ok() {
            if let Some(irq) = self.irq.get() {
                irq.handle_irq();
            }
        }
    }
}

impl Doorbell for LoopbackDoorbell {
    fn ring(&self) {
        self.register.raise();
        if let Some(irq) = self.irq.get() {
            irq.handle_irq();
        }
    }
}
