use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use shmem_transport::SharedBlock;

/// Bytes of read or write payload one command can carry.
pub const FLASH_DATA_WINDOW: usize = 1024;

/// Per-side progress word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HandshakeState {
    Idle = 0,
    Ready = 1,
    Done = 2,
}

impl HandshakeState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(HandshakeState::Idle),
            1 => Some(HandshakeState::Ready),
            2 => Some(HandshakeState::Done),
            _ => None,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::Ready => "ready",
            HandshakeState::Done => "done",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FlashCode {
    Erase = 0,
    Read = 1,
    Write = 2,
}

impl FlashCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FlashCode::Erase),
            1 => Some(FlashCode::Read),
            2 => Some(FlashCode::Write),
            _ => None,
        }
    }
}

/// The command block both sides mutate in place.
///
/// `remote_state` is written only by the host and `local_state` only by the
/// device. The other fields and the data window belong to whichever side
/// the handshake currently lets proceed.
#[repr(C, align(64))]
pub struct FlashCommandBlock {
    pub code: AtomicU32,
    pub addr: AtomicU32,
    pub size: AtomicU32,
    pub remote_state: AtomicU32,
    pub local_state: AtomicU32,
    pub result: AtomicU32,
    _reserved: [u32; 2],
    data: UnsafeCell<[u8; FLASH_DATA_WINDOW]>,
}

// SAFETY: repr(C), every bit pattern is valid, and shared mutation goes
// through atomics or the `UnsafeCell` data window.
unsafe impl SharedBlock for FlashCommandBlock {}
// SAFETY: data window accesses are serialized by the handshake states.
unsafe impl Sync for FlashCommandBlock {}

impl FlashCommandBlock {
    /// Puts both state words back to `Idle`.
    pub fn reset(&self) {
        self.remote_state
            .store(HandshakeState::Idle as u32, Ordering::Release);
        self.local_state
            .store(HandshakeState::Idle as u32, Ordering::Release);
        self.result.store(0, Ordering::Relaxed);
    }

    pub fn local(&self) -> u32 {
        self.local_state.load(Ordering::Acquire)
    }

    pub fn remote(&self) -> u32 {
        self.remote_state.load(Ordering::Acquire)
    }

    pub fn set_local(&self, state: HandshakeState) {
        self.local_state.store(state as u32, Ordering::Release);
    }

    pub fn set_remote(&self, state: HandshakeState) {
        self.remote_state.store(state as u32, Ordering::Release);
    }

    /// Copies `bytes` into the data window.
    ///
    /// Callers must hold the turn: the host before raising `remote_state`,
    /// the device between observing `Ready` and publishing `Done`.
    pub(crate) fn write_data(&self, bytes: &[u8]) {
        let len = bytes.len().min(FLASH_DATA_WINDOW);
        // SAFETY: the handshake gives this side exclusive use of the window.
        let window = unsafe { &mut *self.data.get() };
        window[..len].copy_from_slice(&bytes[..len]);
    }

    /// Copies the first `out.len()` bytes of the data window into `out`.
    pub(crate) fn read_data(&self, out: &mut [u8]) {
        let len = out.len().min(FLASH_DATA_WINDOW);
        // SAFETY: as for `write_data`.
        let window = unsafe { &*self.data.get() };
        out[..len].copy_from_slice(&window[..len]);
    }

    /// Runs `f` over the first `len` bytes of the data window.
    pub(crate) fn with_data_mut<R>(&self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let len = len.min(FLASH_DATA_WINDOW);
        // SAFETY: as for `write_data`.
        let window = unsafe { &mut *self.data.get() };
        f(&mut window[..len])
    }
}
