//! Cross-crate test suite for the shared-memory link.

#[cfg(all(test, not(target_arch = "wasm32")))]
mod native_e2e;
