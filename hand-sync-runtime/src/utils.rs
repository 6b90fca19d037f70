use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};

use crate::hand_sync::HandSync;
use crate::network::{HandSyncModule, NetworkLink};

pub type NetworkHandSync = HandSync<NetworkLink>;

/// One connection shared by every hand the host created. Handles start at 1
/// so that 0 can mean failure on the C side.
#[derive(Default)]
pub struct Plugin {
    pub module: HandSyncModule,
    hands: HashMap<u32, NetworkHandSync>,
    next_handle: u32,
}

impl Plugin {
    pub fn insert(&mut self, sync: NetworkHandSync) -> u32 {
        self.next_handle += 1;
        self.hands.insert(self.next_handle, sync);
        self.next_handle
    }

    pub fn remove(&mut self, handle: u32) -> Option<NetworkHandSync> {
        self.hands.remove(&handle)
    }

    pub fn hand_mut(&mut self, handle: u32) -> Option<&mut NetworkHandSync> {
        self.hands.get_mut(&handle)
    }

    pub fn hand_count(&self) -> usize {
        self.hands.len()
    }
}

pub static PLUGIN: OnceLock<Arc<Mutex<Plugin>>> = OnceLock::new();

pub fn get_plugin() -> Arc<Mutex<Plugin>> {
    PLUGIN
        .get_or_init(|| Arc::new(Mutex::new(Plugin::default())))
        .clone()
}

/// Helper function to safely execute code that might panic
pub fn execute_safely<F>(func_name: &str, f: F) -> i32
where
    F: FnOnce() -> i32,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(e) => {
            log::error!("Panic in {}: {:?}", func_name, e);
            0
        }
    }
}

pub fn with_plugin_mut<F, R>(f: F, default: R) -> R
where
    F: FnOnce(&mut Plugin) -> R,
{
    match PLUGIN.get() {
        Some(plugin) => match plugin.lock() {
            Ok(mut plugin) => f(&mut plugin),
            Err(e) => {
                log::error!("Failed to lock hand sync plugin: {}", e);
                default
            }
        },
        None => {
            log::error!("Hand sync module not initialized");
            default
        }
    }
}

pub fn with_hand_mut<F, R>(handle: u32, f: F, default: R) -> R
where
    F: FnOnce(&mut NetworkHandSync) -> R,
    R: Clone,
{
    let fallback = default.clone();
    with_plugin_mut(
        |plugin| match plugin.hand_mut(handle) {
            Some(sync) => f(sync),
            None => {
                log::error!("Unknown hand sync handle {}", handle);
                default
            }
        },
        fallback,
    )
}

/// Copies a NUL-terminated string handed over by the host.
///
/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
pub unsafe fn read_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Writes `value` NUL-terminated into a host buffer of `max_len` bytes,
/// truncating if needed. Returns the number of bytes written.
///
/// # Safety
/// `buf` must point to `max_len` writable bytes.
pub unsafe fn write_c_string(value: &str, buf: *mut c_char, max_len: usize) -> usize {
    if buf.is_null() || max_len == 0 {
        return 0;
    }
    let bytes = value.as_bytes();
    let len = bytes.len().min(max_len - 1);
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, max_len);
    out[..len].copy_from_slice(&bytes[..len]);
    out[len] = 0;
    len
}
