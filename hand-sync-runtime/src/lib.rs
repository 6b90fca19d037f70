pub mod config;
pub mod hand_sync;
pub mod messages;
pub mod network;
pub mod receiver;
pub mod schema;
pub mod transport;
pub mod types;
pub mod utils;
pub mod writer;

pub use config::{FactorPolicy, SyncConfig};
pub use hand_sync::{HandSync, SyncMode};
pub use network::{HandSyncModule, NetworkLink};
pub use receiver::PoseReceiver;
pub use schema::{FieldKind, FieldSpec, PoseFrame, PoseSchema};
pub use transport::{LoopbackTransport, PoseTransport};
pub use types::{PoseSource, SkeletonState};
pub use writer::PoseWriter;

use env_logger::Builder;
use std::ffi::c_char;
use std::panic;
use utils::{
    execute_safely, get_plugin, read_c_string, with_hand_mut, with_plugin_mut, write_c_string,
};

// C - API
//
// Poses cross the boundary as flat f32 buffers laid out by `PoseSchema`.
// Every hand is addressed by the handle `HandSyncCreate` returned; all hands
// share one server connection. Calls return 1 on success and 0 on failure.

#[no_mangle]
pub extern "C" fn HandSyncInit() {
    // Set up a panic hook that logs panics but doesn't abort
    panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic in hand sync module: {:?}", panic_info);
    }));

    let mut builder = Builder::from_default_env();

    #[cfg(debug_assertions)]
    builder.filter_level(log::LevelFilter::Debug);
    #[cfg(not(debug_assertions))]
    builder.filter_level(log::LevelFilter::Info);

    let _ = builder.try_init();

    let _ = get_plugin();
    log::info!("Hand sync module initialized");
}

/// Creates one replicated hand and returns its handle, or 0 on failure.
/// `config_json` may be null to use the defaults.
///
/// # Safety
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn HandSyncCreate(config_json: *const c_char, authoritative: i32) -> i32 {
    execute_safely("HandSyncCreate", || {
        let config = match read_c_string(config_json) {
            Some(json) => match SyncConfig::from_json(&json) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Invalid hand sync config: {}", e);
                    return 0;
                }
            },
            None => SyncConfig::default(),
        };

        with_plugin_mut(
            |plugin| {
                let initial = SkeletonState::identity(config.joint_count);
                let transport = plugin.module.link(authoritative != 0);
                let sync = match HandSync::new(transport, config, initial) {
                    Ok(sync) => sync,
                    Err(e) => {
                        log::error!("Failed to create hand sync: {}", e);
                        return 0;
                    }
                };

                log::info!(
                    "Created hand sync in {:?} mode with schema {}",
                    sync.mode(),
                    sync.schema().fingerprint()
                );

                plugin.insert(sync) as i32
            },
            0,
        )
    })
}

#[no_mangle]
pub extern "C" fn HandSyncDestroy(handle: u32) -> i32 {
    execute_safely("HandSyncDestroy", || {
        with_plugin_mut(
            |plugin| match plugin.remove(handle) {
                Some(_) => {
                    log::info!("Destroyed hand sync {}", handle);
                    1
                }
                None => {
                    log::error!("Unknown hand sync handle {}", handle);
                    0
                }
            },
            0,
        )
    })
}

/// # Safety
/// `url` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn HandSyncConnect(url: *const c_char) -> i32 {
    execute_safely("HandSyncConnect", || {
        let Some(url) = read_c_string(url) else {
            log::error!("HandSyncConnect called without a url");
            return 0;
        };
        log::info!("Connecting to server: {}", url);

        with_plugin_mut(
            |plugin| match plugin.module.connect(&url) {
                Ok(_) => {
                    log::info!("Successfully connected to {}", url);
                    1
                }
                Err(e) => {
                    log::error!("Failed to connect to {}: {}", url, e);
                    0
                }
            },
            0,
        )
    })
}

/// 1 while the server connection is open, 0 once it was closed from
/// either side.
#[no_mangle]
pub extern "C" fn HandSyncIsConnected() -> i32 {
    execute_safely("HandSyncIsConnected", || {
        with_plugin_mut(|plugin| plugin.module.is_connected() as i32, 0)
    })
}

#[no_mangle]
pub extern "C" fn HandSyncDisconnect() -> i32 {
    execute_safely("HandSyncDisconnect", || {
        log::info!("Disconnecting from server");

        with_plugin_mut(
            |plugin| match plugin.module.disconnect() {
                Ok(_) => {
                    log::info!("Successfully disconnected");
                    1
                }
                Err(e) => {
                    log::error!("Failed to disconnect: {}", e);
                    0
                }
            },
            0,
        )
    })
}

/// # Safety
/// `session_id` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn HandSyncJoinSession(session_id: *const c_char) -> i32 {
    execute_safely("HandSyncJoinSession", || {
        let Some(session_id) = read_c_string(session_id) else {
            log::error!("HandSyncJoinSession called without a session id");
            return 0;
        };

        with_plugin_mut(
            |plugin| match plugin.module.join_session(&session_id) {
                Ok(_) => 1,
                Err(e) => {
                    log::error!("Failed to join session {}: {}", session_id, e);
                    0
                }
            },
            0,
        )
    })
}

#[no_mangle]
pub extern "C" fn HandSyncLeaveSession() -> i32 {
    execute_safely("HandSyncLeaveSession", || {
        with_plugin_mut(
            |plugin| match plugin.module.leave_session() {
                Ok(_) => 1,
                Err(e) => {
                    log::error!("Failed to leave session: {}", e);
                    0
                }
            },
            0,
        )
    })
}

/// Number of remote senders heard in the current session.
#[no_mangle]
pub extern "C" fn HandSyncGetRemotePeerCount() -> i32 {
    execute_safely("HandSyncGetRemotePeerCount", || {
        with_plugin_mut(|plugin| plugin.module.remote_peers().len() as i32, 0)
    })
}

/// Pins the observer behind `handle` to `sender_id`.
///
/// # Safety
/// `sender_id` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn HandSyncFollow(handle: u32, sender_id: *const c_char) -> i32 {
    execute_safely("HandSyncFollow", || {
        let Some(sender_id) = read_c_string(sender_id) else {
            return 0;
        };

        with_hand_mut(
            handle,
            |sync| {
                sync.transport_mut().follow(&sender_id);
                1
            },
            0,
        )
    })
}

/// Copies the sender the observer behind `handle` currently follows into
/// `buf`. Returns 0 while it follows nobody.
///
/// # Safety
/// `buf` must point to `max_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn HandSyncGetFollowedSender(
    handle: u32,
    buf: *mut c_char,
    max_len: usize,
) -> i32 {
    execute_safely("HandSyncGetFollowedSender", || {
        with_hand_mut(
            handle,
            |sync| match sync.transport().following() {
                Some(sender_id) => (write_c_string(sender_id, buf, max_len) > 0) as i32,
                None => 0,
            },
            0,
        )
    })
}

#[no_mangle]
pub extern "C" fn HandSyncSetEnabled(handle: u32, enabled: i32) -> i32 {
    execute_safely("HandSyncSetEnabled", || {
        with_hand_mut(
            handle,
            |sync| {
                let enabled = enabled != 0;
                if sync.is_enabled() != enabled {
                    log::info!(
                        "Hand sync {} {}",
                        handle,
                        if enabled { "enabled" } else { "disabled" }
                    );
                }
                sync.set_enabled(enabled);
                1
            },
            0,
        )
    })
}

#[no_mangle]
pub extern "C" fn HandSyncGetFrameLength(handle: u32) -> i32 {
    execute_safely("HandSyncGetFrameLength", || {
        with_hand_mut(handle, |sync| sync.schema().frame_len() as i32, 0)
    })
}

/// `pose_in` holds the live local pose and is only read on the
/// authoritative peer; observers may pass null.
///
/// # Safety
/// `pose_in` must be null or point to `len` readable floats.
#[no_mangle]
pub unsafe extern "C" fn HandSyncTick(
    handle: u32,
    delta_seconds: f32,
    pose_in: *const f32,
    len: usize,
) -> i32 {
    execute_safely("HandSyncTick", || {
        let live = if pose_in.is_null() {
            None
        } else {
            Some(std::slice::from_raw_parts(pose_in, len).to_vec())
        };

        with_hand_mut(
            handle,
            |sync| {
                let source = match (sync.mode(), live) {
                    (SyncMode::Authoritative, Some(frame)) => match sync.schema().decode(&frame) {
                        Ok(state) => state,
                        Err(e) => {
                            log::error!("Invalid local pose: {}", e);
                            return 0;
                        }
                    },
                    (SyncMode::Authoritative, None) => {
                        log::error!("Authoritative tick without a local pose");
                        return 0;
                    }
                    (SyncMode::Observer, _) => SkeletonState::identity(sync.schema().joint_count()),
                };

                match sync.tick(delta_seconds, &source) {
                    Ok(_) => 1,
                    Err(e) => {
                        log::error!("Hand sync tick failed: {}", e);
                        0
                    }
                }
            },
            0,
        )
    })
}

/// Writes the rendered pose of the observer behind `handle` into `pose_out`.
///
/// # Safety
/// `pose_out` must point to `len` writable floats.
#[no_mangle]
pub unsafe extern "C" fn HandSyncGetRenderedPose(
    handle: u32,
    pose_out: *mut f32,
    len: usize,
) -> i32 {
    execute_safely("HandSyncGetRenderedPose", || {
        if pose_out.is_null() {
            return 0;
        }
        let out = std::slice::from_raw_parts_mut(pose_out, len);

        with_hand_mut(
            handle,
            |sync| {
                let Some(rendered) = sync.rendered() else {
                    return 0;
                };
                let frame = match sync.schema().encode(rendered) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to encode rendered pose: {}", e);
                        return 0;
                    }
                };
                if out.len() < frame.len() {
                    log::error!("Pose buffer too small: {} < {}", out.len(), frame.len());
                    return 0;
                }

                out[..frame.len()].copy_from_slice(&frame);
                1
            },
            0,
        )
    })
}
