use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

use crate::schema::PoseFrame;

/// What the sync component needs from whatever carries frames between peers.
///
/// Delivery is "most recent wins": there is no sequencing and frames may be
/// dropped. `take_latest` hands out the newest frame that arrived since the
/// previous call.
pub trait PoseTransport {
    /// Whether this peer is the source of truth for the skeleton.
    fn is_authoritative(&self) -> bool;

    fn send_frame(&mut self, frame: PoseFrame) -> Result<()>;

    fn take_latest(&mut self) -> Option<PoseFrame>;
}

type Slot = Arc<Mutex<Option<PoseFrame>>>;

/// In-process transport. Both ends share one slot per direction; a new
/// frame replaces whatever was still waiting in it.
pub struct LoopbackTransport {
    authoritative: bool,
    outbound: Slot,
    inbound: Slot,
}

impl LoopbackTransport {
    /// Returns `(authoritative, observer)`.
    pub fn pair() -> (Self, Self) {
        let forward: Slot = Arc::new(Mutex::new(None));
        let backward: Slot = Arc::new(Mutex::new(None));

        let authority = Self {
            authoritative: true,
            outbound: Arc::clone(&forward),
            inbound: Arc::clone(&backward),
        };
        let observer = Self {
            authoritative: false,
            outbound: backward,
            inbound: forward,
        };

        (authority, observer)
    }
}

impl PoseTransport for LoopbackTransport {
    fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    fn send_frame(&mut self, frame: PoseFrame) -> Result<()> {
        let mut slot = self
            .outbound
            .lock()
            .map_err(|e| anyhow!("loopback slot poisoned: {}", e))?;
        *slot = Some(frame);
        Ok(())
    }

    fn take_latest(&mut self) -> Option<PoseFrame> {
        match self.inbound.lock() {
            Ok(mut slot) => slot.take(),
            Err(e) => {
                log::error!("Failed to lock loopback slot: {}", e);
                None
            }
        }
    }
}
