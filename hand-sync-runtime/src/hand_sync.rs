use anyhow::Result;

use crate::config::SyncConfig;
use crate::receiver::PoseReceiver;
use crate::schema::PoseSchema;
use crate::transport::PoseTransport;
use crate::types::{PoseSource, SkeletonState};
use crate::writer::PoseWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sends the local pose every tick, never applies remote input.
    Authoritative,
    /// Follows the remote pose, never sends.
    Observer,
}

enum Role {
    Writer(PoseWriter),
    Receiver(PoseReceiver),
}

/// Replicates one hand skeleton over a [`PoseTransport`].
///
/// The mode is read from the transport once, at construction.
pub struct HandSync<T: PoseTransport> {
    transport: T,
    role: Role,
    enabled: bool,
}

impl<T: PoseTransport> HandSync<T> {
    pub fn new(transport: T, config: SyncConfig, initial: SkeletonState) -> Result<Self> {
        let role = if transport.is_authoritative() {
            Role::Writer(PoseWriter::new(PoseSchema::hand(config.joint_count)))
        } else {
            Role::Receiver(PoseReceiver::new(config, initial)?)
        };

        Ok(Self {
            transport,
            role,
            enabled: true,
        })
    }

    pub fn mode(&self) -> SyncMode {
        match self.role {
            Role::Writer(_) => SyncMode::Authoritative,
            Role::Receiver(_) => SyncMode::Observer,
        }
    }

    pub fn schema(&self) -> &PoseSchema {
        match &self.role {
            Role::Writer(writer) => writer.schema(),
            Role::Receiver(receiver) => receiver.schema(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// While disabled nothing is sent or accepted; inbound frames are
    /// dropped. An observer keeps easing toward the last target it accepted.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Rendered skeleton on an observer, `None` on the authoritative peer.
    pub fn rendered(&self) -> Option<&SkeletonState> {
        match &self.role {
            Role::Writer(_) => None,
            Role::Receiver(receiver) => Some(receiver.rendered()),
        }
    }

    /// One replication tick. `source` is only read on the authoritative peer.
    pub fn tick(&mut self, delta_seconds: f32, source: &dyn PoseSource) -> Result<()> {
        match &mut self.role {
            Role::Writer(writer) => {
                if self.transport.take_latest().is_some() {
                    log::debug!("Authoritative peer ignoring inbound pose frame");
                }

                if self.enabled {
                    let frame = writer.write(source)?;
                    if let Err(e) = self.transport.send_frame(frame) {
                        log::warn!("Failed to send pose frame: {}", e);
                    }
                }
            }
            Role::Receiver(receiver) => {
                match self.transport.take_latest() {
                    Some(frame) if self.enabled => {
                        if let Err(e) = receiver.receive_frame(&frame) {
                            log::warn!("Rejected pose frame: {}", e);
                        }
                    }
                    Some(_) => log::debug!("Disabled observer dropping pose frame"),
                    None => {}
                }

                receiver.advance(delta_seconds);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use glam::{Quat, Vec3};

    const TICK: f32 = 1.0 / 60.0;

    fn config(joints: usize) -> SyncConfig {
        SyncConfig {
            joint_count: joints,
            ..SyncConfig::default()
        }
    }

    fn live_pose(joints: usize) -> SkeletonState {
        SkeletonState {
            wrist_position: Vec3::new(0.0, 1.2, 0.4),
            joint_rotations: (0..joints)
                .map(|i| Quat::from_rotation_z(0.1 * i as f32))
                .collect(),
            scale: Vec3::splat(1.1),
        }
    }

    #[test]
    fn mode_follows_transport_authority() {
        let (authority, observer) = LoopbackTransport::pair();
        let writer = HandSync::new(authority, config(3), SkeletonState::identity(3)).unwrap();
        let reader = HandSync::new(observer, config(3), SkeletonState::identity(3)).unwrap();

        assert_eq!(writer.mode(), SyncMode::Authoritative);
        assert_eq!(reader.mode(), SyncMode::Observer);
        assert!(writer.rendered().is_none());
    }

    #[test]
    fn authoritative_peer_ignores_network_input() {
        let (authority, mut observer) = LoopbackTransport::pair();
        let mut sync = HandSync::new(authority, config(2), SkeletonState::identity(2)).unwrap();
        let live = live_pose(2);

        // A bogus frame pushed back toward the authority.
        observer.send_frame(vec![9.0; 14]).unwrap();
        sync.tick(TICK, &live).unwrap();

        assert!(sync.rendered().is_none());
        let sent = observer.take_latest().unwrap();
        assert_eq!(sent, PoseSchema::hand(2).encode(&live).unwrap());
    }

    #[test]
    fn disabled_component_neither_sends_nor_accepts() {
        let (authority, observer) = LoopbackTransport::pair();
        let mut writer = HandSync::new(authority, config(2), SkeletonState::identity(2)).unwrap();
        let mut reader = HandSync::new(observer, config(2), SkeletonState::identity(2)).unwrap();
        let idle = SkeletonState::identity(2);

        writer.set_enabled(false);
        assert!(!writer.is_enabled());
        writer.tick(TICK, &live_pose(2)).unwrap();
        assert!(reader.transport_mut().take_latest().is_none());

        writer.set_enabled(true);
        writer.tick(TICK, &live_pose(2)).unwrap();
        reader.set_enabled(false);
        reader.tick(TICK, &idle).unwrap();
        assert_eq!(reader.rendered(), Some(&SkeletonState::identity(2)));
    }

    #[test]
    fn re_enabled_observer_ignores_frames_sent_while_disabled() {
        let (mut authority, observer) = LoopbackTransport::pair();
        let mut reader = HandSync::new(observer, config(2), SkeletonState::identity(2)).unwrap();
        let idle = SkeletonState::identity(2);

        reader.set_enabled(false);
        authority
            .send_frame(PoseSchema::hand(2).encode(&live_pose(2)).unwrap())
            .unwrap();
        reader.tick(TICK, &idle).unwrap();

        reader.set_enabled(true);
        reader.tick(TICK, &idle).unwrap();
        assert_eq!(reader.rendered(), Some(&idle));

        let mut fresh = SkeletonState::identity(2);
        fresh.wrist_position = Vec3::X;
        authority
            .send_frame(PoseSchema::hand(2).encode(&fresh).unwrap())
            .unwrap();
        reader.tick(TICK, &idle).unwrap();
        assert!(reader.rendered().unwrap().wrist_position.x > 0.0);
    }

    #[test]
    fn rejected_frame_does_not_stop_interpolation() {
        let (mut authority, observer) = LoopbackTransport::pair();
        let mut reader = HandSync::new(observer, config(2), SkeletonState::identity(2)).unwrap();
        let idle = SkeletonState::identity(2);

        authority
            .send_frame(PoseSchema::hand(2).encode(&live_pose(2)).unwrap())
            .unwrap();
        reader.tick(TICK, &idle).unwrap();
        let before = reader.rendered().unwrap().wrist_position;

        authority.send_frame(vec![0.0; 5]).unwrap();
        reader.tick(TICK, &idle).unwrap();
        let after = reader.rendered().unwrap().wrist_position;

        let goal = live_pose(2).wrist_position;
        assert!(after.distance(goal) < before.distance(goal));
    }
}
