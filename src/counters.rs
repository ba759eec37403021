//! Housekeeping counters of the engine and its channels.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::NUM_QUEUES;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SentCounters {
    pub file_data_bytes: u64,
    pub pdu: u32,
    pub error: u32,
    pub nak_segment_requests: u32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RecvCounters {
    pub file_data_bytes: u64,
    pub pdu: u32,
    pub error: u32,
    pub spurious: u32,
    pub dropped: u32,
    pub nak_segment_requests: u32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultCounters {
    pub file_open: u32,
    pub file_read: u32,
    pub file_seek: u32,
    pub file_write: u32,
    pub file_rename: u32,
    pub directory_read: u32,
    pub crc_mismatch: u32,
    pub file_size_mismatch: u32,
    pub nak_limit: u32,
    pub ack_limit: u32,
    pub inactivity_timer: u32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelCounters {
    pub sent: SentCounters,
    pub recv: RecvCounters,
    pub fault: FaultCounters,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CommandCounters {
    pub cmd: u32,
    pub err: u32,
}

/// Which counters a reset command clears.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResetKind {
    All,
    Command,
    Fault,
    /// Receive counters.
    Up,
    /// Send counters.
    Down,
}

impl ChannelCounters {
    pub fn reset(&mut self, kind: ResetKind) {
        match kind {
            ResetKind::All => *self = Self::default(),
            ResetKind::Command => (),
            ResetKind::Fault => self.fault = FaultCounters::default(),
            ResetKind::Up => self.recv = RecvCounters::default(),
            ResetKind::Down => self.sent = SentCounters::default(),
        }
    }
}

/// Snapshot of one channel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelHousekeeping {
    pub counters: ChannelCounters,
    /// Indexed by [crate::QueueIdx].
    pub q_size: [u32; NUM_QUEUES],
    /// Number of polling directories with a busy playback.
    pub poll_counter: u8,
    /// Number of busy commanded playbacks.
    pub playback_counter: u8,
    pub frozen: bool,
    pub channel_closed: bool,
}
