//! # Engine Configuration Module
//!
//! Global and per channel configuration of the [crate::engine::Engine]. The default values
//! match the default flight configuration table. The configuration is read-only after the
//! engine was created, except for the parameters which can be changed with
//! [EngineConfig::set_param].
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    string::{String, ToString},
    vec::Vec,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    CfdpClass, EntityId, MAX_FILE_DATA_SIZE, MAX_POLLING_DIR_PER_CHAN, MAX_VALID_IPS_PER_CHAN,
    NUM_CHANNELS,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("ticks per second must not be zero")]
    ZeroTicksPerSecond,
    #[error("rx CRC calculation bytes per wakeup {0} is not a non-zero multiple of 1024")]
    InvalidRxCrcBytes(u32),
    #[error("outgoing file chunk size {size} exceeds maximum {max}")]
    ChunkSizeTooLarge { size: u16, max: usize },
    #[error("invalid number of channels {0}")]
    InvalidChannelCount(usize),
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    #[error("peer address {addr} of channel {chan} is not in the valid IP table")]
    PeerNotInIpTable { chan: u8, addr: SocketAddr },
    #[error("valid IP table of channel {0} is full")]
    IpTableFull(u8),
    #[error("invalid value {value} for parameter {param:?}")]
    InvalidParamValue { param: ParamId, value: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionType {
    Udp,
    Bus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UdpConfig {
    pub my_address: SocketAddr,
    pub the_other_addr: SocketAddr,
}

impl UdpConfig {
    pub const fn new(my_address: SocketAddr, the_other_addr: SocketAddr) -> Self {
        Self {
            my_address,
            the_other_addr,
        }
    }

    pub fn localhost(my_port: u16, other_port: u16) -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            my_address: SocketAddr::new(localhost, my_port),
            the_other_addr: SocketAddr::new(localhost, other_port),
        }
    }
}

/// Polling directory. When enabled, the directory is played back every `interval_sec`
/// seconds once the previous playback of the directory has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PollDirConfig {
    pub interval_sec: u32,
    pub priority: u8,
    pub class: CfdpClass,
    pub dest_eid: EntityId,
    pub src_dir: String,
    pub dst_dir: String,
    pub enabled: bool,
}

impl Default for PollDirConfig {
    fn default() -> Self {
        Self {
            interval_sec: 0,
            priority: 0,
            class: CfdpClass::Class1,
            dest_eid: 0,
            src_dir: String::new(),
            dst_dir: String::new(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    /// Zero means unbounded.
    pub max_outgoing_messages_per_wakeup: u32,
    pub rx_max_messages_per_wakeup: u32,
    pub ack_timer_s: u32,
    pub nak_timer_s: u32,
    pub inactivity_timer_s: u32,
    pub ack_limit: u8,
    pub nak_limit: u8,
    pub dequeue_enabled: bool,
    /// Depth of the inbound message queue of bus channels.
    pub pipe_depth_input: u16,
    pub connection_type: ConnectionType,
    /// Only relevant for [ConnectionType::Udp] channels.
    pub udp_config: UdpConfig,
    pub polldir: [PollDirConfig; MAX_POLLING_DIR_PER_CHAN],
    /// Successfully sent files with `keep = false` are moved here instead of being deleted.
    pub move_dir: Option<String>,
    /// Append a CRC-16 to every PDU sent on this channel.
    pub pdu_crc: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_outgoing_messages_per_wakeup: 5,
            rx_max_messages_per_wakeup: 5,
            ack_timer_s: 3,
            nak_timer_s: 3,
            inactivity_timer_s: 30,
            ack_limit: 4,
            nak_limit: 4,
            dequeue_enabled: true,
            pipe_depth_input: 16,
            connection_type: ConnectionType::Bus,
            udp_config: UdpConfig::localhost(0, 0),
            polldir: Default::default(),
            move_dir: None,
            pdu_crc: false,
        }
    }
}

impl ChannelConfig {
    /// Default configuration of the given channel of the flight configuration table.
    pub fn default_for_channel(chan: u8) -> Self {
        match chan {
            0 => {
                let mut cfg = Self {
                    ack_timer_s: 14,
                    nak_timer_s: 14,
                    connection_type: ConnectionType::Udp,
                    udp_config: UdpConfig::localhost(11010, 11001),
                    ..Default::default()
                };
                cfg.polldir[0] = PollDirConfig {
                    interval_sec: 5,
                    priority: 25,
                    class: CfdpClass::Class2,
                    dest_eid: 23,
                    src_dir: "/cf/poll_dir".to_string(),
                    dst_dir: "./poll_dir".to_string(),
                    enabled: false,
                };
                cfg
            }
            1 => Self {
                connection_type: ConnectionType::Udp,
                udp_config: UdpConfig::localhost(11012, 11021),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    pub ticks_per_second: u32,
    /// Must be a non-zero multiple of 1024.
    pub rx_crc_calc_bytes_per_wakeup: u32,
    pub local_eid: EntityId,
    pub outgoing_file_chunk_size: u16,
    /// Directory for the temporary files of receive transactions.
    pub tmp_dir: String,
    pub chan: Vec<ChannelConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 10,
            rx_crc_calc_bytes_per_wakeup: 32768,
            local_eid: 25,
            outgoing_file_chunk_size: 1380,
            tmp_dir: "/cf/tmp".to_string(),
            chan: (0..NUM_CHANNELS as u8)
                .map(ChannelConfig::default_for_channel)
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Configuration with the given number of default bus channels.
    pub fn with_bus_channels(local_eid: EntityId, num_channels: usize) -> Self {
        Self {
            local_eid,
            chan: (0..num_channels).map(|_| ChannelConfig::default()).collect(),
            ..Default::default()
        }
    }

    pub fn channel(&self, chan: u8) -> Result<&ChannelConfig, ConfigError> {
        self.chan
            .get(chan as usize)
            .ok_or(ConfigError::InvalidChannel(chan))
    }

    pub fn channel_mut(&mut self, chan: u8) -> Result<&mut ChannelConfig, ConfigError> {
        self.chan
            .get_mut(chan as usize)
            .ok_or(ConfigError::InvalidChannel(chan))
    }

    pub fn validate(&self, ip_table: &ValidIpTable) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroTicksPerSecond);
        }
        validate_rx_crc_bytes(self.rx_crc_calc_bytes_per_wakeup)?;
        validate_chunk_size(self.outgoing_file_chunk_size)?;
        if self.chan.is_empty() || self.chan.len() > NUM_CHANNELS {
            return Err(ConfigError::InvalidChannelCount(self.chan.len()));
        }
        for (idx, chan_cfg) in self.chan.iter().enumerate() {
            if chan_cfg.connection_type == ConnectionType::Udp
                && !ip_table.contains(idx as u8, &chan_cfg.udp_config.the_other_addr)
            {
                return Err(ConfigError::PeerNotInIpTable {
                    chan: idx as u8,
                    addr: chan_cfg.udp_config.the_other_addr,
                });
            }
        }
        Ok(())
    }

    pub fn get_param(&self, param: ParamId, chan: u8) -> Result<u64, ConfigError> {
        let chan_cfg = self.channel(chan)?;
        Ok(match param {
            ParamId::TicksPerSecond => self.ticks_per_second as u64,
            ParamId::RxCrcCalcBytesPerWakeup => self.rx_crc_calc_bytes_per_wakeup as u64,
            ParamId::AckTimerS => chan_cfg.ack_timer_s as u64,
            ParamId::NakTimerS => chan_cfg.nak_timer_s as u64,
            ParamId::InactivityTimerS => chan_cfg.inactivity_timer_s as u64,
            ParamId::OutgoingFileChunkSize => self.outgoing_file_chunk_size as u64,
            ParamId::AckLimit => chan_cfg.ack_limit as u64,
            ParamId::NakLimit => chan_cfg.nak_limit as u64,
            ParamId::LocalEid => self.local_eid,
            ParamId::MaxOutgoingMessagesPerWakeup => {
                chan_cfg.max_outgoing_messages_per_wakeup as u64
            }
        })
    }

    /// Change one parameter. Values are checked with the same rules as [Self::validate].
    pub fn set_param(&mut self, param: ParamId, value: u64, chan: u8) -> Result<(), ConfigError> {
        let invalid = ConfigError::InvalidParamValue { param, value };
        let as_u32 = |value: u64| u32::try_from(value).map_err(|_| invalid.clone());
        let as_u8 = |value: u64| u8::try_from(value).map_err(|_| invalid.clone());
        // Checked up front, so a rejected value never leaves a partial update behind.
        self.channel(chan)?;
        match param {
            ParamId::TicksPerSecond => {
                let tps = as_u32(value)?;
                if tps == 0 {
                    return Err(invalid);
                }
                self.ticks_per_second = tps;
            }
            ParamId::RxCrcCalcBytesPerWakeup => {
                let bytes = as_u32(value)?;
                validate_rx_crc_bytes(bytes).map_err(|_| invalid.clone())?;
                self.rx_crc_calc_bytes_per_wakeup = bytes;
            }
            ParamId::OutgoingFileChunkSize => {
                let size = u16::try_from(value).map_err(|_| invalid.clone())?;
                validate_chunk_size(size).map_err(|_| invalid.clone())?;
                self.outgoing_file_chunk_size = size;
            }
            ParamId::LocalEid => self.local_eid = value,
            ParamId::AckTimerS => self.channel_mut(chan)?.ack_timer_s = as_u32(value)?,
            ParamId::NakTimerS => self.channel_mut(chan)?.nak_timer_s = as_u32(value)?,
            ParamId::InactivityTimerS => {
                self.channel_mut(chan)?.inactivity_timer_s = as_u32(value)?
            }
            ParamId::AckLimit => self.channel_mut(chan)?.ack_limit = as_u8(value)?,
            ParamId::NakLimit => self.channel_mut(chan)?.nak_limit = as_u8(value)?,
            ParamId::MaxOutgoingMessagesPerWakeup => {
                self.channel_mut(chan)?.max_outgoing_messages_per_wakeup = as_u32(value)?
            }
        }
        Ok(())
    }
}

fn validate_rx_crc_bytes(bytes: u32) -> Result<(), ConfigError> {
    if bytes == 0 || bytes & 0x3ff != 0 {
        return Err(ConfigError::InvalidRxCrcBytes(bytes));
    }
    Ok(())
}

fn validate_chunk_size(size: u16) -> Result<(), ConfigError> {
    if size as usize > MAX_FILE_DATA_SIZE {
        return Err(ConfigError::ChunkSizeTooLarge {
            size,
            max: MAX_FILE_DATA_SIZE,
        });
    }
    Ok(())
}

/// Parameters which can be read and changed at runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParamId {
    TicksPerSecond,
    RxCrcCalcBytesPerWakeup,
    AckTimerS,
    NakTimerS,
    InactivityTimerS,
    OutgoingFileChunkSize,
    AckLimit,
    NakLimit,
    LocalEid,
    MaxOutgoingMessagesPerWakeup,
}

/// Per channel allow list of UDP peer addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValidIpTable {
    entries: Vec<heapless::Vec<SocketAddr, MAX_VALID_IPS_PER_CHAN>>,
}

impl Default for ValidIpTable {
    fn default() -> Self {
        let mut table = Self::empty();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        // Cannot fail on an empty table.
        let _ = table.add(0, SocketAddr::new(localhost, 11001));
        let _ = table.add(1, SocketAddr::new(localhost, 11021));
        table
    }
}

impl ValidIpTable {
    pub fn empty() -> Self {
        Self {
            entries: (0..NUM_CHANNELS).map(|_| heapless::Vec::new()).collect(),
        }
    }

    pub fn add(&mut self, chan: u8, addr: SocketAddr) -> Result<(), ConfigError> {
        let entries = self
            .entries
            .get_mut(chan as usize)
            .ok_or(ConfigError::InvalidChannel(chan))?;
        if entries.contains(&addr) {
            return Ok(());
        }
        entries.push(addr).map_err(|_| ConfigError::IpTableFull(chan))
    }

    pub fn contains(&self, chan: u8, addr: &SocketAddr) -> bool {
        self.entries
            .get(chan as usize)
            .is_some_and(|entries| entries.contains(addr))
    }

    pub fn channel_entries(&self, chan: u8) -> &[SocketAddr] {
        self.entries
            .get(chan as usize)
            .map(|entries| entries.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chan.len(), NUM_CHANNELS);
        assert_eq!(cfg.chan[0].ack_timer_s, 14);
        assert_eq!(cfg.chan[1].ack_timer_s, 3);
        assert_eq!(cfg.chan[2].connection_type, ConnectionType::Bus);
        assert_eq!(cfg.chan[0].polldir[0].priority, 25);
        assert!(!cfg.chan[0].polldir[0].enabled);
        cfg.validate(&ValidIpTable::default()).unwrap();
    }

    #[test]
    fn test_validation_failures() {
        let table = ValidIpTable::default();
        let mut cfg = EngineConfig::default();
        cfg.ticks_per_second = 0;
        assert_eq!(
            cfg.validate(&table),
            Err(ConfigError::ZeroTicksPerSecond)
        );

        let mut cfg = EngineConfig::default();
        cfg.rx_crc_calc_bytes_per_wakeup = 1000;
        assert_eq!(
            cfg.validate(&table),
            Err(ConfigError::InvalidRxCrcBytes(1000))
        );

        let mut cfg = EngineConfig::default();
        cfg.outgoing_file_chunk_size = 1500;
        assert!(matches!(
            cfg.validate(&table),
            Err(ConfigError::ChunkSizeTooLarge { size: 1500, .. })
        ));

        let cfg = EngineConfig::default();
        assert!(matches!(
            cfg.validate(&ValidIpTable::empty()),
            Err(ConfigError::PeerNotInIpTable { chan: 0, .. })
        ));

        let mut cfg = EngineConfig::default();
        cfg.chan.clear();
        assert_eq!(
            cfg.validate(&table),
            Err(ConfigError::InvalidChannelCount(0))
        );
    }

    #[test]
    fn test_bus_channels_need_no_ip_table() {
        let cfg = EngineConfig::with_bus_channels(3, 2);
        cfg.validate(&ValidIpTable::empty()).unwrap();
    }

    #[test]
    fn test_ip_table_capacity() {
        let mut table = ValidIpTable::empty();
        for port in 0..MAX_VALID_IPS_PER_CHAN as u16 {
            table
                .add(2, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
                .unwrap();
        }
        let extra = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999);
        assert_eq!(table.add(2, extra), Err(ConfigError::IpTableFull(2)));
        assert_eq!(table.channel_entries(2).len(), MAX_VALID_IPS_PER_CHAN);
        assert!(!table.contains(2, &extra));
        assert!(table.channel_entries(42).is_empty());
    }

    #[test]
    fn test_get_set_param() {
        let mut cfg = EngineConfig::default();
        cfg.set_param(ParamId::AckLimit, 7, 2).unwrap();
        assert_eq!(cfg.get_param(ParamId::AckLimit, 2).unwrap(), 7);
        assert_eq!(cfg.get_param(ParamId::AckLimit, 1).unwrap(), 4);
        cfg.set_param(ParamId::RxCrcCalcBytesPerWakeup, 2048, 0)
            .unwrap();
        assert_eq!(cfg.rx_crc_calc_bytes_per_wakeup, 2048);
        assert!(cfg
            .set_param(ParamId::RxCrcCalcBytesPerWakeup, 2047, 0)
            .is_err());
        assert!(cfg.set_param(ParamId::TicksPerSecond, 0, 0).is_err());
        assert!(cfg.set_param(ParamId::AckLimit, 300, 0).is_err());
        assert!(cfg
            .set_param(ParamId::OutgoingFileChunkSize, 4000, 0)
            .is_err());
        assert_eq!(
            cfg.set_param(ParamId::NakLimit, 1, 20),
            Err(ConfigError::InvalidChannel(20))
        );
        cfg.set_param(ParamId::LocalEid, 77, 0).unwrap();
        assert_eq!(cfg.get_param(ParamId::LocalEid, 3).unwrap(), 77);
    }
}
