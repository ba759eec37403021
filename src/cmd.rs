//! # Command Module
//!
//! Commands accepted by the [Engine]. Every command can be called directly through the
//! respective engine method, or dispatched through [Engine::execute] which also maintains the
//! accepted and rejected command counters reported in the housekeeping data.
use std::{net::SocketAddr, string::String};

use derive_new::new;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, ParamId},
    counters::ResetKind,
    engine::Engine,
    filestore::{FilestoreError, VirtualFilestore},
    transport::TransportError,
    CfdpClass, EngineUser, EntityId, TransactionId,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CmdError {
    #[error("engine is disabled")]
    EngineDisabled,
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),
    #[error("transaction {0} is already in the requested state")]
    AlreadyInState(TransactionId),
    #[error("channel {0} reached the limit of commanded file transfers")]
    CommandedFileLimit(u8),
    #[error("no free transaction")]
    NoFreeTransaction,
    #[error("channel {0} has no idle playback slot")]
    NoFreePlayback(u8),
    #[error("file name too long: {0}")]
    FilenameTooLong(String),
    #[error("invalid polling directory {0}")]
    InvalidPollDir(u8),
    #[error("channel {0} is not a UDP channel")]
    NotUdpChannel(u8),
    #[error("address {addr} is not a valid peer of channel {chan}")]
    AddressNotAllowed { chan: u8, addr: SocketAddr },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
}

/// Transmit a single file.
#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TxFileRequest {
    pub class: CfdpClass,
    /// Keep the source file after a successful transfer. Otherwise it is moved to the move
    /// directory of the channel or deleted.
    pub keep: bool,
    pub chan: u8,
    /// Lower values are served first.
    pub priority: u8,
    pub dest_eid: EntityId,
    pub src_filename: String,
    pub dst_filename: String,
}

/// Transmit all regular files of a directory.
#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlaybackRequest {
    pub class: CfdpClass,
    pub keep: bool,
    pub chan: u8,
    pub priority: u8,
    pub dest_eid: EntityId,
    pub src_dir: String,
    pub dst_dir: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TxnSelector {
    Id(TransactionId),
    Channel(u8),
    All,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelSelector {
    Channel(u8),
    All,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PollSelector {
    Dir(u8),
    All,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PurgeTarget {
    Pending,
    History,
    Both,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QueueSelector {
    Pending,
    /// Transactions which are sending, waiting for a peer or receiving.
    Active,
    History,
    All,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DirectionSelector {
    /// Receive transactions.
    Up,
    /// Send transactions.
    Down,
    All,
}

/// Write a listing of queue entries to a file.
#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WriteQueueRequest {
    pub chan: u8,
    pub queue: QueueSelector,
    pub direction: DirectionSelector,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Command {
    Noop,
    ResetCounters(ResetKind),
    TxFile(TxFileRequest),
    PlaybackDir(PlaybackRequest),
    Freeze(ChannelSelector),
    Thaw(ChannelSelector),
    Suspend(TxnSelector),
    Resume(TxnSelector),
    Cancel(TxnSelector),
    Abandon(TxnSelector),
    SetParam { param: ParamId, value: u64, chan: u8 },
    GetParam { param: ParamId, chan: u8 },
    WriteQueue(WriteQueueRequest),
    EnableDequeue(ChannelSelector),
    DisableDequeue(ChannelSelector),
    EnablePolling { chan: ChannelSelector, dir: PollSelector },
    DisablePolling { chan: ChannelSelector, dir: PollSelector },
    PurgeQueue { chan: ChannelSelector, target: PurgeTarget },
    EnableEngine,
    DisableEngine,
    SwitchUdpAddress { chan: u8, addr: SocketAddr },
    OpenUdpChannel(u8),
    CloseUdpChannel(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CommandResponse {
    Done,
    Transaction(TransactionId),
    /// Number of affected transactions or written queue entries.
    Count(usize),
    Param(u64),
}

impl<Vfs: VirtualFilestore, User: EngineUser> Engine<Vfs, User> {
    /// Execute a command and update the command counters.
    pub fn execute(&mut self, cmd: Command) -> Result<CommandResponse, CmdError> {
        let result = self.execute_internal(cmd);
        match &result {
            Ok(_) => self.cmd_counters.cmd = self.cmd_counters.cmd.wrapping_add(1),
            Err(e) => {
                log::error!("CF: command rejected: {}", e);
                self.cmd_counters.err = self.cmd_counters.err.wrapping_add(1);
            }
        }
        result
    }

    fn execute_internal(&mut self, cmd: Command) -> Result<CommandResponse, CmdError> {
        Ok(match cmd {
            Command::Noop => {
                self.noop();
                CommandResponse::Done
            }
            Command::ResetCounters(kind) => {
                self.reset_counters(kind);
                CommandResponse::Done
            }
            Command::TxFile(request) => CommandResponse::Transaction(self.tx_file(request)?),
            Command::PlaybackDir(request) => {
                self.playback_dir(request)?;
                CommandResponse::Done
            }
            Command::Freeze(chan) => {
                self.freeze(chan)?;
                CommandResponse::Done
            }
            Command::Thaw(chan) => {
                self.thaw(chan)?;
                CommandResponse::Done
            }
            Command::Suspend(selector) => CommandResponse::Count(self.suspend(selector)?),
            Command::Resume(selector) => CommandResponse::Count(self.resume(selector)?),
            Command::Cancel(selector) => CommandResponse::Count(self.cancel(selector)?),
            Command::Abandon(selector) => CommandResponse::Count(self.abandon(selector)?),
            Command::SetParam { param, value, chan } => {
                self.set_param(param, value, chan)?;
                CommandResponse::Done
            }
            Command::GetParam { param, chan } => CommandResponse::Param(self.get_param(param, chan)?),
            Command::WriteQueue(request) => CommandResponse::Count(self.write_queue(&request)?),
            Command::EnableDequeue(chan) => {
                self.set_dequeue(chan, true)?;
                CommandResponse::Done
            }
            Command::DisableDequeue(chan) => {
                self.set_dequeue(chan, false)?;
                CommandResponse::Done
            }
            Command::EnablePolling { chan, dir } => {
                self.set_polling(chan, dir, true)?;
                CommandResponse::Done
            }
            Command::DisablePolling { chan, dir } => {
                self.set_polling(chan, dir, false)?;
                CommandResponse::Done
            }
            Command::PurgeQueue { chan, target } => {
                CommandResponse::Count(self.purge_queue(chan, target)?)
            }
            Command::EnableEngine => {
                self.enable_engine();
                CommandResponse::Done
            }
            Command::DisableEngine => {
                self.disable_engine();
                CommandResponse::Done
            }
            Command::SwitchUdpAddress { chan, addr } => {
                self.switch_udp_address(chan, addr)?;
                CommandResponse::Done
            }
            Command::OpenUdpChannel(chan) => {
                self.open_udp_channel(chan)?;
                CommandResponse::Done
            }
            Command::CloseUdpChannel(chan) => {
                self.close_udp_channel(chan)?;
                CommandResponse::Done
            }
        })
    }
}
