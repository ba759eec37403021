//! This crate contains a bounded-memory CCSDS File Delivery Protocol (CFDP) transaction engine
//! as specified in CCSDS 727.0-B-5, shaped for flight software.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). Class 1 transfers are unacknowledged: the sender streams Metadata, File Data
//! and an EOF PDU and forgets about the transaction. Class 2 transfers are acknowledged: the
//! receiver requests lost segments with NAK PDUs, acknowledges the EOF and reports the outcome
//! with a Finished PDU which the sender acknowledges in turn.
//!
//! # Engine model
//!
//! The [engine::Engine] is driven by the application at a fixed wakeup rate. Each call to
//! [engine::Engine::cycle] visits all channels in order and per channel
//!
//! 1. receives a bounded number of PDUs from the channel transport and dispatches them to the
//!    matching transaction or admits a new receive transaction,
//! 2. ticks the ACK, NAK and inactivity timers of all transactions and emits their pending
//!    responses,
//! 3. advances directory playbacks and polling directories,
//! 4. emits file PDUs of the active send transactions until the per wakeup outgoing quota
//!    is reached.
//!
//! All memory is allocated when the engine is created. Transactions, histories and chunk lists
//! live in the fixed pools of the [arena] module and are linked into the intrusive queues of
//! the [queue] module. Timers count wakeups, so there is no dependency on a wall clock.
//!
//! # Features
//!
//! The PDU [codec], [chunks], [timer] and [checksum] modules are `no_std` compatible. The pool
//! and queue containers require `alloc`. The engine itself, its transports and the native
//! filestore require `std`, which is enabled by default.
//!
//! # Notes on the user hooks
//!
//! The engine reports fault handler decisions through the [UserFaultHookProvider] and every
//! finished transaction through [EngineUser::transaction_finished]. The end-to-end integration
//! tests of this crate use these hooks to collect the outcome of file copy operations between
//! two engines.
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "alloc")]
pub mod arena;
pub mod checksum;
pub mod chunks;
#[cfg(feature = "std")]
mod channel;
#[cfg(feature = "std")]
pub mod cmd;
pub mod codec;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod counters;
#[cfg(feature = "std")]
mod dest;
#[cfg(feature = "std")]
pub mod engine;
#[cfg(feature = "std")]
pub mod filestore;
pub mod pdu;
#[cfg(feature = "std")]
mod playback;
#[cfg(feature = "alloc")]
pub mod queue;
#[cfg(feature = "std")]
mod source;
pub mod timer;
#[cfg(feature = "std")]
pub mod transaction;
#[cfg(feature = "std")]
pub mod transport;

use core::fmt::Display;
use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISCSI, CRC_32_ISO_HDLC};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::{ConditionCode, FaultHandlerCode, TransmissionMode};

pub type EntityId = u64;
pub type TransactionSeq = u64;

pub const NUM_CHANNELS: usize = 7;
pub const NAK_MAX_SEGMENTS: usize = 58;
pub const MAX_SIMULTANEOUS_RX: usize = 4;
pub const MAX_COMMANDED_PLAYBACK_FILES_PER_CHAN: usize = 4;
pub const MAX_COMMANDED_PLAYBACK_DIRECTORIES_PER_CHAN: usize = 2;
pub const MAX_POLLING_DIR_PER_CHAN: usize = 5;
pub const NUM_TRANSACTIONS_PER_PLAYBACK: usize = 5;
pub const NUM_TRANSACTIONS_PER_CHANNEL: usize = MAX_COMMANDED_PLAYBACK_FILES_PER_CHAN
    + MAX_SIMULTANEOUS_RX
    + (MAX_POLLING_DIR_PER_CHAN + MAX_COMMANDED_PLAYBACK_DIRECTORIES_PER_CHAN)
        * NUM_TRANSACTIONS_PER_PLAYBACK;
pub const NUM_HISTORIES_PER_CHANNEL: usize = 256;
pub const MAX_PDU_SIZE: usize = 1412;
pub const R2_CRC_CHUNK_SIZE: usize = 2048;
pub const FILENAME_MAX_LEN: usize = 128;
pub const MAX_VALID_IPS_PER_CHAN: usize = 16;

/// Largest file data payload which fits into a PDU with the smallest possible header
/// (4 byte fixed part, one byte entity IDs and sequence number) and a 4 byte offset field.
pub const MAX_FILE_DATA_SIZE: usize = MAX_PDU_SIZE - codec::FIXED_HEADER_LEN - 3 - 4;

/// Numeric status codes as reported by the flight software interfaces.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = -1;
    pub const PDU_METADATA_ERROR: i32 = -2;
    pub const SHORT_PDU_ERROR: i32 = -3;
    pub const REC_PDU_FSIZE_MISMATCH_ERROR: i32 = -4;
    pub const REC_PDU_BAD_EOF_ERROR: i32 = -5;
    pub const SEND_PDU_NO_BUF_AVAIL_ERROR: i32 = -6;
    pub const SEND_PDU_ERROR: i32 = -7;
}

/// CRC algorithm used for the PDU CRC trailer, CRC-16/CCITT-FALSE.
pub static CRC_16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
/// CRC algorithm which is used for the CRC32 checksum type as specified in the
/// [SANA Checksum Types registry](https://sanaregistry.org/r/checksum_identifiers/).
pub static CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// CRC algorithm which is used for the CRC32C checksum type as specified in the
/// [SANA Checksum Types registry](https://sanaregistry.org/r/checksum_identifiers/).
pub static CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The CFDP transaction ID consists of the source entity ID and the sequence number of that
/// transfer which is also determined by the source entity.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId {
    pub source_eid: EntityId,
    pub seq_num: TransactionSeq,
}

impl TransactionId {
    pub const fn new(source_eid: EntityId, seq_num: TransactionSeq) -> Self {
        Self {
            source_eid,
            seq_num,
        }
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source_eid, self.seq_num)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CfdpClass {
    /// Unacknowledged transfer.
    #[default]
    Class1,
    /// Acknowledged transfer.
    Class2,
}

impl CfdpClass {
    pub fn transmission_mode(&self) -> TransmissionMode {
        match self {
            CfdpClass::Class1 => TransmissionMode::Unacknowledged,
            CfdpClass::Class2 => TransmissionMode::Acknowledged,
        }
    }
}

impl From<TransmissionMode> for CfdpClass {
    fn from(mode: TransmissionMode) -> Self {
        match mode {
            TransmissionMode::Unacknowledged => CfdpClass::Class1,
            TransmissionMode::Acknowledged => CfdpClass::Class2,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TxnDirection {
    #[default]
    Rx,
    Tx,
}

/// Per channel queues. Every transaction of a channel is linked into exactly one of
/// [QueueIdx::Pend], [QueueIdx::Txa], [QueueIdx::Txw], [QueueIdx::Rx] and [QueueIdx::Free].
/// Histories live in [QueueIdx::Hist] and [QueueIdx::HistFree].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QueueIdx {
    Pend = 0,
    Txa = 1,
    Txw = 2,
    Rx = 3,
    Hist = 4,
    HistFree = 5,
    Free = 6,
}

pub const NUM_QUEUES: usize = 7;

/// Final or current status of a transaction.
///
/// Besides the protocol condition codes, this carries local error causes which have no
/// dedicated condition code. [TxnStatus::condition_code] maps each status to the condition
/// code which is reported to the peer.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TxnStatus {
    /// No final status was determined yet.
    #[default]
    Undefined,
    Condition(ConditionCode),
    ProtocolError,
    AckLimitNoFin,
    AckLimitNoEof,
    NakResponseError,
    SendEofFailure,
    EarlyFin,
    ReadFailure,
    NoResource,
}

impl TxnStatus {
    pub fn is_error(&self) -> bool {
        match self {
            TxnStatus::Undefined => false,
            TxnStatus::Condition(cc) => *cc != ConditionCode::NoError,
            _ => true,
        }
    }

    pub fn condition_code(&self) -> ConditionCode {
        match self {
            TxnStatus::Undefined => ConditionCode::NoError,
            TxnStatus::Condition(cc) => *cc,
            TxnStatus::AckLimitNoFin | TxnStatus::AckLimitNoEof => {
                ConditionCode::PositiveAckLimitReached
            }
            TxnStatus::ReadFailure | TxnStatus::NoResource => ConditionCode::FilestoreRejection,
            TxnStatus::ProtocolError
            | TxnStatus::NakResponseError
            | TxnStatus::SendEofFailure
            | TxnStatus::EarlyFin => ConditionCode::CancelRequestReceived,
        }
    }
}

impl From<ConditionCode> for TxnStatus {
    fn from(cc: ConditionCode) -> Self {
        TxnStatus::Condition(cc)
    }
}

/// Callbacks which notify the user about the handling of a fault. Exactly one of them is
/// called for every fault, selected by the [FaultHandlerCode] configured for its condition
/// code.
pub trait UserFaultHookProvider {
    fn notice_of_suspension_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64);

    fn notice_of_cancellation_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64);

    fn abandoned_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64);

    fn ignore_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64);
}

/// User interface of the engine. Receives the end-of-transaction record of every transaction
/// which leaves the active queues.
#[cfg(feature = "std")]
pub trait EngineUser: UserFaultHookProvider {
    fn transaction_finished(&mut self, record: &transaction::EotRecord);
}

/// Dummy user which implements [UserFaultHookProvider] and [EngineUser] with empty
/// implementations.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DummyUser {}

impl UserFaultHookProvider for DummyUser {
    fn notice_of_suspension_cb(&mut self, _: TransactionId, _: ConditionCode, _: u64) {}

    fn notice_of_cancellation_cb(&mut self, _: TransactionId, _: ConditionCode, _: u64) {}

    fn abandoned_cb(&mut self, _: TransactionId, _: ConditionCode, _: u64) {}

    fn ignore_cb(&mut self, _: TransactionId, _: ConditionCode, _: u64) {}
}

#[cfg(feature = "std")]
impl EngineUser for DummyUser {
    fn transaction_finished(&mut self, _record: &transaction::EotRecord) {}
}

/// Condition codes with a configurable fault handler, in table order.
const FAULT_CONDITIONS: [ConditionCode; 10] = [
    ConditionCode::PositiveAckLimitReached,
    ConditionCode::KeepAliveLimitReached,
    ConditionCode::InvalidTransmissionMode,
    ConditionCode::FilestoreRejection,
    ConditionCode::FileChecksumFailure,
    ConditionCode::FileSizeError,
    ConditionCode::NakLimitReached,
    ConditionCode::InactivityDetected,
    ConditionCode::CheckLimitReached,
    ConditionCode::UnsupportedChecksumType,
];

/// Fault handler table of the engine.
///
/// Every fault a transaction detects is reported with its condition code. The table selects
/// one of the four [FaultHandlerCode]s for it, the matching [UserFaultHookProvider] callback
/// is invoked and the state machines act on the returned code:
///
/// - [FaultHandlerCode::NoticeOfCancellation]: the transaction is closed gracefully. A send
///   transaction emits an EOF with the fault condition, a class 2 receive transaction a
///   Finished PDU.
/// - [FaultHandlerCode::NoticeOfSuspension]: the transaction is suspended.
/// - [FaultHandlerCode::IgnoreError]: processing continues.
/// - [FaultHandlerCode::AbandonTransaction]: the transaction ends without further PDUs.
///
/// Every condition starts out with [FaultHandlerCode::NoticeOfCancellation].
#[derive(Debug)]
pub struct FaultHandler<User: UserFaultHookProvider> {
    handlers: [FaultHandlerCode; FAULT_CONDITIONS.len()],
    pub user_hook: User,
}

impl<User: UserFaultHookProvider> FaultHandler<User> {
    pub fn new(user_hook: User) -> Self {
        Self {
            handlers: [FaultHandlerCode::NoticeOfCancellation; FAULT_CONDITIONS.len()],
            user_hook,
        }
    }

    fn slot(cond: ConditionCode) -> Option<usize> {
        FAULT_CONDITIONS.iter().position(|entry| *entry == cond)
    }

    /// Returns false if the condition code has no configurable handler.
    pub fn set_fault_handler(&mut self, cond: ConditionCode, code: FaultHandlerCode) -> bool {
        match Self::slot(cond) {
            Some(idx) => {
                self.handlers[idx] = code;
                true
            }
            None => false,
        }
    }

    /// Conditions without a table entry, for example a cancel request, are always handled
    /// as [FaultHandlerCode::NoticeOfCancellation].
    pub fn get_fault_handler(&self, cond: ConditionCode) -> FaultHandlerCode {
        Self::slot(cond)
            .map(|idx| self.handlers[idx])
            .unwrap_or(FaultHandlerCode::NoticeOfCancellation)
    }

    /// Notify the user and return the handler which applies to the fault.
    pub fn report_fault(
        &mut self,
        id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) -> FaultHandlerCode {
        let code = self.get_fault_handler(cond);
        log::warn!(
            "CF: transaction {} fault {:?} at offset {}, handled with {:?}",
            id,
            cond,
            progress,
            code
        );
        match code {
            FaultHandlerCode::NoticeOfCancellation => {
                self.user_hook.notice_of_cancellation_cb(id, cond, progress)
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.user_hook.notice_of_suspension_cb(id, cond, progress)
            }
            FaultHandlerCode::IgnoreError => self.user_hook.ignore_cb(id, cond, progress),
            FaultHandlerCode::AbandonTransaction => self.user_hook.abandoned_cb(id, cond, progress),
        }
        code
    }
}
