//! # Transaction Module
//!
//! Per transaction state shared by the send ([crate::source]) and receive ([crate::dest])
//! state machines, the history records which outlive a transaction and the
//! [EotRecord] reported to the [crate::EngineUser] when a transaction finishes.
use std::{format, string::String};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::{
    pdu::finished::{DeliveryCode, FileStatus},
    ChecksumType, ConditionCode, CrcFlag, Direction, FaultHandlerCode, LargeFileFlag,
};

use crate::{
    arena::Handle,
    channel::ChannelIo,
    checksum::FileChecksum,
    chunks::ChunkList,
    codec::CodecError,
    config::{ChannelConfig, EngineConfig},
    filestore::VirtualFilestore,
    pdu::{Pdu, PduBody, PduHeader},
    playback::PlaybackRef,
    status,
    timer::Timer,
    transport::TransportError,
    CfdpClass, EngineUser, EntityId, FaultHandler, QueueIdx, TransactionId, TransactionSeq,
    TxnDirection, TxnStatus, FILENAME_MAX_LEN, NAK_MAX_SEGMENTS,
};

pub type Filename = heapless::String<FILENAME_MAX_LEN>;
pub(crate) type TxnChunks = ChunkList<NAK_MAX_SEGMENTS>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TxnState {
    /// Allocated for an inbound PDU, class not determined yet.
    #[default]
    Idle,
    S1,
    S2,
    R1,
    R2,
    /// Receive transaction which could not be set up. Further PDUs are ignored until the
    /// inactivity timer expires.
    Drop,
}

/// Summary of a transaction which is kept after the transaction itself was released.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct History {
    pub seq_num: TransactionSeq,
    pub src_eid: EntityId,
    pub peer_eid: EntityId,
    pub dir: TxnDirection,
    pub txn_stat: TxnStatus,
    pub fsize: u64,
    pub src_filename: Filename,
    pub dst_filename: Filename,
}

impl History {
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.src_eid, self.seq_num)
    }
}

/// End of transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EotRecord {
    pub channel: u8,
    /// State of the transaction when it finished.
    pub state: TxnState,
    pub crc_result: u32,
    pub history: History,
}

impl EotRecord {
    pub fn transaction_id(&self) -> TransactionId {
        self.history.transaction_id()
    }

    pub fn is_success(&self) -> bool {
        !self.history.txn_stat.is_error()
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TxSubState {
    #[default]
    Metadata,
    FileData,
    Eof,
    /// EOF sent, waiting for the EOF ACK and the Finished PDU.
    CloseoutSync,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RxSubState {
    #[default]
    FileData,
    /// All data received, checksum verification in progress.
    Eof,
    /// Finished PDU sent, waiting for its ACK.
    CloseoutSync,
}

#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct TxnFlags {
    pub suspended: bool,
    pub canceled: bool,
    /// Started by the transmit file command, counts against the commanded file limit.
    pub cmd_tx: bool,
    pub md_recv: bool,
    pub eof_recv: bool,
    pub fin_recv: bool,
    pub eof_acked: bool,
    pub file_created: bool,
    pub out_of_order: bool,
    pub complete: bool,
    pub crc_done: bool,
    pub md_need_send: bool,
    pub send_eof: bool,
    pub send_ack: bool,
    pub send_nak: bool,
    pub send_fin: bool,
    pub send_fin_ack: bool,
    pub finish_after_ack: bool,
    pub ack_timer_armed: bool,
    pub nak_timer_armed: bool,
    pub inactivity_armed: bool,
    pub finished: bool,
    /// Release without writing a history entry.
    pub drop_history: bool,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub state: TxnState,
    pub class: CfdpClass,
    pub history: Option<usize>,
    pub chunks: Option<Handle>,
    pub priority: u8,
    pub keep: bool,
    /// Send: size of the source file. Receive: size announced by the Metadata or EOF PDU.
    pub fsize: u64,
    /// Send: offset of the next new file data. Receive: end of the highest received segment.
    pub foffs: u64,
    /// Receive: number of bytes already fed into the checksum in file order.
    pub crc_offset: u64,
    pub checksum: FileChecksum,
    pub checksum_type: ChecksumType,
    pub crc_result: u32,
    pub eof_checksum: u32,
    pub closure_requested: bool,
    pub ack_timer: Timer,
    pub nak_timer: Timer,
    pub inactivity_timer: Timer,
    pub acknak_count: u8,
    pub tx_sub: TxSubState,
    pub rx_sub: RxSubState,
    /// Condition code of the EOF to send.
    pub eof_cc: ConditionCode,
    /// Send: received Finished PDU. Receive: Finished PDU to send.
    pub fin_cc: ConditionCode,
    pub fin_dc: DeliveryCode,
    pub fin_fs: FileStatus,
    pub playback: Option<PlaybackRef>,
    pub flags: TxnFlags,
    /// Queue the channel moves the transaction to after the current event.
    pub requeue: Option<QueueIdx>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TxnState::Idle,
            class: CfdpClass::Class1,
            history: None,
            chunks: None,
            priority: 0,
            keep: true,
            fsize: 0,
            foffs: 0,
            crc_offset: 0,
            checksum: FileChecksum::default(),
            checksum_type: ChecksumType::Modular,
            crc_result: 0,
            eof_checksum: 0,
            closure_requested: false,
            ack_timer: Timer::default(),
            nak_timer: Timer::default(),
            inactivity_timer: Timer::default(),
            acknak_count: 0,
            tx_sub: TxSubState::default(),
            rx_sub: RxSubState::default(),
            eof_cc: ConditionCode::NoError,
            fin_cc: ConditionCode::NoError,
            fin_dc: DeliveryCode::Incomplete,
            fin_fs: FileStatus::DiscardDeliberately,
            playback: None,
            flags: TxnFlags::default(),
            requeue: None,
        }
    }
}

impl Transaction {
    pub fn is_tx(&self) -> bool {
        matches!(self.state, TxnState::S1 | TxnState::S2)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
    #[error("no send buffer available")]
    NoBufferAvailable,
    #[error("PDU encoding failed: {0}")]
    Codec(#[from] CodecError),
    /// The transport rejected the PDU for another reason than being busy.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SendError {
    pub fn status_code(&self) -> i32 {
        match self {
            SendError::NoBufferAvailable => status::SEND_PDU_NO_BUF_AVAIL_ERROR,
            SendError::Codec(_) | SendError::Transport(_) => status::SEND_PDU_ERROR,
        }
    }

    /// The PDU stays due and is emitted again on a later wakeup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::NoBufferAvailable | SendError::Transport(_))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RecvError {
    #[error("file size mismatch, expected {expected}, received {received}")]
    FileSizeMismatch { expected: u64, received: u64 },
    #[error("EOF received before metadata")]
    BadEof,
}

impl RecvError {
    pub fn status_code(&self) -> i32 {
        match self {
            RecvError::FileSizeMismatch { .. } => status::REC_PDU_FSIZE_MISMATCH_ERROR,
            RecvError::BadEof => status::REC_PDU_BAD_EOF_ERROR,
        }
    }
}

/// Advance an armed timer by one tick. Returns [true] once when the timer expires, which also
/// disarms it.
pub(crate) fn tick_armed(timer: &mut Timer, armed: &mut bool) -> bool {
    if !*armed {
        return false;
    }
    if !timer.expired() {
        timer.tick();
    }
    if timer.expired() {
        *armed = false;
        return true;
    }
    false
}

/// Path of the temporary file which collects the data of a receive transaction.
pub(crate) fn tmp_file_path(tmp_dir: &str, src_eid: EntityId, seq_num: TransactionSeq) -> String {
    format!("{}/{}_{}.tmp", tmp_dir.trim_end_matches('/'), src_eid, seq_num)
}

/// Everything a state machine may touch while it handles one event of one transaction.
pub(crate) struct TxnCtx<'a, Vfs: VirtualFilestore, User: EngineUser> {
    pub cfg: &'a EngineConfig,
    pub chan_cfg: &'a ChannelConfig,
    pub io: &'a mut ChannelIo,
    pub vfs: &'a Vfs,
    pub faults: &'a mut FaultHandler<User>,
    pub txn: &'a mut Transaction,
    pub hist: &'a mut History,
    pub chunks: Option<&'a mut TxnChunks>,
    /// File data buffer.
    pub scratch: &'a mut [u8],
}

impl<Vfs: VirtualFilestore, User: EngineUser> TxnCtx<'_, Vfs, User> {
    pub fn id(&self) -> TransactionId {
        self.hist.transaction_id()
    }

    /// Header for a PDU of this transaction. The source of the transaction stays the source
    /// entity of the header independent of the PDU direction.
    pub fn header(&self, direction: Direction) -> PduHeader {
        let (source_eid, dest_eid) = match self.hist.dir {
            TxnDirection::Tx => (self.hist.src_eid, self.hist.peer_eid),
            TxnDirection::Rx => (self.hist.src_eid, self.cfg.local_eid),
        };
        let mut header = PduHeader::new(
            direction,
            self.txn.class.transmission_mode(),
            source_eid,
            self.hist.seq_num,
            dest_eid,
        );
        if self.chan_cfg.pdu_crc {
            header.crc_flag = CrcFlag::WithCrc;
        }
        if self.txn.fsize > u32::MAX as u64 {
            header.large_file_flag = LargeFileFlag::Large;
        }
        header
    }

    pub fn can_send(&self) -> bool {
        self.io.can_send(self.txn.flags.suspended)
    }

    pub fn send(&mut self, direction: Direction, body: PduBody<'_>) -> Result<(), SendError> {
        let pdu = Pdu::new(self.header(direction), body);
        self.io.send(&pdu, self.txn.flags.suspended)
    }

    /// Record the status. The first error status sticks.
    pub fn set_status(&mut self, status: TxnStatus) {
        if !self.hist.txn_stat.is_error() {
            self.hist.txn_stat = status;
        }
    }

    /// Declare a fault and return the configured handling. The status is recorded unless the
    /// fault is ignored or suspends the transaction.
    pub fn report_fault(&mut self, status: TxnStatus) -> FaultHandlerCode {
        let id = self.id();
        let code = self
            .faults
            .report_fault(id, status.condition_code(), self.txn.foffs);
        log::error!(
            "CF: transaction {} on channel {} fault {:?}, handling {:?}",
            id,
            self.io.chan,
            status,
            code
        );
        match code {
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::NoticeOfSuspension => self.txn.flags.suspended = true,
            FaultHandlerCode::NoticeOfCancellation | FaultHandlerCode::AbandonTransaction => {
                self.set_status(status)
            }
        }
        code
    }

    pub fn finish(&mut self) {
        self.txn.flags.finished = true;
    }

    pub fn requeue(&mut self, queue: QueueIdx) {
        self.txn.requeue = Some(queue);
    }

    pub fn arm_ack_timer(&mut self) {
        self.txn
            .ack_timer
            .init_rel_sec(self.chan_cfg.ack_timer_s, self.cfg.ticks_per_second);
        self.txn.flags.ack_timer_armed = true;
    }

    pub fn arm_nak_timer(&mut self) {
        self.txn
            .nak_timer
            .init_rel_sec(self.chan_cfg.nak_timer_s, self.cfg.ticks_per_second);
        self.txn.flags.nak_timer_armed = true;
    }

    pub fn arm_inactivity_timer(&mut self) {
        self.txn
            .inactivity_timer
            .init_rel_sec(self.chan_cfg.inactivity_timer_s, self.cfg.ticks_per_second);
        self.txn.flags.inactivity_armed = true;
    }

    pub fn tmp_file_path(&self) -> String {
        tmp_file_path(&self.cfg.tmp_dir, self.hist.src_eid, self.hist.seq_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_armed() {
        let mut timer = Timer::new_rel_sec(1, 2);
        let mut armed = true;
        assert!(!tick_armed(&mut timer, &mut armed));
        assert!(tick_armed(&mut timer, &mut armed));
        assert!(!armed);
        // Disarmed timers are not ticked any further.
        assert!(!tick_armed(&mut timer, &mut armed));
    }

    #[test]
    fn test_zero_timer_expires_on_first_tick() {
        let mut timer = Timer::new_rel_sec(0, 10);
        let mut armed = true;
        assert!(tick_armed(&mut timer, &mut armed));
    }

    #[test]
    fn test_tmp_file_path() {
        assert_eq!(tmp_file_path("/cf/tmp/", 23, 4), "/cf/tmp/23_4.tmp");
        assert_eq!(tmp_file_path("tmp", 1, 100), "tmp/1_100.tmp");
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            SendError::NoBufferAvailable.status_code(),
            status::SEND_PDU_NO_BUF_AVAIL_ERROR
        );
        assert_eq!(
            RecvError::FileSizeMismatch {
                expected: 1,
                received: 2
            }
            .status_code(),
            status::REC_PDU_FSIZE_MISMATCH_ERROR
        );
        assert_eq!(RecvError::BadEof.status_code(), status::REC_PDU_BAD_EOF_ERROR);
        let transport = SendError::from(TransportError::PeerDisconnected);
        assert_eq!(transport.status_code(), status::SEND_PDU_ERROR);
        assert!(transport.is_retryable());
        assert!(!SendError::from(CodecError::BufferTooSmall).is_retryable());
    }

    #[test]
    fn test_eot_record_success() {
        let mut record = EotRecord {
            channel: 0,
            state: TxnState::S1,
            crc_result: 0,
            history: History {
                seq_num: 3,
                src_eid: 5,
                ..Default::default()
            },
        };
        assert!(record.is_success());
        assert_eq!(record.transaction_id(), TransactionId::new(5, 3));
        record.history.txn_stat = TxnStatus::AckLimitNoEof;
        assert!(!record.is_success());
    }
}
