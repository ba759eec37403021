//! # Logical PDU Module
//!
//! Decoded, wire independent representation of CFDP PDUs. The [crate::codec] module converts
//! between these structures and the CCSDS 727.0-B-5 byte layout. Variable length parts like
//! file names and file data borrow from the raw buffer they were decoded from.
use derive_new::new;
use spacepackets::cfdp::{
    pdu::{
        finished::{DeliveryCode, FileStatus},
        FileDirectiveType,
    },
    ChecksumType, ConditionCode, CrcFlag, Direction, LargeFileFlag, PduType,
    SegmentationControl, TransactionStatus, TransmissionMode,
};

use crate::NAK_MAX_SEGMENTS;

/// Fixed PDU header.
///
/// The entity ID and sequence number lengths are in bytes. A length of zero requests the
/// encoder to pick the smallest width from {1, 2, 4, 8} which fits the respective values.
/// Decoded headers always carry the lengths found on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub direction: Direction,
    pub transmission_mode: TransmissionMode,
    pub crc_flag: CrcFlag,
    pub large_file_flag: LargeFileFlag,
    pub segmentation_control: SegmentationControl,
    pub eid_len: u8,
    pub seq_num_len: u8,
    pub source_eid: u64,
    pub seq_num: u64,
    pub dest_eid: u64,
}

impl PduHeader {
    /// Header with automatic field widths, no CRC and normal file size fields.
    pub fn new(
        direction: Direction,
        transmission_mode: TransmissionMode,
        source_eid: u64,
        seq_num: u64,
        dest_eid: u64,
    ) -> Self {
        Self {
            direction,
            transmission_mode,
            crc_flag: CrcFlag::NoCrc,
            large_file_flag: LargeFileFlag::Normal,
            segmentation_control: SegmentationControl::NoRecordBoundaryPreservation,
            eid_len: 0,
            seq_num_len: 0,
            source_eid,
            seq_num,
            dest_eid,
        }
    }

    pub fn is_large_file(&self) -> bool {
        self.large_file_flag == LargeFileFlag::Large
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MetadataPdu<'a> {
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
    pub source_filename: &'a [u8],
    pub dest_filename: &'a [u8],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
pub struct SegmentMetadata<'a> {
    pub record_continuation_state: u8,
    pub metadata: &'a [u8],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileDataPdu<'a> {
    pub offset: u64,
    pub data: &'a [u8],
    pub segment_metadata: Option<SegmentMetadata<'a>>,
}

/// End-of-file PDU. The fault location is the entity ID TLV which is only present when
/// the condition code is not [ConditionCode::NoError].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub checksum: u32,
    pub file_size: u64,
    pub fault_location: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FinPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub fault_location: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckPdu {
    /// Either [FileDirectiveType::EofPdu] or [FileDirectiveType::FinishedPdu].
    pub acked_directive: FileDirectiveType,
    pub directive_subtype: u8,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    pub fn new(
        acked_directive: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        // The directive subtype code is 0b0001 when acknowledging a Finished PDU.
        let directive_subtype = if acked_directive == FileDirectiveType::FinishedPdu {
            0b0001
        } else {
            0b0000
        };
        Self {
            acked_directive,
            directive_subtype,
            condition_code,
            transaction_status,
        }
    }
}

/// Inclusive start, exclusive end offset of a missing file extent. A `(0, 0)` request
/// asks for the Metadata PDU.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, new)]
pub struct SegmentRequest {
    pub start: u64,
    pub end: u64,
}

pub type SegmentRequestList = heapless::Vec<SegmentRequest, NAK_MAX_SEGMENTS>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    pub start_of_scope: u64,
    pub end_of_scope: u64,
    pub segment_requests: SegmentRequestList,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PromptResponse {
    Nak = 0,
    KeepAlive = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody<'a> {
    Metadata(MetadataPdu<'a>),
    FileData(FileDataPdu<'a>),
    Eof(EofPdu),
    Fin(FinPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Prompt(PromptResponse),
    KeepAlive(u64),
}

/// One complete logical PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu<'a> {
    pub header: PduHeader,
    pub body: PduBody<'a>,
}

impl<'a> Pdu<'a> {
    pub fn new(header: PduHeader, body: PduBody<'a>) -> Self {
        Self { header, body }
    }

    pub fn pdu_type(&self) -> PduType {
        match self.body {
            PduBody::FileData(_) => PduType::FileData,
            _ => PduType::FileDirective,
        }
    }

    /// Returns [None] for file data PDUs.
    pub fn directive(&self) -> Option<FileDirectiveType> {
        Some(match self.body {
            PduBody::Metadata(_) => FileDirectiveType::MetadataPdu,
            PduBody::FileData(_) => return None,
            PduBody::Eof(_) => FileDirectiveType::EofPdu,
            PduBody::Fin(_) => FileDirectiveType::FinishedPdu,
            PduBody::Ack(_) => FileDirectiveType::AckPdu,
            PduBody::Nak(_) => FileDirectiveType::NakPdu,
            PduBody::Prompt(_) => FileDirectiveType::PromptPdu,
            PduBody::KeepAlive(_) => FileDirectiveType::KeepAlivePdu,
        })
    }
}
