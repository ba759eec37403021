//! # PDU Codec Module
//!
//! Bit exact encoding and decoding of CCSDS 727.0-B-5 PDUs.
//!
//! The PDU header and the Metadata, File Data, EOF, Finished, ACK and NAK PDUs are built and
//! parsed with the [spacepackets] PDU creators and readers. Prompt and Keep Alive PDUs and the
//! NAK PDU without segment requests for large files are not covered by those and are written
//! with the [Encoder] cursor.
//!
//! Received PDUs first pass a structural check with the [Decoder] cursor. It verifies that every
//! field the readers access lies inside the data field, so malformed input is rejected with an
//! error before any reader touches it. The cursors fail closed: the first out of bounds access
//! or invalid value marks the cursor as broken and every subsequent operation becomes a no-op.
//! Callers can therefore perform a whole sequence of field accesses and check for errors once at
//! the end with [Encoder::finish] or [Decoder::check].
//!
//! The direction bit of an encoded PDU always follows its body, see [wire_direction].
use spacepackets::{
    cfdp::{
        lv::Lv,
        pdu::{
            ack::AckPdu as SpAckPdu,
            eof::EofPdu as SpEofPdu,
            file_data::{
                FileDataPdu as SpFileDataPdu, RecordContinuationState,
                SegmentMetadata as SpSegmentMetadata,
            },
            finished::{FinishedPduCreator, FinishedPduReader},
            metadata::{MetadataGenericParams, MetadataPduCreator, MetadataPduReader},
            nak::{NakPduCreator, NakPduReader},
            CommonPduConfig, FileDirectiveType, PduError, PduHeader as SpPduHeader,
            WritablePduPacket,
        },
        tlv::EntityIdTlv,
        CrcFlag, Direction, LargeFileFlag, PduType, SegmentMetadataFlag,
    },
    util::{UnsignedByteField, UnsignedEnum},
    ByteConversionError,
};

use crate::{
    pdu::{
        AckPdu, EofPdu, FileDataPdu, FinPdu, MetadataPdu, NakPdu, Pdu, PduBody, PduHeader,
        PromptResponse, SegmentMetadata, SegmentRequest, SegmentRequestList,
    },
    status, CRC_16, NAK_MAX_SEGMENTS,
};

/// Length of the fixed part of the PDU header.
pub const FIXED_HEADER_LEN: usize = 4;
/// Type code of the entity ID TLV used for the fault location.
pub const TLV_TYPE_ENTITY_ID: u8 = 0x06;
const CRC_LEN: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum CodecError {
    #[error("PDU is too short")]
    ShortPdu,
    #[error("malformed PDU field")]
    PduMetadata,
    #[error("unsupported CFDP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid entity ID length {0}")]
    InvalidEntityIdLength(u8),
    #[error("invalid sequence number length {0}")]
    InvalidSeqNumLength(u8),
    #[error("invalid directive code {0:#04x}")]
    InvalidDirective(u8),
    #[error("PDU CRC mismatch, expected {expected:#06x}, found {found:#06x}")]
    CrcMismatch { expected: u16, found: u16 },
    #[error("value {value} does not fit into {width} bytes")]
    ValueTooLarge { value: u64, width: u8 },
    #[error("encode buffer too small")]
    BufferTooSmall,
}

impl CodecError {
    /// Numeric status code as reported in engine events.
    pub fn status_code(&self) -> i32 {
        match self {
            CodecError::ShortPdu => status::SHORT_PDU_ERROR,
            CodecError::PduMetadata
            | CodecError::UnsupportedVersion(_)
            | CodecError::InvalidEntityIdLength(_)
            | CodecError::InvalidSeqNumLength(_)
            | CodecError::InvalidDirective(_)
            | CodecError::CrcMismatch { .. } => status::PDU_METADATA_ERROR,
            CodecError::ValueTooLarge { .. } | CodecError::BufferTooSmall => status::ERROR,
        }
    }
}

impl From<PduError> for CodecError {
    fn from(error: PduError) -> Self {
        match error {
            PduError::ByteConversion(ByteConversionError::ToSliceTooSmall { .. }) => {
                CodecError::BufferTooSmall
            }
            PduError::ByteConversion(_) => CodecError::ShortPdu,
            PduError::CfdpVersionMissmatch(version) => CodecError::UnsupportedVersion(version),
            PduError::InvalidEntityLen(len) => CodecError::InvalidEntityIdLength(len),
            PduError::InvalidTransactionSeqNumLen(len) => CodecError::InvalidSeqNumLength(len),
            PduError::FileSizeTooLarge(value) => CodecError::ValueTooLarge { value, width: 4 },
            _ => CodecError::PduMetadata,
        }
    }
}

/// Smallest width out of {1, 2, 4, 8} bytes which can hold the value.
pub const fn min_width(value: u64) -> u8 {
    if value <= u8::MAX as u64 {
        1
    } else if value <= u16::MAX as u64 {
        2
    } else if value <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// Fail closed encode cursor.
#[derive(Debug)]
pub struct Encoder<'buf> {
    buf: &'buf mut [u8],
    pos: usize,
    error: Option<CodecError>,
}

impl<'buf> Encoder<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            error: None,
        }
    }

    /// Restrict the encoder to the first `max_len` bytes of the buffer.
    pub fn with_max_len(buf: &'buf mut [u8], max_len: usize) -> Self {
        let len = max_len.min(buf.len());
        Self::new(&mut buf[..len])
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.error.is_some()
    }

    pub fn fail(&mut self, error: CodecError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn take(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.is_broken() {
            return None;
        }
        if self.buf.len() - self.pos < len {
            self.fail(CodecError::BufferTooSmall);
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(&mut self.buf[start..start + len])
    }

    pub fn put_u8(&mut self, value: u8) {
        if let Some(slot) = self.take(1) {
            slot[0] = value;
        }
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    /// Write the value as a big endian unsigned integer with the given width in bytes.
    pub fn put_uint(&mut self, value: u64, width: u8) {
        if self.is_broken() {
            return;
        }
        if !(1..=8).contains(&width) {
            self.fail(CodecError::PduMetadata);
            return;
        }
        if width < 8 && (value >> (8 * width as u32)) != 0 {
            self.fail(CodecError::ValueTooLarge { value, width });
            return;
        }
        let raw = value.to_be_bytes();
        self.put_bytes(&raw[8 - width as usize..]);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        if let Some(slot) = self.take(data.len()) {
            slot.copy_from_slice(data);
        }
    }

    /// Returns the number of written bytes or the first error encountered.
    pub fn finish(self) -> Result<usize, CodecError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.pos),
        }
    }
}

/// Fail closed decode cursor. Accessors return zero or empty values once broken.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    error: Option<CodecError>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            error: None,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.error.is_some()
    }

    pub fn fail(&mut self, error: CodecError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn check(&self) -> Result<(), CodecError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn get_bytes(&mut self, len: usize) -> &'a [u8] {
        if self.is_broken() {
            return &[];
        }
        if self.remaining() < len {
            self.fail(CodecError::ShortPdu);
            return &[];
        }
        let start = self.pos;
        self.pos += len;
        &self.buf[start..start + len]
    }

    /// Consume everything which is left.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let len = self.remaining();
        self.get_bytes(len)
    }

    pub fn get_u8(&mut self) -> u8 {
        self.get_bytes(1).first().copied().unwrap_or(0)
    }

    pub fn get_u16(&mut self) -> u16 {
        self.get_uint(2) as u16
    }

    pub fn get_u32(&mut self) -> u32 {
        self.get_uint(4) as u32
    }

    pub fn get_uint(&mut self, width: u8) -> u64 {
        if !(1..=8).contains(&width) {
            self.fail(CodecError::PduMetadata);
            return 0;
        }
        self.get_bytes(width as usize)
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
    }

    pub fn get_lv(&mut self) -> &'a [u8] {
        let len = self.get_u8();
        self.get_bytes(len as usize)
    }
}


fn file_size_width(large_file: bool) -> u8 {
    if large_file {
        8
    } else {
        4
    }
}

/// Direction bit of a PDU with this body.
///
/// Metadata, File Data, EOF and Prompt PDUs travel towards the file receiver, Finished, NAK and
/// Keep Alive PDUs back to the file sender. ACK PDUs travel opposite to the directive they
/// acknowledge.
pub fn wire_direction(body: &PduBody) -> Direction {
    match body {
        PduBody::Metadata(_) | PduBody::FileData(_) | PduBody::Eof(_) | PduBody::Prompt(_) => {
            Direction::TowardsReceiver
        }
        PduBody::Fin(_) | PduBody::Nak(_) | PduBody::KeepAlive(_) => Direction::TowardsSender,
        PduBody::Ack(ack) if ack.acked_directive == FileDirectiveType::FinishedPdu => {
            Direction::TowardsReceiver
        }
        PduBody::Ack(_) => Direction::TowardsSender,
    }
}

fn check_fits(value: u64, width: u8) -> Result<(), CodecError> {
    if width < 8 && (value >> (8 * width as u32)) != 0 {
        return Err(CodecError::ValueTooLarge { value, width });
    }
    Ok(())
}

fn field_width(len: u8, value: u64, invalid: fn(u8) -> CodecError) -> Result<u8, CodecError> {
    match len {
        0 => Ok(min_width(value)),
        1 | 2 | 4 | 8 => Ok(len),
        _ => Err(invalid(len)),
    }
}

/// Resolves automatic widths and checks that all header values fit. The byte fields of
/// [spacepackets] silently truncate values.
fn pdu_config(header: &PduHeader, direction: Direction) -> Result<CommonPduConfig, CodecError> {
    let eid_len = field_width(
        header.eid_len,
        header.source_eid.max(header.dest_eid),
        CodecError::InvalidEntityIdLength,
    )?;
    let seq_num_len = field_width(
        header.seq_num_len,
        header.seq_num,
        CodecError::InvalidSeqNumLength,
    )?;
    check_fits(header.source_eid, eid_len)?;
    check_fits(header.seq_num, seq_num_len)?;
    check_fits(header.dest_eid, eid_len)?;
    Ok(CommonPduConfig::new(
        UnsignedByteField::new(eid_len as usize, header.source_eid),
        UnsignedByteField::new(eid_len as usize, header.dest_eid),
        UnsignedByteField::new(seq_num_len as usize, header.seq_num),
        header.transmission_mode,
        header.large_file_flag,
        header.crc_flag,
        direction,
    )?)
}

/// Writes a PDU built by one of the creators. The creators store the data field length as u16
/// without a range check.
fn write_packet(
    packet: &impl WritablePduPacket,
    header_len: usize,
    buf: &mut [u8],
) -> Result<usize, CodecError> {
    let len = packet.len_written();
    let data_field_len = len.saturating_sub(header_len);
    if data_field_len > u16::MAX as usize {
        return Err(CodecError::ValueTooLarge {
            value: data_field_len as u64,
            width: 2,
        });
    }
    if buf.len() < len {
        return Err(CodecError::BufferTooSmall);
    }
    Ok(packet.write_to_bytes(buf)?)
}

fn filename_lv(name: &[u8]) -> Result<Lv<'_>, CodecError> {
    Lv::new(name).map_err(|_| CodecError::ValueTooLarge {
        value: name.len() as u64,
        width: 1,
    })
}

fn sp_segment_metadata(
    seg_meta: SegmentMetadata<'_>,
) -> Result<SpSegmentMetadata<'_>, CodecError> {
    let state = RecordContinuationState::try_from(seg_meta.record_continuation_state)
        .map_err(|_| CodecError::PduMetadata)?;
    let metadata = (!seg_meta.metadata.is_empty()).then_some(seg_meta.metadata);
    SpSegmentMetadata::new(state, metadata).ok_or(CodecError::ValueTooLarge {
        value: seg_meta.metadata.len() as u64,
        width: 1,
    })
}

fn fault_location_tlv(fault_location: Option<u64>) -> Option<EntityIdTlv> {
    fault_location.map(|entity_id| {
        EntityIdTlv::new(UnsignedByteField::new(
            min_width(entity_id) as usize,
            entity_id,
        ))
    })
}

/// Encode a complete PDU into the buffer and return the encoded length.
///
/// Header widths of zero are resolved to the smallest fitting width. If the CRC flag is set, a
/// CRC-16/CCITT-FALSE over the whole PDU is appended. The direction bit is taken from
/// [wire_direction], not from the header.
pub fn encode_pdu(pdu: &Pdu, buf: &mut [u8]) -> Result<usize, CodecError> {
    let header = &pdu.header;
    let large_file = header.is_large_file();
    let conf = pdu_config(header, wire_direction(&pdu.body))?;
    let directive_header = SpPduHeader::new_generic(
        PduType::FileDirective,
        conf,
        0,
        SegmentMetadataFlag::NotPresent,
        header.segmentation_control,
    );
    let header_len = directive_header.header_len();
    match &pdu.body {
        PduBody::Metadata(md) => {
            check_fits(md.file_size, file_size_width(large_file))?;
            let params =
                MetadataGenericParams::new(md.closure_requested, md.checksum_type, md.file_size);
            let metadata = MetadataPduCreator::new_no_opts(
                directive_header,
                params,
                filename_lv(md.source_filename)?,
                filename_lv(md.dest_filename)?,
            );
            write_packet(&metadata, header_len, buf)
        }
        PduBody::FileData(fd) => {
            check_fits(fd.offset, file_size_width(large_file))?;
            let segment_metadata = fd.segment_metadata.map(sp_segment_metadata).transpose()?;
            let seg_metadata_flag = if segment_metadata.is_some() {
                SegmentMetadataFlag::Present
            } else {
                SegmentMetadataFlag::NotPresent
            };
            let fd_header = SpPduHeader::new_generic(
                PduType::FileData,
                conf,
                0,
                seg_metadata_flag,
                header.segmentation_control,
            );
            let file_data =
                SpFileDataPdu::new_generic(fd_header, segment_metadata, fd.offset, fd.data);
            write_packet(&file_data, header_len, buf)
        }
        PduBody::Eof(eof) => {
            check_fits(eof.file_size, file_size_width(large_file))?;
            let eof_pdu = SpEofPdu::new(
                directive_header,
                eof.condition_code,
                eof.checksum,
                eof.file_size,
                fault_location_tlv(eof.fault_location),
            );
            write_packet(&eof_pdu, header_len, buf)
        }
        PduBody::Fin(fin) => {
            let finished = FinishedPduCreator::new_generic(
                directive_header,
                fin.condition_code,
                fin.delivery_code,
                fin.file_status,
                &[],
                fault_location_tlv(fin.fault_location),
            );
            write_packet(&finished, header_len, buf)
        }
        PduBody::Ack(ack) => {
            let ack_pdu = SpAckPdu::new(
                directive_header,
                ack.acked_directive,
                ack.condition_code,
                ack.transaction_status,
            )?;
            write_packet(&ack_pdu, header_len, buf)
        }
        PduBody::Nak(nak) if large_file => {
            if nak.segment_requests.is_empty() {
                // The creator only writes 8 byte scope fields together with segment requests.
                return encode_with_cursor(directive_header, large_file, &pdu.body, buf);
            }
            let mut segments = heapless::Vec::<(u64, u64), NAK_MAX_SEGMENTS>::new();
            for segment in &nak.segment_requests {
                segments
                    .push((segment.start, segment.end))
                    .map_err(|_| CodecError::PduMetadata)?;
            }
            let nak_pdu = NakPduCreator::new_large_file_size(
                directive_header,
                nak.start_of_scope,
                nak.end_of_scope,
                &segments,
            )?;
            write_packet(&nak_pdu, header_len, buf)
        }
        PduBody::Nak(nak) => {
            let narrow = |value: u64| {
                u32::try_from(value).map_err(|_| CodecError::ValueTooLarge { value, width: 4 })
            };
            let mut segments = heapless::Vec::<(u32, u32), NAK_MAX_SEGMENTS>::new();
            for segment in &nak.segment_requests {
                segments
                    .push((narrow(segment.start)?, narrow(segment.end)?))
                    .map_err(|_| CodecError::PduMetadata)?;
            }
            let nak_pdu = NakPduCreator::new(
                directive_header,
                narrow(nak.start_of_scope)?,
                narrow(nak.end_of_scope)?,
                &segments,
            )?;
            write_packet(&nak_pdu, header_len, buf)
        }
        PduBody::Prompt(_) | PduBody::KeepAlive(_) => {
            encode_with_cursor(directive_header, large_file, &pdu.body, buf)
        }
    }
}

/// Writes the header and a directive body without a matching creator. The data field length in
/// `template` is ignored.
fn encode_with_cursor(
    template: SpPduHeader,
    large_file: bool,
    body: &PduBody,
    buf: &mut [u8],
) -> Result<usize, CodecError> {
    let header_len = template.header_len();
    if buf.len() < header_len {
        return Err(CodecError::BufferTooSmall);
    }
    let with_crc = template.common_pdu_conf().crc_flag == CrcFlag::WithCrc;
    let (head, rest) = buf.split_at_mut(header_len);
    let mut enc = Encoder::new(rest);
    encode_directive_body(&mut enc, large_file, body);
    if with_crc {
        enc.put_u16(0);
    }
    let data_field_len = enc.finish()?;
    let header = SpPduHeader::new_generic(
        PduType::FileDirective,
        *template.common_pdu_conf(),
        data_field_len as u16,
        SegmentMetadataFlag::NotPresent,
        template.seg_ctrl(),
    );
    header.write_to_bytes(head)?;
    let pdu_len = header_len + data_field_len;
    if with_crc {
        let crc_pos = pdu_len - CRC_LEN;
        let crc = CRC_16.checksum(&buf[..crc_pos]);
        buf[crc_pos..pdu_len].copy_from_slice(&crc.to_be_bytes());
    }
    Ok(pdu_len)
}

fn encode_directive_body(enc: &mut Encoder, large_file: bool, body: &PduBody) {
    let fss = file_size_width(large_file);
    match body {
        PduBody::Nak(nak) => {
            enc.put_u8(FileDirectiveType::NakPdu as u8);
            enc.put_uint(nak.start_of_scope, fss);
            enc.put_uint(nak.end_of_scope, fss);
            for segment in &nak.segment_requests {
                enc.put_uint(segment.start, fss);
                enc.put_uint(segment.end, fss);
            }
        }
        PduBody::Prompt(response) => {
            enc.put_u8(FileDirectiveType::PromptPdu as u8);
            enc.put_u8((*response as u8) << 7);
        }
        PduBody::KeepAlive(progress) => {
            enc.put_u8(FileDirectiveType::KeepAlivePdu as u8);
            enc.put_uint(*progress, fss);
        }
        _ => enc.fail(CodecError::PduMetadata),
    }
}

/// Walks the TLVs behind a directive and returns the value of the entity ID TLV if one is
/// present. Every TLV must lie completely inside the data field.
fn get_fault_location(dec: &mut Decoder) -> Option<u64> {
    let mut fault_location = None;
    while dec.remaining() > 0 && !dec.is_broken() {
        let tlv_type = dec.get_u8();
        let len = dec.get_u8();
        if tlv_type == TLV_TYPE_ENTITY_ID {
            if !matches!(len, 1 | 2 | 4 | 8) {
                dec.fail(CodecError::PduMetadata);
            }
            fault_location = Some(dec.get_uint(len));
        } else {
            dec.get_bytes(len as usize);
        }
    }
    fault_location
}

/// Decode one PDU from the raw buffer. Trailing bytes after the PDU are ignored.
pub fn decode_pdu(raw: &[u8]) -> Result<Pdu<'_>, CodecError> {
    let (sp_header, header_len) = SpPduHeader::from_bytes(raw)?;
    let conf = *sp_header.common_pdu_conf();
    let pdu_len = sp_header.pdu_len();
    if raw.len() < pdu_len {
        return Err(CodecError::ShortPdu);
    }
    if conf.crc_flag == CrcFlag::WithCrc && sp_header.pdu_datafield_len() < CRC_LEN {
        return Err(CodecError::ShortPdu);
    }
    let raw = &raw[..pdu_len];
    let body_end = match sp_header.verify_length_and_checksum(raw) {
        Ok(len) => len,
        Err(PduError::ChecksumError(found)) => {
            let expected = CRC_16.checksum(&raw[..pdu_len - CRC_LEN]);
            return Err(CodecError::CrcMismatch { expected, found });
        }
        Err(error) => return Err(error.into()),
    };
    let header = PduHeader {
        direction: conf.direction,
        transmission_mode: conf.trans_mode,
        crc_flag: conf.crc_flag,
        large_file_flag: conf.file_flag,
        segmentation_control: sp_header.seg_ctrl(),
        eid_len: conf.source_id().size() as u8,
        seq_num_len: conf.transaction_seq_num.size() as u8,
        source_eid: conf.source_id().value(),
        seq_num: conf.transaction_seq_num.value(),
        dest_eid: conf.dest_id().value(),
    };
    let body = decode_body(raw, &sp_header, header_len, body_end)?;
    Ok(Pdu { header, body })
}

/// The cursor pass walks the body first so the readers only ever see PDUs whose fields lie
/// inside the data field. Borrowed parts are taken from the cursor, numeric fields from the
/// readers.
fn decode_body<'a>(
    raw: &'a [u8],
    sp_header: &SpPduHeader,
    header_len: usize,
    body_end: usize,
) -> Result<PduBody<'a>, CodecError> {
    let large_file = sp_header.common_pdu_conf().file_flag == LargeFileFlag::Large;
    let fss = file_size_width(large_file);
    let mut dec = Decoder::new(&raw[header_len..body_end]);
    if sp_header.pdu_type() == PduType::FileData {
        let mut segment_metadata = None;
        if sp_header.seg_metadata_flag() == SegmentMetadataFlag::Present {
            let first = dec.get_u8();
            let metadata = dec.get_bytes((first & 0x3f) as usize);
            segment_metadata = Some(SegmentMetadata::new(first >> 6, metadata));
        }
        dec.get_uint(fss);
        dec.check()?;
        let fd = SpFileDataPdu::from_bytes(raw)?;
        return Ok(PduBody::FileData(FileDataPdu {
            offset: fd.offset(),
            data: fd.file_data(),
            segment_metadata,
        }));
    }
    let code = dec.get_u8();
    dec.check()?;
    let directive =
        FileDirectiveType::try_from(code).map_err(|_| CodecError::InvalidDirective(code))?;
    let body = match directive {
        FileDirectiveType::MetadataPdu => {
            dec.get_u8();
            dec.get_uint(fss);
            let source_filename = dec.get_lv();
            let dest_filename = dec.get_lv();
            dec.check()?;
            // Metadata options are not used by the engine.
            let reader = MetadataPduReader::from_bytes(raw)?;
            let params = reader.metadata_params();
            PduBody::Metadata(MetadataPdu {
                closure_requested: params.closure_requested,
                checksum_type: params.checksum_type,
                file_size: params.file_size,
                source_filename,
                dest_filename,
            })
        }
        FileDirectiveType::EofPdu => {
            dec.get_bytes(1 + 4);
            dec.get_uint(fss);
            let fault_location = get_fault_location(&mut dec);
            dec.check()?;
            let eof = SpEofPdu::from_bytes(raw)?;
            PduBody::Eof(EofPdu {
                condition_code: eof.condition_code(),
                checksum: eof.file_checksum(),
                file_size: eof.file_size(),
                fault_location,
            })
        }
        FileDirectiveType::FinishedPdu => {
            dec.get_u8();
            get_fault_location(&mut dec);
            dec.check()?;
            let fin = FinishedPduReader::from_bytes(raw)?;
            PduBody::Fin(FinPdu {
                condition_code: fin.condition_code(),
                delivery_code: fin.delivery_code(),
                file_status: fin.file_status(),
                fault_location: fin.fault_location().map(|tlv| tlv.entity_id().value()),
            })
        }
        FileDirectiveType::AckPdu => {
            let first = dec.get_u8();
            dec.get_u8();
            dec.check()?;
            let ack = SpAckPdu::from_bytes(raw)?;
            PduBody::Ack(AckPdu {
                acked_directive: ack.directive_code_of_acked_pdu(),
                directive_subtype: first & 0x0f,
                condition_code: ack.condition_code(),
                transaction_status: ack.transaction_status(),
            })
        }
        FileDirectiveType::NakPdu => {
            dec.get_uint(fss);
            dec.get_uint(fss);
            dec.check()?;
            if dec.remaining() % (2 * fss as usize) != 0 {
                return Err(CodecError::PduMetadata);
            }
            let nak = NakPduReader::from_bytes(raw)?;
            let mut segment_requests = SegmentRequestList::new();
            let mut add = |start: u64, end: u64| {
                segment_requests
                    .push(SegmentRequest::new(start, end))
                    .is_ok()
            };
            // Requests beyond the list capacity are dropped, the peer re-requests them once the
            // earlier ones were served.
            if let Some(requests) = nak.get_large_segment_requests_iterator() {
                for (start, end) in requests {
                    if !add(start, end) {
                        break;
                    }
                }
            } else if let Some(requests) = nak.get_normal_segment_requests_iterator() {
                for (start, end) in requests {
                    if !add(start.into(), end.into()) {
                        break;
                    }
                }
            }
            PduBody::Nak(NakPdu {
                start_of_scope: nak.start_of_scope(),
                end_of_scope: nak.end_of_scope(),
                segment_requests,
            })
        }
        FileDirectiveType::PromptPdu => {
            let first = dec.get_u8();
            dec.check()?;
            PduBody::Prompt(if first >> 7 == 1 {
                PromptResponse::KeepAlive
            } else {
                PromptResponse::Nak
            })
        }
        FileDirectiveType::KeepAlivePdu => {
            let progress = dec.get_uint(fss);
            dec.check()?;
            PduBody::KeepAlive(progress)
        }
    };
    Ok(body)
}
