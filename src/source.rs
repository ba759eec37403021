//! # CFDP Source Entity Module
//!
//! Send side state machine for class 1 (S1) and class 2 (S2) transactions. Every call of
//! [dispatch] emits at most one PDU, which gives the channel full control over the outgoing
//! rate. A transaction runs through the following steps:
//!
//! 1. Metadata PDU. The size of the source file is determined here, a failure to access the
//!    file ends the transaction with a filestore rejection.
//! 2. File Data PDUs of at most the configured chunk size.
//! 3. EOF PDU carrying the checksum of the whole file. This ends a class 1 transaction.
//!
//! A class 2 transaction then moves to the waiting queue. It repeats the EOF until the EOF ACK
//! arrives, re-sends segments requested by NAK PDUs with priority over new file data and
//! acknowledges the Finished PDU, which ends the transaction.
use core::mem;
use std::format;

use log::{debug, info, warn};
use spacepackets::cfdp::{
    pdu::FileDirectiveType, ConditionCode, Direction, FaultHandlerCode, TransactionStatus,
};

use crate::{
    checksum::FileChecksum,
    filestore::VirtualFilestore,
    pdu::{AckPdu, EofPdu, FileDataPdu, MetadataPdu, NakPdu, Pdu, PduBody},
    transaction::{tick_armed, SendError, TxSubState, TxnCtx},
    CfdpClass, EngineUser, QueueIdx, TxnStatus, MAX_FILE_DATA_SIZE,
};

/// Result of one dispatch of an active send transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TxProgress {
    Sent,
    /// Nothing could be sent right now.
    Blocked,
    /// No PDU was due.
    Idle,
}

/// Emit the next PDU of an active send transaction.
pub(crate) fn dispatch<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> TxProgress {
    if !ctx.can_send() {
        return TxProgress::Blocked;
    }
    if ctx.txn.tx_sub == TxSubState::Metadata {
        return start_transfer(ctx);
    }
    if ctx.txn.class == CfdpClass::Class2 && !ctx.txn.flags.canceled {
        if ctx.txn.flags.md_need_send {
            return match send_metadata(ctx) {
                Ok(()) => {
                    ctx.txn.flags.md_need_send = false;
                    TxProgress::Sent
                }
                Err(e) => send_failed(ctx, e),
            };
        }
        if let Some(progress) = retransmit(ctx) {
            return progress;
        }
    }
    match ctx.txn.tx_sub {
        TxSubState::FileData if ctx.txn.foffs < ctx.txn.fsize => send_new_file_data(ctx),
        TxSubState::Metadata | TxSubState::FileData | TxSubState::Eof => {
            ctx.txn.tx_sub = TxSubState::Eof;
            send_eof(ctx)
        }
        TxSubState::CloseoutSync => {
            ctx.requeue(QueueIdx::Txw);
            TxProgress::Idle
        }
    }
}

/// Determine the file size and send the Metadata PDU.
fn start_transfer<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> TxProgress {
    let fsize = match ctx.vfs.file_size(&ctx.hist.src_filename) {
        Ok(fsize) => fsize,
        Err(e) => {
            warn!(
                "CF: transaction {} can not open source file {}: {}",
                ctx.id(),
                ctx.hist.src_filename,
                e
            );
            ctx.io.counters.fault.file_open += 1;
            let status = TxnStatus::Condition(ConditionCode::FilestoreRejection);
            ctx.report_fault(status);
            // Nothing was sent yet, there is no graceful way to continue.
            ctx.set_status(status);
            ctx.finish();
            return TxProgress::Idle;
        }
    };
    ctx.txn.fsize = fsize;
    ctx.hist.fsize = fsize;
    ctx.txn.checksum = FileChecksum::new(ctx.txn.checksum_type).unwrap_or_default();
    if ctx.txn.class == CfdpClass::Class2 {
        ctx.arm_inactivity_timer();
    }
    match send_metadata(ctx) {
        Ok(()) => {
            info!(
                "CF: transaction {} started, {} -> {}, {} bytes",
                ctx.id(),
                ctx.hist.src_filename,
                ctx.hist.dst_filename,
                fsize
            );
            ctx.txn.tx_sub = TxSubState::FileData;
            TxProgress::Sent
        }
        Err(e) => send_failed(ctx, e),
    }
}

fn send_metadata<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Result<(), SendError> {
    let header = ctx.header(Direction::TowardsReceiver);
    let md = MetadataPdu {
        closure_requested: ctx.txn.closure_requested,
        checksum_type: ctx.txn.checksum_type,
        file_size: ctx.txn.fsize,
        source_filename: ctx.hist.src_filename.as_bytes(),
        dest_filename: ctx.hist.dst_filename.as_bytes(),
    };
    ctx.io
        .send(&Pdu::new(header, PduBody::Metadata(md)), ctx.txn.flags.suspended)
}

/// Largest file data segment for the next PDU.
fn segment_len<Vfs: VirtualFilestore, User: EngineUser>(ctx: &TxnCtx<'_, Vfs, User>) -> u64 {
    (ctx.cfg.outgoing_file_chunk_size as usize)
        .min(MAX_FILE_DATA_SIZE)
        .min(ctx.scratch.len())
        .max(1) as u64
}

/// Read a segment into the scratch buffer and send it.
fn send_file_data<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    offset: u64,
    len: u64,
) -> Result<(), TxProgress> {
    let read_len = len as usize;
    if let Err(e) = ctx
        .vfs
        .read_data(&ctx.hist.src_filename, offset, len, ctx.scratch)
    {
        warn!(
            "CF: transaction {} reading {} bytes at offset {} failed: {}",
            ctx.id(),
            len,
            offset,
            e
        );
        ctx.io.counters.fault.file_read += 1;
        handle_fault(ctx, TxnStatus::ReadFailure);
        return Err(TxProgress::Idle);
    }
    let header = ctx.header(Direction::TowardsReceiver);
    let fd = FileDataPdu {
        offset,
        data: &ctx.scratch[..read_len],
        segment_metadata: None,
    };
    match ctx
        .io
        .send(&Pdu::new(header, PduBody::FileData(fd)), ctx.txn.flags.suspended)
    {
        Ok(()) => {
            ctx.io.counters.sent.file_data_bytes += len;
            Ok(())
        }
        Err(e) => Err(send_failed(ctx, e)),
    }
}

fn send_new_file_data<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> TxProgress {
    let offset = ctx.txn.foffs;
    let len = segment_len(ctx).min(ctx.txn.fsize - offset);
    if let Err(progress) = send_file_data(ctx, offset, len) {
        return progress;
    }
    ctx.txn.checksum.update(&ctx.scratch[..len as usize]);
    ctx.txn.foffs += len;
    if ctx.txn.foffs >= ctx.txn.fsize {
        ctx.txn.tx_sub = TxSubState::Eof;
    }
    TxProgress::Sent
}

/// Re-send the next segment requested by a NAK. Returns [None] if nothing is requested.
fn retransmit<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Option<TxProgress> {
    let chunk = ctx.chunks.as_ref()?.first()?;
    let len = chunk.size.min(segment_len(ctx));
    if let Err(progress) = send_file_data(ctx, chunk.offset, len) {
        return Some(progress);
    }
    if let Some(chunks) = ctx.chunks.as_deref_mut() {
        chunks.remove_from_first(len);
    }
    debug!(
        "CF: transaction {} re-sent segment at offset {}, {} bytes",
        ctx.id(),
        chunk.offset,
        len
    );
    Some(TxProgress::Sent)
}

fn send_eof_pdu<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Result<(), SendError> {
    if !ctx.txn.flags.crc_done {
        ctx.txn.crc_result = mem::take(&mut ctx.txn.checksum).finalize();
        ctx.txn.flags.crc_done = true;
    }
    let fault_location =
        (ctx.txn.eof_cc != ConditionCode::NoError).then_some(ctx.cfg.local_eid);
    let eof = EofPdu {
        condition_code: ctx.txn.eof_cc,
        checksum: ctx.txn.crc_result,
        file_size: ctx.txn.fsize,
        fault_location,
    };
    ctx.send(Direction::TowardsReceiver, PduBody::Eof(eof))
}

fn send_eof<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> TxProgress {
    if let Err(e) = send_eof_pdu(ctx) {
        return send_failed(ctx, e);
    }
    if ctx.txn.eof_cc != ConditionCode::NoError {
        ctx.set_status(TxnStatus::Condition(ctx.txn.eof_cc));
    }
    match ctx.txn.class {
        CfdpClass::Class1 => complete(ctx),
        CfdpClass::Class2 => {
            ctx.txn.tx_sub = TxSubState::CloseoutSync;
            ctx.txn.acknak_count = 0;
            ctx.arm_ack_timer();
            ctx.arm_inactivity_timer();
            ctx.requeue(QueueIdx::Txw);
        }
    }
    TxProgress::Sent
}

fn send_failed<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    error: SendError,
) -> TxProgress {
    if error.is_retryable() {
        return TxProgress::Blocked;
    }
    log::error!(
        "CF: transaction {} PDU not sent: {} ({})",
        ctx.id(),
        error,
        error.status_code()
    );
    ctx.set_status(TxnStatus::ProtocolError);
    ctx.finish();
    TxProgress::Idle
}

/// Declare a fault and apply the configured handling.
fn handle_fault<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    status: TxnStatus,
) {
    match ctx.report_fault(status) {
        FaultHandlerCode::NoticeOfCancellation => cancel(ctx, status.condition_code()),
        FaultHandlerCode::AbandonTransaction => ctx.finish(),
        FaultHandlerCode::NoticeOfSuspension | FaultHandlerCode::IgnoreError => (),
    }
}

/// The transaction ends. A successful transfer of a file which is not kept moves or deletes
/// the source file.
fn complete<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    if !ctx.txn.keep && !ctx.hist.txn_stat.is_error() {
        let src = ctx.hist.src_filename.as_str();
        let result = match &ctx.chan_cfg.move_dir {
            Some(move_dir) => {
                let name = src.rsplit('/').next().unwrap_or(src);
                let target = format!("{}/{}", move_dir.trim_end_matches('/'), name);
                ctx.vfs.rename_file(src, &target)
            }
            None => ctx.vfs.remove_file(src),
        };
        if let Err(e) = result {
            warn!(
                "CF: transaction {} disposing of source file {} failed: {}",
                ctx.id(),
                src,
                e
            );
        }
    }
    ctx.finish();
}

/// Advance the timers of a waiting class 2 transaction and emit the due responses.
pub(crate) fn tick<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    if ctx.txn.flags.send_fin_ack {
        let ack = AckPdu::new(
            FileDirectiveType::FinishedPdu,
            ctx.txn.fin_cc,
            TransactionStatus::Terminated,
        );
        match ctx.send(Direction::TowardsReceiver, PduBody::Ack(ack)) {
            Ok(()) => {
                ctx.txn.flags.send_fin_ack = false;
                complete(ctx);
            }
            Err(e) if e.is_retryable() => (),
            Err(e) => {
                send_failed(ctx, e);
            }
        }
        return;
    }
    if tick_armed(
        &mut ctx.txn.inactivity_timer,
        &mut ctx.txn.flags.inactivity_armed,
    ) {
        ctx.io.counters.fault.inactivity_timer += 1;
        let status = TxnStatus::Condition(ConditionCode::InactivityDetected);
        match ctx.report_fault(status) {
            FaultHandlerCode::IgnoreError | FaultHandlerCode::NoticeOfSuspension => {
                ctx.arm_inactivity_timer()
            }
            FaultHandlerCode::NoticeOfCancellation | FaultHandlerCode::AbandonTransaction => {
                ctx.finish();
                return;
            }
        }
    }
    if ctx.txn.tx_sub == TxSubState::CloseoutSync
        && !ctx.txn.flags.eof_acked
        && tick_armed(&mut ctx.txn.ack_timer, &mut ctx.txn.flags.ack_timer_armed)
    {
        ctx.txn.acknak_count = ctx.txn.acknak_count.saturating_add(1);
        if ctx.txn.acknak_count >= ctx.chan_cfg.ack_limit {
            ctx.io.counters.fault.ack_limit += 1;
            match ctx.report_fault(TxnStatus::AckLimitNoEof) {
                FaultHandlerCode::IgnoreError => {
                    ctx.txn.acknak_count = 0;
                    ctx.txn.flags.send_eof = true;
                    ctx.arm_ack_timer();
                }
                FaultHandlerCode::NoticeOfSuspension => ctx.arm_ack_timer(),
                // The peer never acknowledged the EOF, a cancel EOF would not arrive either.
                FaultHandlerCode::NoticeOfCancellation | FaultHandlerCode::AbandonTransaction => {
                    ctx.finish();
                    return;
                }
            }
        } else {
            debug!(
                "CF: transaction {} EOF not acknowledged, retry {}",
                ctx.id(),
                ctx.txn.acknak_count
            );
            ctx.txn.flags.send_eof = true;
            ctx.arm_ack_timer();
        }
    }
    if ctx.txn.flags.send_eof {
        match send_eof_pdu(ctx) {
            Ok(()) => ctx.txn.flags.send_eof = false,
            Err(e) if e.is_retryable() => (),
            Err(e) => {
                send_failed(ctx, e);
            }
        }
    }
}

/// Handle a PDU addressed to a send transaction.
pub(crate) fn recv<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    pdu: &Pdu,
) {
    if ctx.txn.class == CfdpClass::Class1 {
        spurious(ctx, pdu);
        return;
    }
    if ctx.txn.flags.inactivity_armed {
        ctx.arm_inactivity_timer();
    }
    match &pdu.body {
        PduBody::Ack(ack) if ack.acked_directive == FileDirectiveType::EofPdu => {
            if ctx.txn.tx_sub != TxSubState::CloseoutSync || ctx.txn.flags.eof_acked {
                spurious(ctx, pdu);
                return;
            }
            debug!("CF: transaction {} EOF acknowledged", ctx.id());
            ctx.txn.flags.eof_acked = true;
            ctx.txn.flags.ack_timer_armed = false;
            ctx.txn.flags.send_eof = false;
            if ctx.txn.flags.canceled {
                ctx.finish();
            }
        }
        PduBody::Fin(fin) => {
            if ctx.txn.flags.fin_recv {
                // Our ACK is still pending.
                return;
            }
            ctx.txn.flags.fin_recv = true;
            ctx.txn.flags.eof_acked = true;
            ctx.txn.flags.ack_timer_armed = false;
            ctx.txn.flags.send_eof = false;
            ctx.txn.fin_cc = fin.condition_code;
            ctx.txn.fin_dc = fin.delivery_code;
            ctx.txn.fin_fs = fin.file_status;
            if fin.condition_code != ConditionCode::NoError {
                ctx.set_status(TxnStatus::Condition(fin.condition_code));
            } else if ctx.txn.tx_sub != TxSubState::CloseoutSync {
                ctx.set_status(TxnStatus::EarlyFin);
            }
            info!(
                "CF: transaction {} Finished PDU received, {:?} {:?} {:?}",
                ctx.id(),
                fin.condition_code,
                fin.delivery_code,
                fin.file_status
            );
            ctx.txn.flags.send_fin_ack = true;
            ctx.requeue(QueueIdx::Txw);
        }
        PduBody::Nak(nak) => handle_nak(ctx, nak),
        _ => spurious(ctx, pdu),
    }
}

fn handle_nak<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    nak: &NakPdu,
) {
    if ctx.txn.tx_sub == TxSubState::Metadata || ctx.txn.flags.fin_recv {
        ctx.io.counters.recv.spurious += 1;
        return;
    }
    ctx.io.counters.recv.nak_segment_requests += nak.segment_requests.len() as u32;
    let fsize = ctx.txn.fsize;
    let mut invalid = 0;
    for request in nak.segment_requests.iter() {
        if request.start == 0 && request.end == 0 {
            ctx.txn.flags.md_need_send = true;
        } else if request.start < request.end && request.end <= fsize {
            if let Some(chunks) = ctx.chunks.as_deref_mut() {
                // Overflow is not possible for ranges inside the file.
                let _ = chunks.add(request.start, request.end - request.start);
            }
        } else {
            invalid += 1;
        }
    }
    if invalid > 0 {
        warn!(
            "CF: transaction {} received {} invalid NAK segment requests",
            ctx.id(),
            invalid
        );
        ctx.io.counters.recv.spurious += 1;
    }
    let pending =
        ctx.txn.flags.md_need_send || ctx.chunks.as_ref().is_some_and(|chunks| !chunks.is_empty());
    if pending && ctx.txn.tx_sub == TxSubState::CloseoutSync {
        ctx.requeue(QueueIdx::Txa);
    }
}

fn spurious<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>, pdu: &Pdu) {
    ctx.io.counters.recv.spurious += 1;
    debug!(
        "CF: transaction {} ignores {:?} PDU",
        ctx.id(),
        pdu.directive()
    );
}

/// Graceful close. Without any PDU sent the transaction simply ends, otherwise an EOF with the
/// condition code is sent. Once the EOF was sent the transaction keeps waiting for the peer.
pub(crate) fn cancel<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    cc: ConditionCode,
) {
    ctx.txn.flags.canceled = true;
    ctx.set_status(TxnStatus::Condition(cc));
    match ctx.txn.tx_sub {
        TxSubState::Metadata => ctx.finish(),
        TxSubState::FileData | TxSubState::Eof => {
            info!("CF: transaction {} canceled, {:?}", ctx.id(), cc);
            ctx.txn.eof_cc = cc;
            ctx.txn.tx_sub = TxSubState::Eof;
            ctx.txn.flags.md_need_send = false;
            if let Some(chunks) = ctx.chunks.as_deref_mut() {
                chunks.reset();
            }
            ctx.requeue(QueueIdx::Txa);
        }
        TxSubState::CloseoutSync => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::tests::{Fixture, LOCAL_EID, REMOTE_EID},
        tests::FaultNotice,
        pdu::{FinPdu, PduHeader, SegmentRequest, SegmentRequestList},
        playback::TxParams,
        TransactionId,
    };
    use spacepackets::cfdp::{
        pdu::finished::{DeliveryCode, FileStatus},
        ChecksumType, TransmissionMode,
    };
    use std::{string::ToString, vec, vec::Vec};

    fn file_content(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx % 251) as u8).collect()
    }

    fn modular_checksum(data: &[u8]) -> u32 {
        let mut checksum = FileChecksum::new(ChecksumType::Modular).unwrap();
        checksum.update(data);
        checksum.finalize()
    }

    fn reply_header(id: TransactionId) -> PduHeader {
        PduHeader::new(
            Direction::TowardsSender,
            TransmissionMode::Acknowledged,
            LOCAL_EID,
            id.seq_num,
            REMOTE_EID,
        )
    }

    fn eof_ack(id: TransactionId) -> Pdu<'static> {
        Pdu::new(
            reply_header(id),
            PduBody::Ack(AckPdu::new(
                FileDirectiveType::EofPdu,
                ConditionCode::NoError,
                TransactionStatus::Active,
            )),
        )
    }

    fn fin(id: TransactionId, condition_code: ConditionCode) -> Pdu<'static> {
        Pdu::new(
            reply_header(id),
            PduBody::Fin(FinPdu {
                condition_code,
                delivery_code: DeliveryCode::Complete,
                file_status: FileStatus::Retained,
                fault_location: None,
            }),
        )
    }

    fn nak(id: TransactionId, requests: &[(u64, u64)]) -> Pdu<'static> {
        let mut segment_requests = SegmentRequestList::new();
        for (start, end) in requests {
            segment_requests
                .push(SegmentRequest::new(*start, *end))
                .unwrap();
        }
        Pdu::new(
            reply_header(id),
            PduBody::Nak(NakPdu {
                start_of_scope: 0,
                end_of_scope: 0,
                segment_requests,
            }),
        )
    }

    fn directives(pdus: &[(PduHeader, PduBody<'static>)]) -> Vec<Option<FileDirectiveType>> {
        pdus.iter()
            .map(|(header, body)| Pdu::new(*header, body.clone()).directive())
            .collect()
    }

    #[test]
    fn test_class1_transfer() {
        let mut fixture = Fixture::new();
        let data = file_content(3000);
        let src = fixture.write_file("src.bin", &data);
        let id = fixture.create_tx(CfdpClass::Class1, 0, &src);
        fixture.cycle();
        let sent = fixture.sent_pdus();
        assert_eq!(
            directives(&sent),
            vec![
                Some(FileDirectiveType::MetadataPdu),
                None,
                None,
                None,
                Some(FileDirectiveType::EofPdu)
            ]
        );
        for (header, _) in &sent {
            assert_eq!(header.transmission_mode, TransmissionMode::Unacknowledged);
            assert_eq!(header.direction, Direction::TowardsReceiver);
            assert_eq!(header.source_eid, LOCAL_EID);
            assert_eq!(header.dest_eid, REMOTE_EID);
        }
        let mut received = Vec::new();
        for (_, body) in &sent {
            if let PduBody::FileData(fd) = body {
                assert_eq!(fd.offset as usize, received.len());
                received.extend_from_slice(fd.data);
            }
        }
        assert_eq!(received, data);
        match &sent[4].1 {
            PduBody::Eof(eof) => {
                assert_eq!(eof.condition_code, ConditionCode::NoError);
                assert_eq!(eof.file_size, 3000);
                assert_eq!(eof.checksum, modular_checksum(&data));
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(fixture.txn(id).is_none());
        let finished = &fixture.faults.user_hook.finished;
        assert_eq!(finished.len(), 1);
        assert!(finished[0].is_success());
        assert_eq!(finished[0].history.fsize, 3000);
        assert_eq!(fixture.channel.io.counters.sent.file_data_bytes, 3000);
        // Files are kept by default.
        assert!(std::path::Path::new(&src).exists());
    }

    #[test]
    fn test_missing_source_file() {
        let mut fixture = Fixture::new();
        let src = fixture.tmp.path().join("missing.bin");
        fixture.create_tx(CfdpClass::Class1, 0, src.to_str().unwrap());
        fixture.cycle();
        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.channel.io.counters.fault.file_open, 1);
        let hook = &fixture.faults.user_hook;
        assert_eq!(hook.notices.len(), 1);
        assert_eq!(hook.notices[0].0, FaultNotice::Cancellation);
        assert_eq!(
            hook.finished[0].history.txn_stat,
            TxnStatus::Condition(ConditionCode::FilestoreRejection)
        );
    }

    #[test]
    fn test_source_file_removed_when_not_kept() {
        let mut fixture = Fixture::new();
        let src = fixture.write_file("gone.bin", &file_content(10));
        let params = TxParams {
            class: CfdpClass::Class1,
            keep: false,
            priority: 0,
            dest_eid: REMOTE_EID,
            src_filename: src.clone(),
            dst_filename: "/dst.bin".to_string(),
        };
        fixture
            .with_env(|channel, env| channel.create_tx_txn(env, &params))
            .unwrap();
        fixture.cycle();
        assert_eq!(fixture.sent().len(), 3);
        assert!(!std::path::Path::new(&src).exists());
    }

    #[test]
    fn test_class2_retransmit_and_finish() {
        let mut fixture = Fixture::new();
        let data = file_content(100);
        let src = fixture.write_file("c2.bin", &data);
        let id = fixture.create_tx(CfdpClass::Class2, 0, &src);
        fixture.cycle();
        assert_eq!(
            directives(&fixture.sent_pdus()),
            vec![
                Some(FileDirectiveType::MetadataPdu),
                None,
                Some(FileDirectiveType::EofPdu)
            ]
        );
        assert_eq!(fixture.queue_of(id), Some(QueueIdx::Txw));

        fixture.inject(&eof_ack(id));
        fixture.inject(&nak(id, &[(10, 30), (0, 0)]));
        fixture.cycle();
        let sent = fixture.sent_pdus();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, PduBody::Metadata(_)));
        match &sent[1].1 {
            PduBody::FileData(fd) => {
                assert_eq!(fd.offset, 10);
                assert_eq!(fd.data, &data[10..30]);
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert_eq!(fixture.channel.io.counters.recv.nak_segment_requests, 2);
        assert_eq!(fixture.queue_of(id), Some(QueueIdx::Txw));

        fixture.inject(&fin(id, ConditionCode::NoError));
        fixture.cycle();
        let sent = fixture.sent_pdus();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            PduBody::Ack(ack) => {
                assert_eq!(ack.acked_directive, FileDirectiveType::FinishedPdu);
                assert_eq!(ack.transaction_status, TransactionStatus::Terminated);
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(fixture.txn(id).is_none());
        assert!(fixture.faults.user_hook.finished[0].is_success());
    }

    #[test]
    fn test_invalid_nak_segments_ignored() {
        let mut fixture = Fixture::new();
        let src = fixture.write_file("c2.bin", &file_content(100));
        let id = fixture.create_tx(CfdpClass::Class2, 0, &src);
        fixture.cycle();
        fixture.sent();
        fixture.inject(&nak(id, &[(50, 5000), (40, 20)]));
        fixture.cycle();
        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.channel.io.counters.recv.spurious, 1);
        assert_eq!(fixture.queue_of(id), Some(QueueIdx::Txw));
    }

    #[test]
    fn test_eof_ack_limit() {
        let mut fixture = Fixture::new();
        fixture.cfg.chan[0].ack_timer_s = 1;
        fixture.cfg.chan[0].ack_limit = 2;
        let src = fixture.write_file("c2.bin", &file_content(10));
        let id = fixture.create_tx(CfdpClass::Class2, 0, &src);
        let mut eofs = 0;
        for _ in 0..30 {
            fixture.cycle();
            eofs += directives(&fixture.sent_pdus())
                .iter()
                .filter(|directive| **directive == Some(FileDirectiveType::EofPdu))
                .count();
        }
        assert_eq!(eofs, 2);
        assert!(fixture.txn(id).is_none());
        assert_eq!(fixture.channel.io.counters.fault.ack_limit, 1);
        assert_eq!(
            fixture.faults.user_hook.finished[0].history.txn_stat,
            TxnStatus::AckLimitNoEof
        );
    }

    #[test]
    fn test_early_fin() {
        let mut fixture = Fixture::new();
        fixture.cfg.chan[0].max_outgoing_messages_per_wakeup = 2;
        let src = fixture.write_file("big.bin", &file_content(10_000));
        let id = fixture.create_tx(CfdpClass::Class2, 0, &src);
        fixture.cycle();
        assert_eq!(fixture.sent().len(), 2);
        fixture.inject(&fin(id, ConditionCode::NoError));
        fixture.cycle();
        let sent = fixture.sent_pdus();
        assert!(matches!(sent.last(), Some((_, PduBody::Ack(_)))));
        assert!(fixture.txn(id).is_none());
        assert_eq!(
            fixture.faults.user_hook.finished[0].history.txn_stat,
            TxnStatus::EarlyFin
        );
    }

    #[test]
    fn test_cancel_sends_eof_with_condition() {
        let mut fixture = Fixture::new();
        fixture.cfg.chan[0].max_outgoing_messages_per_wakeup = 2;
        let src = fixture.write_file("big.bin", &file_content(10_000));
        let id = fixture.create_tx(CfdpClass::Class1, 0, &src);
        fixture.cycle();
        assert_eq!(fixture.sent().len(), 2);
        fixture.with_env(|channel, env| {
            let idx = channel.find_by_id(id).unwrap();
            channel.cancel_txn(env, idx);
        });
        fixture.cycle();
        let sent = fixture.sent_pdus();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            PduBody::Eof(eof) => {
                assert_eq!(eof.condition_code, ConditionCode::CancelRequestReceived);
                assert_eq!(eof.fault_location, Some(LOCAL_EID));
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(fixture.txn(id).is_none());
        assert_eq!(
            fixture.faults.user_hook.finished[0].history.txn_stat,
            TxnStatus::Condition(ConditionCode::CancelRequestReceived)
        );
        assert!(std::path::Path::new(&src).exists());
    }

    #[test]
    fn test_suspended_transaction_sends_nothing() {
        let mut fixture = Fixture::new();
        let src = fixture.write_file("s.bin", &file_content(10));
        let id = fixture.create_tx(CfdpClass::Class1, 0, &src);
        let idx = fixture.channel.find_by_id(id).unwrap();
        assert!(fixture.channel.set_suspended(idx, true));
        assert!(!fixture.channel.set_suspended(idx, true));
        fixture.cycle();
        assert!(fixture.sent().is_empty());
        assert!(fixture.channel.set_suspended(idx, false));
        fixture.cycle();
        assert_eq!(fixture.sent().len(), 3);
    }
}
