//! # CFDP Destination Entity Module
//!
//! Receive side state machine for class 1 (R1) and class 2 (R2) transactions.
//!
//! File data is written into a temporary file named after the transaction inside the
//! configured temporary directory and only renamed to the destination file name once the
//! transfer is complete and its checksum verified.
//!
//! An R1 transaction computes the checksum on the fly while the data arrives in order and
//! completes when the EOF PDU arrives. An R2 transaction tracks the received extents, requests
//! missing ones with NAK PDUs, acknowledges the EOF and verifies the checksum of the complete
//! file in bounded steps per wakeup. It then reports the outcome with a Finished PDU and waits
//! for its acknowledgement.
use core::mem;

use log::{debug, error, info, warn};
use spacepackets::cfdp::{
    pdu::{
        finished::{DeliveryCode, FileStatus},
        FileDirectiveType,
    },
    ConditionCode, Direction, FaultHandlerCode, TransactionStatus,
};

use crate::{
    checksum::FileChecksum,
    filestore::VirtualFilestore,
    pdu::{
        AckPdu, EofPdu, FileDataPdu, FinPdu, MetadataPdu, NakPdu, Pdu, PduBody,
        SegmentRequest, SegmentRequestList,
    },
    transaction::{tick_armed, Filename, RecvError, RxSubState, SendError, TxnCtx, TxnState},
    CfdpClass, EngineUser, TxnStatus, R2_CRC_CHUNK_SIZE,
};

/// First PDU of a new receive transaction, always a Metadata or File Data PDU.
pub(crate) fn recv_idle<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    pdu: &Pdu,
) {
    ctx.txn.class = CfdpClass::from(pdu.header.transmission_mode);
    ctx.txn.state = match ctx.txn.class {
        CfdpClass::Class1 => TxnState::R1,
        CfdpClass::Class2 => TxnState::R2,
    };
    info!(
        "CF: channel {} new {:?} receive transaction {}",
        ctx.io.chan,
        ctx.txn.state,
        ctx.id()
    );
    if ctx.txn.class == CfdpClass::Class2 && ctx.chunks.is_none() {
        error!("CF: transaction {} has no chunk list", ctx.id());
        ctx.set_status(TxnStatus::NoResource);
        enter_drop(ctx);
        return;
    }
    recv(ctx, pdu);
}

/// Handle a PDU of an established receive transaction.
pub(crate) fn recv<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    pdu: &Pdu,
) {
    ctx.arm_inactivity_timer();
    if ctx.txn.state == TxnState::Drop {
        return;
    }
    match &pdu.body {
        PduBody::Metadata(md) => recv_metadata(ctx, md),
        PduBody::FileData(fd) => recv_file_data(ctx, fd),
        PduBody::Eof(eof) => match ctx.txn.class {
            CfdpClass::Class1 => r1_recv_eof(ctx, eof),
            CfdpClass::Class2 => r2_recv_eof(ctx, eof),
        },
        PduBody::Ack(ack)
            if ack.acked_directive == FileDirectiveType::FinishedPdu
                && ctx.txn.class == CfdpClass::Class2
                && ctx.txn.rx_sub == RxSubState::CloseoutSync =>
        {
            debug!("CF: transaction {} Finished PDU acknowledged", ctx.id());
            ctx.txn.flags.ack_timer_armed = false;
            ctx.finish();
        }
        _ => {
            ctx.io.counters.recv.spurious += 1;
            debug!(
                "CF: transaction {} ignores {:?} PDU",
                ctx.id(),
                pdu.directive()
            );
        }
    }
}

/// Stop processing PDUs but keep the transaction until the peer went quiet, so its remaining
/// PDUs do not create new transactions.
fn enter_drop<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    remove_tmp_file(ctx);
    ctx.txn.state = TxnState::Drop;
    ctx.arm_inactivity_timer();
}

fn remove_tmp_file<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    if !ctx.txn.flags.file_created {
        return;
    }
    let tmp = ctx.tmp_file_path();
    if let Err(e) = ctx.vfs.remove_file(&tmp) {
        warn!("CF: removing temporary file {} failed: {}", tmp, e);
    }
    ctx.txn.flags.file_created = false;
}

/// Create the temporary file on the first Metadata or File Data PDU.
fn ensure_tmp_file<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> bool {
    if ctx.txn.flags.file_created {
        return true;
    }
    let tmp = ctx.tmp_file_path();
    // Left over by an earlier run with the same transaction ID.
    if ctx.vfs.exists(&tmp).unwrap_or(false) {
        let _ = ctx.vfs.remove_file(&tmp);
    }
    match ctx.vfs.create_file(&tmp) {
        Ok(()) => {
            ctx.txn.flags.file_created = true;
            true
        }
        Err(e) => {
            error!(
                "CF: transaction {} can not create temporary file {}: {}",
                ctx.id(),
                tmp,
                e
            );
            ctx.io.counters.fault.file_open += 1;
            let status = TxnStatus::Condition(ConditionCode::FilestoreRejection);
            ctx.report_fault(status);
            ctx.set_status(status);
            enter_drop(ctx);
            false
        }
    }
}

/// Declare a fault and apply the configured handling.
fn handle_fault<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    status: TxnStatus,
) -> FaultHandlerCode {
    let code = ctx.report_fault(status);
    match code {
        FaultHandlerCode::NoticeOfCancellation => cancel(ctx, status.condition_code()),
        FaultHandlerCode::AbandonTransaction => {
            remove_tmp_file(ctx);
            ctx.finish();
        }
        FaultHandlerCode::NoticeOfSuspension | FaultHandlerCode::IgnoreError => (),
    }
    code
}

fn recv_metadata<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    md: &MetadataPdu,
) {
    if ctx.txn.flags.md_recv {
        debug!("CF: transaction {} ignores duplicate metadata", ctx.id());
        return;
    }
    let names = core::str::from_utf8(md.source_filename)
        .ok()
        .and_then(|src| Filename::try_from(src).ok())
        .zip(
            core::str::from_utf8(md.dest_filename)
                .ok()
                .and_then(|dst| Filename::try_from(dst).ok()),
        );
    let Some((src_filename, dst_filename)) = names else {
        ctx.io.counters.recv.error += 1;
        error!("CF: transaction {} has invalid file names", ctx.id());
        handle_fault(
            ctx,
            TxnStatus::Condition(ConditionCode::FilestoreRejection),
        );
        return;
    };
    let Some(checksum) = FileChecksum::new(md.checksum_type) else {
        error!(
            "CF: transaction {} uses unsupported checksum type {:?}",
            ctx.id(),
            md.checksum_type
        );
        handle_fault(
            ctx,
            TxnStatus::Condition(ConditionCode::UnsupportedChecksumType),
        );
        return;
    };
    if !ensure_tmp_file(ctx) {
        return;
    }
    ctx.hist.src_filename = src_filename;
    ctx.hist.dst_filename = dst_filename;
    ctx.hist.fsize = md.file_size;
    ctx.txn.fsize = md.file_size;
    ctx.txn.checksum_type = md.checksum_type;
    ctx.txn.checksum = checksum;
    ctx.txn.closure_requested = md.closure_requested;
    ctx.txn.flags.md_recv = true;
    // Data which arrived first was not fed into a checksum of the right type.
    if ctx.txn.crc_offset > 0 {
        ctx.txn.flags.out_of_order = true;
    }
    info!(
        "CF: transaction {} metadata {} -> {}, {} bytes",
        ctx.id(),
        ctx.hist.src_filename,
        ctx.hist.dst_filename,
        md.file_size
    );
    if ctx.txn.class == CfdpClass::Class2 && ctx.txn.flags.eof_recv {
        check_complete(ctx);
    }
}

fn recv_file_data<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    fd: &FileDataPdu,
) {
    if !ensure_tmp_file(ctx) {
        return;
    }
    if ctx.txn.flags.complete {
        // Late retransmission of data which is already there.
        return;
    }
    let len = fd.data.len() as u64;
    let size_known = ctx.txn.flags.md_recv || ctx.txn.flags.eof_recv;
    let end = match fd.offset.checked_add(len) {
        Some(end) if !size_known || end <= ctx.txn.fsize => end,
        _ => {
            file_data_out_of_range(ctx, fd.offset, len);
            return;
        }
    };
    let tmp = ctx.tmp_file_path();
    if let Err(e) = ctx.vfs.write_data(&tmp, fd.offset, fd.data) {
        error!(
            "CF: transaction {} writing {} bytes at offset {} failed: {}",
            ctx.id(),
            len,
            fd.offset,
            e
        );
        ctx.io.counters.fault.file_write += 1;
        handle_fault(
            ctx,
            TxnStatus::Condition(ConditionCode::FilestoreRejection),
        );
        return;
    }
    ctx.io.counters.recv.file_data_bytes += len;
    if !ctx.txn.flags.out_of_order {
        if fd.offset == ctx.txn.crc_offset {
            ctx.txn.checksum.update(fd.data);
            ctx.txn.crc_offset = end;
        } else if end > ctx.txn.crc_offset {
            ctx.txn.flags.out_of_order = true;
        }
    }
    ctx.txn.foffs = ctx.txn.foffs.max(end);
    if ctx.txn.class == CfdpClass::Class2 {
        if let Some(chunks) = ctx.chunks.as_deref_mut() {
            if chunks.add(fd.offset, len).is_err() {
                file_data_out_of_range(ctx, fd.offset, len);
                return;
            }
        }
        if ctx.txn.flags.eof_recv {
            check_complete(ctx);
        }
    }
}

/// File data which does not fit into the file is a file size error.
fn file_data_out_of_range<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    offset: u64,
    len: u64,
) {
    error!(
        "CF: transaction {} file data at offset {}, {} bytes, exceeds file size {}",
        ctx.id(),
        offset,
        len,
        ctx.txn.fsize
    );
    ctx.io.counters.recv.error += 1;
    ctx.io.counters.fault.file_size_mismatch += 1;
    handle_fault(ctx, TxnStatus::Condition(ConditionCode::FileSizeError));
}

fn r1_recv_eof<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    eof: &EofPdu,
) {
    ctx.txn.flags.eof_recv = true;
    ctx.txn.eof_cc = eof.condition_code;
    if eof.condition_code != ConditionCode::NoError {
        info!(
            "CF: transaction {} canceled by the sender, {:?}",
            ctx.id(),
            eof.condition_code
        );
        ctx.set_status(TxnStatus::Condition(eof.condition_code));
        remove_tmp_file(ctx);
        ctx.finish();
        return;
    }
    if !ctx.txn.flags.md_recv {
        let e = RecvError::BadEof;
        error!("CF: transaction {} {} ({})", ctx.id(), e, e.status_code());
        r1_fail(ctx, TxnStatus::Condition(ConditionCode::FilestoreRejection));
        return;
    }
    if ctx.txn.foffs != eof.file_size || ctx.txn.fsize != eof.file_size {
        let e = RecvError::FileSizeMismatch {
            expected: eof.file_size,
            received: ctx.txn.foffs,
        };
        error!("CF: transaction {} {} ({})", ctx.id(), e, e.status_code());
        ctx.io.counters.fault.file_size_mismatch += 1;
        if r1_fault(ctx, TxnStatus::Condition(ConditionCode::FileSizeError)) {
            return;
        }
    }
    ctx.txn.fsize = eof.file_size;
    let crc = if ctx.txn.flags.out_of_order || ctx.txn.crc_offset != eof.file_size {
        let tmp = ctx.tmp_file_path();
        match ctx.vfs.calculate_checksum(
            &tmp,
            ctx.txn.checksum_type,
            eof.file_size,
            ctx.scratch,
        ) {
            Ok(crc) => crc,
            Err(e) => {
                error!("CF: transaction {} checksum calculation failed: {}", ctx.id(), e);
                ctx.io.counters.fault.file_read += 1;
                r1_fail(ctx, TxnStatus::Condition(ConditionCode::FilestoreRejection));
                return;
            }
        }
    } else {
        mem::take(&mut ctx.txn.checksum).finalize()
    };
    ctx.txn.crc_result = crc;
    ctx.txn.flags.crc_done = true;
    if crc != eof.checksum {
        error!(
            "CF: transaction {} checksum mismatch, expected {:#010x}, calculated {:#010x}",
            ctx.id(),
            eof.checksum,
            crc
        );
        ctx.io.counters.fault.crc_mismatch += 1;
        if r1_fault(ctx, TxnStatus::Condition(ConditionCode::FileChecksumFailure)) {
            return;
        }
    }
    if let Err(status) = move_to_destination(ctx) {
        r1_fail(ctx, status);
        return;
    }
    ctx.finish();
}

/// Fault at the end of a class 1 transaction. There is nothing left to negotiate, so any
/// handling but ignoring ends the transaction. Returns [true] if it ended.
fn r1_fault<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    status: TxnStatus,
) -> bool {
    if ctx.report_fault(status) == FaultHandlerCode::IgnoreError {
        return false;
    }
    ctx.txn.flags.suspended = false;
    r1_fail(ctx, status);
    true
}

fn r1_fail<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    status: TxnStatus,
) {
    ctx.set_status(status);
    remove_tmp_file(ctx);
    ctx.finish();
}

/// Rename the temporary file to the destination file.
fn move_to_destination<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Result<(), TxnStatus> {
    let tmp = ctx.tmp_file_path();
    if let Err(e) = ctx.vfs.rename_file(&tmp, &ctx.hist.dst_filename) {
        error!(
            "CF: transaction {} renaming {} to {} failed: {}",
            ctx.id(),
            tmp,
            ctx.hist.dst_filename,
            e
        );
        ctx.io.counters.fault.file_rename += 1;
        return Err(TxnStatus::Condition(ConditionCode::FilestoreRejection));
    }
    ctx.txn.flags.file_created = false;
    info!(
        "CF: transaction {} stored {}, {} bytes",
        ctx.id(),
        ctx.hist.dst_filename,
        ctx.txn.fsize
    );
    Ok(())
}

fn r2_recv_eof<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    eof: &EofPdu,
) {
    ctx.txn.flags.send_ack = true;
    if ctx.txn.flags.eof_recv {
        debug!("CF: transaction {} EOF repeated", ctx.id());
        return;
    }
    ctx.txn.flags.eof_recv = true;
    ctx.txn.eof_cc = eof.condition_code;
    ctx.txn.eof_checksum = eof.checksum;
    if eof.condition_code != ConditionCode::NoError {
        info!(
            "CF: transaction {} canceled by the sender, {:?}",
            ctx.id(),
            eof.condition_code
        );
        ctx.set_status(TxnStatus::Condition(eof.condition_code));
        ctx.txn.flags.finish_after_ack = true;
        ctx.txn.flags.send_nak = false;
        ctx.txn.flags.nak_timer_armed = false;
        return;
    }
    if ctx.txn.foffs > eof.file_size {
        let e = RecvError::FileSizeMismatch {
            expected: eof.file_size,
            received: ctx.txn.foffs,
        };
        error!("CF: transaction {} {} ({})", ctx.id(), e, e.status_code());
        ctx.io.counters.fault.file_size_mismatch += 1;
        handle_fault(ctx, TxnStatus::Condition(ConditionCode::FileSizeError));
        return;
    }
    ctx.txn.fsize = eof.file_size;
    ctx.hist.fsize = eof.file_size;
    check_complete(ctx);
}

/// Enter checksum verification once the metadata and all data are there, otherwise request
/// the missing parts.
fn check_complete<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    if ctx.txn.flags.complete || ctx.txn.rx_sub != RxSubState::FileData {
        return;
    }
    let data_complete = ctx
        .chunks
        .as_ref()
        .is_some_and(|chunks| chunks.is_complete(ctx.txn.fsize));
    if ctx.txn.flags.md_recv && data_complete {
        debug!("CF: transaction {} all data received", ctx.id());
        ctx.txn.flags.complete = true;
        ctx.txn.flags.send_nak = false;
        ctx.txn.flags.nak_timer_armed = false;
        ctx.txn.rx_sub = RxSubState::Eof;
        ctx.txn.crc_offset = 0;
        ctx.txn.checksum = FileChecksum::new(ctx.txn.checksum_type).unwrap_or_default();
    } else if !ctx.txn.flags.nak_timer_armed {
        ctx.txn.flags.send_nak = true;
    }
}

/// Advance the timers of a receive transaction and emit the due responses.
pub(crate) fn tick<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    let inactive = tick_armed(
        &mut ctx.txn.inactivity_timer,
        &mut ctx.txn.flags.inactivity_armed,
    );
    if matches!(ctx.txn.state, TxnState::Drop | TxnState::Idle) {
        if inactive {
            ctx.finish();
        }
        return;
    }
    if inactive {
        ctx.io.counters.fault.inactivity_timer += 1;
        warn!("CF: transaction {} inactivity timer expired", ctx.id());
        let status = TxnStatus::Condition(ConditionCode::InactivityDetected);
        if ctx.txn.class == CfdpClass::Class1 || ctx.txn.rx_sub == RxSubState::CloseoutSync {
            if ctx.report_fault(status) == FaultHandlerCode::IgnoreError {
                ctx.arm_inactivity_timer();
            } else {
                r1_fail(ctx, status);
                return;
            }
        } else {
            let code = handle_fault(ctx, status);
            if code == FaultHandlerCode::IgnoreError {
                ctx.arm_inactivity_timer();
            }
            if ctx.txn.flags.finished {
                return;
            }
        }
    }
    if ctx.txn.class == CfdpClass::Class1 {
        return;
    }
    if ctx.txn.flags.send_ack {
        let ack = AckPdu::new(
            FileDirectiveType::EofPdu,
            ctx.txn.eof_cc,
            TransactionStatus::Active,
        );
        match ctx.send(Direction::TowardsSender, PduBody::Ack(ack)) {
            Ok(()) => {
                ctx.txn.flags.send_ack = false;
                if ctx.txn.flags.finish_after_ack {
                    remove_tmp_file(ctx);
                    ctx.finish();
                    return;
                }
            }
            Err(e) => {
                send_failed(ctx, e);
                return;
            }
        }
    }
    if ctx.txn.rx_sub == RxSubState::Eof && !ctx.txn.flags.crc_done {
        verify_step(ctx);
        if ctx.txn.flags.finished {
            return;
        }
    }
    if tick_armed(&mut ctx.txn.nak_timer, &mut ctx.txn.flags.nak_timer_armed) {
        ctx.txn.acknak_count = ctx.txn.acknak_count.saturating_add(1);
        if ctx.txn.acknak_count >= ctx.chan_cfg.nak_limit {
            ctx.io.counters.fault.nak_limit += 1;
            let code = handle_fault(ctx, TxnStatus::Condition(ConditionCode::NakLimitReached));
            if code == FaultHandlerCode::IgnoreError {
                ctx.txn.acknak_count = 0;
                ctx.txn.flags.send_nak = true;
            }
            if ctx.txn.flags.finished {
                return;
            }
        } else {
            ctx.txn.flags.send_nak = true;
        }
    }
    if ctx.txn.flags.send_nak {
        match send_nak(ctx) {
            Ok(()) => (),
            Err(e) => {
                send_failed(ctx, e);
                return;
            }
        }
    }
    if ctx.txn.flags.send_fin {
        match send_fin(ctx) {
            Ok(()) => {
                ctx.txn.flags.send_fin = false;
                if ctx.txn.rx_sub != RxSubState::CloseoutSync {
                    ctx.txn.rx_sub = RxSubState::CloseoutSync;
                    ctx.txn.acknak_count = 0;
                }
                ctx.arm_ack_timer();
            }
            Err(e) => send_failed(ctx, e),
        }
        return;
    }
    if ctx.txn.rx_sub == RxSubState::CloseoutSync
        && tick_armed(&mut ctx.txn.ack_timer, &mut ctx.txn.flags.ack_timer_armed)
    {
        ctx.txn.acknak_count = ctx.txn.acknak_count.saturating_add(1);
        if ctx.txn.acknak_count >= ctx.chan_cfg.ack_limit {
            ctx.io.counters.fault.ack_limit += 1;
            if ctx.report_fault(TxnStatus::AckLimitNoFin) == FaultHandlerCode::IgnoreError {
                ctx.txn.acknak_count = 0;
                ctx.txn.flags.send_fin = true;
            } else {
                ctx.set_status(TxnStatus::AckLimitNoFin);
                ctx.finish();
            }
        } else {
            debug!(
                "CF: transaction {} Finished PDU not acknowledged, retry {}",
                ctx.id(),
                ctx.txn.acknak_count
            );
            ctx.txn.flags.send_fin = true;
        }
    }
}

fn send_failed<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    error: SendError,
) {
    // Retried on the next wakeup.
    if error.is_retryable() {
        return;
    }
    error!(
        "CF: transaction {} PDU not sent: {} ({})",
        ctx.id(),
        error,
        error.status_code()
    );
    ctx.set_status(TxnStatus::ProtocolError);
    remove_tmp_file(ctx);
    ctx.finish();
}

/// Request the missing metadata and file extents.
fn send_nak<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Result<(), SendError> {
    let end_of_scope = if ctx.txn.flags.eof_recv {
        ctx.txn.fsize
    } else {
        ctx.txn.foffs
    };
    let mut segment_requests = SegmentRequestList::new();
    if !ctx.txn.flags.md_recv {
        let _ = segment_requests.push(SegmentRequest::new(0, 0));
    }
    if let Some(chunks) = ctx.chunks.as_ref() {
        for gap in chunks.gaps(end_of_scope, 0) {
            if segment_requests
                .push(SegmentRequest::new(gap.offset, gap.end()))
                .is_err()
            {
                break;
            }
        }
    }
    if segment_requests.is_empty() {
        ctx.txn.flags.send_nak = false;
        check_complete(ctx);
        return Ok(());
    }
    let num_requests = segment_requests.len() as u32;
    let nak = NakPdu {
        start_of_scope: 0,
        end_of_scope,
        segment_requests,
    };
    ctx.send(Direction::TowardsSender, PduBody::Nak(nak))?;
    debug!(
        "CF: transaction {} requested {} missing segments",
        ctx.id(),
        num_requests
    );
    ctx.io.counters.sent.nak_segment_requests += num_requests;
    ctx.txn.flags.send_nak = false;
    ctx.arm_nak_timer();
    Ok(())
}

fn send_fin<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
) -> Result<(), SendError> {
    let fault_location =
        (ctx.txn.fin_cc != ConditionCode::NoError).then_some(ctx.cfg.local_eid);
    let fin = FinPdu {
        condition_code: ctx.txn.fin_cc,
        delivery_code: ctx.txn.fin_dc,
        file_status: ctx.txn.fin_fs,
        fault_location,
    };
    ctx.send(Direction::TowardsSender, PduBody::Fin(fin))
}

/// Feed a bounded number of bytes of the complete file into the checksum. Once the whole file
/// is verified the transaction keeps or discards the file and reports the result.
fn verify_step<Vfs: VirtualFilestore, User: EngineUser>(ctx: &mut TxnCtx<'_, Vfs, User>) {
    let tmp = ctx.tmp_file_path();
    let budget = ctx.cfg.rx_crc_calc_bytes_per_wakeup as u64;
    let mut done = 0;
    while done < budget && ctx.txn.crc_offset < ctx.txn.fsize {
        let len = (R2_CRC_CHUNK_SIZE.min(ctx.scratch.len()) as u64)
            .min(ctx.txn.fsize - ctx.txn.crc_offset)
            .min(budget - done);
        if let Err(e) = ctx
            .vfs
            .read_data(&tmp, ctx.txn.crc_offset, len, ctx.scratch)
        {
            error!(
                "CF: transaction {} reading {} for verification failed: {}",
                ctx.id(),
                tmp,
                e
            );
            ctx.io.counters.fault.file_read += 1;
            ctx.txn.flags.crc_done = true;
            handle_fault(
                ctx,
                TxnStatus::Condition(ConditionCode::FilestoreRejection),
            );
            return;
        }
        ctx.txn.checksum.update(&ctx.scratch[..len as usize]);
        ctx.txn.crc_offset += len;
        done += len;
    }
    if ctx.txn.crc_offset < ctx.txn.fsize {
        return;
    }
    ctx.txn.flags.crc_done = true;
    ctx.txn.crc_result = mem::take(&mut ctx.txn.checksum).finalize();
    ctx.txn.fin_dc = DeliveryCode::Complete;
    if ctx.txn.crc_result != ctx.txn.eof_checksum {
        error!(
            "CF: transaction {} checksum mismatch, expected {:#010x}, calculated {:#010x}",
            ctx.id(),
            ctx.txn.eof_checksum,
            ctx.txn.crc_result
        );
        ctx.io.counters.fault.crc_mismatch += 1;
        let status = TxnStatus::Condition(ConditionCode::FileChecksumFailure);
        if ctx.report_fault(status) != FaultHandlerCode::IgnoreError {
            ctx.set_status(status);
            ctx.txn.fin_cc = ConditionCode::FileChecksumFailure;
            ctx.txn.fin_dc = DeliveryCode::Incomplete;
            ctx.txn.fin_fs = FileStatus::DiscardDeliberately;
            ctx.txn.flags.suspended = false;
            remove_tmp_file(ctx);
            ctx.txn.flags.send_fin = true;
            return;
        }
    }
    match move_to_destination(ctx) {
        Ok(()) => {
            ctx.txn.fin_cc = ConditionCode::NoError;
            ctx.txn.fin_fs = FileStatus::Retained;
        }
        Err(status) => {
            ctx.set_status(status);
            ctx.txn.fin_cc = status.condition_code();
            ctx.txn.fin_fs = FileStatus::DiscardedFsRejection;
            remove_tmp_file(ctx);
        }
    }
    ctx.txn.flags.send_fin = true;
}

/// Graceful close. A class 2 transaction which did not report its result yet sends a
/// Finished PDU with the condition code, all others end immediately.
pub(crate) fn cancel<Vfs: VirtualFilestore, User: EngineUser>(
    ctx: &mut TxnCtx<'_, Vfs, User>,
    cc: ConditionCode,
) {
    ctx.txn.flags.canceled = true;
    ctx.set_status(TxnStatus::Condition(cc));
    let can_report = ctx.txn.state == TxnState::R2
        && ctx.txn.rx_sub != RxSubState::CloseoutSync
        && !ctx.txn.flags.send_fin
        && !ctx.txn.flags.finish_after_ack;
    if !can_report {
        remove_tmp_file(ctx);
        ctx.finish();
        return;
    }
    info!("CF: transaction {} canceled, {:?}", ctx.id(), cc);
    ctx.txn.fin_cc = cc;
    ctx.txn.fin_dc = if ctx.txn.flags.complete {
        DeliveryCode::Complete
    } else {
        DeliveryCode::Incomplete
    };
    ctx.txn.fin_fs = FileStatus::DiscardDeliberately;
    remove_tmp_file(ctx);
    ctx.txn.flags.send_fin = true;
    ctx.txn.flags.send_nak = false;
    ctx.txn.flags.nak_timer_armed = false;
    ctx.txn.flags.crc_done = true;
    ctx.txn.rx_sub = RxSubState::Eof;
}
