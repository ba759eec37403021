//! # Channel Module
//!
//! A channel owns the transaction, history and chunk list pools, the queues which link them,
//! the directory playbacks and the transport. [Channel::cycle] runs one engine wakeup for the
//! channel: receive, tick, playback and transmit processing.
//!
//! The state machines in [crate::source] and [crate::dest] never touch the queues. They record
//! the requested queue move or the end of the transaction inside the transaction and the
//! channel applies it after the event was handled.
use core::mem;
use std::{format, string::String, vec, vec::Vec};

use log::{debug, error, info, warn};
use spacepackets::cfdp::{
    pdu::FileDirectiveType, ConditionCode, Direction, TransactionStatus, TransmissionMode,
};

use crate::{
    arena::{Arena, Handle},
    chunks::FullPolicy,
    cmd::{CmdError, DirectionSelector, PlaybackRequest, PurgeTarget, QueueSelector},
    codec::{decode_pdu, encode_pdu},
    config::{ChannelConfig, EngineConfig},
    counters::{ChannelCounters, ChannelHousekeeping},
    dest,
    filestore::{FilestoreError, VirtualFilestore},
    pdu::{AckPdu, FinPdu, Pdu, PduBody, PduHeader},
    playback::{playback_slot, Playback, PlaybackRef, PollDir, TxParams},
    queue::QueueSet,
    source::{self, TxProgress},
    transaction::{
        tick_armed, tmp_file_path, EotRecord, Filename, History, SendError, Transaction, TxnChunks,
        TxnCtx, TxnState,
    },
    transport::{ChannelTransport, PduTransport},
    CfdpClass, EngineUser, EntityId, FaultHandler, QueueIdx, TransactionId, TransactionSeq,
    TxnDirection, TxnStatus, MAX_COMMANDED_PLAYBACK_DIRECTORIES_PER_CHAN,
    MAX_POLLING_DIR_PER_CHAN, MAX_PDU_SIZE, MAX_SIMULTANEOUS_RX, NUM_HISTORIES_PER_CHANNEL,
    NUM_QUEUES, NUM_TRANSACTIONS_PER_CHANNEL, R2_CRC_CHUNK_SIZE,
};

/// Queues holding live transactions.
const ACTIVE_QUEUES: [QueueIdx; 4] = [QueueIdx::Rx, QueueIdx::Pend, QueueIdx::Txa, QueueIdx::Txw];

/// Transport side of a channel together with its counters and the per wakeup send quota.
#[derive(Debug)]
pub(crate) struct ChannelIo {
    pub chan: u8,
    pub transport: ChannelTransport,
    pub counters: ChannelCounters,
    pub outgoing_counter: u32,
    /// Zero means unbounded.
    pub max_outgoing: u32,
    pub frozen: bool,
    buf: Vec<u8>,
}

impl ChannelIo {
    pub fn new(chan: u8, transport: ChannelTransport) -> Self {
        Self {
            chan,
            transport,
            counters: ChannelCounters::default(),
            outgoing_counter: 0,
            max_outgoing: 0,
            frozen: false,
            buf: vec![0; MAX_PDU_SIZE],
        }
    }

    pub fn reset_quota(&mut self, max_outgoing: u32) {
        self.outgoing_counter = 0;
        self.max_outgoing = max_outgoing;
    }

    pub fn quota_reached(&self) -> bool {
        self.max_outgoing != 0 && self.outgoing_counter >= self.max_outgoing
    }

    pub fn can_send(&self, suspended: bool) -> bool {
        !self.quota_reached() && !self.frozen && !suspended && self.transport.is_open()
    }

    /// Encode and send a PDU. Only a PDU which the transport accepted counts against the
    /// quota. A busy transport is reported as [SendError::NoBufferAvailable].
    pub fn send(&mut self, pdu: &Pdu, suspended: bool) -> Result<(), SendError> {
        if !self.can_send(suspended) {
            return Err(SendError::NoBufferAvailable);
        }
        let len = match encode_pdu(pdu, &mut self.buf) {
            Ok(len) => len,
            Err(e) => {
                self.counters.sent.error += 1;
                return Err(e.into());
            }
        };
        match self.transport.send_pdu(&self.buf[..len]) {
            Ok(()) => {
                self.outgoing_counter += 1;
                self.counters.sent.pdu += 1;
                debug!(
                    "CF: channel {} sent {:?} PDU of transaction {}:{}, {} bytes",
                    self.chan,
                    pdu.directive(),
                    pdu.header.source_eid,
                    pdu.header.seq_num,
                    len
                );
                Ok(())
            }
            Err(e) if e.is_busy() => {
                debug!("CF: channel {} transport busy: {}", self.chan, e);
                Err(SendError::NoBufferAvailable)
            }
            Err(e) => {
                self.counters.sent.error += 1;
                error!("CF: channel {} PDU send failed: {}", self.chan, e);
                Err(e.into())
            }
        }
    }
}

/// Engine wide state a channel needs while it processes a wakeup or a command.
pub(crate) struct ChannelEnv<'a, Vfs: VirtualFilestore, User: EngineUser> {
    pub cfg: &'a EngineConfig,
    pub vfs: &'a Vfs,
    pub faults: &'a mut FaultHandler<User>,
    pub seq_num: &'a mut TransactionSeq,
}

/// Snapshot of a live transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub channel: u8,
    pub state: TxnState,
    pub queue: QueueIdx,
    pub suspended: bool,
    pub history: History,
}

fn queue_from_index(idx: usize) -> Option<QueueIdx> {
    Some(match idx {
        0 => QueueIdx::Pend,
        1 => QueueIdx::Txa,
        2 => QueueIdx::Txw,
        3 => QueueIdx::Rx,
        4 => QueueIdx::Hist,
        5 => QueueIdx::HistFree,
        6 => QueueIdx::Free,
        _ => return None,
    })
}

pub(crate) struct Channel {
    pub io: ChannelIo,
    txns: Arena<Transaction>,
    hists: Arena<History>,
    chunk_pool: Arena<TxnChunks>,
    /// Transactions in [QueueIdx::Pend], [QueueIdx::Txa], [QueueIdx::Txw], [QueueIdx::Rx] and
    /// [QueueIdx::Free].
    txn_queues: QueueSet<NUM_QUEUES>,
    /// Histories in [QueueIdx::Hist] and [QueueIdx::HistFree]. Histories of live transactions
    /// are not linked.
    hist_queues: QueueSet<NUM_QUEUES>,
    /// Active send transaction to resume with on the next wakeup.
    cursor: Option<Handle>,
    playbacks: [Playback; MAX_COMMANDED_PLAYBACK_DIRECTORIES_PER_CHAN],
    polls: [PollDir; MAX_POLLING_DIR_PER_CHAN],
    pub num_cmd_tx: usize,
    scratch: Vec<u8>,
    rx_buf: Vec<u8>,
}

impl Channel {
    pub fn new(chan: u8, transport: ChannelTransport) -> Self {
        let mut txn_queues = QueueSet::new(NUM_TRANSACTIONS_PER_CHANNEL);
        for idx in 0..NUM_TRANSACTIONS_PER_CHANNEL {
            txn_queues.push_back(QueueIdx::Free as usize, idx);
        }
        let mut hist_queues = QueueSet::new(NUM_HISTORIES_PER_CHANNEL);
        for idx in 0..NUM_HISTORIES_PER_CHANNEL {
            hist_queues.push_back(QueueIdx::HistFree as usize, idx);
        }
        Self {
            io: ChannelIo::new(chan, transport),
            txns: Arena::new(NUM_TRANSACTIONS_PER_CHANNEL, |_| Transaction::default()),
            hists: Arena::new(NUM_HISTORIES_PER_CHANNEL, |_| History::default()),
            chunk_pool: Arena::new(NUM_TRANSACTIONS_PER_CHANNEL, |_| TxnChunks::new()),
            txn_queues,
            hist_queues,
            cursor: None,
            playbacks: core::array::from_fn(|_| Playback::default()),
            polls: core::array::from_fn(|_| PollDir::default()),
            num_cmd_tx: 0,
            scratch: vec![0; MAX_PDU_SIZE.max(R2_CRC_CHUNK_SIZE)],
            rx_buf: vec![0; MAX_PDU_SIZE],
        }
    }

    pub fn chan(&self) -> u8 {
        self.io.chan
    }

    /// One engine wakeup.
    pub fn cycle<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
    ) {
        let cfg = env.cfg;
        let Some(chan_cfg) = cfg.chan.get(self.io.chan as usize) else {
            return;
        };
        self.io.reset_quota(chan_cfg.max_outgoing_messages_per_wakeup);
        self.receive(env, chan_cfg);
        if self.io.frozen {
            return;
        }
        self.tick(env);
        self.process_playbacks(env);
        self.process_polls(env, chan_cfg);
        self.dispatch_tx(env, chan_cfg);
    }

    fn with_txn<Vfs: VirtualFilestore, User: EngineUser, R>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
        f: impl FnOnce(&mut TxnCtx<'_, Vfs, User>) -> R,
    ) -> Option<R> {
        let cfg = env.cfg;
        let chan_cfg = cfg.chan.get(self.io.chan as usize)?;
        let txn = self.txns.at_mut(idx)?;
        let hist = self.hists.at_mut(txn.history?)?;
        let chunks = match txn.chunks {
            Some(handle) => self.chunk_pool.get_mut(handle),
            None => None,
        };
        let mut ctx = TxnCtx {
            cfg,
            chan_cfg,
            io: &mut self.io,
            vfs: env.vfs,
            faults: &mut *env.faults,
            txn,
            hist,
            chunks,
            scratch: &mut self.scratch,
        };
        Some(f(&mut ctx))
    }

    /// Finish or move the transaction as requested by the last event.
    fn apply_outcome<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
    ) {
        let Some(txn) = self.txns.at_mut(idx) else {
            return;
        };
        if txn.flags.finished {
            self.finalize(env, idx);
            return;
        }
        if let Some(queue) = txn.requeue.take() {
            if self.txn_queues.queue_of(idx) != Some(queue as usize) {
                self.txn_queues.push_back(queue as usize, idx);
            }
        }
    }

    /// Release a transaction: report it, keep its history and return all its resources.
    fn finalize<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
    ) {
        let handle = self.txns.handle(idx);
        let Some(txn) = self.txns.at_mut(idx) else {
            return;
        };
        self.txn_queues.remove(idx);
        if let Some(hist_idx) = txn.history.take() {
            if let Some(hist) = self.hists.at_mut(hist_idx) {
                if !txn.is_tx() && txn.flags.file_created {
                    let tmp = tmp_file_path(&env.cfg.tmp_dir, hist.src_eid, hist.seq_num);
                    if let Err(e) = env.vfs.remove_file(&tmp) {
                        warn!("CF: removing temporary file {} failed: {}", tmp, e);
                    }
                }
                if hist.txn_stat == TxnStatus::Undefined {
                    hist.txn_stat = TxnStatus::Condition(ConditionCode::NoError);
                }
                if !txn.flags.drop_history {
                    info!(
                        "CF: channel {} transaction {} {:?} finished, status {:?}",
                        self.io.chan,
                        hist.transaction_id(),
                        hist.dir,
                        hist.txn_stat
                    );
                    let record = EotRecord {
                        channel: self.io.chan,
                        state: txn.state,
                        crc_result: txn.crc_result,
                        history: hist.clone(),
                    };
                    env.faults.user_hook.transaction_finished(&record);
                }
            }
            let queue = if txn.flags.drop_history {
                QueueIdx::HistFree
            } else {
                QueueIdx::Hist
            };
            self.hist_queues.push_back(queue as usize, hist_idx);
        }
        if let Some(chunks) = txn.chunks.take() {
            if let Some(list) = self.chunk_pool.get_mut(chunks) {
                list.reset();
            }
            self.chunk_pool.release(chunks);
        }
        if let (Some(pb_ref), Some(handle)) = (txn.playback.take(), handle) {
            if let Some(pb) = playback_slot(&mut self.playbacks, &mut self.polls, pb_ref) {
                pb.detach(handle);
            }
        }
        if txn.flags.cmd_tx {
            self.num_cmd_tx = self.num_cmd_tx.saturating_sub(1);
        }
        *txn = Transaction::default();
        self.txns.retire(idx);
        self.txn_queues.push_back(QueueIdx::Free as usize, idx);
        if self.cursor.is_some_and(|cursor| cursor.index() == idx) {
            self.cursor = None;
        }
    }

    /// Take a history slot, evicting the oldest history if none is free.
    fn alloc_history(&mut self) -> Option<usize> {
        let idx = self
            .hist_queues
            .pop_front(QueueIdx::HistFree as usize)
            .or_else(|| self.hist_queues.pop_front(QueueIdx::Hist as usize))?;
        if let Some(hist) = self.hists.at_mut(idx) {
            *hist = History::default();
        }
        Some(idx)
    }

    /// Take a free transaction with a fresh history. The transaction is not linked into any
    /// queue yet.
    fn alloc_txn(&mut self) -> Option<usize> {
        let idx = self.txn_queues.front(QueueIdx::Free as usize)?;
        let hist = self.alloc_history()?;
        self.txn_queues.remove(idx);
        if let Some(txn) = self.txns.at_mut(idx) {
            *txn = Transaction::default();
            txn.history = Some(hist);
        }
        Some(idx)
    }

    fn alloc_chunks(&mut self, policy: FullPolicy) -> Option<Handle> {
        let handle = self.chunk_pool.alloc()?;
        if let Some(list) = self.chunk_pool.get_mut(handle) {
            list.reset_with(policy);
        }
        Some(handle)
    }

    fn hist_of(&self, idx: usize) -> Option<&History> {
        self.hists.at(self.txns.at(idx)?.history?)
    }

    fn find_txn(&self, source_eid: EntityId, seq_num: TransactionSeq) -> Option<usize> {
        ACTIVE_QUEUES.iter().find_map(|queue| {
            self.txn_queues.iter(*queue as usize).find(|idx| {
                self.hist_of(*idx)
                    .is_some_and(|hist| hist.src_eid == source_eid && hist.seq_num == seq_num)
            })
        })
    }

    pub fn find_by_id(&self, id: TransactionId) -> Option<usize> {
        self.find_txn(id.source_eid, id.seq_num)
    }

    #[cfg(test)]
    pub fn txn_by_id(&self, id: TransactionId) -> Option<&Transaction> {
        self.txns.at(self.find_by_id(id)?)
    }

    /// All live transactions, receive transactions first.
    pub fn active_txns(&self) -> Vec<usize> {
        ACTIVE_QUEUES
            .iter()
            .flat_map(|queue| self.txn_queues.iter(*queue as usize))
            .collect()
    }

    pub fn summary(&self, idx: usize) -> Option<TransactionSummary> {
        let txn = self.txns.at(idx)?;
        Some(TransactionSummary {
            channel: self.io.chan,
            state: txn.state,
            queue: queue_from_index(self.txn_queues.queue_of(idx)?)?,
            suspended: txn.flags.suspended,
            history: self.hist_of(idx)?.clone(),
        })
    }

    /// Histories of finished transactions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &History> {
        self.hist_queues
            .iter(QueueIdx::Hist as usize)
            .filter_map(|idx| self.hists.at(idx))
    }

    pub fn housekeeping(&self) -> ChannelHousekeeping {
        let txn_sizes = self.txn_queues.sizes();
        let hist_sizes = self.hist_queues.sizes();
        let mut q_size = [0; NUM_QUEUES];
        for (idx, size) in q_size.iter_mut().enumerate() {
            *size = txn_sizes[idx] + hist_sizes[idx];
        }
        ChannelHousekeeping {
            counters: self.io.counters,
            q_size,
            poll_counter: self.polls.iter().filter(|poll| poll.pb.busy).count() as u8,
            playback_counter: self.playbacks.iter().filter(|pb| pb.busy).count() as u8,
            frozen: self.io.frozen,
            channel_closed: !self.io.transport.is_open(),
        }
    }

    fn receive<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        chan_cfg: &ChannelConfig,
    ) {
        if !self.io.transport.is_open() {
            return;
        }
        let mut rx_buf = mem::take(&mut self.rx_buf);
        for _ in 0..chan_cfg.rx_max_messages_per_wakeup {
            match self.io.transport.receive_pdu(&mut rx_buf) {
                Ok(Some(len)) => self.handle_raw_pdu(env, &rx_buf[..len]),
                Ok(None) => break,
                Err(e) => {
                    self.io.counters.recv.error += 1;
                    warn!("CF: channel {} receive error: {}", self.io.chan, e);
                    break;
                }
            }
        }
        self.rx_buf = rx_buf;
    }

    fn handle_raw_pdu<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        raw: &[u8],
    ) {
        let pdu = match decode_pdu(raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                self.io.counters.recv.error += 1;
                error!(
                    "CF: channel {} PDU decode failed: {} ({})",
                    self.io.chan,
                    e,
                    e.status_code()
                );
                return;
            }
        };
        self.io.counters.recv.pdu += 1;
        let header = pdu.header;
        debug!(
            "CF: channel {} received {:?} PDU of transaction {}:{}",
            self.io.chan,
            pdu.directive(),
            header.source_eid,
            header.seq_num
        );
        if let Some(idx) = self.find_txn(header.source_eid, header.seq_num) {
            self.dispatch_pdu(env, idx, &pdu);
            return;
        }
        if let PduBody::Fin(fin) = &pdu.body {
            if header.source_eid == env.cfg.local_eid {
                self.reply_to_unknown_fin(&header, fin);
                return;
            }
        }
        if header.dest_eid != env.cfg.local_eid {
            self.io.counters.recv.dropped += 1;
            error!(
                "CF: channel {} dropping PDU for invalid destination EID {}",
                self.io.chan, header.dest_eid
            );
            return;
        }
        if !matches!(pdu.body, PduBody::Metadata(_) | PduBody::FileData(_)) {
            self.io.counters.recv.spurious += 1;
            debug!(
                "CF: channel {} ignores {:?} PDU of unknown transaction {}:{}",
                self.io.chan,
                pdu.directive(),
                header.source_eid,
                header.seq_num
            );
            return;
        }
        if let Some(idx) = self.admit_rx(&header) {
            self.dispatch_pdu(env, idx, &pdu);
        }
    }

    /// The peer repeats a Finished PDU of a transaction which is already gone because the
    /// ACK got lost. Acknowledge it so the peer can close its side.
    fn reply_to_unknown_fin(&mut self, header: &PduHeader, fin: &FinPdu) {
        self.io.counters.recv.spurious += 1;
        let mut ack_header = *header;
        ack_header.direction = Direction::TowardsReceiver;
        let ack = AckPdu::new(
            FileDirectiveType::FinishedPdu,
            fin.condition_code,
            TransactionStatus::Unrecognized,
        );
        info!(
            "CF: channel {} acknowledging Finished PDU of unknown transaction {}:{}",
            self.io.chan, header.source_eid, header.seq_num
        );
        if let Err(e) = self.io.send(&Pdu::new(ack_header, PduBody::Ack(ack)), false) {
            warn!("CF: channel {} Finished ACK not sent: {}", self.io.chan, e);
        }
    }

    fn admit_rx(&mut self, header: &PduHeader) -> Option<usize> {
        if self.txn_queues.len(QueueIdx::Rx as usize) as usize >= MAX_SIMULTANEOUS_RX {
            self.io.counters.recv.dropped += 1;
            error!(
                "CF: channel {} dropping PDU of {}:{}, maximum number of receive transactions reached",
                self.io.chan, header.source_eid, header.seq_num
            );
            return None;
        }
        let Some(idx) = self.alloc_txn() else {
            self.io.counters.recv.dropped += 1;
            error!(
                "CF: channel {} dropping PDU of {}:{}, no free transaction",
                self.io.chan, header.source_eid, header.seq_num
            );
            return None;
        };
        let chunks = if header.transmission_mode == TransmissionMode::Acknowledged {
            // Received extents must never claim more than what arrived.
            self.alloc_chunks(FullPolicy::KeepLargest)
        } else {
            None
        };
        self.txn_queues.push_back(QueueIdx::Rx as usize, idx);
        let txn = self.txns.at_mut(idx)?;
        txn.chunks = chunks;
        let hist = self.hists.at_mut(txn.history?)?;
        hist.dir = TxnDirection::Rx;
        hist.src_eid = header.source_eid;
        hist.peer_eid = header.source_eid;
        hist.seq_num = header.seq_num;
        Some(idx)
    }

    fn dispatch_pdu<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
        pdu: &Pdu,
    ) {
        let Some(state) = self.txns.at(idx).map(|txn| txn.state) else {
            return;
        };
        self.with_txn(env, idx, |ctx| match state {
            TxnState::Idle => dest::recv_idle(ctx, pdu),
            TxnState::R1 | TxnState::R2 | TxnState::Drop => dest::recv(ctx, pdu),
            TxnState::S1 | TxnState::S2 => source::recv(ctx, pdu),
        });
        self.apply_outcome(env, idx);
    }

    /// Advance the timers of all receive and waiting send transactions.
    fn tick<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
    ) {
        for queue in [QueueIdx::Rx, QueueIdx::Txw] {
            let mut node = self.txn_queues.front(queue as usize);
            while let Some(idx) = node {
                node = self.txn_queues.next(idx);
                let Some(txn) = self.txns.at(idx) else {
                    continue;
                };
                if txn.flags.suspended {
                    continue;
                }
                let is_tx = txn.is_tx();
                self.with_txn(env, idx, |ctx| {
                    if is_tx {
                        source::tick(ctx)
                    } else {
                        dest::tick(ctx)
                    }
                });
                self.apply_outcome(env, idx);
            }
        }
    }

    fn process_playbacks<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
    ) {
        for idx in 0..self.playbacks.len() {
            if self.playbacks[idx].busy {
                self.feed_playback(env, PlaybackRef::Commanded(idx as u8));
            }
        }
    }

    fn process_polls<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        chan_cfg: &ChannelConfig,
    ) {
        for (idx, poll_cfg) in chan_cfg.polldir.iter().enumerate() {
            let Some(poll) = self.polls.get_mut(idx) else {
                break;
            };
            if poll.pb.busy {
                self.feed_playback(env, PlaybackRef::Poll(idx as u8));
                continue;
            }
            if !poll_cfg.enabled {
                poll.timer_set = false;
                continue;
            }
            if !poll.timer_set {
                poll.timer
                    .init_rel_sec(poll_cfg.interval_sec, env.cfg.ticks_per_second);
                poll.timer_set = true;
            }
            if !tick_armed(&mut poll.timer, &mut poll.timer_set) {
                continue;
            }
            match env.vfs.read_dir(&poll_cfg.src_dir) {
                Ok(files) => {
                    if !files.is_empty() {
                        debug!(
                            "CF: channel {} polling directory {} found {} files",
                            self.io.chan,
                            poll_cfg.src_dir,
                            files.len()
                        );
                        let request = PlaybackRequest::new(
                            poll_cfg.class,
                            false,
                            self.io.chan,
                            poll_cfg.priority,
                            poll_cfg.dest_eid,
                            poll_cfg.src_dir.clone(),
                            poll_cfg.dst_dir.clone(),
                        );
                        poll.pb.start(&request, files);
                        self.feed_playback(env, PlaybackRef::Poll(idx as u8));
                    }
                }
                Err(e) => {
                    self.io.counters.fault.directory_read += 1;
                    error!(
                        "CF: channel {} reading polling directory {} failed: {}",
                        self.io.chan, poll_cfg.src_dir, e
                    );
                }
            }
        }
    }

    /// Start the next files of a playback while it has free transaction slots.
    fn feed_playback<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        pb_ref: PlaybackRef,
    ) {
        loop {
            let Some(pb) = playback_slot(&mut self.playbacks, &mut self.polls, pb_ref) else {
                return;
            };
            if !pb.has_capacity() || self.txn_queues.is_empty(QueueIdx::Free as usize) {
                return;
            }
            let Some(params) = pb.next_transfer() else {
                pb.refresh_busy();
                return;
            };
            match self.create_tx_txn(env, &params) {
                Ok((idx, _)) => {
                    if let Some(txn) = self.txns.at_mut(idx) {
                        txn.playback = Some(pb_ref);
                    }
                    let handle = self.txns.handle(idx);
                    let pb = playback_slot(&mut self.playbacks, &mut self.polls, pb_ref);
                    if let (Some(pb), Some(handle)) = (pb, handle) {
                        pb.attach(handle);
                    }
                }
                Err(e) => warn!(
                    "CF: channel {} playback skips {}: {}",
                    self.io.chan, params.src_filename, e
                ),
            }
        }
    }

    /// Round robin over the active send transactions, one PDU per transaction and turn,
    /// until the outgoing quota is used up or nothing is left to send.
    fn dispatch_tx<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        chan_cfg: &ChannelConfig,
    ) {
        loop {
            if self.io.quota_reached() {
                return;
            }
            if self.txn_queues.is_empty(QueueIdx::Txa as usize) {
                if !chan_cfg.dequeue_enabled {
                    return;
                }
                let Some(idx) = self.txn_queues.front(QueueIdx::Pend as usize) else {
                    return;
                };
                self.txn_queues.push_back(QueueIdx::Txa as usize, idx);
            }
            let resume_at = self
                .cursor
                .take()
                .filter(|cursor| {
                    self.txns.is_valid(*cursor)
                        && self.txn_queues.queue_of(cursor.index()) == Some(QueueIdx::Txa as usize)
                })
                .map(|cursor| cursor.index());
            let mut node = resume_at.or_else(|| self.txn_queues.front(QueueIdx::Txa as usize));
            let mut progressed = false;
            while let Some(idx) = node {
                node = self.txn_queues.next(idx);
                if self.txns.at(idx).map_or(true, |txn| txn.flags.suspended) {
                    continue;
                }
                let progress = self
                    .with_txn(env, idx, |ctx| source::dispatch(ctx))
                    .unwrap_or(TxProgress::Idle);
                self.apply_outcome(env, idx);
                match progress {
                    TxProgress::Sent => progressed = true,
                    TxProgress::Blocked => {
                        self.cursor = self.txns.handle(idx);
                        return;
                    }
                    TxProgress::Idle => (),
                }
                if self.io.quota_reached() {
                    self.cursor = node.and_then(|next| self.txns.handle(next));
                    return;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Create a send transaction and queue it as pending.
    pub fn create_tx_txn<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        params: &TxParams,
    ) -> Result<(usize, TransactionId), CmdError> {
        let src_filename = Filename::try_from(params.src_filename.as_str())
            .map_err(|_| CmdError::FilenameTooLong(params.src_filename.clone()))?;
        let dst_filename = Filename::try_from(params.dst_filename.as_str())
            .map_err(|_| CmdError::FilenameTooLong(params.dst_filename.clone()))?;
        let chunks = match params.class {
            CfdpClass::Class2 => Some(
                self.alloc_chunks(FullPolicy::MergeNearest)
                    .ok_or(CmdError::NoFreeTransaction)?,
            ),
            CfdpClass::Class1 => None,
        };
        let Some(idx) = self.alloc_txn() else {
            if let Some(chunks) = chunks {
                self.chunk_pool.release(chunks);
            }
            return Err(CmdError::NoFreeTransaction);
        };
        *env.seq_num = env.seq_num.wrapping_add(1);
        let id = TransactionId::new(env.cfg.local_eid, *env.seq_num);
        let priority = params.priority;
        if let Some(txn) = self.txns.at_mut(idx) {
            txn.state = match params.class {
                CfdpClass::Class1 => TxnState::S1,
                CfdpClass::Class2 => TxnState::S2,
            };
            txn.class = params.class;
            txn.chunks = chunks;
            txn.priority = priority;
            txn.keep = params.keep;
            txn.closure_requested = params.class == CfdpClass::Class2;
            if let Some(hist) = txn.history.and_then(|hist| self.hists.at_mut(hist)) {
                hist.dir = TxnDirection::Tx;
                hist.src_eid = id.source_eid;
                hist.seq_num = id.seq_num;
                hist.peer_eid = params.dest_eid;
                hist.src_filename = src_filename;
                hist.dst_filename = dst_filename;
            }
        }
        let txns = &self.txns;
        self.txn_queues
            .insert_sorted(QueueIdx::Pend as usize, idx, |member| {
                txns.at(member).is_some_and(|txn| txn.priority <= priority)
            });
        info!(
            "CF: channel {} queued {:?} transaction {}: {} -> {}",
            self.io.chan, params.class, id, params.src_filename, params.dst_filename
        );
        Ok((idx, id))
    }

    pub fn set_cmd_tx(&mut self, idx: usize) {
        if let Some(txn) = self.txns.at_mut(idx) {
            txn.flags.cmd_tx = true;
            self.num_cmd_tx += 1;
        }
    }

    pub fn start_playback<Vfs: VirtualFilestore>(
        &mut self,
        vfs: &Vfs,
        request: &PlaybackRequest,
    ) -> Result<(), CmdError> {
        let chan = self.io.chan;
        let pb = self
            .playbacks
            .iter_mut()
            .find(|pb| !pb.busy)
            .ok_or(CmdError::NoFreePlayback(chan))?;
        let files = match vfs.read_dir(&request.src_dir) {
            Ok(files) => files,
            Err(e) => {
                self.io.counters.fault.directory_read += 1;
                return Err(e.into());
            }
        };
        info!(
            "CF: channel {} playback of {} with {} files",
            chan,
            request.src_dir,
            files.len()
        );
        pb.start(request, files);
        Ok(())
    }

    /// Set the suspended flag. Returns whether it changed.
    pub fn set_suspended(&mut self, idx: usize, suspended: bool) -> bool {
        match self.txns.at_mut(idx) {
            Some(txn) if txn.flags.suspended != suspended => {
                txn.flags.suspended = suspended;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_txn<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
    ) {
        let Some(txn) = self.txns.at_mut(idx) else {
            return;
        };
        // A suspended transaction could not finish its graceful close.
        txn.flags.suspended = false;
        let is_tx = txn.is_tx();
        let cc = ConditionCode::CancelRequestReceived;
        self.with_txn(env, idx, |ctx| {
            ctx.set_status(TxnStatus::Condition(cc));
            if is_tx {
                source::cancel(ctx, cc);
            } else {
                dest::cancel(ctx, cc);
            }
        });
        self.apply_outcome(env, idx);
    }

    pub fn abandon_txn<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        idx: usize,
    ) {
        self.with_txn(env, idx, |ctx| {
            ctx.set_status(TxnStatus::Condition(ConditionCode::CancelRequestReceived));
            ctx.finish();
        });
        self.apply_outcome(env, idx);
    }

    /// Stop all playbacks and polls from starting new transactions.
    pub fn stop_playbacks(&mut self) {
        for pb in self.playbacks.iter_mut() {
            pb.stop();
        }
        for poll in self.polls.iter_mut() {
            poll.pb.stop();
            poll.timer_set = false;
        }
    }

    /// Returns the number of purged entries.
    pub fn purge<Vfs: VirtualFilestore, User: EngineUser>(
        &mut self,
        env: &mut ChannelEnv<'_, Vfs, User>,
        target: PurgeTarget,
    ) -> usize {
        let mut purged = 0;
        if matches!(target, PurgeTarget::Pending | PurgeTarget::Both) {
            let pending: Vec<usize> = self.txn_queues.iter(QueueIdx::Pend as usize).collect();
            for idx in pending {
                if let Some(txn) = self.txns.at_mut(idx) {
                    txn.flags.drop_history = true;
                    txn.flags.finished = true;
                }
                self.apply_outcome(env, idx);
                purged += 1;
            }
        }
        if matches!(target, PurgeTarget::History | PurgeTarget::Both) {
            while let Some(idx) = self.hist_queues.pop_front(QueueIdx::Hist as usize) {
                self.hist_queues.push_back(QueueIdx::HistFree as usize, idx);
                purged += 1;
            }
        }
        purged
    }

    /// Write one line per selected queue entry to a file. Returns the number of entries.
    pub fn write_queue<Vfs: VirtualFilestore>(
        &self,
        vfs: &Vfs,
        queue: QueueSelector,
        direction: DirectionSelector,
        filename: &str,
    ) -> Result<usize, FilestoreError> {
        let dir_matches = |hist: &History| match direction {
            DirectionSelector::Up => hist.dir == TxnDirection::Rx,
            DirectionSelector::Down => hist.dir == TxnDirection::Tx,
            DirectionSelector::All => true,
        };
        let txn_queues: &[QueueIdx] = match queue {
            QueueSelector::Pending => &[QueueIdx::Pend],
            QueueSelector::Active => &[QueueIdx::Txa, QueueIdx::Txw, QueueIdx::Rx],
            QueueSelector::History => &[],
            QueueSelector::All => &ACTIVE_QUEUES,
        };
        let mut lines = String::new();
        let mut entries = 0;
        for queue_idx in txn_queues {
            for idx in self.txn_queues.iter(*queue_idx as usize) {
                let (Some(txn), Some(hist)) = (self.txns.at(idx), self.hist_of(idx)) else {
                    continue;
                };
                if dir_matches(hist) {
                    lines.push_str(&format_entry(hist, &format!("{:?}", txn.state)));
                    entries += 1;
                }
            }
        }
        if matches!(queue, QueueSelector::History | QueueSelector::All) {
            for hist in self.history().filter(|hist| dir_matches(hist)) {
                lines.push_str(&format_entry(hist, &format!("{:?}", hist.txn_stat)));
                entries += 1;
            }
        }
        if vfs.exists(filename)? {
            vfs.remove_file(filename)?;
        }
        vfs.create_file(filename)?;
        vfs.write_data(filename, 0, lines.as_bytes())?;
        Ok(entries)
    }
}

fn format_entry(hist: &History, state: &str) -> String {
    format!(
        "{} {:?} {} {} {} -> {}\n",
        hist.transaction_id(),
        hist.dir,
        state,
        hist.fsize,
        hist.src_filename,
        hist.dst_filename
    )
}
