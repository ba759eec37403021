//! # Engine Module
//!
//! The [Engine] owns the configuration, the channels, the filestore and the user hooks. The
//! application drives it by calling [Engine::cycle] once per wakeup and controls it with the
//! command methods, which are also reachable through [Engine::execute].
//!
//! ```no_run
//! use cfdp_engine::{
//!     cmd::TxFileRequest,
//!     config::{EngineConfig, ValidIpTable},
//!     engine::{open_channel_transports, Engine},
//!     filestore::std_mod::NativeFilestore,
//!     CfdpClass, DummyUser,
//! };
//!
//! let config = EngineConfig::with_bus_channels(25, 1);
//! let (transports, _bus_ends) = open_channel_transports(&config).unwrap();
//! let mut engine = Engine::new(
//!     config,
//!     ValidIpTable::empty(),
//!     transports,
//!     NativeFilestore::default(),
//!     DummyUser::default(),
//! )
//! .unwrap();
//! engine
//!     .tx_file(TxFileRequest::new(
//!         CfdpClass::Class2,
//!         true,
//!         0,
//!         10,
//!         23,
//!         "/cf/out/data.bin".into(),
//!         "/cf/in/data.bin".into(),
//!     ))
//!     .unwrap();
//! loop {
//!     engine.cycle();
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```
use std::{net::SocketAddr, vec::Vec};

use log::{info, warn};

pub use crate::channel::TransactionSummary;
use crate::{
    channel::{Channel, ChannelEnv},
    cmd::{
        ChannelSelector, CmdError, PlaybackRequest, PollSelector, PurgeTarget, TxFileRequest,
        TxnSelector, WriteQueueRequest,
    },
    config::{ConfigError, ConnectionType, EngineConfig, ParamId, ValidIpTable},
    counters::{ChannelHousekeeping, CommandCounters, ResetKind},
    filestore::{FilestoreError, VirtualFilestore},
    playback::TxParams,
    transaction::History,
    transport::{BusTransport, ChannelTransport, PduTransport, TransportError, UdpTransport},
    EngineUser, FaultHandler, QueueIdx, TransactionId, TransactionSeq,
    MAX_COMMANDED_PLAYBACK_FILES_PER_CHAN, MAX_POLLING_DIR_PER_CHAN, NUM_QUEUES,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("expected {expected} channel transports, found {found}")]
    TransportCount { expected: usize, found: usize },
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
}

/// Housekeeping snapshot of the whole engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Housekeeping {
    pub cmd: CommandCounters,
    pub enabled: bool,
    pub channels: Vec<ChannelHousekeeping>,
}

/// Create the transport of every configured channel. UDP channels are bound right away.
/// Bus channels are connected to a bus of depth `pipe_depth_input` whose far end is returned
/// at the same index of the second vector.
pub fn open_channel_transports(
    config: &EngineConfig,
) -> Result<(Vec<ChannelTransport>, Vec<Option<BusTransport>>), TransportError> {
    let mut transports = Vec::with_capacity(config.chan.len());
    let mut far_ends = Vec::with_capacity(config.chan.len());
    for chan_cfg in &config.chan {
        match chan_cfg.connection_type {
            ConnectionType::Udp => {
                transports.push(UdpTransport::new(&chan_cfg.udp_config)?.into());
                far_ends.push(None);
            }
            ConnectionType::Bus => {
                let (local, far) = BusTransport::pair(chan_cfg.pipe_depth_input as usize);
                transports.push(local.into());
                far_ends.push(Some(far));
            }
        }
    }
    Ok((transports, far_ends))
}

pub struct Engine<Vfs: VirtualFilestore, User: EngineUser> {
    config: EngineConfig,
    ip_table: ValidIpTable,
    channels: Vec<Channel>,
    vfs: Vfs,
    fault_handler: FaultHandler<User>,
    enabled: bool,
    /// Sequence number of the last locally started transaction.
    seq_num: TransactionSeq,
    pub(crate) cmd_counters: CommandCounters,
}

impl<Vfs: VirtualFilestore, User: EngineUser> Engine<Vfs, User> {
    /// Validate the configuration, create the temporary directory and set up one channel per
    /// transport. The engine starts enabled.
    pub fn new(
        config: EngineConfig,
        ip_table: ValidIpTable,
        transports: Vec<ChannelTransport>,
        vfs: Vfs,
        user: User,
    ) -> Result<Self, EngineError> {
        config.validate(&ip_table)?;
        if transports.len() != config.chan.len() {
            return Err(EngineError::TransportCount {
                expected: config.chan.len(),
                found: transports.len(),
            });
        }
        if !vfs.exists(&config.tmp_dir)? {
            vfs.create_dir(&config.tmp_dir)?;
        }
        let channels = transports
            .into_iter()
            .enumerate()
            .map(|(chan, transport)| Channel::new(chan as u8, transport))
            .collect();
        info!(
            "CF: engine with entity ID {} and {} channels initialized",
            config.local_eid,
            config.chan.len()
        );
        Ok(Self {
            config,
            ip_table,
            channels,
            vfs,
            fault_handler: FaultHandler::new(user),
            enabled: true,
            seq_num: 0,
            cmd_counters: CommandCounters::default(),
        })
    }

    /// One wakeup of the engine. Visits every channel in order.
    pub fn cycle(&mut self) {
        if !self.enabled {
            return;
        }
        let mut env = ChannelEnv {
            cfg: &self.config,
            vfs: &self.vfs,
            faults: &mut self.fault_handler,
            seq_num: &mut self.seq_num,
        };
        for channel in self.channels.iter_mut() {
            channel.cycle(&mut env);
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user(&self) -> &User {
        &self.fault_handler.user_hook
    }

    pub fn user_mut(&mut self) -> &mut User {
        &mut self.fault_handler.user_hook
    }

    /// Used to change the fault handling per condition code.
    pub fn fault_handler_mut(&mut self) -> &mut FaultHandler<User> {
        &mut self.fault_handler
    }

    pub fn housekeeping(&self) -> Housekeeping {
        Housekeeping {
            cmd: self.cmd_counters,
            enabled: self.enabled,
            channels: self.channels.iter().map(Channel::housekeeping).collect(),
        }
    }

    pub fn queue_sizes(&self, chan: u8) -> Result<[u32; NUM_QUEUES], CmdError> {
        Ok(self.channel(chan)?.housekeeping().q_size)
    }

    /// Histories of finished transactions of a channel, oldest first.
    pub fn history(&self, chan: u8) -> Result<impl Iterator<Item = &History>, CmdError> {
        Ok(self.channel(chan)?.history())
    }

    /// Snapshot of a live transaction.
    pub fn transaction_summary(&self, id: TransactionId) -> Option<TransactionSummary> {
        self.channels
            .iter()
            .find_map(|channel| channel.summary(channel.find_by_id(id)?))
    }

    fn channel(&self, chan: u8) -> Result<&Channel, CmdError> {
        self.channels
            .get(chan as usize)
            .ok_or(CmdError::InvalidChannel(chan))
    }

    fn check_channel(&self, chan: u8) -> Result<(), CmdError> {
        self.channel(chan).map(|_| ())
    }

    fn check_enabled(&self) -> Result<(), CmdError> {
        if !self.enabled {
            return Err(CmdError::EngineDisabled);
        }
        Ok(())
    }

    fn selected_channels(&self, selector: ChannelSelector) -> Result<Vec<usize>, CmdError> {
        match selector {
            ChannelSelector::Channel(chan) => {
                self.check_channel(chan)?;
                Ok(Vec::from([chan as usize]))
            }
            ChannelSelector::All => Ok((0..self.channels.len()).collect()),
        }
    }

    /// Transactions addressed by a selector as (channel, transaction index) pairs.
    fn selected_txns(&self, selector: TxnSelector) -> Result<Vec<(usize, usize)>, CmdError> {
        match selector {
            TxnSelector::Id(id) => self
                .channels
                .iter()
                .enumerate()
                .find_map(|(chan, channel)| channel.find_by_id(id).map(|idx| (chan, idx)))
                .map(|found| Vec::from([found]))
                .ok_or(CmdError::TransactionNotFound(id)),
            TxnSelector::Channel(chan) => {
                let channel = self.channel(chan)?;
                Ok(channel
                    .active_txns()
                    .into_iter()
                    .map(|idx| (chan as usize, idx))
                    .collect())
            }
            TxnSelector::All => Ok(self
                .channels
                .iter()
                .enumerate()
                .flat_map(|(chan, channel)| {
                    channel
                        .active_txns()
                        .into_iter()
                        .map(move |idx| (chan, idx))
                })
                .collect()),
        }
    }

    /// Run a closure for one channel with the engine wide state it needs.
    fn with_channel<R>(
        &mut self,
        chan: usize,
        f: impl FnOnce(&mut Channel, &mut ChannelEnv<'_, Vfs, User>) -> R,
    ) -> Option<R> {
        let channel = self.channels.get_mut(chan)?;
        let mut env = ChannelEnv {
            cfg: &self.config,
            vfs: &self.vfs,
            faults: &mut self.fault_handler,
            seq_num: &mut self.seq_num,
        };
        Some(f(channel, &mut env))
    }

    pub fn noop(&mut self) {
        info!("CF: no-op received, engine {}", env!("CARGO_PKG_VERSION"));
    }

    pub fn reset_counters(&mut self, kind: ResetKind) {
        if matches!(kind, ResetKind::All | ResetKind::Command) {
            self.cmd_counters = CommandCounters::default();
        }
        for channel in self.channels.iter_mut() {
            channel.io.counters.reset(kind);
        }
        info!("CF: counters reset, {:?}", kind);
    }

    /// Queue a file for transmission. Returns the ID of the new transaction.
    pub fn tx_file(&mut self, request: TxFileRequest) -> Result<TransactionId, CmdError> {
        self.check_enabled()?;
        self.check_channel(request.chan)?;
        let chan = request.chan as usize;
        if self.channels[chan].num_cmd_tx >= MAX_COMMANDED_PLAYBACK_FILES_PER_CHAN {
            return Err(CmdError::CommandedFileLimit(request.chan));
        }
        let params = TxParams {
            class: request.class,
            keep: request.keep,
            priority: request.priority,
            dest_eid: request.dest_eid,
            src_filename: request.src_filename,
            dst_filename: request.dst_filename,
        };
        self.with_channel(chan, |channel, env| {
            let (idx, id) = channel.create_tx_txn(env, &params)?;
            channel.set_cmd_tx(idx);
            Ok(id)
        })
        .ok_or(CmdError::InvalidChannel(request.chan))?
    }

    /// Start the playback of a directory.
    pub fn playback_dir(&mut self, request: PlaybackRequest) -> Result<(), CmdError> {
        self.check_enabled()?;
        self.check_channel(request.chan)?;
        let vfs = &self.vfs;
        self.channels[request.chan as usize].start_playback(vfs, &request)
    }

    pub fn freeze(&mut self, selector: ChannelSelector) -> Result<(), CmdError> {
        self.set_frozen(selector, true)
    }

    pub fn thaw(&mut self, selector: ChannelSelector) -> Result<(), CmdError> {
        self.set_frozen(selector, false)
    }

    fn set_frozen(&mut self, selector: ChannelSelector, frozen: bool) -> Result<(), CmdError> {
        for chan in self.selected_channels(selector)? {
            self.channels[chan].io.frozen = frozen;
            info!("CF: channel {} frozen: {}", chan, frozen);
        }
        Ok(())
    }

    /// Returns the number of transactions which were suspended.
    pub fn suspend(&mut self, selector: TxnSelector) -> Result<usize, CmdError> {
        self.set_suspended(selector, true)
    }

    /// Returns the number of transactions which were resumed.
    pub fn resume(&mut self, selector: TxnSelector) -> Result<usize, CmdError> {
        self.set_suspended(selector, false)
    }

    fn set_suspended(&mut self, selector: TxnSelector, suspended: bool) -> Result<usize, CmdError> {
        let selected = self.selected_txns(selector)?;
        let mut changed = 0;
        for (chan, idx) in selected {
            if self.channels[chan].set_suspended(idx, suspended) {
                changed += 1;
            }
        }
        if let TxnSelector::Id(id) = selector {
            if changed == 0 {
                return Err(CmdError::AlreadyInState(id));
            }
        }
        info!(
            "CF: {} transactions {}",
            changed,
            if suspended { "suspended" } else { "resumed" }
        );
        Ok(changed)
    }

    /// Gracefully close the selected transactions. Returns their number.
    pub fn cancel(&mut self, selector: TxnSelector) -> Result<usize, CmdError> {
        let selected = self.selected_txns(selector)?;
        let count = selected.len();
        for (chan, idx) in selected {
            self.with_channel(chan, |channel, env| channel.cancel_txn(env, idx));
        }
        info!("CF: {} transactions canceled", count);
        Ok(count)
    }

    /// Release the selected transactions immediately. Returns their number.
    pub fn abandon(&mut self, selector: TxnSelector) -> Result<usize, CmdError> {
        let selected = self.selected_txns(selector)?;
        let count = selected.len();
        for (chan, idx) in selected {
            self.with_channel(chan, |channel, env| channel.abandon_txn(env, idx));
        }
        info!("CF: {} transactions abandoned", count);
        Ok(count)
    }

    pub fn set_param(&mut self, param: ParamId, value: u64, chan: u8) -> Result<(), CmdError> {
        self.config.set_param(param, value, chan)?;
        info!("CF: parameter {:?} of channel {} set to {}", param, chan, value);
        Ok(())
    }

    pub fn get_param(&self, param: ParamId, chan: u8) -> Result<u64, CmdError> {
        Ok(self.config.get_param(param, chan)?)
    }

    /// Returns the number of written entries.
    pub fn write_queue(&mut self, request: &WriteQueueRequest) -> Result<usize, CmdError> {
        let channel = self.channel(request.chan)?;
        let entries = channel
            .write_queue(
                &self.vfs,
                request.queue,
                request.direction,
                &request.filename,
            )
            .map_err(|e| {
                warn!("CF: writing queue file {} failed: {}", request.filename, e);
                e
            })?;
        info!(
            "CF: wrote {} queue entries of channel {} to {}",
            entries, request.chan, request.filename
        );
        Ok(entries)
    }

    pub fn set_dequeue(&mut self, selector: ChannelSelector, enabled: bool) -> Result<(), CmdError> {
        for chan in self.selected_channels(selector)? {
            self.config.chan[chan].dequeue_enabled = enabled;
        }
        Ok(())
    }

    pub fn set_polling(
        &mut self,
        selector: ChannelSelector,
        dir: PollSelector,
        enabled: bool,
    ) -> Result<(), CmdError> {
        let dirs = match dir {
            PollSelector::Dir(dir) if (dir as usize) < MAX_POLLING_DIR_PER_CHAN => {
                dir as usize..dir as usize + 1
            }
            PollSelector::Dir(dir) => return Err(CmdError::InvalidPollDir(dir)),
            PollSelector::All => 0..MAX_POLLING_DIR_PER_CHAN,
        };
        for chan in self.selected_channels(selector)? {
            for poll_cfg in &mut self.config.chan[chan].polldir[dirs.clone()] {
                poll_cfg.enabled = enabled;
            }
        }
        Ok(())
    }

    /// Returns the number of purged entries.
    pub fn purge_queue(
        &mut self,
        selector: ChannelSelector,
        target: PurgeTarget,
    ) -> Result<usize, CmdError> {
        let mut purged = 0;
        for chan in self.selected_channels(selector)? {
            purged += self
                .with_channel(chan, |channel, env| channel.purge(env, target))
                .unwrap_or(0);
        }
        info!("CF: purged {} queue entries", purged);
        Ok(purged)
    }

    pub fn enable_engine(&mut self) {
        self.enabled = true;
        info!("CF: engine enabled");
    }

    /// Stop the engine. All live transactions are abandoned and all playbacks stopped.
    pub fn disable_engine(&mut self) {
        if !self.enabled {
            return;
        }
        for chan in 0..self.channels.len() {
            self.channels[chan].stop_playbacks();
            let active = self.channels[chan].active_txns();
            for idx in active {
                self.with_channel(chan, |channel, env| channel.abandon_txn(env, idx));
            }
        }
        self.enabled = false;
        info!("CF: engine disabled");
    }

    /// Send the PDUs of a UDP channel to another peer of its valid IP table.
    pub fn switch_udp_address(&mut self, chan: u8, addr: SocketAddr) -> Result<(), CmdError> {
        self.check_channel(chan)?;
        if !self.ip_table.contains(chan, &addr) {
            return Err(CmdError::AddressNotAllowed { chan, addr });
        }
        let udp = self.channels[chan as usize]
            .io
            .transport
            .as_udp_mut()
            .ok_or(CmdError::NotUdpChannel(chan))?;
        udp.switch_peer(addr);
        self.config.chan[chan as usize].udp_config.the_other_addr = addr;
        info!("CF: channel {} now sends to {}", chan, addr);
        Ok(())
    }

    pub fn open_udp_channel(&mut self, chan: u8) -> Result<(), CmdError> {
        self.check_channel(chan)?;
        let udp = self.channels[chan as usize]
            .io
            .transport
            .as_udp_mut()
            .ok_or(CmdError::NotUdpChannel(chan))?;
        if !udp.is_open() {
            udp.open()?;
        }
        info!("CF: channel {} opened", chan);
        Ok(())
    }

    pub fn close_udp_channel(&mut self, chan: u8) -> Result<(), CmdError> {
        self.check_channel(chan)?;
        let udp = self.channels[chan as usize]
            .io
            .transport
            .as_udp_mut()
            .ok_or(CmdError::NotUdpChannel(chan))?;
        udp.close();
        info!("CF: channel {} closed", chan);
        Ok(())
    }

    /// Number of transactions in a queue of a channel.
    pub fn queue_len(&self, chan: u8, queue: QueueIdx) -> Result<u32, CmdError> {
        Ok(self.queue_sizes(chan)?[queue as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd::{Command, CommandResponse, DirectionSelector, QueueSelector},
        filestore::std_mod::NativeFilestore,
        tests::TestFaultHook,
        CfdpClass, TxnStatus, MAX_PDU_SIZE,
    };
    use spacepackets::cfdp::ConditionCode;
    use std::{string::{String, ToString}, vec};

    const LOCAL_EID: u64 = 25;
    const REMOTE_EID: u64 = 23;

    struct TestEngine {
        engine: Engine<NativeFilestore, TestFaultHook>,
        peer: BusTransport,
        tmp: tempfile::TempDir,
    }

    impl TestEngine {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let mut config = EngineConfig::with_bus_channels(LOCAL_EID, 2);
            config.tmp_dir = tmp.path().join("tmp").to_str().unwrap().to_string();
            let (transports, mut far_ends) = open_channel_transports(&config).unwrap();
            let engine = Engine::new(
                config,
                ValidIpTable::empty(),
                transports,
                NativeFilestore::default(),
                TestFaultHook::default(),
            )
            .unwrap();
            Self {
                engine,
                peer: far_ends.remove(0).unwrap(),
                tmp,
            }
        }

        fn file(&self, name: &str, len: usize) -> String {
            let path = self.tmp.path().join(name);
            std::fs::write(&path, vec![0x5a; len]).unwrap();
            path.to_str().unwrap().to_string()
        }

        fn tx(&mut self, class: CfdpClass, src: &str) -> TransactionId {
            self.engine
                .tx_file(TxFileRequest::new(
                    class,
                    true,
                    0,
                    0,
                    REMOTE_EID,
                    src.to_string(),
                    "/remote/file.bin".to_string(),
                ))
                .unwrap()
        }

        fn num_sent(&mut self) -> usize {
            let mut buf = [0; MAX_PDU_SIZE];
            let mut count = 0;
            while self.peer.receive_pdu(&mut buf).unwrap().is_some() {
                count += 1;
            }
            count
        }
    }

    #[test]
    fn test_tmp_dir_created() {
        let test = TestEngine::new();
        assert!(std::path::Path::new(&test.engine.config().tmp_dir).is_dir());
        assert!(test.engine.is_enabled());
    }

    #[test]
    fn test_transport_count_checked() {
        let config = EngineConfig::with_bus_channels(LOCAL_EID, 2);
        let result = Engine::new(
            config,
            ValidIpTable::empty(),
            Vec::new(),
            NativeFilestore::default(),
            TestFaultHook::default(),
        );
        assert!(matches!(
            result,
            Err(EngineError::TransportCount {
                expected: 2,
                found: 0
            })
        ));
    }

    #[test]
    fn test_class1_transfer_has_three_file_data_pdus() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 3000);
        let id = test.tx(CfdpClass::Class1, &src);
        test.engine.cycle();
        // Metadata, three file data PDUs and the EOF.
        assert_eq!(test.num_sent(), 5);
        let hk = test.engine.housekeeping();
        assert_eq!(hk.channels[0].counters.sent.file_data_bytes, 3000);
        assert_eq!(hk.channels[0].q_size[QueueIdx::Hist as usize], 1);
        assert!(test.engine.transaction_summary(id).is_none());
        let history: Vec<_> = test.engine.history(0).unwrap().collect();
        assert_eq!(history[0].transaction_id(), id);
        assert!(!history[0].txn_stat.is_error());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut test = TestEngine::new();
        test.engine.config.chan[0].max_outgoing_messages_per_wakeup = 1;
        let src = test.file("a.bin", 3000);
        let id = test.tx(CfdpClass::Class2, &src);
        test.engine.cycle();
        assert_eq!(test.num_sent(), 1);
        assert_eq!(test.engine.suspend(TxnSelector::Id(id)).unwrap(), 1);
        assert!(matches!(
            test.engine.suspend(TxnSelector::Id(id)),
            Err(CmdError::AlreadyInState(_))
        ));
        for _ in 0..5 {
            test.engine.cycle();
        }
        assert_eq!(test.num_sent(), 0);
        let summary = test.engine.transaction_summary(id).unwrap();
        assert!(summary.suspended);
        assert_eq!(summary.queue, QueueIdx::Txa);
        assert_eq!(test.engine.resume(TxnSelector::All).unwrap(), 1);
        for _ in 0..4 {
            test.engine.cycle();
        }
        // The remaining three file data PDUs and the EOF.
        assert_eq!(test.num_sent(), 4);
        assert_eq!(
            test.engine.transaction_summary(id).unwrap().queue,
            QueueIdx::Txw
        );

        // Timers of a suspended transaction stand still.
        let timers = |test: &TestEngine| {
            let txn = test.engine.channels[0].txn_by_id(id).unwrap();
            assert!(txn.flags.ack_timer_armed && txn.flags.inactivity_armed);
            (
                txn.ack_timer.remaining_ticks(),
                txn.inactivity_timer.remaining_ticks(),
            )
        };
        let (ack, inactivity) = timers(&test);
        assert!(ack > 1 && inactivity > 1);
        assert_eq!(test.engine.suspend(TxnSelector::Id(id)).unwrap(), 1);
        for _ in 0..5 {
            test.engine.cycle();
            assert_eq!(timers(&test), (ack, inactivity));
        }
        assert_eq!(test.num_sent(), 0);
        assert_eq!(test.engine.resume(TxnSelector::Id(id)).unwrap(), 1);
        test.engine.cycle();
        assert_eq!(timers(&test), (ack - 1, inactivity - 1));
    }

    #[test]
    fn test_ack_limit_ends_in_history_with_error() {
        let mut test = TestEngine::new();
        test.engine.config.chan[0].ack_timer_s = 1;
        test.engine.config.chan[0].ack_limit = 3;
        let src = test.file("a.bin", 100);
        let id = test.tx(CfdpClass::Class2, &src);
        for _ in 0..60 {
            test.engine.cycle();
        }
        assert!(test.engine.transaction_summary(id).is_none());
        let history: Vec<_> = test.engine.history(0).unwrap().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].txn_stat, TxnStatus::AckLimitNoEof);
        let finished = &test.engine.user().finished;
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].is_success());
        assert_eq!(test.engine.housekeeping().channels[0].counters.fault.ack_limit, 1);
    }

    #[test]
    fn test_commanded_file_limit() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        for _ in 0..MAX_COMMANDED_PLAYBACK_FILES_PER_CHAN {
            test.tx(CfdpClass::Class1, &src);
        }
        let request = TxFileRequest::new(
            CfdpClass::Class1,
            true,
            0,
            0,
            REMOTE_EID,
            src.clone(),
            "/x".to_string(),
        );
        assert!(matches!(
            test.engine.execute(Command::TxFile(request)),
            Err(CmdError::CommandedFileLimit(0))
        ));
        assert_eq!(test.engine.housekeeping().cmd.err, 1);
        assert_eq!(test.engine.queue_len(0, QueueIdx::Pend).unwrap() as usize, 4);
    }

    #[test]
    fn test_command_counters() {
        let mut test = TestEngine::new();
        assert_eq!(
            test.engine.execute(Command::Noop).unwrap(),
            CommandResponse::Done
        );
        assert!(test
            .engine
            .execute(Command::Freeze(ChannelSelector::Channel(9)))
            .is_err());
        let hk = test.engine.housekeeping();
        assert_eq!(hk.cmd.cmd, 1);
        assert_eq!(hk.cmd.err, 1);
        test.engine
            .execute(Command::ResetCounters(ResetKind::Command))
            .unwrap();
        // The reset itself is counted after clearing.
        assert_eq!(test.engine.housekeeping().cmd.cmd, 1);
        assert_eq!(test.engine.housekeeping().cmd.err, 0);
    }

    #[test]
    fn test_freeze_stops_sending() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        test.tx(CfdpClass::Class1, &src);
        test.engine.freeze(ChannelSelector::All).unwrap();
        test.engine.cycle();
        assert_eq!(test.num_sent(), 0);
        assert!(test.engine.housekeeping().channels[0].frozen);
        test.engine.thaw(ChannelSelector::Channel(0)).unwrap();
        test.engine.cycle();
        assert_eq!(test.num_sent(), 3);
    }

    #[test]
    fn test_cancel_unknown_transaction() {
        let mut test = TestEngine::new();
        let id = TransactionId::new(LOCAL_EID, 44);
        assert!(matches!(
            test.engine.cancel(TxnSelector::Id(id)),
            Err(CmdError::TransactionNotFound(_))
        ));
        assert_eq!(test.engine.cancel(TxnSelector::All).unwrap(), 0);
    }

    #[test]
    fn test_abandon_keeps_history() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        let id = test.tx(CfdpClass::Class2, &src);
        assert_eq!(test.engine.abandon(TxnSelector::Channel(0)).unwrap(), 1);
        assert!(test.engine.transaction_summary(id).is_none());
        let history: Vec<_> = test.engine.history(0).unwrap().collect();
        assert_eq!(
            history[0].txn_stat,
            TxnStatus::Condition(ConditionCode::CancelRequestReceived)
        );
        assert_eq!(test.num_sent(), 0);
    }

    #[test]
    fn test_disabled_engine_rejects_transfers() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        let id = test.tx(CfdpClass::Class1, &src);
        test.engine.disable_engine();
        assert!(test.engine.transaction_summary(id).is_none());
        let request = TxFileRequest::new(
            CfdpClass::Class1,
            true,
            0,
            0,
            REMOTE_EID,
            src,
            "/x".to_string(),
        );
        assert!(matches!(
            test.engine.tx_file(request),
            Err(CmdError::EngineDisabled)
        ));
        test.engine.cycle();
        assert_eq!(test.num_sent(), 0);
        test.engine.enable_engine();
        assert!(test.engine.is_enabled());
    }

    #[test]
    fn test_purge_pending_and_history() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        test.engine.set_dequeue(ChannelSelector::All, false).unwrap();
        test.tx(CfdpClass::Class1, &src);
        test.tx(CfdpClass::Class1, &src);
        test.engine.cycle();
        assert_eq!(test.num_sent(), 0);
        assert_eq!(
            test.engine
                .purge_queue(ChannelSelector::Channel(0), PurgeTarget::Pending)
                .unwrap(),
            2
        );
        assert_eq!(test.engine.queue_len(0, QueueIdx::Pend).unwrap(), 0);
        assert_eq!(test.engine.queue_len(0, QueueIdx::Hist).unwrap(), 0);

        test.engine.set_dequeue(ChannelSelector::All, true).unwrap();
        test.tx(CfdpClass::Class1, &src);
        test.engine.cycle();
        assert_eq!(test.engine.queue_len(0, QueueIdx::Hist).unwrap(), 1);
        assert_eq!(
            test.engine
                .purge_queue(ChannelSelector::All, PurgeTarget::History)
                .unwrap(),
            1
        );
        assert_eq!(test.engine.queue_len(0, QueueIdx::Hist).unwrap(), 0);
    }

    #[test]
    fn test_write_queue() {
        let mut test = TestEngine::new();
        let src = test.file("a.bin", 10);
        test.engine.set_dequeue(ChannelSelector::All, false).unwrap();
        let id = test.tx(CfdpClass::Class2, &src);
        let out = test.tmp.path().join("queue.txt");
        let request = WriteQueueRequest::new(
            0,
            QueueSelector::All,
            DirectionSelector::Down,
            out.to_str().unwrap().to_string(),
        );
        assert_eq!(test.engine.write_queue(&request).unwrap(), 1);
        let listing = std::fs::read_to_string(&out).unwrap();
        assert!(listing.starts_with(&std::format!("{} Tx", id)));
        let request = WriteQueueRequest::new(
            0,
            QueueSelector::Pending,
            DirectionSelector::Up,
            out.to_str().unwrap().to_string(),
        );
        assert_eq!(test.engine.write_queue(&request).unwrap(), 0);
    }

    #[test]
    fn test_params() {
        let mut test = TestEngine::new();
        test.engine.set_param(ParamId::AckLimit, 9, 1).unwrap();
        assert_eq!(test.engine.get_param(ParamId::AckLimit, 1).unwrap(), 9);
        assert_eq!(
            test.engine
                .execute(Command::GetParam {
                    param: ParamId::AckLimit,
                    chan: 0
                })
                .unwrap(),
            CommandResponse::Param(4)
        );
        assert!(test.engine.set_param(ParamId::AckLimit, 1000, 0).is_err());
    }

    #[test]
    fn test_polling_selection() {
        let mut test = TestEngine::new();
        test.engine
            .set_polling(ChannelSelector::Channel(1), PollSelector::Dir(2), true)
            .unwrap();
        assert!(test.engine.config().chan[1].polldir[2].enabled);
        assert!(!test.engine.config().chan[1].polldir[1].enabled);
        assert!(matches!(
            test.engine
                .set_polling(ChannelSelector::All, PollSelector::Dir(9), true),
            Err(CmdError::InvalidPollDir(9))
        ));
        test.engine
            .set_polling(ChannelSelector::All, PollSelector::All, false)
            .unwrap();
        assert!(!test.engine.config().chan[1].polldir[2].enabled);
    }

    #[test]
    fn test_udp_commands_rejected_on_bus_channel() {
        let mut test = TestEngine::new();
        assert!(matches!(
            test.engine.close_udp_channel(0),
            Err(CmdError::NotUdpChannel(0))
        ));
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(matches!(
            test.engine.switch_udp_address(0, addr),
            Err(CmdError::AddressNotAllowed { chan: 0, .. })
        ));
    }

    #[test]
    fn test_polling_directory_sends_files() {
        let mut test = TestEngine::new();
        let dir = test.tmp.path().join("poll");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("one.bin"), [1; 10]).unwrap();
        std::fs::write(dir.join("two.bin"), [2; 10]).unwrap();
        {
            let poll = &mut test.engine.config.chan[0].polldir[0];
            poll.interval_sec = 1;
            poll.dest_eid = REMOTE_EID;
            poll.src_dir = dir.to_str().unwrap().to_string();
            poll.dst_dir = "/in".to_string();
            poll.enabled = true;
        }
        for _ in 0..15 {
            test.engine.cycle();
        }
        // Two class 1 transfers of Metadata, one file data PDU and EOF each.
        assert_eq!(test.num_sent(), 6);
        // Polled files are not kept.
        assert!(!dir.join("one.bin").exists());
        assert!(!dir.join("two.bin").exists());
        assert_eq!(test.engine.user().finished.len(), 2);
    }
}
