//! End-to-end integration tests which copy files between two engines.
use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
    thread,
    time::{Duration, Instant},
};

use cfdp_engine::{
    cmd::TxFileRequest,
    config::{ConnectionType, EngineConfig, UdpConfig, ValidIpTable},
    engine::{open_channel_transports, Engine},
    filestore::std_mod::NativeFilestore,
    transaction::EotRecord,
    transport::{BusTransport, ChannelTransport, PduTransport},
    CfdpClass, EngineUser, EntityId, TransactionId, UserFaultHookProvider, MAX_PDU_SIZE,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use spacepackets::cfdp::ConditionCode;

const SOURCE_EID: EntityId = 1;
const DEST_EID: EntityId = 2;
const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

static LOGGER_INIT: Once = Once::new();

fn setup_logger() {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    std::thread::current().name().unwrap_or("unnamed"),
                    record.level(),
                    message
                ))
            })
            .level(LOG_LEVEL)
            .chain(std::io::stdout())
            .apply()
            .unwrap();
    });
}

pub struct TestUser {
    name: &'static str,
    completion_signal: Arc<AtomicBool>,
    finished: Vec<EotRecord>,
}

impl TestUser {
    pub fn new(name: &'static str, completion_signal: Arc<AtomicBool>) -> Self {
        Self {
            name,
            completion_signal,
            finished: Vec::new(),
        }
    }
}

impl UserFaultHookProvider for TestUser {
    fn notice_of_suspension_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        panic!(
            "{}: unexpected suspension of transaction {}, condition code {:?}, progress {}",
            self.name, transaction_id, cond, progress
        );
    }

    fn notice_of_cancellation_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        panic!(
            "{}: unexpected cancellation of transaction {}, condition code {:?}, progress {}",
            self.name, transaction_id, cond, progress
        );
    }

    fn abandoned_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        panic!(
            "{}: unexpected abandonment of transaction {}, condition code {:?}, progress {}",
            self.name, transaction_id, cond, progress
        );
    }

    fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        panic!(
            "{}: ignoring unexpected error in transaction {}, condition code {:?}, progress {}",
            self.name, transaction_id, cond, progress
        );
    }
}

impl EngineUser for TestUser {
    fn transaction_finished(&mut self, record: &EotRecord) {
        log::info!("{}: transaction finished: {:?}", self.name, record);
        self.finished.push(record.clone());
        self.completion_signal.store(true, Ordering::Relaxed);
    }
}

type TestEngine = Engine<NativeFilestore, TestUser>;

struct Entity {
    engine: TestEngine,
    completion_signal: Arc<AtomicBool>,
    _tmp: tempfile::TempDir,
}

fn entity(
    name: &'static str,
    eid: EntityId,
    mut config: EngineConfig,
    ip_table: ValidIpTable,
    transports: Vec<ChannelTransport>,
) -> Entity {
    let tmp = tempfile::tempdir().expect("creating temp directory failed");
    config.local_eid = eid;
    config.tmp_dir = tmp.path().to_str().expect("invalid path string").to_string();
    let completion_signal = Arc::new(AtomicBool::new(false));
    let engine = Engine::new(
        config,
        ip_table,
        transports,
        NativeFilestore::default(),
        TestUser::new(name, completion_signal.clone()),
    )
    .expect("creating engine failed");
    Entity {
        engine,
        completion_signal,
        _tmp: tmp,
    }
}

fn random_file_data(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0x0c0f_fee0);
    (0..len).map(|_| rng.gen()).collect()
}

struct Files {
    _dir: tempfile::TempDir,
    src: String,
    dst: String,
}

fn source_file(data: &[u8]) -> Files {
    let dir = tempfile::tempdir().expect("creating temp directory failed");
    let src = dir.path().join("src.bin");
    std::fs::write(&src, data).expect("writing file content failed");
    let dst = dir.path().join("dst.bin");
    Files {
        src: src.to_str().expect("invalid path string").to_string(),
        dst: dst.to_str().expect("invalid path string").to_string(),
        _dir: dir,
    }
}

fn tx_request(class: CfdpClass, files: &Files) -> TxFileRequest {
    TxFileRequest::new(
        class,
        true,
        0,
        0,
        DEST_EID,
        files.src.clone(),
        files.dst.clone(),
    )
}

/// Run each engine in its own thread, the engines are connected by a bus.
fn threaded_transfer(class: CfdpClass) {
    setup_logger();
    let data = random_file_data(5000);
    let files = source_file(&data);
    let (source_bus, dest_bus) = BusTransport::pair(32);
    let mut source = entity(
        "source",
        SOURCE_EID,
        EngineConfig::with_bus_channels(SOURCE_EID, 1),
        ValidIpTable::empty(),
        vec![source_bus.into()],
    );
    let dest = entity(
        "dest",
        DEST_EID,
        EngineConfig::with_bus_channels(DEST_EID, 1),
        ValidIpTable::empty(),
        vec![dest_bus.into()],
    );
    let stop_signal = Arc::new(AtomicBool::new(false));
    let id = source
        .engine
        .tx_file(tx_request(class, &files))
        .expect("file transfer request failed");

    let spawn_entity = |name: &str, mut entity: Entity, stop_signal: Arc<AtomicBool>| {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop_signal.load(Ordering::Relaxed) {
                    entity.engine.cycle();
                    thread::sleep(Duration::from_millis(5));
                }
                entity
            })
            .expect("spawning thread failed")
    };
    let source_done = source.completion_signal.clone();
    let dest_done = dest.completion_signal.clone();
    let jh_source = spawn_entity("source", source, stop_signal.clone());
    let jh_dest = spawn_entity("dest", dest, stop_signal.clone());

    let start = Instant::now();
    while !(source_done.load(Ordering::Relaxed) && dest_done.load(Ordering::Relaxed)) {
        if start.elapsed() > Duration::from_secs(5) {
            stop_signal.store(true, Ordering::Relaxed);
            panic!("file transfer not finished in 5 seconds");
        }
        thread::sleep(Duration::from_millis(20));
    }
    stop_signal.store(true, Ordering::Relaxed);
    let source = jh_source.join().unwrap();
    let dest = jh_dest.join().unwrap();

    assert_eq!(std::fs::read(&files.dst).expect("reading file failed"), data);
    for entity in [&source, &dest] {
        let finished = &entity.engine.user().finished;
        assert_eq!(finished.len(), 1);
        assert!(finished[0].is_success());
        assert_eq!(finished[0].transaction_id(), id);
        assert_eq!(finished[0].history.fsize, data.len() as u64);
    }
    let hk = dest.engine.housekeeping();
    assert_eq!(hk.channels[0].counters.recv.file_data_bytes, data.len() as u64);
    assert_eq!(hk.channels[0].counters.recv.error, 0);
}

#[test]
fn end_to_end_class1() {
    threaded_transfer(CfdpClass::Class1);
}

#[test]
fn end_to_end_class2() {
    threaded_transfer(CfdpClass::Class2);
}

/// Class 2 transfer over a relay which loses some of the file data PDUs on the first pass.
#[test]
fn end_to_end_class2_with_lost_segments() {
    setup_logger();
    let data = random_file_data(10_000);
    let files = source_file(&data);
    let (source_bus, mut relay_source) = BusTransport::pair(32);
    let (dest_bus, mut relay_dest) = BusTransport::pair(32);
    let mut source = entity(
        "source",
        SOURCE_EID,
        EngineConfig::with_bus_channels(SOURCE_EID, 1),
        ValidIpTable::empty(),
        vec![source_bus.into()],
    );
    let mut dest = entity(
        "dest",
        DEST_EID,
        EngineConfig::with_bus_channels(DEST_EID, 1),
        ValidIpTable::empty(),
        vec![dest_bus.into()],
    );
    source
        .engine
        .tx_file(tx_request(CfdpClass::Class2, &files))
        .expect("file transfer request failed");

    let mut buf = [0; MAX_PDU_SIZE];
    let mut forwarded = 0;
    for _ in 0..500 {
        source.engine.cycle();
        while let Some(len) = relay_source.receive_pdu(&mut buf).unwrap() {
            forwarded += 1;
            // The Metadata PDU is the first one, drop the second and fifth file data PDU.
            if forwarded == 3 || forwarded == 6 {
                continue;
            }
            relay_dest.send_pdu(&buf[..len]).unwrap();
        }
        dest.engine.cycle();
        while let Some(len) = relay_dest.receive_pdu(&mut buf).unwrap() {
            relay_source.send_pdu(&buf[..len]).unwrap();
        }
        if source.completion_signal.load(Ordering::Relaxed)
            && dest.completion_signal.load(Ordering::Relaxed)
        {
            break;
        }
    }
    assert!(source.completion_signal.load(Ordering::Relaxed));
    assert!(dest.completion_signal.load(Ordering::Relaxed));
    assert_eq!(std::fs::read(&files.dst).expect("reading file failed"), data);
    assert!(dest.engine.user().finished[0].is_success());
    let source_hk = source.engine.housekeeping();
    assert_eq!(
        source_hk.channels[0].counters.recv.nak_segment_requests,
        2
    );
    let dest_hk = dest.engine.housekeeping();
    assert_eq!(dest_hk.channels[0].counters.sent.nak_segment_requests, 2);
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .and_then(|socket| socket.local_addr())
        .map(|addr| addr.port())
        .expect("finding a free UDP port failed")
}

fn udp_entity(name: &'static str, eid: EntityId, my_port: u16, other_port: u16) -> Entity {
    let mut config = EngineConfig::with_bus_channels(eid, 1);
    config.chan[0].connection_type = ConnectionType::Udp;
    config.chan[0].udp_config = UdpConfig::localhost(my_port, other_port);
    let mut ip_table = ValidIpTable::empty();
    let peer: SocketAddr = config.chan[0].udp_config.the_other_addr;
    ip_table.add(0, peer).unwrap();
    let (transports, _) = open_channel_transports(&config).expect("opening transports failed");
    entity(name, eid, config, ip_table, transports)
}

#[test]
fn end_to_end_class2_over_udp() {
    setup_logger();
    let data = random_file_data(4000);
    let files = source_file(&data);
    let source_port = free_udp_port();
    let dest_port = free_udp_port();
    let mut source = udp_entity("source", SOURCE_EID, source_port, dest_port);
    let mut dest = udp_entity("dest", DEST_EID, dest_port, source_port);
    source
        .engine
        .tx_file(tx_request(CfdpClass::Class2, &files))
        .expect("file transfer request failed");
    let start = Instant::now();
    while !(source.completion_signal.load(Ordering::Relaxed)
        && dest.completion_signal.load(Ordering::Relaxed))
    {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("file transfer not finished in 5 seconds");
        }
        source.engine.cycle();
        dest.engine.cycle();
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(std::fs::read(&files.dst).expect("reading file failed"), data);
    assert!(source.engine.user().finished[0].is_success());
    assert!(dest.engine.user().finished[0].is_success());
}
