//! Two engines in separate threads which copy a file to each other over UDP on localhost.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cfdp_engine::{
    cmd::{Command, CommandResponse, TxFileRequest},
    config::{ConnectionType, EngineConfig, UdpConfig, ValidIpTable},
    engine::{open_channel_transports, Engine},
    filestore::std_mod::NativeFilestore,
    transaction::EotRecord,
    CfdpClass, EngineUser, EntityId, TransactionId, UserFaultHookProvider,
};
use clap::Parser;
use log::{info, warn};
use spacepackets::cfdp::ConditionCode;

static KILL_APP: AtomicBool = AtomicBool::new(false);

const GROUND_ID: EntityId = 23;
const FLIGHT_ID: EntityId = 25;

const GROUND_PORT: u16 = 5111;
const FLIGHT_PORT: u16 = 5222;

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum ClassCli {
    /// Unacknowledged
    One,
    /// Acknowledged
    Two,
}

impl From<ClassCli> for CfdpClass {
    fn from(class: ClassCli) -> Self {
        match class {
            ClassCli::One => CfdpClass::Class1,
            ClassCli::Two => CfdpClass::Class2,
        }
    }
}

#[derive(clap::Parser)]
#[command(about = "Copy a file between two CFDP engines over UDP")]
pub struct Cli {
    #[arg(short, long, default_value = "two")]
    class: ClassCli,
    #[arg(short, long, default_value_t = 100_000)]
    size: usize,
    /// Wakeups per second of both engines.
    #[arg(short, long, default_value_t = 20)]
    rate: u32,
    /// Give up after this many seconds.
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

pub struct DemoUser {
    name: &'static str,
    done: Arc<AtomicBool>,
}

impl UserFaultHookProvider for DemoUser {
    fn notice_of_suspension_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64) {
        warn!("{}: transaction {} suspended, {:?} at {}", self.name, id, cond, progress);
    }

    fn notice_of_cancellation_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64) {
        warn!("{}: transaction {} canceled, {:?} at {}", self.name, id, cond, progress);
    }

    fn abandoned_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64) {
        warn!("{}: transaction {} abandoned, {:?} at {}", self.name, id, cond, progress);
    }

    fn ignore_cb(&mut self, id: TransactionId, cond: ConditionCode, progress: u64) {
        warn!("{}: transaction {} ignored {:?} at {}", self.name, id, cond, progress);
    }
}

impl EngineUser for DemoUser {
    fn transaction_finished(&mut self, record: &EotRecord) {
        info!(
            "{}: transaction {} finished with {:?}, {} bytes",
            self.name,
            record.transaction_id(),
            record.history.txn_stat,
            record.history.fsize
        );
        self.done.store(true, Ordering::Relaxed);
    }
}

fn udp_engine(
    name: &'static str,
    eid: EntityId,
    my_port: u16,
    other_port: u16,
    ticks_per_second: u32,
    tmp_dir: String,
    done: Arc<AtomicBool>,
) -> Engine<NativeFilestore, DemoUser> {
    let mut config = EngineConfig::with_bus_channels(eid, 1);
    config.ticks_per_second = ticks_per_second;
    config.tmp_dir = tmp_dir;
    config.chan[0].connection_type = ConnectionType::Udp;
    config.chan[0].udp_config = UdpConfig::localhost(my_port, other_port);
    let mut ip_table = ValidIpTable::empty();
    ip_table
        .add(0, config.chan[0].udp_config.the_other_addr)
        .expect("adding peer address failed");
    let (transports, _) = open_channel_transports(&config).expect("binding UDP socket failed");
    Engine::new(
        config,
        ip_table,
        transports,
        NativeFilestore::default(),
        DemoUser { name, done },
    )
    .expect("creating engine failed")
}

fn run(name: &'static str, mut engine: Engine<NativeFilestore, DemoUser>, rate: u32) {
    let period = Duration::from_secs(1) / rate;
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !KILL_APP.load(Ordering::Relaxed) {
                engine.cycle();
                thread::sleep(period);
            }
            let hk = engine.housekeeping();
            info!("{}: final housekeeping {:?}", name, hk.channels[0].counters);
        })
        .expect("spawning engine thread failed");
}

fn main() {
    let cli_args = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                std::thread::current().name().expect("thread is not named"),
                record.level(),
                message
            ))
        })
        .level(LOG_LEVEL)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let workdir = tempfile::tempdir().expect("creating temp directory failed");
    let src = workdir.path().join("downlink.bin");
    let dst = workdir.path().join("received.bin");
    let data: Vec<u8> = (0..cli_args.size).map(|_| rand::random()).collect();
    std::fs::write(&src, &data).expect("writing source file failed");
    info!("created source file {:?} with {} bytes", src, data.len());

    let flight_done = Arc::new(AtomicBool::new(false));
    let ground_done = Arc::new(AtomicBool::new(false));
    let tmp_of = |name: &str| workdir.path().join(name).to_str().unwrap().to_string();
    let mut flight = udp_engine(
        "flight",
        FLIGHT_ID,
        FLIGHT_PORT,
        GROUND_PORT,
        cli_args.rate,
        tmp_of("flight-tmp"),
        flight_done.clone(),
    );
    let ground = udp_engine(
        "ground",
        GROUND_ID,
        GROUND_PORT,
        FLIGHT_PORT,
        cli_args.rate,
        tmp_of("ground-tmp"),
        ground_done.clone(),
    );
    let request = TxFileRequest::new(
        cli_args.class.into(),
        true,
        0,
        0,
        GROUND_ID,
        src.to_str().unwrap().to_string(),
        dst.to_str().unwrap().to_string(),
    );
    match flight.execute(Command::TxFile(request)) {
        Ok(CommandResponse::Transaction(id)) => info!("started transaction {}", id),
        other => panic!("file transfer request failed: {:?}", other),
    }
    run("flight", flight, cli_args.rate);
    run("ground", ground, cli_args.rate);

    let start = Instant::now();
    while !(flight_done.load(Ordering::Relaxed) && ground_done.load(Ordering::Relaxed)) {
        if start.elapsed() > Duration::from_secs(cli_args.timeout) {
            warn!("file transfer not finished in {} seconds", cli_args.timeout);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    match std::fs::read(&dst) {
        Ok(received) if received == data => info!("received file matches the source file"),
        Ok(_) => warn!("received file differs from the source file"),
        Err(e) => warn!("reading received file failed: {}", e),
    }
    KILL_APP.store(true, Ordering::Relaxed);
    thread::sleep(Duration::from_millis(200));
}
