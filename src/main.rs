mod exit;

use std::{
    fmt::Display,
    io::{self, Write},
    process,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use dataq_stream::{
    BUFFER_WORDS, Calibration, CancelToken, DEFAULT_SCAN_LIST, Error, ReadOutcome,
    Session, SessionConfig, Timing, autodiscover, decode_row,
};
use exit::{CliError, CliResult};
use status_line::StatusLine;

fn cli() -> Command {
    Command::new("dataq-stream")
        .about("Stream samples from a DATAQ DI-718B-E(S) data acquisition unit")
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .required_unless_present("auto")
                .help("Hostname or IP address of the unit"),
        )
        .arg(
            Arg::new("auto")
                .short('a')
                .long("auto")
                .action(ArgAction::SetTrue)
                .conflicts_with("host")
                .help("Autodiscover the unit"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16))
                .default_value("10001")
                .help("TCP port"),
        )
        .arg(
            Arg::new("channels")
                .short('n')
                .long("channels")
                .value_parser(value_parser!(usize))
                .default_value("6")
                .help("Poll the first N channels of the scan list"),
        )
        .arg(
            Arg::new("scan-list")
                .long("scan-list")
                .default_value(DEFAULT_SCAN_LIST)
                .help("Channel and gain codes, four hex digits per channel"),
        )
        .arg(
            Arg::new("timer-scaler")
                .long("timer-scaler")
                .value_parser(value_parser!(u8))
                .default_value("2")
                .help("Division from the 14400 Hz main timer"),
        )
        .arg(
            Arg::new("rate-divisor")
                .long("rate-divisor")
                .value_parser(value_parser!(u16))
                .default_value("0")
                .help("Further division of the output rate"),
        )
        .arg(
            Arg::new("full-scale")
                .short('f')
                .long("full-scale")
                .value_parser(value_parser!(f32))
                .default_value("20.0")
                .help("Full-scale range in engineering units (depends on the input module)"),
        )
        .arg(
            Arg::new("fudge")
                .long("fudge")
                .value_parser(value_parser!(f32))
                .default_value("1.0")
                .help("Calibration correction factor"),
        )
        .arg(
            Arg::new("rows")
                .short('r')
                .long("rows")
                .value_parser(value_parser!(u16).range(1..=BUFFER_WORDS as i64))
                .default_value("1")
                .help("Rows fetched per read, at most 512 words in total"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("1000")
                .help("Receive timeout in milliseconds"),
        )
        .arg(
            Arg::new("drain-ms")
                .long("drain-ms")
                .value_parser(value_parser!(u64))
                .default_value("222")
                .help("Wait after stopping the stream before flushing, in milliseconds"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Abort on the first row with bad sync bits instead of skipping it"),
        )
        .arg(
            Arg::new("progress")
                .long("progress")
                .action(ArgAction::SetTrue)
                .help("Show a status line on stderr"),
        )
}

fn arg<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> T {
    matches
        .get_one::<T>(id)
        .cloned()
        .expect("argument has a default value")
}

struct Options {
    host: String,
    port: u16,
    config: SessionConfig,
    timing: Timing,
    calibration: Calibration,
    rows: usize,
    strict: bool,
    progress: bool,
}

#[derive(Clone)]
struct Progress {
    received: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    started: Instant,
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let received = self.received.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        write!(
            f,
            "Rows: {} ({:.01}/s) \t Rejected: {}",
            received,
            received as f64 / self.started.elapsed().as_secs_f64(),
            rejected
        )
    }
}

fn main() {
    env_logger::init();

    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let code = if err.use_stderr() { exit::USAGE } else { exit::OK };
            let _ = err.print();
            process::exit(code);
        }
    };

    let host = if matches.get_flag("auto") {
        match autodiscover() {
            Some(host) => host,
            None => process::exit(exit::UNAVAILABLE),
        }
    } else {
        arg::<String>(&matches, "host")
    };

    let options = Options {
        host,
        port: arg(&matches, "port"),
        config: SessionConfig {
            timer_scaler: arg(&matches, "timer-scaler"),
            rate_divisor: arg(&matches, "rate-divisor"),
            scan_list: arg(&matches, "scan-list"),
            channel_count: arg(&matches, "channels"),
        },
        timing: Timing {
            read_timeout: Duration::from_millis(arg(&matches, "timeout-ms")),
            drain_delay: Duration::from_millis(arg(&matches, "drain-ms")),
        },
        calibration: Calibration::new(arg(&matches, "full-scale"), arg(&matches, "fudge")),
        rows: usize::from(arg::<u16>(&matches, "rows")),
        strict: matches.get_flag("strict"),
        progress: matches.get_flag("progress"),
    };

    if let Err(err) = run(&options) {
        eprintln!("Error: {}", err);
        process::exit(err.code);
    }
}

fn run(options: &Options) -> CliResult<()> {
    let config = &options.config;
    config
        .validate()
        .and_then(|_| config.block_bytes(options.rows))
        .map_err(|err| exit::protocol_error("options", err))?;

    // installed first so a signal during initialization still ends in teardown
    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_cancel.is_cancelled() {
            eprintln!("Killing...");
            process::exit(-1);
        }
        handler_cancel.cancel();
    })
    .map_err(|err| CliError::new(exit::OS_ERR, format!("signal handler: {err}")))?;

    let mut session = Session::connect_with_timing(&options.host, options.port, config, options.timing)
        .map_err(|err| exit::protocol_error("connect", err))?;
    eprintln!(
        "streaming {} channels from {}:{}",
        config.channel_count, options.host, options.port
    );

    let progress = Progress {
        received: Arc::new(AtomicU64::new(0)),
        rejected: Arc::new(AtomicU64::new(0)),
        started: Instant::now(),
    };
    let status = options.progress.then(|| StatusLine::new(progress.clone()));

    let result = stream(&mut session, options, &cancel, &progress);

    drop(status);
    session.close();
    result
}

fn stream(
    session: &mut Session,
    options: &Options,
    cancel: &CancelToken,
    progress: &Progress,
) -> CliResult<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let channels = options.config.channel_count;

    loop {
        let block = match session.read_block(options.rows, cancel) {
            Ok(ReadOutcome::Block(block)) => block,
            Ok(ReadOutcome::Cancelled) => {
                log::info!("stopped by signal");
                return Ok(());
            }
            Err(Error::ReadTimeout) => {
                log::warn!("no data within {:?}", options.timing.read_timeout);
                continue;
            }
            Err(err) => return Err(exit::protocol_error("receive", err)),
        };
        let now = chrono::Utc::now();

        for row in block.rows() {
            let values = match decode_row(row, channels, &options.calibration) {
                Ok(values) => values,
                Err(err) if !options.strict => {
                    log::warn!("dropping row: {}", err);
                    progress.rejected.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(err) => return Err(exit::protocol_error("receive", err.into())),
            };
            progress.received.fetch_add(1, Ordering::Relaxed);

            print_row(&mut out, &now, &values).map_err(|err| exit::io_error("stdout", err))?;
        }
    }
}

fn print_row<W: Write>(out: &mut W, at: &chrono::DateTime<chrono::Utc>, values: &[f32]) -> io::Result<()> {
    write!(out, "{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())?;
    for value in values {
        write!(out, " {:.3}", value)?;
    }
    writeln!(out)
}
