use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dataq_stream::{
    CancelToken, Calibration, Error, ReadOutcome, Session, SessionConfig, SessionState, Timing,
    frame::encode_word,
};

const SCAN_LIST: &str = "E000E001E002E003E004E005";

fn config() -> SessionConfig {
    SessionConfig {
        timer_scaler: 2,
        rate_divisor: 0,
        scan_list: SCAN_LIST.to_string(),
        channel_count: 6,
    }
}

fn timing(read_timeout_ms: u64) -> Timing {
    Timing {
        read_timeout: Duration::from_millis(read_timeout_ms),
        drain_delay: Duration::from_millis(20),
    }
}

/// Device side of one connection.
struct Peer {
    stream: TcpStream,
    commands: Vec<String>,
}

impl Peer {
    /// Next command body, `None` once the client hangs up.
    fn next_command(&mut self) -> Option<String> {
        let mut marker = [0u8; 1];
        self.stream.read_exact(&mut marker).ok()?;
        assert_eq!(marker[0], 0, "command without marker");

        let mut letter = [0u8; 1];
        self.stream.read_exact(&mut letter).ok()?;
        let rest = match letter[0] {
            b'X' | b'C' => 2,
            b'M' => 4,
            b'L' => 2 + SCAN_LIST.len(),
            b'S' | b'T' => 1,
            other => panic!("unknown command {:?}", other as char),
        };
        let mut body = vec![0u8; rest];
        self.stream.read_exact(&mut body).ok()?;

        let mut command = String::from(letter[0] as char);
        command.push_str(&String::from_utf8_lossy(&body));
        self.commands.push(command.clone());
        Some(command)
    }

    fn echo(&mut self, command: &str) {
        self.stream.write_all(command.as_bytes()).unwrap();
    }

    /// Answer commands until streaming starts.
    fn initialize(&mut self) {
        while let Some(command) = self.next_command() {
            if command == "T0" {
                continue;
            }
            self.echo(&command);
            if command == "S3" {
                return;
            }
        }
    }

    /// Wait for the stop command or a hang-up.
    fn wait_for_stop(&mut self) {
        while let Some(command) = self.next_command() {
            if command == "T0" {
                return;
            }
        }
    }

    fn send_row(&mut self, raws: &[u16]) {
        let bytes: Vec<u8> = raws
            .iter()
            .enumerate()
            .flat_map(|(i, &raw)| encode_word(raw, i).to_le_bytes())
            .collect();
        self.stream.write_all(&bytes).unwrap();
    }
}

struct FakeDevice {
    addr: SocketAddr,
    handle: JoinHandle<Vec<String>>,
}

impl FakeDevice {
    fn spawn(script: impl FnOnce(&mut Peer) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut peer = Peer {
                stream,
                commands: Vec::new(),
            };
            script(&mut peer);
            peer.commands
        });
        FakeDevice { addr, handle }
    }

    fn connect(&self, timing: Timing) -> Result<Session, Error> {
        Session::connect_with_timing("127.0.0.1", self.addr.port(), &config(), timing)
    }

    fn commands(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

fn init_sequence() -> Vec<String> {
    vec![
        "T0".to_string(),
        "X02".to_string(),
        "M0000".to_string(),
        format!("L00{}", SCAN_LIST),
        "C06".to_string(),
        "S3".to_string(),
    ]
}

#[test]
fn initializes_then_streams() {
    let (started_tx, started_rx) = mpsc::channel();
    let device = FakeDevice::spawn(move |peer| {
        peer.initialize();
        started_tx.send(peer.commands.clone()).unwrap();
        peer.send_row(&[8192, 0, 16383, 8192, 8192, 8192]);
        peer.send_row(&[0, 8192, 8192, 8192, 8192, 4096]);
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(1000)).unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    // the five init commands, after the stop sequence, before any data
    let before_first_read = started_rx.recv().unwrap();
    assert_eq!(before_first_read, init_sequence());

    let cancel = CancelToken::new();
    let block = match session.read_block(2, &cancel).unwrap() {
        ReadOutcome::Block(block) => block,
        ReadOutcome::Cancelled => panic!("not cancelled"),
    };
    assert_eq!(block.row_count(), 2);

    let calibration = Calibration::new(10.0, 1.0);
    let rows: Vec<Vec<f32>> = block.decode(&calibration).map(Result::unwrap).collect();
    assert_eq!(rows[0][0], 0.0);
    assert_eq!(rows[0][1], -10.0);
    assert!((rows[0][2] - 10.0 * (16383.0 / 8192.0 - 1.0)).abs() < 1e-5);
    assert_eq!(rows[1][0], -10.0);
    assert_eq!(rows[1][5], -5.0);

    session.close();

    let commands = device.commands();
    assert_eq!(commands.len(), 7);
    assert_eq!(commands.last().map(String::as_str), Some("T0"));
}

#[test]
fn stale_stream_is_flushed() {
    let device = FakeDevice::spawn(|peer| {
        // leftovers of an earlier session that never stopped
        peer.stream.write_all(&[0x01, 0x81, 0x03, 0x05, 0x07]).unwrap();
        peer.initialize();
        peer.wait_for_stop();
    });

    let session = device.connect(timing(1000)).unwrap();
    session.close();
    assert_eq!(device.commands()[..6], init_sequence()[..]);
}

#[test]
fn bad_echo_aborts_initialization() {
    let device = FakeDevice::spawn(|peer| {
        while let Some(command) = peer.next_command() {
            match command.as_str() {
                "T0" if peer.commands.len() > 1 => return,
                "T0" => {}
                "M0000" => peer.echo("M0001"),
                _ => peer.echo(&command),
            }
        }
    });

    match device.connect(timing(1000)) {
        Err(Error::EchoMismatch { expected, received }) => {
            assert_eq!(expected, "M0000");
            assert_eq!(received, "M0001");
        }
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }

    // nothing after the rejected command except the teardown stop
    let commands = device.commands();
    assert_eq!(commands, vec!["T0", "X02", "M0000", "T0"]);
}

#[test]
fn cancel_interrupts_blocked_read() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        // half a word, then silence
        peer.stream.write_all(&[0x00]).unwrap();
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(300)).unwrap();
    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let signal = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let start = Instant::now();
    let outcome = session.read_block(1, &cancel).unwrap();
    assert!(matches!(outcome, ReadOutcome::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
    signal.join().unwrap();

    session.close();
    assert_eq!(device.commands().last().map(String::as_str), Some("T0"));
}

#[test]
fn silence_times_out() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(100)).unwrap();
    let result = session.read_block(1, &CancelToken::new());
    assert!(matches!(result, Err(Error::ReadTimeout)));
    session.close();
    device.commands();
}

#[test]
fn partial_row_is_short_read() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        peer.stream.write_all(&[0x00, 0x81, 0x01]).unwrap();
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(100)).unwrap();
    let result = session.read_block(1, &CancelToken::new());
    assert!(matches!(
        result,
        Err(Error::ShortRead {
            expected: 12,
            actual: 3
        })
    ));
    session.close();
    device.commands();
}

#[test]
fn hang_up_mid_stream() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
    });

    let mut session = device.connect(timing(1000)).unwrap();
    let commands = device.commands();
    assert_eq!(commands, init_sequence());

    let result = session.read_block(1, &CancelToken::new());
    assert!(matches!(result, Err(Error::PeerClosed)));
    // teardown against a dead socket still completes
    session.close();
}

#[test]
fn desynchronized_row_is_reported() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        let mut bytes = Vec::new();
        for (i, raw) in [100u16, 200, 300, 400, 500, 600].iter().enumerate() {
            // sync bits of channel 3 knocked out
            let word = if i == 3 {
                encode_word(*raw, i) & !0x0101
            } else {
                encode_word(*raw, i)
            };
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        peer.stream.write_all(&bytes).unwrap();
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(1000)).unwrap();
    let block = match session.read_block(1, &CancelToken::new()).unwrap() {
        ReadOutcome::Block(block) => block,
        ReadOutcome::Cancelled => panic!("not cancelled"),
    };
    let err = Error::from(block.decode(&Calibration::default()).next().unwrap().unwrap_err());
    match err {
        Error::Decode(dataq_stream::DecodeError::SyncBitViolation { channel, .. }) => {
            assert_eq!(channel, 3)
        }
        other => panic!("unexpected {:?}", other),
    }
    session.close();
    device.commands();
}

#[test]
fn refused_connection() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    match Session::connect_with_timing("127.0.0.1", port, &config(), timing(100)) {
        Err(Error::ConnectionRefused { addr, .. }) => {
            assert_eq!(addr, format!("127.0.0.1:{}", port))
        }
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }
}

#[test]
fn unknown_host() {
    match Session::connect_with_timing("di718b.invalid", 10001, &config(), timing(100)) {
        Err(Error::HostResolutionFailed { host, .. }) => assert_eq!(host, "di718b.invalid"),
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }
}

#[test]
fn oversized_block_fails_without_reading() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        peer.send_row(&[8192; 6]);
        peer.wait_for_stop();
    });

    let mut session = device.connect(timing(1000)).unwrap();
    let cancel = CancelToken::new();
    for rows in [usize::MAX / 4, 86] {
        assert!(matches!(
            session.read_block(rows, &cancel),
            Err(Error::ReadSizeOutOfRange { .. })
        ));
    }

    // the stream is still aligned on the first row
    let block = match session.read_block(1, &cancel).unwrap() {
        ReadOutcome::Block(block) => block,
        ReadOutcome::Cancelled => panic!("not cancelled"),
    };
    assert_eq!(
        block.decode(&Calibration::default()).next().unwrap().unwrap(),
        vec![0.0; 6]
    );
    session.close();
    device.commands();
}

#[test]
fn close_returns_while_device_keeps_streaming() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        // ignores the stop command and streams until the socket dies
        let row: Vec<u8> = (0..6)
            .flat_map(|i| encode_word(8192, i).to_le_bytes())
            .collect();
        let burst = row.repeat(256);
        while peer.stream.write_all(&burst).is_ok() {}
    });

    let session = device.connect(timing(1000)).unwrap();
    let start = Instant::now();
    session.close();
    assert!(start.elapsed() < Duration::from_secs(2));
    device.commands();
}

#[test]
fn cancel_raised_during_initialization() {
    let device = FakeDevice::spawn(|peer| {
        peer.initialize();
        peer.send_row(&[8192; 6]);
        peer.wait_for_stop();
    });

    // a signal that arrives while connecting
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut session = device.connect(timing(1000)).unwrap();

    let start = Instant::now();
    assert!(matches!(
        session.read_block(1, &cancel).unwrap(),
        ReadOutcome::Cancelled
    ));
    assert!(start.elapsed() < Duration::from_millis(500));

    session.close();
    assert_eq!(device.commands().last().map(String::as_str), Some("T0"));
}
