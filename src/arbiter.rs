//! Half-duplex serial arbiter: owns the UART and serializes concurrent TCP
//! requests onto a single bus transaction at a time, tolerating a second
//! master on the same wire.
//!
//! Runs its own background task. The public handle communicates with it
//! through a single-slot command channel plus polled completion state,
//! mirroring a thread-per-bus design without needing a real OS thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::serial_codec::{self, ParsedResponse, FUNC_READ_HOLDING, SERIAL_NUM_LEN};

/// Register the inverter's own 10-byte ASCII serial number starts at, read
/// as 5 consecutive holding registers during the identity probe.
pub const PROBE_REGISTER: u16 = 0x0000;
pub const PROBE_REGISTER_COUNT: u16 = 5;

const MAX_BUFFER: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(15);
const DIRECTION_SETTLING: Duration = Duration::from_micros(100);

/// Trait for an optional RS-485 direction-control line. USB RS-485
/// adapters usually handle this in hardware, in which case no
/// implementation is supplied and the arbiter skips it entirely.
pub trait DirectionControl: Send {
    fn set_tx(&mut self, transmitting: bool);
}

trait AsyncSerialPort: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncSerialPort for T {}

#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    pub response_timeout: Duration,
    pub inter_frame_gap: Duration,
    pub probe_backoff_base: Duration,
    pub probe_backoff_max: Duration,
}

/// Outcome of one bus transaction, polled by the coordinator via
/// [`SerialArbiter::last_result`].
#[derive(Debug, Clone)]
pub enum ArbiterOutcome {
    Success(ParsedResponse),
    Timeout,
    Desync,
}

enum Command {
    Transaction { expected_function: u8, expected_start: u16, tx_bytes: Vec<u8> },
}

struct SharedState {
    link_up: bool,
    busy: bool,
    detected_serial: [u8; SERIAL_NUM_LEN],
    last_result: Option<ArbiterOutcome>,
    last_raw_bytes: Option<Vec<u8>>,
    ignored_packets: u64,
    invalid_frames: u64,
}

impl SharedState {
    fn new() -> Self {
        Self {
            link_up: false,
            busy: false,
            detected_serial: [0u8; SERIAL_NUM_LEN],
            last_result: None,
            last_raw_bytes: None,
            ignored_packets: 0,
            invalid_frames: 0,
        }
    }
}

/// Handle to the running arbiter task.
pub struct SerialArbiter {
    shared: Arc<Mutex<SharedState>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl SerialArbiter {
    /// Spawns the arbiter task over `port`, optionally toggling `direction`
    /// around each transmit.
    pub fn spawn<P>(port: P, direction: Option<Box<dyn DirectionControl>>, config: ArbiterConfig) -> Self
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(SharedState::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let task_shared = shared.clone();
        tokio::spawn(run_task(Box::new(port), direction, config, task_shared, cmd_rx));
        Self { shared, cmd_tx }
    }

    /// Dispatches a read. Returns `false` immediately if the arbiter is
    /// already mid-transaction or the inverter link is down (in which case
    /// the background probe loop is already responsible for re-establishing
    /// it — no extra action is needed here).
    pub fn send_read(&self, function: u8, start: u16, count: u16) -> bool {
        self.dispatch(|serial| serial_codec::encode_read(function, start, count, serial), function, start)
    }

    /// Dispatches a write (single- or multi-value, per
    /// [`serial_codec::encode_write`]'s own split on `values.len()`).
    pub fn send_write(&self, start: u16, values: &[u16]) -> bool {
        let expected_function = if values.len() == 1 {
            serial_codec::FUNC_WRITE_SINGLE
        } else {
            serial_codec::FUNC_WRITE_MULTIPLE
        };
        self.dispatch(|serial| serial_codec::encode_write(start, values, serial), expected_function, start)
    }

    fn dispatch(
        &self,
        encode: impl FnOnce(&[u8]) -> Result<Vec<u8>, crate::error::CodecError>,
        expected_function: u8,
        expected_start: u16,
    ) -> bool {
        let serial = {
            let st = self.shared.lock();
            if st.busy || !st.link_up {
                return false;
            }
            st.detected_serial
        };
        let Ok(tx_bytes) = encode(&serial) else { return false };
        match self.cmd_tx.try_send(Command::Transaction { expected_function, expected_start, tx_bytes }) {
            Ok(()) => {
                self.shared.lock().busy = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.lock().busy
    }

    pub fn is_link_up(&self) -> bool {
        self.shared.lock().link_up
    }

    pub fn last_result(&self) -> Option<ArbiterOutcome> {
        self.shared.lock().last_result.clone()
    }

    pub fn last_raw_bytes(&self) -> Option<Vec<u8>> {
        self.shared.lock().last_raw_bytes.clone()
    }

    pub fn ignored_packets(&self) -> u64 {
        self.shared.lock().ignored_packets
    }

    pub fn invalid_frames(&self) -> u64 {
        self.shared.lock().invalid_frames
    }

    /// Test-only seam: bypasses the identity probe so a test bus can be
    /// driven directly without encoding a probe round-trip first.
    #[cfg(test)]
    pub(crate) fn force_link_up_for_test(&self) {
        let mut st = self.shared.lock();
        st.link_up = true;
        st.detected_serial = *b"0000000000";
    }
}

async fn run_task(
    mut port: Box<dyn AsyncSerialPort>,
    mut direction: Option<Box<dyn DirectionControl>>,
    config: ArbiterConfig,
    shared: Arc<Mutex<SharedState>>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut backoff = config.probe_backoff_base;
    let mut next_probe_at = Instant::now();

    loop {
        let link_up = shared.lock().link_up;
        let probe_sleep = tokio::time::sleep_until(next_probe_at);
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Transaction { expected_function, expected_start, tx_bytes }) => {
                        let outcome = run_transaction(
                            &mut port,
                            direction.as_deref_mut(),
                            &config,
                            expected_function,
                            expected_start,
                            &tx_bytes,
                            &shared,
                        )
                        .await;
                        finalize_transaction(&shared, outcome);
                    }
                    None => break,
                }
            }
            _ = probe_sleep, if !link_up => {
                let tx_bytes = serial_codec::encode_read(
                    FUNC_READ_HOLDING,
                    PROBE_REGISTER,
                    PROBE_REGISTER_COUNT,
                    &[0u8; SERIAL_NUM_LEN],
                )
                .expect("probe parameters are always in range");
                let outcome = run_transaction(
                    &mut port,
                    direction.as_deref_mut(),
                    &config,
                    FUNC_READ_HOLDING,
                    PROBE_REGISTER,
                    &tx_bytes,
                    &shared,
                )
                .await;
                handle_probe_outcome(&shared, outcome, &mut backoff, &config);
                next_probe_at = Instant::now() + backoff;
            }
        }
    }
}

fn finalize_transaction(shared: &Arc<Mutex<SharedState>>, outcome: ArbiterOutcome) {
    let mut st = shared.lock();
    st.busy = false;
    if let ArbiterOutcome::Success(parsed) = &outcome {
        st.last_raw_bytes = Some(parsed.raw.clone());
    }
    st.last_result = Some(outcome);
}

fn handle_probe_outcome(shared: &Arc<Mutex<SharedState>>, outcome: ArbiterOutcome, backoff: &mut Duration, config: &ArbiterConfig) {
    let mut st = shared.lock();
    st.busy = false;
    match outcome {
        ArbiterOutcome::Success(parsed) if parsed.values.len() == PROBE_REGISTER_COUNT as usize => {
            let mut serial = [0u8; SERIAL_NUM_LEN];
            for (i, v) in parsed.values.iter().enumerate() {
                let b = v.to_le_bytes();
                serial[2 * i] = b[0];
                serial[2 * i + 1] = b[1];
            }
            info!(target: "inverter_bridge::arbiter", serial = %String::from_utf8_lossy(&serial), "inverter identity probe succeeded");
            st.link_up = true;
            st.detected_serial = serial;
            *backoff = config.probe_backoff_base;
        }
        other => {
            debug!(target: "inverter_bridge::arbiter", ?other, "inverter identity probe failed, backing off");
            *backoff = (*backoff * 2).min(config.probe_backoff_max);
        }
    }
}

/// Drains bytes until a matching response is framed, the response timeout
/// elapses, or the buffer desyncs past 1024 bytes.
async fn run_transaction(
    port: &mut Box<dyn AsyncSerialPort>,
    mut direction: Option<&mut dyn DirectionControl>,
    config: &ArbiterConfig,
    expected_function: u8,
    expected_start: u16,
    tx_bytes: &[u8],
    shared: &Arc<Mutex<SharedState>>,
) -> ArbiterOutcome {
    if let Some(d) = direction.as_deref_mut() {
        d.set_tx(true);
        tokio::time::sleep(DIRECTION_SETTLING).await;
    }
    let _ = port.write_all(tx_bytes).await;
    let _ = port.flush().await;
    if let Some(d) = direction.as_deref_mut() {
        tokio::time::sleep(DIRECTION_SETTLING).await;
        d.set_tx(false);
    }

    let deadline = Instant::now() + config.response_timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut last_byte_at = Instant::now();
    let mut read_buf = [0u8; 256];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return ArbiterOutcome::Timeout;
        }
        let poll_until = std::cmp::min(now + POLL_INTERVAL, deadline);
        match tokio::time::timeout_at(poll_until, port.read(&mut read_buf)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&read_buf[..n]);
                last_byte_at = Instant::now();
                if buffer.len() > MAX_BUFFER {
                    return ArbiterOutcome::Desync;
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(target: "inverter_bridge::arbiter", error = %e, "serial read error, continuing to poll");
            }
            Err(_) => {}
        }

        if !buffer.is_empty() && Instant::now().saturating_duration_since(last_byte_at) >= config.inter_frame_gap {
            if let Some(outcome) = try_frame(&mut buffer, expected_function, expected_start, shared) {
                return outcome;
            }
        }
    }
}

/// Returns `Some(outcome)` when the transaction is resolved; `None` means
/// keep waiting (the buffer may have been mutated for resync purposes).
fn try_frame(
    buffer: &mut Vec<u8>,
    expected_function: u8,
    expected_start: u16,
    shared: &Arc<Mutex<SharedState>>,
) -> Option<ArbiterOutcome> {
    if buffer.is_empty() {
        return None;
    }
    if buffer[0] == serial_codec::ADDR_REQUEST {
        shared.lock().ignored_packets += 1;
        buffer.clear();
        return None;
    }
    if let Ok(parsed) = serial_codec::decode_response(buffer) {
        buffer.clear();
        return match_candidate(parsed, expected_function, expected_start);
    }
    let descriptors = serial_codec::split_frames(buffer);
    if let Some(idx) = serial_codec::find_matching_response(&descriptors, expected_function, expected_start) {
        let parsed = descriptors[idx].parsed.clone().expect("find_matching_response only returns parsed descriptors");
        buffer.clear();
        return Some(ArbiterOutcome::Success(parsed));
    }
    shared.lock().invalid_frames += 1;
    resync(buffer);
    None
}

fn match_candidate(parsed: ParsedResponse, expected_function: u8, expected_start: u16) -> Option<ArbiterOutcome> {
    let expected_base = expected_function & 0x7F;
    let is_match = parsed.function_base() == expected_base && (parsed.is_exception || parsed.start_register == expected_start);
    is_match.then_some(ArbiterOutcome::Success(parsed))
}

/// Advances `buffer` to the next byte that looks like the start of a
/// response frame (address 0x01 followed by a recognized function code),
/// or clears it entirely if nothing plausible is found.
fn resync(buffer: &mut Vec<u8>) {
    let mut i = 1;
    while i < buffer.len() {
        if buffer[i] == serial_codec::ADDR_RESPONSE {
            if i + 1 < buffer.len() {
                let base = buffer[i + 1] & 0x7F;
                if matches!(base, 0x03 | 0x04 | 0x06 | 0x10) {
                    buffer.drain(0..i);
                    return;
                }
            } else {
                buffer.drain(0..i);
                return;
            }
        }
        i += 1;
    }
    buffer.clear();
}
