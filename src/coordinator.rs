//! Bridge coordinator: decodes client requests, drives the serial arbiter,
//! validates the response against the originating request, and resolves to
//! a TCP response — falling back to the cache, or to a synthesized error,
//! when the bus transaction doesn't pan out.

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::arbiter::{ArbiterOutcome, SerialArbiter};
use crate::cache::{FallbackCache, Fingerprint};
use crate::guard::{ActivityKind, OperationGuardRegistry};
use crate::serial_codec::{self, SERIAL_NUM_LEN};
use crate::tcp_codec::{self, ParsedClientRequest};

/// Modbus-style exception codes used when synthesizing a client-visible
/// error locally (no inverter involved). Chosen to be meaningful to a
/// client that already interprets Modbus exception codes, since the wire
/// format offers no other channel for bridge-local errors.
const EXC_SLAVE_BUSY: u8 = 0x06;
const EXC_GATEWAY_FAILED_TO_RESPOND: u8 = 0x0B;
const EXC_SLAVE_DEVICE_FAILURE: u8 = 0x04;

/// Outbound byte sink for one client session.
pub type ClientHandle = UnboundedSender<Vec<u8>>;

struct ActiveRequest {
    client: ClientHandle,
    expected_function: u8,
    expected_start: u16,
    expected_count: u16,
    fingerprint: Option<Fingerprint>,
    started_at: Instant,
}

pub struct BridgeCoordinator {
    arbiter: SerialArbiter,
    guard: OperationGuardRegistry,
    cache: FallbackCache,
    dongle_serial: [u8; SERIAL_NUM_LEN],
    request_timeout: Duration,
    active: Option<ActiveRequest>,
}

impl BridgeCoordinator {
    pub fn new(
        arbiter: SerialArbiter,
        guard: OperationGuardRegistry,
        cache: FallbackCache,
        dongle_serial: [u8; SERIAL_NUM_LEN],
        request_timeout: Duration,
    ) -> Self {
        Self { arbiter, guard, cache, dongle_serial, request_timeout, active: None }
    }

    /// Cache diagnostics snapshot, exposed for an external status surface.
    pub fn cache_snapshot(&self) -> Vec<crate::cache::CacheEntrySnapshot> {
        self.cache.snapshot()
    }

    /// Decodes and dispatches one client request. Non-blocking: returns as
    /// soon as the request is either resolved locally or handed to the
    /// arbiter; completion of a dispatched request is driven by `tick()`.
    pub fn process_client_bytes(&mut self, bytes: &[u8], client: ClientHandle) {
        let parsed = match tcp_codec::decode_request(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "inverter_bridge::coordinator", error = %e, "dropping malformed client request");
                return;
            }
        };

        if let Some(kind) = self.guard.active_kind() {
            if kind.blocks_new_requests() {
                debug!(target: "inverter_bridge::coordinator", ?kind, "rejecting request: incompatible activity holds the guard");
                self.send_synth_error(&client, parsed.function, EXC_SLAVE_BUSY);
                return;
            }
        }

        let Some(_guard) = self.guard.try_acquire(ActivityKind::TcpRequestHandling, "client request") else {
            self.send_synth_error(&client, parsed.function, EXC_SLAVE_BUSY);
            return;
        };

        if self.active.is_some() {
            self.send_synth_error(&client, parsed.function, EXC_SLAVE_BUSY);
            return;
        }

        let dispatched = if parsed.is_write {
            self.arbiter.send_write(parsed.start_register, &parsed.values)
        } else {
            self.arbiter.send_read(parsed.function, parsed.start_register, parsed.register_count)
        };

        if !dispatched {
            self.resolve_locally(&parsed, &client);
            return;
        }

        let expected_count = if parsed.is_write { parsed.values.len() as u16 } else { parsed.register_count };
        let fingerprint = (!parsed.is_write).then(|| Fingerprint {
            function_code: parsed.function,
            start_register: parsed.start_register,
            register_count: parsed.register_count,
        });
        self.active = Some(ActiveRequest {
            client,
            expected_function: parsed.function,
            expected_start: parsed.start_register,
            expected_count,
            fingerprint,
            started_at: Instant::now(),
        });
    }

    /// Drives completion of the in-flight request, if any. Should be called
    /// frequently (e.g. on every event-loop pass).
    pub fn tick(&mut self) {
        let Some(active) = &self.active else { return };

        if Instant::now().saturating_duration_since(active.started_at) > self.request_timeout {
            debug!(target: "inverter_bridge::coordinator", "coordinator-level request timeout elapsed");
            self.finish_active(None);
            return;
        }

        if self.arbiter.is_busy() {
            return;
        }

        let result = self.arbiter.last_result();
        self.finish_active(result);
    }

    fn finish_active(&mut self, result: Option<ArbiterOutcome>) {
        let Some(active) = self.active.take() else { return };
        match result {
            Some(ArbiterOutcome::Success(parsed)) => {
                let expected_base = active.expected_function & 0x7F;
                let is_match = parsed.function_base() == expected_base
                    && (parsed.is_exception || parsed.start_register == active.expected_start)
                    && (parsed.is_exception || parsed.register_count == active.expected_count);
                if is_match {
                    match tcp_codec::encode_response(&parsed.raw, &self.dongle_serial) {
                        Ok(resp) => {
                            if !parsed.is_exception {
                                if let Some(fp) = active.fingerprint {
                                    self.cache.put(fp, resp.clone());
                                }
                            }
                            let _ = active.client.send(resp);
                        }
                        Err(e) => {
                            warn!(target: "inverter_bridge::coordinator", error = %e, "failed to encode client response");
                            self.fallback_or_error(&active, EXC_SLAVE_DEVICE_FAILURE);
                        }
                    }
                } else {
                    debug!(target: "inverter_bridge::coordinator", "response did not match originating request");
                    self.fallback_or_error(&active, EXC_SLAVE_DEVICE_FAILURE);
                }
            }
            _ => {
                debug!(target: "inverter_bridge::coordinator", "bus transaction failed (timeout or desync)");
                self.fallback_or_error(&active, EXC_GATEWAY_FAILED_TO_RESPOND);
            }
        }
    }

    /// Used when `send_read`/`send_write` refuse to dispatch at all (link
    /// down or arbiter unexpectedly busy).
    fn resolve_locally(&mut self, parsed: &ParsedClientRequest, client: &ClientHandle) {
        if !parsed.is_write {
            let fp = Fingerprint {
                function_code: parsed.function,
                start_register: parsed.start_register,
                register_count: parsed.register_count,
            };
            if let Some(cached) = self.cache.get(&fp) {
                let _ = client.send(cached);
                return;
            }
        }
        self.send_synth_error(client, parsed.function, EXC_GATEWAY_FAILED_TO_RESPOND);
    }

    fn fallback_or_error(&mut self, active: &ActiveRequest, exception_code: u8) {
        if let Some(fp) = active.fingerprint {
            if let Some(cached) = self.cache.get(&fp) {
                let _ = active.client.send(cached);
                return;
            }
        }
        self.send_synth_error(&active.client, active.expected_function, exception_code);
    }

    fn send_synth_error(&self, client: &ClientHandle, function: u8, exception_code: u8) {
        let exc = serial_codec::encode_exception_response(function, &[0u8; SERIAL_NUM_LEN], exception_code);
        match tcp_codec::encode_response(&exc, &self.dongle_serial) {
            Ok(resp) => {
                let _ = client.send(resp);
            }
            Err(e) => warn!(target: "inverter_bridge::coordinator", error = %e, "failed to synthesize error response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ArbiterConfig;
    use crate::serial_codec::{encode_exception_response, encode_read_response, encode_write_single_response, FUNC_READ_INPUT, FUNC_WRITE_SINGLE};
    use crate::tcp_codec::{encode_read_request, encode_write_request};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::unbounded_channel;

    const DONGLE: &[u8; 10] = b"DONGLE0001";
    const INV: &[u8] = b"INV0000001";

    fn test_config() -> ArbiterConfig {
        ArbiterConfig {
            response_timeout: Duration::from_millis(150),
            inter_frame_gap: Duration::from_millis(20),
            probe_backoff_base: Duration::from_millis(30),
            probe_backoff_max: Duration::from_millis(200),
        }
    }

    fn force_link_up(arbiter: &SerialArbiter) {
        arbiter.force_link_up_for_test();
    }

    async fn drive_until_reply(coordinator: &mut BridgeCoordinator, rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        for _ in 0..400 {
            coordinator.tick();
            if let Ok(msg) = rx.try_recv() {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no reply received in time");
    }

    #[tokio::test]
    async fn s1_read_success_end_to_end() {
        let (client_io, mut bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        force_link_up(&arbiter);
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));

        let (tx, mut rx) = unbounded_channel();
        let req = encode_read_request(DONGLE, INV, FUNC_READ_INPUT, 0, 40);
        coordinator.process_client_bytes(&req, tx);

        let mut raw_req = [0u8; 18];
        bus.read_exact(&mut raw_req).await.unwrap();
        let values: Vec<u16> = (0..40).collect();
        let resp = encode_read_response(FUNC_READ_INPUT, 0, &values, INV).unwrap();
        assert_eq!(resp.len(), 97);
        bus.write_all(&resp).await.unwrap();
        bus.flush().await.unwrap();

        let reply = drive_until_reply(&mut coordinator, &mut rx).await;
        assert_eq!(reply.len(), 117);
        assert_eq!(coordinator.cache_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn s3_write_single_not_cached() {
        let (client_io, mut bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        force_link_up(&arbiter);
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));

        let (tx, mut rx) = unbounded_channel();
        let req = encode_write_request(DONGLE, INV, 21, &[3]);
        coordinator.process_client_bytes(&req, tx);

        let mut raw_req = [0u8; 18];
        bus.read_exact(&mut raw_req).await.unwrap();
        let echo = encode_write_single_response(21, 3, INV).unwrap();
        bus.write_all(&echo).await.unwrap();
        bus.flush().await.unwrap();

        let reply = drive_until_reply(&mut coordinator, &mut rx).await;
        assert_eq!(reply.len(), echo.len() + 20);
        assert!(coordinator.cache_snapshot().is_empty());
    }

    #[tokio::test]
    async fn s5_exception_forwarded_and_not_cached() {
        let (client_io, mut bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        force_link_up(&arbiter);
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));

        let (tx, mut rx) = unbounded_channel();
        let req = encode_write_request(DONGLE, INV, 9999, &[1]);
        coordinator.process_client_bytes(&req, tx);

        let mut raw_req = [0u8; 18];
        bus.read_exact(&mut raw_req).await.unwrap();
        let exc = encode_exception_response(FUNC_WRITE_SINGLE, INV, 0x02);
        bus.write_all(&exc).await.unwrap();
        bus.flush().await.unwrap();

        let reply = drive_until_reply(&mut coordinator, &mut rx).await;
        assert_eq!(reply.len(), exc.len() + 20);
        assert_eq!(&reply[20..20 + exc.len() - 2], &exc[..exc.len() - 2]);
        assert!(coordinator.cache_snapshot().is_empty());
    }

    #[tokio::test]
    async fn s6_second_request_rejected_while_busy() {
        let (client_io, _bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        force_link_up(&arbiter);
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));

        let (tx1, _rx1) = unbounded_channel();
        let req1 = encode_read_request(DONGLE, INV, FUNC_READ_INPUT, 0, 10);
        coordinator.process_client_bytes(&req1, tx1);
        assert!(coordinator.active.is_some());

        let (tx2, mut rx2) = unbounded_channel();
        let req2 = encode_read_request(DONGLE, INV, FUNC_READ_INPUT, 5, 10);
        coordinator.process_client_bytes(&req2, tx2);

        let reply = rx2.recv().await.unwrap();
        assert!(!reply.is_empty());
        // Busy rejection must not disturb the single active request.
        assert!(coordinator.active.is_some());
    }

    #[tokio::test]
    async fn cache_fallback_serves_bit_exact_bytes_after_timeout() {
        let (client_io, mut bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        force_link_up(&arbiter);
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));

        // First, a successful read populates the cache.
        let (tx1, mut rx1) = unbounded_channel();
        let req = encode_read_request(DONGLE, INV, FUNC_READ_INPUT, 0, 4);
        coordinator.process_client_bytes(&req, tx1);
        let mut raw_req = [0u8; 18];
        bus.read_exact(&mut raw_req).await.unwrap();
        let resp = encode_read_response(FUNC_READ_INPUT, 0, &[1, 2, 3, 4], INV).unwrap();
        bus.write_all(&resp).await.unwrap();
        bus.flush().await.unwrap();
        let first_reply = drive_until_reply(&mut coordinator, &mut rx1).await;

        // Second, identical read with no inverter reply times out and falls
        // back to the cached bytes.
        let (tx2, mut rx2) = unbounded_channel();
        coordinator.process_client_bytes(&req, tx2);
        let second_reply = drive_until_reply(&mut coordinator, &mut rx2).await;
        assert_eq!(first_reply, second_reply);
    }

    #[tokio::test]
    async fn malformed_request_is_dropped_silently() {
        let (client_io, _bus) = duplex(4096);
        let arbiter = SerialArbiter::spawn(client_io, None, test_config());
        let mut coordinator =
            BridgeCoordinator::new(arbiter, OperationGuardRegistry::new(), FallbackCache::new(10, Duration::from_secs(600)), *DONGLE, Duration::from_secs(2));
        let (tx, mut rx) = unbounded_channel();
        coordinator.process_client_bytes(&[0u8; 5], tx);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.active.is_none());
    }
}
