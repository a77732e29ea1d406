//! DevLink3Connection state machine (spec §4.4): `Closed -> Dialing ->
//! Connected -> Authenticated -> Subscribed -> Closed`, with error
//! transitions back to `Closed` from any state, exponential backoff on
//! reconnect, and 30s keepalive.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::auth::{self, AuthOutcome};
use crate::error::{BridgeError, Result};
use crate::framer::{self, Frame, FrameDecoder};
use crate::protocol::{PACKET_TEST, PACKET_TEST_ACK};

use super::transport::{self, Transport};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const BACKOFF_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Closed,
    Dialing,
    Subscribed,
    WaitBackoff(u32),
}

pub struct DevLink3Params {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub tls_verify: bool,
    pub event_flags: String,
}

/// Runs the connection state machine on the calling thread until `stop`
/// fires. Every received frame is forwarded on `frame_tx`; the supervisor
/// never re-drives reconnection, this loop owns that entirely (spec §4.4).
pub struct DevLink3Connection {
    params: DevLink3Params,
    state: Arc<Mutex<ConnectionState>>,
    attempt: u32,
}

impl DevLink3Connection {
    pub fn new(params: DevLink3Params) -> Self {
        Self {
            params,
            state: Arc::new(Mutex::new(ConnectionState::Closed)),
            attempt: 0,
        }
    }

    pub fn state_handle(&self) -> Arc<Mutex<ConnectionState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn run(mut self, stop: Receiver<()>, frame_tx: Sender<Frame>) {
        loop {
            if stop.try_recv().is_ok() {
                self.set_state(ConnectionState::Closed);
                return;
            }

            self.set_state(ConnectionState::Dialing);
            match self.connect_and_subscribe() {
                Ok(mut stream) => {
                    self.attempt = 0;
                    self.set_state(ConnectionState::Subscribed);
                    tracing::info!(host = %self.params.host, "DevLink3 subscribed");
                    self.pump_until_dead(stream.as_mut(), &stop, &frame_tx);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "DevLink3 connect/auth failed");
                }
            }

            self.set_state(ConnectionState::WaitBackoff(self.attempt));
            let delay = backoff_delay(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            if !sleep_interruptible(delay, &stop) {
                self.set_state(ConnectionState::Closed);
                return;
            }
        }
    }

    fn connect_and_subscribe(&self) -> Result<Box<dyn Transport>> {
        let mut stream = transport::dial(
            &self.params.host,
            self.params.port,
            self.params.use_tls,
            self.params.tls_verify,
        )?;

        match auth::perform_handshake(&mut stream, &self.params.username, &self.params.password)? {
            AuthOutcome::Success => {}
            AuthOutcome::Failed(reason) => {
                return Err(BridgeError::Auth(reason));
            }
        }

        let ok = auth::register_events(&mut stream, &self.params.event_flags)?;
        if !ok {
            return Err(BridgeError::Protocol(
                "event registration rejected by PBX".into(),
            ));
        }

        Ok(stream)
    }

    /// Reads frames until the stop signal fires or the link is judged dead
    /// (I/O error, or a keepalive `Test` fires while the previous `TestAck`
    /// is still outstanding).
    fn pump_until_dead(
        &self,
        stream: &mut dyn Transport,
        stop: &Receiver<()>,
        frame_tx: &Sender<Frame>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut last_test_sent = Instant::now();
        let mut test_ack_pending = false;
        let mut buf = [0u8; 4096];

        loop {
            if stop.try_recv().is_ok() {
                return;
            }

            if last_test_sent.elapsed() >= KEEPALIVE_INTERVAL {
                if test_ack_pending {
                    tracing::warn!("DevLink3 keepalive missed TestAck, closing link");
                    return;
                }
                if let Err(e) = framer::write_frame(stream, PACKET_TEST, 0, &[0u8; 4]) {
                    tracing::warn!(error = %e, "failed to send keepalive Test");
                    return;
                }
                last_test_sent = Instant::now();
                test_ack_pending = true;
            }

            match std::io::Read::read(stream, &mut buf) {
                Ok(0) => {
                    tracing::info!("DevLink3 socket closed by peer");
                    return;
                }
                Ok(n) => {
                    let (frames, skipped) = decoder.push(&buf[..n]);
                    if skipped > 0 {
                        tracing::debug!(skipped, "DevLink3 framer resynchronized");
                    }
                    for frame in frames {
                        if frame.packet_type == PACKET_TEST_ACK {
                            test_ack_pending = false;
                            continue;
                        }
                        if frame_tx.send(frame).is_err() {
                            return; // consumer gone
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "DevLink3 read failed");
                    return;
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let capped_shift = attempt.min(5); // 2^5 * 1s == 32s already above the 30s cap
    let secs = BACKOFF_BASE.as_secs().saturating_mul(1u64 << capped_shift);
    Duration::from_secs(secs).min(BACKOFF_MAX)
}

/// Sleeps in small increments so `stop` is observed promptly. Returns
/// `false` if stop fired during the sleep.
fn sleep_interruptible(total: Duration, stop: &Receiver<()>) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if stop.try_recv().is_ok() {
            return false;
        }
        std::thread::sleep(BACKOFF_POLL_INTERVAL.min(deadline - Instant::now()));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }
}
