//! Serial session ownership and the request/response exchange.
//!
//! RS485 is half-duplex: exactly one transaction may be on the wire at a
//! time. [`Transport`] owns the link behind an async mutex held from the
//! request write until the response is read (or the timeout expires), so
//! concurrent callers are serialized and frames never interleave.
//!
//! An exchange that did not end with a complete, valid response (timeout,
//! corrupted reply, or a caller that gave up mid-exchange) leaves the link
//! dirty. Before the next request the link is then drained until it has
//! been quiet for a full response timeout, so a late reply is never taken
//! as the answer to a later request.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{self, EXCEPTION_FLAG, Request, Response};
use crate::config::SerialConfig;
use crate::error::{DecodeError, TransportError};

/// Length of a complete exception response frame.
const EXCEPTION_FRAME_LEN: usize = 5;

/// Upper bound of a drain, in quiet periods, on a line that never settles.
const MAX_DRAIN_PERIODS: u32 = 4;

/// The seam through which every component reaches the device.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Run one Modbus transaction.
    async fn execute(&self, request: Request) -> Result<Response, TransportError>;

    /// Read `count` holding registers starting at `address`.
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let response = self
            .execute(Request::ReadHoldingRegisters { address, count })
            .await?;
        response
            .into_registers()
            .ok_or_else(|| TransportError::Framing("write response to a read request".into()))
    }

    /// Write a single holding register.
    async fn write_register(&self, address: u16, value: u16) -> Result<(), TransportError> {
        self.execute(Request::WriteSingleRegister { address, value })
            .await
            .map(|_| ())
    }
}

/// Timing and retry parameters of a transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Modbus slave address of the device.
    pub slave: u8,
    /// Maximum wait for a complete response.
    pub response_timeout: Duration,
    /// Bus silence kept before each request.
    pub frame_gap: Duration,
    /// Additional attempts for reads after a transient failure.
    pub retries: u32,
    /// Pause before a retry.
    pub retry_backoff: Duration,
}

impl TransportSettings {
    /// 3.5 character times at `baud_rate`, 11 bits per character.
    pub fn frame_gap_for_baud(baud_rate: u32) -> Duration {
        let char_time_us = 11_000_000 / baud_rate.max(1) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            slave: 1,
            response_timeout: Duration::from_secs(1),
            frame_gap: Self::frame_gap_for_baud(2400),
            retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Counters of bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Request frames written to the link, retries included.
    pub requests: u64,
    /// Attempts repeated after a transient failure.
    pub retries: u64,
    /// Transactions that ended in an error.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Exclusive owner of the serial session.
pub struct Transport<S> {
    link: Mutex<Option<S>>,
    settings: TransportSettings,
    counters: Counters,
    /// Set while an exchange is in flight or ended without a clean response.
    dirty: AtomicBool,
}

impl Transport<tokio_serial::SerialStream> {
    /// Open the configured serial port.
    pub fn open(config: &SerialConfig) -> Result<Self, TransportError> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .parity(config.serial_parity())
            .stop_bits(config.serial_stop_bits())
            .data_bits(config.serial_data_bits());

        let serial = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;

        debug!(
            port = %config.port,
            baud = config.baud_rate,
            parity = %config.parity,
            "Opened serial port"
        );

        Ok(Self::new(serial, config.transport_settings()))
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already opened link.
    pub fn new(link: S, settings: TransportSettings) -> Self {
        Self {
            link: Mutex::new(Some(link)),
            settings,
            counters: Counters::default(),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Release the link. Waits for an in-flight transaction to finish.
    pub async fn close(&self) {
        let mut guard = self.link.lock().await;
        if guard.take().is_some() {
            debug!("Transport closed");
        }
    }

    /// Write one request and read its response.
    async fn exchange(
        &self,
        link: &mut S,
        request: &Request,
        frame: &[u8],
    ) -> Result<Response, TransportError> {
        // The inter-frame silence doubles as the discard window for stray
        // input; after an unclean exchange it spans a whole response timeout.
        let quiet = if self.dirty.load(Ordering::Acquire) {
            self.settings.response_timeout.max(self.settings.frame_gap)
        } else {
            self.settings.frame_gap
        };
        self.drain(link, quiet).await;
        self.dirty.store(true, Ordering::Release);

        trace!(tx = %codec::hex(frame), "Sending frame");
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.settings.response_timeout;

        tokio::time::timeout_at(deadline, async {
            link.write_all(frame).await?;
            link.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout(self.settings.response_timeout))?
        .map_err(io_error)?;

        let raw = self.read_response(link, request, deadline).await?;
        trace!(rx = %codec::hex(&raw), "Received frame");

        let response = codec::decode(&raw)
            .and_then(|decoded| Response::parse(request, self.settings.slave, &decoded));
        if matches!(response, Ok(_) | Err(DecodeError::DeviceException { .. })) {
            self.dirty.store(false, Ordering::Release);
        }
        Ok(response?)
    }

    /// Read a response frame whose length follows from the request.
    async fn read_response(
        &self,
        link: &mut S,
        request: &Request,
        deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let timeout = self.settings.response_timeout;
        let mut raw = vec![0u8; 2];

        tokio::time::timeout_at(deadline, link.read_exact(&mut raw))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(io_error)?;

        let function = raw[1];
        let expected = if function & EXCEPTION_FLAG != 0 {
            EXCEPTION_FRAME_LEN
        } else if function == request.function_code() {
            request.expected_response_len()
        } else {
            return Err(TransportError::Framing(format!(
                "unexpected function 0x{:02X} in response header",
                function
            )));
        };

        raw.resize(expected, 0);
        tokio::time::timeout_at(deadline, link.read_exact(&mut raw[2..]))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(io_error)?;

        Ok(raw)
    }

    /// Discard input until the line has been silent for `quiet`.
    async fn drain(&self, link: &mut S, quiet: Duration) {
        let give_up = Instant::now() + quiet * MAX_DRAIN_PERIODS;
        let mut scratch = [0u8; 64];
        let mut discarded = 0usize;
        loop {
            let wait = (Instant::now() + quiet).min(give_up);
            match tokio::time::timeout_at(wait, link.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
        if discarded > 0 {
            debug!(bytes = discarded, "Discarded stale input");
        }
    }
}

fn io_error(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}

#[async_trait]
impl<S> Bus for Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run one transaction under the link lock.
    ///
    /// Reads are retried up to `retries` times on timeouts, checksum and
    /// framing failures. Writes get exactly one attempt.
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let frame = request.to_frame(self.settings.slave);
        let attempts = if request.is_write() {
            1
        } else {
            self.settings.retries + 1
        };

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::Closed)?;

        let mut attempt = 1;
        loop {
            match self.exchange(link, &request, &frame).await {
                Ok(response) => {
                    debug!(%request, attempt, "Transaction complete");
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(%request, attempt, error = %e, "Transient bus error, retrying");
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.settings.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(%request, attempt, error = %e, "Transaction failed");
                    return Err(e);
                }
            }
        }
    }
}
