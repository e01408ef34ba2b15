//! Link management
//!
//! Owns the serial handle and orchestrates the codec, scanner,
//! decoders, clock sync and dispatch registry into one running
//! session. One background reader thread decodes everything the
//! device sends; foreground callers share the handle through a write
//! mutex. Also implements first-responder port discovery.

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    clock::ClockSync,
    codec, packet, registry,
    registry::{ControlGuard, ControlHandler, Registry, StreamListener},
    scanner,
    serial::{clear_buffers, configure_port, list_ports, open_port},
    Message, ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_OPEN_SETTLE_MS, DEFAULT_PROBE_TIMEOUT_MS,
    EOP,
};
use tracing::{debug, info, trace, warn};

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No port open
    Closed,
    /// Session running (reader thread live)
    Open,
}

/// Link configuration.
///
/// Only `verify_checksum` changes protocol behavior; the trace flags
/// gate diagnostic output that is too chatty to leave on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Per-port response wait during discovery, in milliseconds
    pub probe_timeout_ms: u64,
    /// Settle delay after opening a port, in milliseconds (the device
    /// reboots when the port opens)
    pub open_settle_ms: u64,
    /// Verify frame checksums (checksum byte 0 always passes)
    pub verify_checksum: bool,
    /// Trace raw buffer consumption in the reader loop
    pub trace_buffer: bool,
    /// Trace every decoded control packet (sync excluded)
    pub trace_control: bool,
    /// Trace every decoded stream packet
    pub trace_stream: bool,
    /// Trace sync packets specifically
    pub trace_sync: bool,
    /// Trace outgoing frames
    pub trace_sent: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            open_settle_ms: DEFAULT_OPEN_SETTLE_MS,
            verify_checksum: true,
            trace_buffer: false,
            trace_control: false,
            trace_stream: false,
            trace_sync: false,
            trace_sent: false,
        }
    }
}

/// Lock helper: a poisoned mutex only means some thread died while
/// holding it; the protected tables are still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the link handle and its reader thread.
struct Shared {
    config: LinkConfig,
    /// Writer half of the serial handle. The reader thread owns its
    /// own clone and never touches this one.
    port: Mutex<Option<Box<dyn SerialPort>>>,
    open: AtomicBool,
    /// Outgoing sequence counter; wraps mod 256 skipping 0
    sequence: AtomicU8,
    /// Last sequence number seen in a decoded control packet
    last_seq_seen: AtomicU8,
    registry: Mutex<Registry>,
    clock: Mutex<ClockSync>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
}

impl Shared {
    fn next_sequence(&self) -> u8 {
        let prev = self
            .sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                let n = s.wrapping_add(1);
                Some(if n == 0 { 1 } else { n })
            })
            .unwrap_or(0);
        let n = prev.wrapping_add(1);
        if n == 0 {
            1
        } else {
            n
        }
    }

    /// Tear the session down. Idempotent; safe to call from the
    /// reader thread itself.
    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("link closed");
        }
        // dropping the handle closes the port
        *lock(&self.port) = None;
    }

    /// Route one verified frame payload to its decoder and callbacks.
    /// Runs on the reader thread (or the discovery routine).
    fn process_payload(&self, payload: &[u8]) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        if packet::is_stream(payload) {
            match packet::decode_stream(payload) {
                Ok(pkt) => {
                    if self.config.trace_stream {
                        debug!(
                            stream = pkt.stream_id,
                            samples = pkt.samples.len(),
                            "stream packet"
                        );
                    }
                    let snapshot = lock(&self.registry).stream_snapshot(pkt.stream_id);
                    registry::dispatch_stream(&snapshot, pkt.stream_id, &pkt.samples);
                }
                Err(e) => warn!("stream decode failed: {}", e),
            }
        } else {
            match packet::decode_control(payload) {
                Ok(pkt) => {
                    self.last_seq_seen.store(pkt.sequence_id, Ordering::Relaxed);
                    if pkt.message == Message::Sync {
                        if let Some(&t) = pkt.words.first() {
                            if self.config.trace_sync {
                                debug!(ticks = t, "sync packet");
                            }
                            lock(&self.clock).on_sync(t);
                        }
                    } else if self.config.trace_control && pkt.message.traced() {
                        debug!(
                            message = %pkt.message,
                            sequence = pkt.sequence_id,
                            words = ?pkt.words,
                            "control packet"
                        );
                    }
                    let snapshot = lock(&self.registry).control_snapshot(pkt.message);
                    registry::dispatch_control(&snapshot, pkt.message, &pkt.words);
                }
                Err(e) => warn!("control decode failed: {}", e),
            }
        }
    }
}

/// A device link: one serial session plus its protocol state.
///
/// `Link` methods take `&self`, so a link wrapped in an [`Arc`] can be
/// shared between threads and even used from inside its own callbacks
/// (for example to deregister a one-shot handler).
pub struct Link {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Create an idle link. Nothing happens until [`Link::open`].
    pub fn new(config: LinkConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                port: Mutex::new(None),
                open: AtomicBool::new(false),
                sequence: AtomicU8::new(20),
                last_seq_seen: AtomicU8::new(0),
                registry: Mutex::new(Registry::new()),
                clock: Mutex::new(ClockSync::new()),
                tx_bytes: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
                tx_packets: AtomicU64::new(0),
                rx_packets: AtomicU64::new(0),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        if self.is_open() {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    /// Whether a session is running.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Cumulative (tx_bytes, rx_bytes, tx_packets, rx_packets).
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.shared.tx_bytes.load(Ordering::Relaxed),
            self.shared.rx_bytes.load(Ordering::Relaxed),
            self.shared.tx_packets.load(Ordering::Relaxed),
            self.shared.rx_packets.load(Ordering::Relaxed),
        )
    }

    /// Sequence number of the last control packet received.
    pub fn last_seq_seen(&self) -> u8 {
        self.shared.last_seq_seen.load(Ordering::Relaxed)
    }

    /// Open a session on `port`, or discover the device when `port`
    /// is `None` (single sweep, no retry; see [`Link::open_first`]).
    pub fn open(&self, port: Option<&str>) -> Result<(), ProtocolError> {
        match port {
            Some(name) => self.open_session(name),
            None => self.open_first(|| false).map(|_| ()),
        }
    }

    /// Discover the device by probing every available port with a
    /// version request, then open a session on the first responder.
    ///
    /// After a fruitless sweep `ask_retry` is consulted; the whole
    /// sweep repeats until a device answers or the callback declines.
    /// Returns the opened port name.
    pub fn open_first<F>(&self, mut ask_retry: F) -> Result<String, ProtocolError>
    where
        F: FnMut() -> bool,
    {
        if self.is_open() {
            return Err(ProtocolError::AlreadyOpen);
        }

        // park existing version handlers so only the probe hook sees
        // the probe responses
        let parked = lock(&self.shared.registry).take_control(Message::Version);

        let swept = loop {
            let mut found = None;
            for info in list_ports() {
                debug!(port = %info.name, "probing");
                match self.probe_port(&info.name) {
                    Ok(true) => {
                        info!(port = %info.name, "device responded");
                        found = Some(info.name);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("{}", e),
                }
                thread::sleep(Duration::from_millis(100));
            }
            match found {
                Some(port) => break Ok(port),
                None => {
                    if !ask_retry() {
                        break Err(ProtocolError::PortProbeFailure {
                            port: "*".to_string(),
                            reason: "no device responded on any port".to_string(),
                        });
                    }
                }
            }
        };

        lock(&self.shared.registry).restore_control(Message::Version, parked);

        let port = swept?;
        self.open_session(&port)?;
        Ok(port)
    }

    /// Probe one port: send a version request, wait, and feed back
    /// whatever arrived. The port is opened and closed entirely
    /// within this call. Returns whether the device answered.
    fn probe_port(&self, name: &str) -> Result<bool, ProtocolError> {
        let probe_failed = |reason: String| ProtocolError::PortProbeFailure {
            port: name.to_string(),
            reason,
        };

        let mut port = open_port(name, Some(self.shared.config.baud_rate))
            .map_err(|e| probe_failed(e.to_string()))?;

        let found = Arc::new(AtomicBool::new(false));
        let hook_found = found.clone();
        let hook: ControlHandler = Arc::new(move |_words: &[u32]| {
            hook_found.store(true, Ordering::SeqCst);
        });
        let hook_id = lock(&self.shared.registry).register(Message::Version, hook, None);

        let exchange = (|| -> Result<(), ProtocolError> {
            let frame = codec::build_frame(Message::Version.id(), 1, &[]);
            port.write_all(&frame)?;
            thread::sleep(Duration::from_millis(self.shared.config.probe_timeout_ms));

            let available = port
                .bytes_to_read()
                .map_err(|e| ProtocolError::SerialError(e.to_string()))?
                as usize;
            let mut response = vec![0u8; available];
            if available > 0 {
                port.read_exact(&mut response)?;
            }

            let (frames, _) =
                scanner::scan(&scanner::primed_with(&response), self.shared.config.verify_checksum);
            for payload in &frames {
                self.shared.process_payload(payload);
            }
            Ok(())
        })();

        // always unhook and close the probe handle before moving on
        let _ = lock(&self.shared.registry).deregister(Message::Version, hook_id);
        drop(port);

        exchange.map_err(|e| probe_failed(e.to_string()))?;
        Ok(found.load(Ordering::SeqCst))
    }

    /// Open a session on a known port and start the reader thread.
    fn open_session(&self, name: &str) -> Result<(), ProtocolError> {
        if self.is_open() {
            return Err(ProtocolError::AlreadyOpen);
        }

        let mut port = open_port(name, Some(self.shared.config.baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;

        let reader_port = port
            .try_clone()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

        *lock(&self.shared.port) = Some(port);
        *lock(&self.shared.clock) = ClockSync::new();
        self.shared.open.store(true, Ordering::SeqCst);
        info!(port = name, "link open");

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("propdaq-reader".to_string())
            .spawn(move || reader_loop(shared, reader_port))
            .map_err(ProtocolError::Io)?;
        *lock(&self.reader) = Some(handle);

        // give the device time to boot after the open reset it
        thread::sleep(Duration::from_millis(self.shared.config.open_settle_ms));

        // start the dialog
        if let Err(e) = self.send(Message::Version, &[]) {
            warn!("version request failed: {}", e);
        }
        Ok(())
    }

    /// Close the session. Best-effort stops all device channels
    /// first; idempotent and safe to call while the reader is
    /// mid-read.
    pub fn close(&self) {
        if self.is_open() {
            let _ = self.send(Message::Stop, &[0]);
        }
        self.shared.shutdown();
        if let Some(handle) = lock(&self.reader).take() {
            let _ = handle.join();
        }
    }

    /// Send a control packet.
    ///
    /// Builds a frame with the next sequence id and writes it under
    /// the write lock. Failures come back as `Err`; a closed link is
    /// [`ProtocolError::LinkNotOpen`].
    pub fn send(&self, message: Message, words: &[u32]) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::LinkNotOpen);
        }
        let sequence = self.shared.next_sequence();
        let frame = codec::build_frame(message.id(), sequence, words);
        if self.shared.config.trace_sent {
            debug!(message = %message, sequence, ?words, raw = ?frame, "sending");
        }

        let mut guard = lock(&self.shared.port);
        let port = guard.as_mut().ok_or(ProtocolError::LinkNotOpen)?;
        port.write_all(&frame).map_err(|e| {
            warn!("write failed: {}", e);
            ProtocolError::SerialError(e.to_string())
        })?;

        self.shared
            .tx_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.shared.tx_packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a control packet by firmware message name.
    pub fn send_named(&self, name: &str, words: &[u32]) -> Result<(), ProtocolError> {
        let message =
            Message::from_name(name).ok_or_else(|| ProtocolError::UnknownMessageName(name.to_string()))?;
        self.send(message, words)
    }

    /// Register a control handler (and optional guard). Returns the
    /// registration id.
    pub fn register(
        &self,
        message: Message,
        handler: ControlHandler,
        guard: Option<ControlGuard>,
    ) -> u64 {
        lock(&self.shared.registry).register(message, handler, guard)
    }

    /// Remove a control registration, returning its handler.
    pub fn deregister(&self, message: Message, id: u64) -> Result<ControlHandler, ProtocolError> {
        lock(&self.shared.registry).deregister(message, id)
    }

    /// Attach a listener to a sample stream.
    pub fn add_listener(
        &self,
        stream_id: u8,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(), ProtocolError> {
        lock(&self.shared.registry).add_listener(stream_id, listener)
    }

    /// Detach a stream listener, matched by object identity.
    pub fn remove_listener(
        &self,
        stream_id: u8,
        listener: &Arc<dyn StreamListener>,
    ) -> Result<(), ProtocolError> {
        lock(&self.shared.registry).remove_listener(stream_id, listener)
    }

    /// Convert a device timestamp to seconds since the first sync.
    /// See [`ClockSync::real_time`].
    pub fn real_time(&self, timestamp: u32, stream_id: Option<u8>) -> f64 {
        lock(&self.shared.clock).real_time(timestamp, stream_id)
    }

    /// Seconds since the first sync, from accumulated device ticks.
    pub fn current_time(&self) -> f64 {
        lock(&self.shared.clock).current_time()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader loop: byte-at-a-time reads, scanning whenever the newest
/// byte could terminate a frame. Exits when the link closes or the
/// read fails, then tears the session down.
fn reader_loop(shared: Arc<Shared>, mut port: Box<dyn SerialPort>) {
    let mut buf = scanner::primed_buffer();

    while shared.open.load(Ordering::SeqCst) {
        let Some(byte) = read_byte(&shared, &mut port) else {
            break;
        };
        buf.push(byte);
        if byte != EOP {
            continue;
        }
        // the byte after a terminator is the frame's trailing
        // checksum; pull it before scanning
        let Some(checksum) = read_byte(&shared, &mut port) else {
            break;
        };
        buf.push(checksum);

        let before = buf.len();
        let (frames, rest) = scanner::scan(&buf, shared.config.verify_checksum);
        for payload in &frames {
            shared.process_payload(payload);
        }
        if shared.config.trace_buffer && rest.len() != before {
            trace!(consumed = before - rest.len(), left = rest.len(), "buffer scanned");
        }
        buf = rest;
    }

    shared.shutdown();
}

/// Read one byte, riding out timeouts while the link stays open.
/// `None` means the link closed or the read failed for real.
fn read_byte(shared: &Shared, port: &mut Box<dyn SerialPort>) -> Option<u8> {
    let mut byte = [0u8; 1];
    while shared.open.load(Ordering::SeqCst) {
        match port.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) => {
                shared.rx_bytes.fetch_add(1, Ordering::Relaxed);
                return Some(byte[0]);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("read error, closing link: {}", e);
                return None;
            }
        }
    }
    None
}
