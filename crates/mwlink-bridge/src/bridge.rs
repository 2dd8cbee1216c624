use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mwlink_frame::{
    encode_envelope_frame, encode_link_frame, Direction, EnvelopeDecoder, LinkDecoder, LinkFrame,
};
use mwlink_transport::{open_serial, Redial, SerialConfig, TransportError};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::{OutboundQueue, QueueItem};

/// How long a dispatched request may hold the serial link before the
/// slot is reclaimed.
pub const ADVANCE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delay between network redial attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);

const EVENT_BACKLOG: usize = 256;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Link bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Advance-timer deadline for the in-flight slot.
    pub advance_timeout: Duration,
    /// Delay between network reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            advance_timeout: ADVANCE_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

enum PumpEvent {
    /// A request envelope arrived from the network side.
    Request(QueueItem),
    /// A complete frame was parsed from the serial stream.
    SerialFrame(LinkFrame),
    Shutdown,
}

/// The client role: moves frames between one serial device and one
/// network connection, keeping exactly one request in flight on the
/// serial side.
pub struct LinkBridge {
    events: SyncSender<PumpEvent>,
    running: Arc<AtomicBool>,
}

impl LinkBridge {
    /// Open the serial port and start bridging to `remote`.
    pub fn open(
        port: &str,
        serial_config: &SerialConfig,
        remote: &str,
        config: BridgeConfig,
    ) -> Result<Self> {
        let writer = open_serial(port, serial_config)?;
        let reader = writer.try_clone().map_err(|source| {
            TransportError::SerialOpen {
                port: port.to_string(),
                source,
            }
        })?;
        let redial = Redial::new(remote, config.reconnect_delay);
        Ok(Self::start(reader, writer, redial, config))
    }

    /// Start bridging over already-opened serial halves.
    ///
    /// Split halves keep the serial reader independent of the pump's
    /// writer; tests drive the bridge over socket pairs the same way.
    pub fn start(
        serial_reader: impl Read + Send + 'static,
        serial_writer: impl Write + Send + 'static,
        redial: Redial,
        config: BridgeConfig,
    ) -> Self {
        let (events, events_rx) = mpsc::sync_channel(EVENT_BACKLOG);
        let running = Arc::new(AtomicBool::new(true));
        let network = Arc::new(Mutex::new(None::<TcpStream>));

        {
            let events = events.clone();
            let running = Arc::clone(&running);
            thread::spawn(move || read_serial(serial_reader, &events, &running));
        }
        {
            let events = events.clone();
            let running = Arc::clone(&running);
            let network = Arc::clone(&network);
            thread::spawn(move || read_network(&redial, &network, &events, &running));
        }
        {
            let advance = config.advance_timeout;
            thread::spawn(move || pump(events_rx, serial_writer, &network, advance));
        }

        Self { events, running }
    }

    /// Stop the pump. Reader threads wind down as their streams close or
    /// time out.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(PumpEvent::Shutdown);
    }
}

impl Drop for LinkBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serial side: feed the link decoder, emit complete response frames.
fn read_serial(
    mut reader: impl Read,
    events: &SyncSender<PumpEvent>,
    running: &AtomicBool,
) {
    let mut decoder = LinkDecoder::new(Direction::Response);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while running.load(Ordering::SeqCst) {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                while let Some(frame) = decoder.decode() {
                    if events.send(PumpEvent::SerialFrame(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => {
                warn!(error = %err, "serial read failed");
                break;
            }
        }
    }
    debug!("serial reader stopped");
}

/// Network side: dial, drain request envelopes into the pump, redial on
/// close — indefinitely.
fn read_network(
    redial: &Redial,
    network: &Arc<Mutex<Option<TcpStream>>>,
    events: &SyncSender<PumpEvent>,
    running: &AtomicBool,
) {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while running.load(Ordering::SeqCst) {
        let mut stream = redial.connect();
        match stream.try_clone() {
            Ok(writer) => *lock(network) = Some(writer),
            Err(err) => {
                warn!(error = %err, "network clone failed, redialing");
                continue;
            }
        }

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    decoder.extend(&chunk[..n]);
                    while let Some(frame) = decoder.decode() {
                        let item = QueueItem {
                            id: frame.id,
                            code: frame.code,
                            payload: frame.payload,
                            priority: frame.priority,
                        };
                        if events.send(PumpEvent::Request(item)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(error = %err, "network read failed");
                    break;
                }
            }
        }

        *lock(network) = None;
        info!(addr = redial.addr(), "network connection lost, reconnecting");
    }
}

/// The dispatch loop: single-threaded owner of the outbound queue, the
/// serial writer, and the advance deadline.
fn pump(
    events: mpsc::Receiver<PumpEvent>,
    mut serial_writer: impl Write,
    network: &Arc<Mutex<Option<TcpStream>>>,
    advance: Duration,
) {
    let mut queue = OutboundQueue::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let event = match deadline {
            Some(at) => match at.checked_duration_since(Instant::now()) {
                Some(remaining) => events.recv_timeout(remaining),
                None => Err(RecvTimeoutError::Timeout),
            },
            None => events
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match event {
            Ok(PumpEvent::Request(item)) => {
                debug!(id = item.id, code = item.code, priority = item.priority, "request queued");
                queue.push(item);
                if deadline.is_none() {
                    deadline = dispatch_next(&mut queue, &mut serial_writer, advance);
                }
            }
            Ok(PumpEvent::SerialFrame(frame)) => {
                match queue.complete() {
                    Some(item) => {
                        deadline = None;
                        forward_response(&item, &frame, network);
                    }
                    None => debug!(code = frame.code, "unsolicited serial frame discarded"),
                }
                deadline = dispatch_next(&mut queue, &mut serial_writer, advance);
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(item) = queue.complete() {
                    warn!(
                        id = item.id,
                        code = item.code,
                        "serial response overdue, advancing queue"
                    );
                }
                deadline = dispatch_next(&mut queue, &mut serial_writer, advance);
            }
            Ok(PumpEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("bridge pump stopped");
}

/// Write the next queued item to the serial link and arm its deadline.
fn dispatch_next(
    queue: &mut OutboundQueue,
    serial_writer: &mut impl Write,
    advance: Duration,
) -> Option<Instant> {
    let item = queue.dispatch()?;
    let mut wire = BytesMut::new();
    match encode_link_frame(Direction::Request, item.code, &item.payload, &mut wire) {
        Ok(()) => {
            // Fire-and-forget: a failed write leaves the advance timer to
            // reclaim the slot.
            if let Err(err) = serial_writer.write_all(&wire).and_then(|()| serial_writer.flush()) {
                warn!(id = item.id, code = item.code, error = %err, "serial write failed");
            }
            Some(Instant::now() + advance)
        }
        Err(err) => {
            warn!(id = item.id, code = item.code, error = %err, "unframeable request dropped");
            queue.complete();
            dispatch_next(queue, serial_writer, advance)
        }
    }
}

/// Forward a serial response to the network side as a response envelope
/// tagged with the originating id.
fn forward_response(item: &QueueItem, frame: &LinkFrame, network: &Arc<Mutex<Option<TcpStream>>>) {
    let mut wire = BytesMut::new();
    if let Err(err) = encode_envelope_frame(
        Direction::Response,
        item.id,
        frame.code,
        item.priority,
        &frame.payload,
        &mut wire,
    ) {
        warn!(id = item.id, error = %err, "response framing failed");
        return;
    }

    let mut guard = lock(network);
    match guard.as_mut() {
        Some(stream) => {
            if let Err(err) = stream.write_all(&wire) {
                warn!(id = item.id, error = %err, "network write failed");
            }
        }
        None => debug!(id = item.id, "network down, response dropped"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
