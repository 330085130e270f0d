use log::{debug, error, info, warn};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::traits::FrameHandler;
use crate::sml::frame::FrameExtractor;
use crate::utils::error::IngestError;

const READ_CHUNK: usize = 1024;
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Idle = 0,
    Connected = 1,
    Reading = 2,
    Draining = 3,
    Closed = 4,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReaderState::Idle,
            1 => ReaderState::Connected,
            2 => ReaderState::Reading,
            3 => ReaderState::Draining,
            _ => ReaderState::Closed,
        }
    }
}

/// Flags shared between the reader thread and its owner.
#[derive(Clone)]
struct Signals {
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl Signals {
    fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
            state: Arc::new(AtomicU8::new(ReaderState::Idle as u8)),
        }
    }

    fn enter(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Owns one meter connection and the thread that reads it.
pub struct MeterReader {
    name: String,
    signals: Signals,
    thread: Option<JoinHandle<()>>,
}

impl MeterReader {
    /// Spawns the reader thread. The transport must return from `read` within
    /// a bounded time (serial ports do so through their timeout), since the
    /// stop flag is only checked between reads.
    pub fn start<T, H>(name: &str, transport: T, handler: H) -> Result<Self, IngestError>
    where
        T: Read + Send + 'static,
        H: FrameHandler + 'static,
    {
        let signals = Signals::new();
        let thread_signals = signals.clone();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("meter-{}", name))
            .spawn(move || run(&thread_name, transport, handler, &thread_signals))
            .map_err(|e| IngestError::ConnectionError(format!("Failed to spawn reader for {}: {}", name, e)))?;

        info!("📡 Reader for meter '{}' started", name);

        Ok(Self {
            name: name.to_string(),
            signals,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.signals.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.signals.state.load(Ordering::SeqCst))
    }

    /// Requests a cooperative stop. No-op once the reader has finished.
    pub fn close(&self) {
        if !self.is_alive() {
            debug!("Reader for meter '{}' already closed", self.name);
            return;
        }
        if !self.signals.stop.swap(true, Ordering::SeqCst) {
            info!("🛑 Stopping reader for meter '{}'", self.name);
        }
    }

    /// Waits for the reader thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("❌ Reader thread for meter '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for MeterReader {
    fn drop(&mut self) {
        self.close();
        self.join();
    }
}

fn run<T: Read, H: FrameHandler>(name: &str, mut transport: T, mut handler: H, signals: &Signals) {
    let result = drive(name, &mut transport, &mut handler, signals);

    signals.alive.store(false, Ordering::SeqCst);
    signals.enter(ReaderState::Closed);

    match &result {
        Ok(()) => info!("🔌 Reader for meter '{}' closed", name),
        Err(e) => error!("❌ Reader for meter '{}' failed: {}", name, e),
    }
    handler.connection_lost(result.as_ref().err());
}

fn drive<T: Read, H: FrameHandler>(
    name: &str,
    transport: &mut T,
    handler: &mut H,
    signals: &Signals,
) -> Result<(), IngestError> {
    handler.prepare()?;
    handler.connection_made()?;
    signals.enter(ReaderState::Connected);

    let mut extractor = FrameExtractor::new();
    let mut buffer = [0u8; READ_CHUNK];

    signals.enter(ReaderState::Reading);
    loop {
        if signals.stop_requested() {
            signals.enter(ReaderState::Draining);
            debug!("Draining reader for meter '{}'", name);
            handler.dispose();
            return Ok(());
        }

        let read = match transport.read(&mut buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                handler.flush();
                continue;
            }
            Err(e) => {
                return Err(IngestError::CommunicationError(format!(
                    "Read from meter '{}' failed: {}",
                    name, e
                )));
            }
        };

        if read == 0 {
            handler.flush();
            std::thread::sleep(IDLE_BACKOFF);
            continue;
        }

        for frame in extractor.feed(&buffer[..read]) {
            debug!("📥 Frame of {} bytes from meter '{}'", frame.len(), name);
            if let Err(e) = handler.data_received(&frame) {
                warn!("⚠️ Handler for meter '{}' rejected frame", name);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sml::frame::START_MARKER;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Prepare,
        Made,
        Frame(Vec<u8>),
        Dispose,
        Lost(Option<String>),
    }

    struct RecordingHandler {
        events: Arc<Mutex<Vec<Event>>>,
        flushes: Arc<AtomicUsize>,
        fail_prepare: bool,
    }

    impl RecordingHandler {
        fn new() -> (Self, Arc<Mutex<Vec<Event>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    events: events.clone(),
                    flushes: Arc::new(AtomicUsize::new(0)),
                    fail_prepare: false,
                },
                events,
            )
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl FrameHandler for RecordingHandler {
        fn prepare(&mut self) -> Result<(), IngestError> {
            self.push(Event::Prepare);
            if self.fail_prepare {
                return Err(IngestError::DatabaseError("unavailable".into()));
            }
            Ok(())
        }

        fn connection_made(&mut self) -> Result<(), IngestError> {
            self.push(Event::Made);
            Ok(())
        }

        fn data_received(&mut self, frame: &[u8]) -> Result<(), IngestError> {
            self.push(Event::Frame(frame.to_vec()));
            Ok(())
        }

        fn flush(&mut self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_lost(&mut self, error: Option<&IngestError>) {
            self.push(Event::Lost(error.map(|e| e.to_string())));
        }

        fn dispose(&mut self) {
            self.push(Event::Dispose);
        }
    }

    /// Plays back scripted reads, then times out like an idle serial port.
    struct ScriptedTransport {
        steps: VecDeque<io::Result<Vec<u8>>>,
        timeout: Duration,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<io::Result<Vec<u8>>>, timeout: Duration) -> Self {
            Self {
                steps: steps.into(),
                timeout,
            }
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => {
                    std::thread::sleep(self.timeout);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                }
            }
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = START_MARKER.to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(&[0x1B, 0x1B, 0x1B, 0x1B, 0x1A, 0x00, 0x12, 0x34]);
        out
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_frames_delivered_in_order_then_drained() {
        let first = frame(&[0x76, 0x01, 0x02, 0x03]);
        let second = frame(&[0x76, 0x04, 0x05, 0x06]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let (head, tail) = stream.split_at(11);

        let transport = ScriptedTransport::new(
            vec![Ok(head.to_vec()), Ok(tail.to_vec())],
            Duration::from_millis(20),
        );
        let (handler, events) = RecordingHandler::new();
        let mut reader = MeterReader::start("M1", transport, handler).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            events.lock().unwrap().iter().filter(|e| matches!(e, Event::Frame(_))).count() == 2
        }));
        assert!(reader.is_alive());

        reader.close();
        reader.join();

        assert!(!reader.is_alive());
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Prepare,
                Event::Made,
                Event::Frame(first),
                Event::Frame(second),
                Event::Dispose,
                Event::Lost(None),
            ]
        );
    }

    #[test]
    fn test_idle_reads_flush_handler() {
        let transport = ScriptedTransport::new(
            vec![
                Ok(frame(&[0x76, 0x01])),
                Err(io::Error::new(io::ErrorKind::Interrupted, "signal")),
                Ok(Vec::new()),
            ],
            Duration::from_millis(20),
        );
        let (handler, events) = RecordingHandler::new();
        let flushes = handler.flushes.clone();
        let mut reader = MeterReader::start("M1", transport, handler).unwrap();

        // the empty read, then every timeout
        assert!(wait_until(Duration::from_secs(2), || flushes.load(Ordering::SeqCst) >= 3));
        reader.close();
        reader.join();

        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| matches!(e, Event::Frame(_))).count(), 1);
        assert_eq!(events.last(), Some(&Event::Lost(None)));
    }

    #[test]
    fn test_stop_observed_within_read_timeout() {
        let timeout = Duration::from_secs(1);
        let (handler, events) = RecordingHandler::new();
        let mut reader = MeterReader::start("M1", ScriptedTransport::new(vec![], timeout), handler).unwrap();

        assert!(wait_until(Duration::from_secs(2), || reader.state() == ReaderState::Reading));

        let requested = Instant::now();
        reader.close();
        assert!(wait_until(Duration::from_secs(3), || !reader.is_alive()));
        assert!(requested.elapsed() < timeout + Duration::from_millis(500));

        reader.join();
        assert_eq!(events.lock().unwrap().last(), Some(&Event::Lost(None)));
    }

    #[test]
    fn test_io_error_ends_reader() {
        let transport = ScriptedTransport::new(
            vec![Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))],
            Duration::from_millis(20),
        );
        let (handler, events) = RecordingHandler::new();
        let mut reader = MeterReader::start("M1", transport, handler).unwrap();
        reader.join();

        assert!(!reader.is_alive());
        let events = events.lock().unwrap();
        assert!(!events.contains(&Event::Dispose));
        match events.last() {
            Some(Event::Lost(Some(message))) => assert!(message.contains("unplugged")),
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[test]
    fn test_prepare_failure_reported() {
        let (mut handler, events) = RecordingHandler::new();
        handler.fail_prepare = true;
        let mut reader =
            MeterReader::start("M1", ScriptedTransport::new(vec![], Duration::from_millis(20)), handler).unwrap();
        reader.join();

        assert!(!reader.is_alive());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::Lost(Some(_))));
    }

    #[test]
    fn test_close_after_exit_is_noop() {
        let transport = ScriptedTransport::new(
            vec![Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))],
            Duration::from_millis(20),
        );
        let (handler, events) = RecordingHandler::new();
        let mut reader = MeterReader::start("M1", transport, handler).unwrap();
        reader.join();

        reader.close();
        reader.close();
        assert_eq!(
            events.lock().unwrap().iter().filter(|e| matches!(e, Event::Lost(_))).count(),
            1
        );
    }
}
