//! In-memory links and event helpers shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use itr90_rs::errors::{DriverError, Result};
use itr90_rs::link::{LinkHalves, LinkOpener};
use itr90_rs::transport::{EventReceiver, LinkEvent};

/// One scripted outcome of a read on a [`ScriptedOpener`] link.
#[derive(Debug, Clone)]
pub enum Step {
    Bytes(Vec<u8>),
    Fail,
    Eof,
}

struct ScriptedReader {
    steps: VecDeque<Step>,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(Step::Bytes(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Bytes(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")),
            Some(Step::Eof) => Ok(0),
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

/// Collects everything written to a link, optionally taking `delay` per write.
#[derive(Clone, Default)]
pub struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    delay: Duration,
}

impl Capture {
    pub fn bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    /// Writer handles handed out and not yet dropped.
    pub fn live_writers(&self) -> usize {
        Arc::strong_count(&self.buf) - 1
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Each `open()` consumes the next session: `Some(steps)` opens a link that
/// plays those steps, `None` fails. Once the queue is empty every open fails.
pub struct ScriptedOpener {
    sessions: Mutex<VecDeque<Option<Vec<Step>>>>,
    opens: AtomicUsize,
    pub written: Capture,
}

impl ScriptedOpener {
    pub fn new(sessions: Vec<Option<Vec<Step>>>) -> Arc<Self> {
        Self::with_write_delay(sessions, Duration::ZERO)
    }

    pub fn with_write_delay(sessions: Vec<Option<Vec<Step>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            opens: AtomicUsize::new(0),
            written: Capture {
                buf: Arc::default(),
                delay,
            },
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl LinkOpener for ScriptedOpener {
    fn open(&self) -> Result<LinkHalves> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().unwrap().pop_front().flatten() {
            Some(steps) => Ok(LinkHalves {
                reader: Box::new(ScriptedReader {
                    steps: steps.into(),
                }),
                writer: Box::new(self.written.clone()),
            }),
            None => Err(DriverError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such device",
            ))),
        }
    }

    fn describe(&self) -> String {
        "scripted link".to_string()
    }
}

/// Every open succeeds with a link whose first read fails, so the link
/// keeps being reacquired.
pub struct FlappingOpener {
    opens: AtomicUsize,
    pub written: Capture,
}

impl FlappingOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            written: Capture::default(),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl LinkOpener for FlappingOpener {
    fn open(&self) -> Result<LinkHalves> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(LinkHalves {
            reader: Box::new(ScriptedReader {
                steps: vec![Step::Fail].into(),
            }),
            writer: Box::new(self.written.clone()),
        })
    }

    fn describe(&self) -> String {
        "flapping link".to_string()
    }
}

struct ChannelReader(mpsc::Receiver<Vec<u8>>);

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv_timeout(Duration::from_millis(10)) {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

/// A link fed by the test through a channel. Opens once.
pub struct ChannelOpener {
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    pub written: Capture,
}

impl ChannelOpener {
    pub fn new() -> (mpsc::Sender<Vec<u8>>, Arc<Self>) {
        let (tx, rx) = mpsc::channel();
        let opener = Arc::new(Self {
            rx: Mutex::new(Some(rx)),
            written: Capture::default(),
        });
        (tx, opener)
    }
}

impl LinkOpener for ChannelOpener {
    fn open(&self) -> Result<LinkHalves> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DriverError::Io(io::ErrorKind::AddrInUse.into()))?;
        Ok(LinkHalves {
            reader: Box::new(ChannelReader(rx)),
            writer: Box::new(self.written.clone()),
        })
    }

    fn describe(&self) -> String {
        "channel link".to_string()
    }
}

/// Receive the next event, failing the test after two seconds.
pub async fn next_event(rx: &mut EventReceiver) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
pub async fn events_until(
    rx: &mut EventReceiver,
    done: impl Fn(&LinkEvent) -> bool,
) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    loop {
        let ev = next_event(rx).await;
        let stop = done(&ev);
        seen.push(ev);
        if stop {
            return seen;
        }
    }
}

/// Everything already queued on the channel.
pub fn drain(rx: &mut EventReceiver) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        seen.push(ev);
    }
    seen
}

pub fn count_errors(events: &[LinkEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LinkEvent::Error(_)))
        .count()
}

pub fn readings(events: &[LinkEvent]) -> Vec<[u8; 9]> {
    events
        .iter()
        .filter_map(|e| match e {
            LinkEvent::Reading(r) => Some(r.raw),
            _ => None,
        })
        .collect()
}
