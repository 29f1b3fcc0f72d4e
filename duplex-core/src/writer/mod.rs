//! Durable background writer.
//!
//! Producers enqueue encoded frames without blocking; a dedicated thread
//! owns the sink and writes in enqueue order with a periodic flush. A write
//! error rotates the sink to a fresh `-recovery{N}` segment with the same
//! format and the recording continues. Frames are lost only when recovery
//! itself fails repeatedly, and every loss is counted and logged.

pub mod path;
pub mod sink;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{DuplexError, Result};

use self::sink::{EncodedFrame, SampleSink, SinkFactory};

/// Bounded queue depth; ~10 s of audio at 10 ms framing.
const QUEUE_CAPACITY: usize = 1024;
/// Frames between flushes (~100 ms at 10 ms framing).
const FLUSH_INTERVAL_FRAMES: u32 = 10;
/// Sink-open attempts per recovery round.
const RECOVERY_ATTEMPTS: u32 = 3;
/// Pause between attempts within a round.
const RECOVERY_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Cooldown before a later enqueue retries a failed recovery round.
const RECOVERY_COOLDOWN: Duration = Duration::from_millis(200);

enum Command {
    Frame(EncodedFrame),
    Finalize(Sender<()>),
}

/// Handle owned by the session; the thread behind it owns the sink.
#[derive(Debug)]
pub struct DurableWriter {
    tx: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
    segments: Arc<Mutex<Vec<PathBuf>>>,
    dropped_frames: Arc<AtomicU64>,
}

impl DurableWriter {
    /// Create the initial segment and start the writer thread.
    ///
    /// Failing to open the very first sink is the one unrecoverable error
    /// a session can hit.
    pub fn spawn(initial_path: PathBuf, factory: SinkFactory) -> Result<Self> {
        if let Some(parent) = initial_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let first_sink = factory(&initial_path).map_err(|source| DuplexError::SinkCreate {
            path: initial_path.clone(),
            source,
        })?;

        let segments = Arc::new(Mutex::new(vec![initial_path.clone()]));
        let dropped_frames = Arc::new(AtomicU64::new(0));
        let (tx, rx) = bounded(QUEUE_CAPACITY);

        let state = WriterState {
            rx,
            sink: Some(first_sink),
            factory,
            base_path: initial_path,
            segments: Arc::clone(&segments),
            dropped_frames: Arc::clone(&dropped_frames),
            recovery_index: 0,
            frames_since_flush: 0,
            cooldown_until: None,
        };
        let handle = std::thread::Builder::new()
            .name("duplex-writer".into())
            .spawn(move || state.run())?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            segments,
            dropped_frames,
        })
    }

    /// Hand one frame to the writer thread. Never blocks the producer: a
    /// full queue (~10 s of backlog) drops the frame and counts the loss.
    pub fn enqueue(&self, frame: EncodedFrame) {
        let Some(ref tx) = self.tx else {
            return;
        };
        if tx.try_send(Command::Frame(frame)).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            warn!("writer queue saturated, frame dropped");
        }
    }

    pub fn segments(&self) -> Vec<PathBuf> {
        self.segments.lock().clone()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Drain the queue within `timeout`, close the sink, and return the
    /// segment list. Safe to call more than once.
    pub fn finalize(&mut self, timeout: Duration) -> Vec<PathBuf> {
        if let Some(tx) = self.tx.take() {
            let (ack_tx, ack_rx) = bounded(1);
            let drained = tx.send(Command::Finalize(ack_tx)).is_ok()
                && ack_rx.recv_timeout(timeout).is_ok();
            drop(tx);
            if drained {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            } else {
                // Drain window expired: leave the thread to finish in the
                // background and report what reached disk.
                warn!("writer drain window expired, queued frames may be lost");
                self.handle.take();
            }
        }
        self.segments.lock().clone()
    }
}

impl Drop for DurableWriter {
    fn drop(&mut self) {
        self.finalize(Duration::from_secs(5));
    }
}

struct WriterState {
    rx: Receiver<Command>,
    sink: Option<Box<dyn SampleSink>>,
    factory: SinkFactory,
    base_path: PathBuf,
    segments: Arc<Mutex<Vec<PathBuf>>>,
    dropped_frames: Arc<AtomicU64>,
    recovery_index: u32,
    frames_since_flush: u32,
    cooldown_until: Option<Instant>,
}

impl WriterState {
    fn run(mut self) {
        loop {
            match self.rx.recv() {
                Ok(Command::Frame(frame)) => self.write_frame(frame),
                Ok(Command::Finalize(ack)) => {
                    self.close_sink();
                    let _ = ack.send(());
                    return;
                }
                // All senders gone: close and exit.
                Err(_) => {
                    self.close_sink();
                    return;
                }
            }
        }
    }

    fn write_frame(&mut self, frame: EncodedFrame) {
        let write_result = match self.sink.as_mut() {
            Some(sink) => sink.write_frame(&frame),
            None => {
                match self.cooldown_until {
                    Some(until) if Instant::now() < until => {
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.cooldown_until = None;
                        self.recover(Some(frame));
                    }
                }
                return;
            }
        };

        match write_result {
            Ok(()) => {
                self.frames_since_flush += 1;
                if self.frames_since_flush >= FLUSH_INTERVAL_FRAMES {
                    self.frames_since_flush = 0;
                    let flushed = match self.sink.as_mut() {
                        Some(sink) => sink.flush(),
                        None => Ok(()),
                    };
                    if let Err(e) = flushed {
                        error!("flush failed ({e}), rotating to recovery segment");
                        self.rotate_sink();
                        self.recover(None);
                    }
                }
            }
            Err(e) => {
                error!("write failed ({e}), rotating to recovery segment");
                self.rotate_sink();
                self.recover(Some(frame));
            }
        }
    }

    /// Flush and close the current sink, ignoring errors: the sink is
    /// already suspect when this is called.
    fn rotate_sink(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.finalize() {
                warn!("failed segment also failed to close: {e}");
            }
        }
    }

    fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush() {
                warn!("final flush failed: {e}");
            }
            if let Err(e) = sink.finalize() {
                warn!("final close failed: {e}");
            }
        }
    }

    /// Open the next recovery segment; `pending` is re-written there first.
    fn recover(&mut self, mut pending: Option<EncodedFrame>) {
        for _ in 0..RECOVERY_ATTEMPTS {
            self.recovery_index += 1;
            let recovery = path::recovery_path(&self.base_path, self.recovery_index);
            match (self.factory)(&recovery) {
                Ok(mut new_sink) => {
                    if let Some(ref frame) = pending {
                        if let Err(e) = new_sink.write_frame(frame) {
                            warn!("recovery segment rejected the pending frame: {e}");
                            let _ = new_sink.finalize();
                            std::thread::sleep(RECOVERY_RETRY_DELAY);
                            continue;
                        }
                        pending = None;
                    }
                    info!(segment = %recovery.display(), "recovered into new segment");
                    self.segments.lock().push(recovery);
                    self.sink = Some(new_sink);
                    self.frames_since_flush = 0;
                    return;
                }
                Err(e) => {
                    warn!(
                        segment = %recovery.display(),
                        "failed to open recovery segment: {e}"
                    );
                    std::thread::sleep(RECOVERY_RETRY_DELAY);
                }
            }
        }

        // Recovery failed repeatedly: this is the only sanctioned
        // frame-loss path. Back off until a later frame retries.
        if pending.is_some() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.cooldown_until = Some(Instant::now() + RECOVERY_COOLDOWN);
        error!("recovery failed repeatedly, dropping frames until the sink heals");
    }
}
