//! Recording session: the public surface of the pipeline.
//!
//! ## Lifecycle
//!
//! ```text
//! RecorderSession::create()
//!     └─► append_mic() / append_speaker()   (any producer thread)
//!         └─► finalize() → FinalizeResult   (drain, merge, diagnostics)
//!             └─► dispose()                 (idempotent cleanup)
//! ```
//!
//! ## Threading
//!
//! One `parking_lot::Mutex` serializes the whole
//! accumulate → guard → AEC → post → quantize → enqueue path; whichever
//! producer appended runs the drain cooperatively while holding it. The
//! writer thread is the only other actor and communicates exclusively
//! through its bounded queue.

mod finalize;

use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aec::{self, EchoCanceller, MAX_STREAM_DELAY_MS};
use crate::aligner::{FrameAligner, FramePair};
use crate::audio::{resample_linear, to_mono_f32, SourceFormat};
use crate::config::{BitDepth, SessionConfig};
use crate::diag::dumps::MonoDumps;
use crate::diag::{Diagnostics, DiagnosticsSnapshot, ToneCheck};
use crate::dsp::dither::Quantizer;
use crate::dsp::ChannelChain;
use crate::error::Result;
use crate::guard::{LeakageGuard, GUIDANCE};
use crate::writer::sink::{stereo_spec, EncodedFrame, WavSink};
use crate::writer::{path::segment_path, DurableWriter};

/// Everything a caller learns from a finished session.
#[derive(Debug, Clone)]
pub struct FinalizeResult {
    /// The merged artifact (the first segment's path).
    pub final_path: PathBuf,
    /// Every segment the writer produced, merged or not.
    pub segment_paths: Vec<PathBuf>,
    pub diagnostics: DiagnosticsSnapshot,
    /// Present when the test-tone check was requested.
    pub tone_check: Option<ToneCheck>,
}

/// One two-party recording. `Send + Sync`; share behind an `Arc` between
/// the mic and loopback feeders.
pub struct RecorderSession {
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    pipeline: Pipeline,
    writer: DurableWriter,
    finalized: Option<FinalizeResult>,
}

impl RecorderSession {
    /// Create the session, its initial segment, and the writer thread.
    ///
    /// This is the only place an I/O error escapes to the caller: if the
    /// initial sink cannot be created there is nothing to record into.
    pub fn create(cfg: SessionConfig, label: &str) -> Result<Self> {
        let mut cfg = cfg;
        cfg.normalize();

        let rate = cfg.recording.sample_rate;
        let frame_len = cfg.frame_samples();
        let initial_path = segment_path(&cfg.recording.output_dir, label, Utc::now());
        let spec = stereo_spec(rate, cfg.recording.bits_per_sample);
        let writer = DurableWriter::spawn(initial_path.clone(), WavSink::factory(spec))?;

        let aec = aec::select(&cfg.aec, rate, frame_len);
        let dumps = if cfg.diagnostics.enable_mono_dumps {
            match MonoDumps::create(&initial_path, rate) {
                Ok(dumps) => Some(dumps),
                Err(e) => {
                    warn!("mono dumps unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let capacity_hint = (rate as f32 * cfg.recording.pre_buffer_s) as usize;
        let discard_samples =
            (rate as u64 * u64::from(cfg.recording.discard_initial_ms) / 1000) as usize;

        info!(
            path = %initial_path.display(),
            sample_rate = rate,
            frame_len,
            aec = %aec.kind(),
            "recording session created"
        );

        let pipeline = Pipeline {
            frame_len,
            rate,
            depth: cfg.recording.bits_per_sample,
            aligner: FrameAligner::new(frame_len, cfg.dsp.frame_ms, capacity_hint),
            aec,
            guard: LeakageGuard::new(cfg.dsp.frame_ms),
            near_chain: ChannelChain::new(
                cfg.dsp.near_gain_db,
                &cfg.dsp,
                &cfg.filter,
                &cfg.limiter,
                rate,
            ),
            far_chain: ChannelChain::new(
                cfg.dsp.far_gain_db,
                &cfg.dsp,
                &cfg.filter,
                &cfg.limiter,
                rate,
            ),
            quantizer: Quantizer::new(&cfg.dither),
            diag: Diagnostics::new(),
            dumps,
            discard_near: discard_samples,
            discard_far: discard_samples,
            cfg,
        };

        Ok(Self {
            inner: Mutex::new(SessionInner {
                pipeline,
                writer,
                finalized: None,
            }),
        })
    }

    /// Append raw microphone bytes in `fmt`. Empty input is a no-op.
    pub fn append_mic(&self, bytes: &[u8], fmt: &SourceFormat) {
        self.append(Side::Near, bytes, fmt);
    }

    /// Append raw loopback (far-end) bytes in `fmt`. Empty input is a no-op.
    pub fn append_speaker(&self, bytes: &[u8], fmt: &SourceFormat) {
        self.append(Side::Far, bytes, fmt);
    }

    fn append(&self, side: Side, bytes: &[u8], fmt: &SourceFormat) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.finalized.is_some() {
            debug!("append after finalize ignored");
            return;
        }

        let SessionInner {
            pipeline, writer, ..
        } = &mut *inner;
        pipeline.ingest(side, bytes, fmt);
        for pair in pipeline.aligner.drain() {
            pipeline.handle_pair(pair, writer);
        }
    }

    /// Flush everything, close the artifact, and report. Later calls return
    /// the same result.
    pub fn finalize(&self) -> Result<FinalizeResult> {
        let mut inner = self.inner.lock();
        if let Some(ref result) = inner.finalized {
            return Ok(result.clone());
        }
        let result = finalize::run(&mut inner)?;
        inner.finalized = Some(result.clone());
        Ok(result)
    }

    /// Best-effort finalize that never fails. Safe to call repeatedly.
    pub fn dispose(&self) {
        if let Err(e) = self.finalize() {
            warn!("dispose: finalize failed: {e}");
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Near,
    Far,
}

struct Pipeline {
    frame_len: usize,
    rate: u32,
    depth: BitDepth,
    aligner: FrameAligner,
    aec: Box<dyn EchoCanceller>,
    guard: LeakageGuard,
    near_chain: ChannelChain,
    far_chain: ChannelChain,
    quantizer: Quantizer,
    diag: Diagnostics,
    dumps: Option<MonoDumps>,
    discard_near: usize,
    discard_far: usize,
    cfg: SessionConfig,
}

impl Pipeline {
    /// Normalize one producer's bytes and push them into the aligner.
    fn ingest(&mut self, side: Side, bytes: &[u8], fmt: &SourceFormat) {
        let mono = to_mono_f32(bytes, fmt);
        let mut samples = resample_linear(&mono, fmt.sample_rate, self.rate);

        let discard = match side {
            Side::Near => &mut self.discard_near,
            Side::Far => &mut self.discard_far,
        };
        if *discard > 0 {
            let take = (*discard).min(samples.len());
            samples.drain(..take);
            *discard -= take;
            if samples.is_empty() {
                return;
            }
        }

        match side {
            Side::Near => self.aligner.push_near(&samples),
            Side::Far => self.aligner.push_far(&samples),
        }
    }

    /// Run one aligned pair through guard, AEC, post-processing and the
    /// writer. Blocked pairs are dropped after the AEC has been fed so the
    /// canceller stays converged.
    fn handle_pair(&mut self, pair: FramePair, writer: &DurableWriter) {
        let FramePair {
            near,
            far,
            base_delay_ms,
            ..
        } = pair;

        self.guard.observe(&near, &far);

        let delay = base_delay_ms
            .saturating_add(i64::from(self.guard.delay_bump_ms()))
            .clamp(0, i64::from(MAX_STREAM_DELAY_MS)) as u16;
        self.aec.set_stream_delay_ms(delay);
        self.aec.feed_far(&far);
        let mut processed = vec![0.0f32; self.frame_len];
        self.aec.process_near(&near, &mut processed);

        self.diag.record_pair(&near, &processed, &far);

        let mut far_out = far;
        let clips_near = self.near_chain.process(&mut processed);
        let clips_far = self.far_chain.process(&mut far_out);
        self.diag.record_clips(clips_near, clips_far);

        if self.guard.blocked() {
            if self.guard.should_reissue_guidance() {
                warn!("recording blocked: {GUIDANCE}");
            }
        } else {
            writer.enqueue(self.encode(&processed, &far_out));
            if let Some(ref mut dumps) = self.dumps {
                dumps.write_pair(&near, &processed, &far_out);
            }
        }

        self.diag.maybe_log(self.aligner.reverse_fill(), delay);
    }

    /// Interleave and quantize one stereo frame for the writer.
    fn encode(&mut self, near: &[f32], far: &[f32]) -> EncodedFrame {
        match self.depth {
            BitDepth::Pcm16 => {
                let mut data = Vec::with_capacity(near.len() * 2);
                for i in 0..near.len() {
                    data.push(self.quantizer.quantize(near[i]));
                    data.push(self.quantizer.quantize(far[i]));
                }
                EncodedFrame::Pcm16(data)
            }
            BitDepth::Float32 => {
                let mut data = Vec::with_capacity(near.len() * 2);
                for i in 0..near.len() {
                    data.push(near[i]);
                    data.push(far[i]);
                }
                EncodedFrame::Float32(data)
            }
        }
    }
}
