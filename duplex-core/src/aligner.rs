//! Dual-stream frame alignment.
//!
//! Two producers append mono samples at the pipeline rate; the aligner pairs
//! them into fixed 10 ms frames. Emission is driven by the near side: a pair
//! goes out when both sides hold a full frame, or when near holds one and
//! the far shortfall is still within the allowed lead (the far frame is then
//! fabricated from zeros). Far-only data is never emitted on its own — it
//! accumulates as the echo canceller's reverse buffer, bounded at twice the
//! target occupancy.
//!
//! Pacing rule: the near side may run ahead of real far data by at most
//! [`MAX_NEAR_LEAD_FRAMES`] fabricated far frames in a row. Beyond that,
//! emission stalls until far data arrives or finalize pads the buffers.
//! This bounds the silent padding that would otherwise stretch playback
//! when the loopback side hiccups.

/// Consecutive zero-padded far frames allowed before emission stalls.
pub const MAX_NEAR_LEAD_FRAMES: u32 = 2;

/// Reverse-buffer occupancy the delay estimate is anchored to.
pub const TARGET_REVERSE_MS: u32 = 200;

/// One aligned 10 ms frame pair.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub near: Vec<f32>,
    pub far: Vec<f32>,
    /// True when the far side was fabricated from zeros.
    pub far_padded: bool,
    /// Occupancy-derived delay component in milliseconds, before the
    /// leakage bump and the `[0, 200]` clamp. Negative when the reverse
    /// buffer is underfilled.
    pub base_delay_ms: i64,
}

pub struct FrameAligner {
    frame_len: usize,
    frame_ms: u32,
    near: Vec<f32>,
    far: Vec<f32>,
    target_reverse_frames: usize,
    max_reverse_frames: usize,
    /// Consecutive zero-padded far frames since the last real far frame.
    pad_streak: u32,
    reverse_drops: u64,
    reverse_underruns: u64,
}

impl FrameAligner {
    pub fn new(frame_len: usize, frame_ms: u32, capacity_hint: usize) -> Self {
        let target_reverse_frames = (TARGET_REVERSE_MS / frame_ms.max(1)).max(1) as usize;
        Self {
            frame_len,
            frame_ms,
            near: Vec::with_capacity(capacity_hint),
            far: Vec::with_capacity(capacity_hint),
            target_reverse_frames,
            max_reverse_frames: target_reverse_frames * 2,
            pad_streak: 0,
            reverse_drops: 0,
            reverse_underruns: 0,
        }
    }

    pub fn push_near(&mut self, samples: &[f32]) {
        self.near.extend_from_slice(samples);
    }

    pub fn push_far(&mut self, samples: &[f32]) {
        self.far.extend_from_slice(samples);
    }

    pub fn reverse_drops(&self) -> u64 {
        self.reverse_drops
    }

    pub fn reverse_underruns(&self) -> u64 {
        self.reverse_underruns
    }

    /// Current reverse-buffer occupancy in whole frames.
    pub fn reverse_fill(&self) -> usize {
        self.far.len() / self.frame_len
    }

    pub fn target_reverse_frames(&self) -> usize {
        self.target_reverse_frames
    }

    /// Buffered-but-unemitted samples per side (for finalize padding).
    pub fn buffered_len(&self) -> (usize, usize) {
        (self.near.len(), self.far.len())
    }

    /// Emit as many aligned pairs as the pacing rule allows.
    pub fn drain(&mut self) -> Vec<FramePair> {
        let frame = self.frame_len;
        let mut pairs = Vec::new();

        loop {
            // Keep the reverse buffer bounded even when nothing is emitted.
            while self.far.len() / frame > self.max_reverse_frames {
                self.far.drain(..frame);
                self.reverse_drops += 1;
            }

            if self.near.len() < frame {
                break;
            }
            let far_full = self.far.len() >= frame;
            if !far_full && self.pad_streak >= MAX_NEAR_LEAD_FRAMES {
                // Near is hoarding; wait for the far side to catch up.
                break;
            }

            let near: Vec<f32> = self.near.drain(..frame).collect();
            let (far, far_padded) = if far_full {
                self.pad_streak = 0;
                (self.far.drain(..frame).collect(), false)
            } else {
                self.pad_streak += 1;
                self.reverse_underruns += 1;
                (vec![0.0; frame], true)
            };

            let occupancy = (self.far.len() / frame) as i64;
            let base_delay_ms =
                (occupancy - self.target_reverse_frames as i64) * self.frame_ms as i64;

            pairs.push(FramePair {
                near,
                far,
                far_padded,
                base_delay_ms,
            });
        }

        pairs
    }

    /// Zero-pad both sides to a common frame-aligned length so every
    /// buffered sample can drain. Called once by finalize.
    pub fn pad_to_flush(&mut self) {
        let frame = self.frame_len;
        let longest = self.near.len().max(self.far.len());
        if longest == 0 {
            return;
        }
        let padded = longest.div_ceil(frame) * frame;
        self.near.resize(padded, 0.0);
        self.far.resize(padded, 0.0);
        self.pad_streak = 0;
    }
}
