//! Raw byte decode and channel downmix.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wire encoding of capture bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// 32-bit IEEE float, little-endian.
    F32,
    /// 16-bit signed PCM, little-endian.
    I16,
    /// Anything the capture layer reported that we do not recognise.
    /// Decoded as float32 on a best-effort basis.
    #[serde(other)]
    Unknown,
}

impl SampleEncoding {
    /// Map a WAVE format tag to an encoding. `1` is integer PCM, `3` is
    /// IEEE float; everything else lands on [`SampleEncoding::Unknown`].
    pub fn from_format_tag(tag: u16) -> Self {
        match tag {
            1 => SampleEncoding::I16,
            3 => SampleEncoding::F32,
            _ => SampleEncoding::Unknown,
        }
    }
}

/// Format descriptor for one capture side, supplied with every append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFormat {
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SourceFormat {
    pub fn new(encoding: SampleEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channels,
        }
    }
}

/// Decode raw device bytes into mono f32 at the *source* rate.
///
/// Multi-channel input is downmixed by arithmetic mean per frame. A trailing
/// partial frame (fewer bytes than one full multi-channel frame) is dropped.
/// Zero-length input yields empty output. Unknown encodings are treated as
/// float32 with the same best-effort downmix.
pub fn to_mono_f32(bytes: &[u8], fmt: &SourceFormat) -> Vec<f32> {
    let channels = usize::from(fmt.channels.max(1));
    let decoded: Vec<f32> = match fmt.encoding {
        SampleEncoding::F32 | SampleEncoding::Unknown => {
            if fmt.encoding == SampleEncoding::Unknown {
                debug!("unknown sample encoding, decoding as float32");
            }
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }
        SampleEncoding::I16 => bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
            .collect(),
    };

    if channels == 1 {
        return decoded;
    }

    let frames = decoded.len() / channels;
    let mut mono = Vec::with_capacity(frames);
    for f in 0..frames {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += decoded[base + c];
        }
        mono.push(sum / channels as f32);
    }
    mono
}
