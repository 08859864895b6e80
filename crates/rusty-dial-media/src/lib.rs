//! Per-call media runtime: transcript segmentation, turn-taking, barge-in,
//! the response pipeline and the STT/TTS adapters.

use std::time::Duration;

pub mod arbiter;
pub mod call;
pub mod chunker;
pub mod outbound;
pub mod pipeline;
pub mod segmenter;
pub mod stt;
pub mod tts_stream;
pub mod vad;

/// Sample rate of all call audio (16-bit mono PCM).
pub const SAMPLE_RATE: u32 = 16_000;

/// Playback length of a PCM16 mono buffer at [`SAMPLE_RATE`].
pub fn pcm_duration(bytes: usize) -> Duration {
    let samples = bytes as u64 / 2;
    Duration::from_micros(samples * 1_000_000 / u64::from(SAMPLE_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_duration() {
        assert_eq!(pcm_duration(32_000), Duration::from_secs(1));
        assert_eq!(pcm_duration(640), Duration::from_millis(20));
        assert_eq!(pcm_duration(0), Duration::ZERO);
    }
}
