//! Energy-based speech detection on 16-bit PCM.

use std::collections::VecDeque;

use rusty_dial_core::config::BargeInConfig;
use rusty_dial_core::types::AudioFrame;

/// RMS energy of a PCM frame.
pub fn frame_energy(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Speech boundary reported by [`EnergyVad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    SpeechStart,
    SpeechEnd,
}

/// Segments audio into speech/silence with a hangover of silent frames.
#[derive(Debug)]
pub struct EnergyVad {
    threshold: f64,
    hangover_frames: usize,
    active: bool,
    silent_run: usize,
}

impl EnergyVad {
    pub fn new(threshold: f64, hangover_frames: usize) -> Self {
        Self {
            threshold,
            hangover_frames: hangover_frames.max(1),
            active: false,
            silent_run: 0,
        }
    }

    pub fn push(&mut self, frame: &AudioFrame) -> Option<VadEdge> {
        let loud = frame_energy(&frame.samples) > self.threshold;
        match (self.active, loud) {
            (false, true) => {
                self.active = true;
                self.silent_run = 0;
                Some(VadEdge::SpeechStart)
            }
            (true, true) => {
                self.silent_run = 0;
                None
            }
            (true, false) => {
                self.silent_run += 1;
                if self.silent_run >= self.hangover_frames {
                    self.active = false;
                    self.silent_run = 0;
                    Some(VadEdge::SpeechEnd)
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Debounced caller-speech detector used for barge-in.
///
/// Confirms speech when at least `min_frames` of the last `window_frames`
/// frames are above the energy threshold and the newest frame is one of them,
/// so a single spike never triggers it.
#[derive(Debug)]
pub struct BargeInDetector {
    threshold: f64,
    window_frames: usize,
    min_frames: usize,
    window: VecDeque<bool>,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig) -> Self {
        let window_frames = config.window_frames.max(1);
        Self {
            threshold: config.energy_threshold,
            window_frames,
            min_frames: config.min_frames.clamp(1, window_frames),
            window: VecDeque::with_capacity(window_frames),
        }
    }

    /// Feed one frame; true when caller speech is confirmed.
    pub fn observe(&mut self, frame: &AudioFrame) -> bool {
        let loud = frame_energy(&frame.samples) > self.threshold;
        if self.window.len() == self.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(loud);
        loud && self.window.iter().filter(|l| **l).count() >= self.min_frames
    }

    /// Forget the window, e.g. when the agent takes the floor.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}
