//! Local voice-activity detection
//!
//! Hysteresis over a moving average: the detector reports only transitions,
//! never per-sample state, so the control channel carries one message when
//! speech starts and one when it stops.

use crate::config::VoiceActivityConfig;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    window: VecDeque<f32>,
    window_len: usize,
    release_samples: u32,
    quiet_run: u32,
    speaking: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: &VoiceActivityConfig) -> Self {
        let window_len = config.smoothing_window.max(1);
        Self {
            threshold: config.threshold,
            window: VecDeque::with_capacity(window_len),
            window_len,
            release_samples: config.release_samples,
            quiet_run: 0,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Smoothed level over the current window
    pub fn average(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    /// Feed one amplitude sample
    ///
    /// Returns `Some(new_state)` only when the speaking state changes.
    pub fn push(&mut self, level: f32) -> Option<bool> {
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(level.max(0.0));

        let loud = self.average() > self.threshold;

        if self.speaking {
            if loud {
                self.quiet_run = 0;
                return None;
            }
            self.quiet_run += 1;
            if self.quiet_run < self.release_samples {
                return None;
            }
            self.speaking = false;
            self.quiet_run = 0;
            Some(false)
        } else if loud {
            self.speaking = true;
            self.quiet_run = 0;
            Some(true)
        } else {
            None
        }
    }

    /// Drop history, e.g. when the microphone is disabled
    pub fn reset(&mut self) -> Option<bool> {
        self.window.clear();
        self.quiet_run = 0;
        if self.speaking {
            self.speaking = false;
            Some(false)
        } else {
            None
        }
    }
}
