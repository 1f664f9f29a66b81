//! Audio feedback for Thattia-PI HAL
//! Maps signal strength to a continuous tone and synthesizes PCM for it

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output format for signed 16-bit PCM
#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub sample_rate: u32,
    /// Interleaved channel count; zero is treated as mono
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Generate a sine tone at constant gain
    pub fn render(&self, tone: &Tone, duration: Duration) -> Vec<i16> {
        self.synthesize(tone.frequency_hz, duration, |_| tone.volume)
    }

    /// Generate a beep with an exponential gain ramp
    pub fn render_beep(&self, beep: &Beep) -> Vec<i16> {
        let total = beep.duration.as_secs_f64().max(f64::EPSILON);
        let ratio = beep.end_gain / beep.start_gain;

        self.synthesize(beep.frequency_hz, beep.duration, |t| {
            beep.start_gain * ratio.powf(t / total)
        })
    }

    fn synthesize(&self, frequency: f64, duration: Duration, gain: impl Fn(f64) -> f64) -> Vec<i16> {
        let num_frames = (self.sample_rate as f64 * duration.as_secs_f64()) as usize;
        let channels = usize::from(self.channels.max(1));
        let mut samples = Vec::with_capacity(num_frames * channels);

        for i in 0..num_frames {
            let t = i as f64 / self.sample_rate as f64;
            let sample = (2.0 * std::f64::consts::PI * frequency * t).sin() * gain(t).clamp(0.0, 1.0);
            let sample = (sample * 32767.0) as i16;
            samples.extend(std::iter::repeat(sample).take(channels));
        }

        samples
    }
}

/// RMS level of a PCM buffer
pub fn rms_level(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();

    (sum / samples.len() as f64).sqrt()
}

/// Continuous feedback tone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub frequency_hz: f64,
    /// Linear gain, 0.0 - 0.5
    pub volume: f64,
}

/// One-shot beep with a decaying envelope
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beep {
    pub frequency_hz: f64,
    pub duration: Duration,
    pub start_gain: f64,
    pub end_gain: f64,
}

/// Percentage to tone mapping. Pitch and volume are monotonic in percentage.
#[derive(Debug, Clone)]
pub struct ToneMapper {
    /// Below this percentage the tone is silent
    pub silence_below: f64,
    pub base_hz: f64,
    pub hz_per_percent: f64,
    pub volume_divisor: f64,
}

impl Default for ToneMapper {
    fn default() -> Self {
        Self {
            silence_below: 5.0,
            base_hz: 200.0,
            hz_per_percent: 10.0,
            volume_divisor: 200.0,
        }
    }
}

impl ToneMapper {
    /// Tone for the given signal percentage, or `None` when silent
    pub fn tone_for(&self, percentage: f64, enabled: bool) -> Option<Tone> {
        if !enabled || !percentage.is_finite() || percentage < self.silence_below {
            return None;
        }

        let p = percentage.min(100.0);
        Some(Tone {
            frequency_hz: self.base_hz + p * self.hz_per_percent,
            volume: p / self.volume_divisor,
        })
    }

    /// Confirmation beep played after ground calibration
    pub fn calibration_beep(&self) -> Beep {
        Beep {
            frequency_hz: 800.0,
            duration: Duration::from_millis(150),
            start_gain: 0.3,
            end_gain: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_below_threshold_or_when_disabled() {
        let mapper = ToneMapper::default();
        assert_eq!(mapper.tone_for(0.0, true), None);
        assert_eq!(mapper.tone_for(4.9, true), None);
        assert_eq!(mapper.tone_for(80.0, false), None);
        assert_eq!(mapper.tone_for(f64::NAN, true), None);
    }

    #[test]
    fn pitch_and_volume_follow_signal() {
        let mapper = ToneMapper::default();

        let low = mapper.tone_for(10.0, true).unwrap();
        let high = mapper.tone_for(90.0, true).unwrap();
        assert_eq!(low.frequency_hz, 300.0);
        assert_eq!(high.frequency_hz, 1100.0);
        assert!(high.volume > low.volume);

        let full = mapper.tone_for(250.0, true).unwrap();
        assert_eq!(full.frequency_hz, 1200.0);
        assert_eq!(full.volume, 0.5);
    }

    #[test]
    fn louder_tone_renders_with_more_energy() {
        let mapper = ToneMapper::default();
        let format = AudioFormat::default();
        let duration = Duration::from_millis(50);

        let quiet = format.render(&mapper.tone_for(10.0, true).unwrap(), duration);
        let loud = format.render(&mapper.tone_for(90.0, true).unwrap(), duration);

        assert_eq!(quiet.len(), 2205);
        assert!(rms_level(&loud) > rms_level(&quiet));
    }

    #[test]
    fn stereo_interleaves_identical_frames() {
        let tone = ToneMapper::default().tone_for(60.0, true).unwrap();
        let duration = Duration::from_millis(20);
        let mono = AudioFormat::default().render(&tone, duration);
        let stereo = AudioFormat {
            channels: 2,
            ..Default::default()
        }
        .render(&tone, duration);

        assert_eq!(stereo.len(), mono.len() * 2);
        for (frame, sample) in stereo.chunks(2).zip(&mono) {
            assert_eq!(frame, &[*sample, *sample]);
        }

        let zero = AudioFormat {
            channels: 0,
            ..Default::default()
        };
        assert_eq!(zero.render(&tone, duration), mono);
    }

    #[test]
    fn calibration_beep_decays() {
        let format = AudioFormat::default();
        let beep = ToneMapper::default().calibration_beep();
        let samples = format.render_beep(&beep);

        let quarter = samples.len() / 4;
        let head = rms_level(&samples[..quarter]);
        let tail = rms_level(&samples[samples.len() - quarter..]);
        assert!(head > tail * 2.0);
    }
}
