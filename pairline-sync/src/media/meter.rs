//! Local audio metering for the speaking indicator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::backend::AudioSampler;
use super::manager::MediaInput;
use crate::config::MediaConfig;

/// Root mean square of a sample window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Threshold with a release delay, so short pauses between words do not
/// flicker the indicator.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold: f32,
    release_ticks: u32,
    quiet_ticks: u32,
    speaking: bool,
}

impl SpeakingDetector {
    pub fn new(threshold: f32, release_ticks: u32) -> Self {
        Self {
            threshold,
            release_ticks,
            quiet_ticks: 0,
            speaking: false,
        }
    }

    /// Feed one level; returns the new state when it changes.
    pub fn update(&mut self, level: f32) -> Option<bool> {
        if level >= self.threshold {
            self.quiet_ticks = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
        } else if self.speaking {
            self.quiet_ticks += 1;
            if self.quiet_ticks >= self.release_ticks {
                self.speaking = false;
                self.quiet_ticks = 0;
                return Some(false);
            }
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

/// Owns the sampling task. Each `arm` starts a new generation; results
/// from older generations are discarded by [`AudioMeter::accept`].
pub struct AudioMeter {
    interval: Duration,
    window: usize,
    threshold: f32,
    release_ticks: u32,
    generation: u64,
    task: Option<JoinHandle<()>>,
    speaking: bool,
}

impl AudioMeter {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            interval: config.meter_interval(),
            window: config.meter_window.max(1),
            threshold: config.speaking_threshold,
            release_ticks: config.speaking_release_ticks,
            generation: 0,
            task: None,
            speaking: false,
        }
    }

    /// (Re)start sampling from `sampler`.
    pub fn arm(&mut self, sampler: Arc<dyn AudioSampler>, inputs: mpsc::UnboundedSender<MediaInput>) {
        self.disarm();
        let generation = self.generation;
        let interval = self.interval;
        let mut buf = vec![0.0f32; self.window];
        let mut detector = SpeakingDetector::new(self.threshold, self.release_ticks);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let n = sampler.read(&mut buf);
                if let Some(speaking) = detector.update(rms(&buf[..n])) {
                    if inputs.send(MediaInput::Speaking { generation, speaking }).is_err() {
                        break;
                    }
                }
            }
        }));
        log::debug!("Audio meter armed (generation {generation})");
    }

    /// Stop sampling. Returns true when the indicator was on and must be
    /// cleared by the caller.
    pub fn disarm(&mut self) -> bool {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
        std::mem::replace(&mut self.speaking, false)
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Apply a report from the sampling task. Stale generations are ignored.
    pub fn accept(&mut self, generation: u64, speaking: bool) -> Option<bool> {
        if self.task.is_none() || generation != self.generation || speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }
}

impl Drop for AudioMeter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ToneSampler;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_detector_hysteresis() {
        let mut detector = SpeakingDetector::new(0.02, 3);
        assert_eq!(detector.update(0.01), None);
        assert_eq!(detector.update(0.05), Some(true));
        assert_eq!(detector.update(0.0), None);
        assert_eq!(detector.update(0.0), None);
        // Speech resumes before the release delay.
        assert_eq!(detector.update(0.03), None);
        assert_eq!(detector.update(0.0), None);
        assert_eq!(detector.update(0.0), None);
        assert_eq!(detector.update(0.0), Some(false));
        assert!(!detector.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_reports_speaking() {
        let config = MediaConfig::default();
        let tone = Arc::new(ToneSampler::new(0.5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut meter = AudioMeter::new(&config);
        meter.arm(tone.clone(), tx);

        match rx.recv().await {
            Some(MediaInput::Speaking { generation, speaking: true }) => {
                assert_eq!(meter.accept(generation, true), Some(true));
            }
            other => panic!("expected speaking, got {other:?}"),
        }

        tone.set_amplitude(0.0);
        match rx.recv().await {
            Some(MediaInput::Speaking { generation, speaking: false }) => {
                assert_eq!(meter.accept(generation, false), Some(false));
            }
            other => panic!("expected silence, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_discards_old_generation() {
        let config = MediaConfig::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut meter = AudioMeter::new(&config);
        meter.arm(Arc::new(ToneSampler::new(0.5)), tx.clone());
        let old = meter.generation;
        meter.arm(Arc::new(ToneSampler::new(0.5)), tx);

        assert_eq!(meter.accept(old, true), None);
        assert!(meter.is_armed());
        assert!(!meter.disarm());
        assert!(!meter.is_armed());
    }
}
