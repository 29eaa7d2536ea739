use std::collections::VecDeque;
use std::f32::consts::TAU;

use crate::distortion::DistortionCurve;
use crate::error::AeolusError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterKind {
    BandPass,
    LowPass,
}

/// One stage of the signal path, declaratively. A valid chain has at least
/// one filter stage and at most one tail effect (reverb or distortion);
/// the master gain is always implicit at the end.
#[derive(Debug, Clone, PartialEq)]
pub enum StageConfig {
    Filter { kind: FilterKind, frequency: f32, q: f32 },
    Reverb { delay: f32, feedback: f32, cutoff: f32 },
    Distortion { amount: f32 },
    Tone { frequency: f32 },
}

impl StageConfig {
    pub fn bandpass(frequency: f32, q: f32) -> Self {
        StageConfig::Filter { kind: FilterKind::BandPass, frequency, q }
    }

    pub fn lowpass(frequency: f32, q: f32) -> Self {
        StageConfig::Filter { kind: FilterKind::LowPass, frequency, q }
    }

    pub fn reverb() -> Self {
        StageConfig::Reverb { delay: 0.3, feedback: 0.5, cutoff: 2000.0 }
    }

    pub fn distortion(amount: f32) -> Self {
        StageConfig::Distortion { amount }
    }

    pub fn tone(frequency: f32) -> Self {
        StageConfig::Tone { frequency }
    }

    fn is_filter(&self) -> bool {
        matches!(self, StageConfig::Filter { .. })
    }

    fn is_tail(&self) -> bool {
        matches!(self, StageConfig::Reverb { .. } | StageConfig::Distortion { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    pub stages: Vec<StageConfig>,
    pub master_gain: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            stages: vec![
                StageConfig::bandpass(400.0, 10.0),
                StageConfig::bandpass(800.0, 10.0),
                StageConfig::bandpass(1600.0, 10.0),
                StageConfig::reverb(),
            ],
            master_gain: 0.5,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<(), AeolusError> {
        let filters = self.stages.iter().filter(|s| s.is_filter()).count();
        if filters == 0 {
            return Err(AeolusError::InvalidConfig("graph needs at least one filter stage".to_string()));
        }
        let tails = self.stages.iter().filter(|s| s.is_tail()).count();
        if tails > 1 {
            return Err(AeolusError::InvalidConfig("graph allows at most one tail effect".to_string()));
        }
        for stage in &self.stages {
            match *stage {
                StageConfig::Filter { frequency, q, .. } => {
                    if frequency <= 0.0 || q <= 0.0 {
                        return Err(AeolusError::InvalidConfig(
                            "filter frequency and Q must be positive".to_string(),
                        ));
                    }
                }
                StageConfig::Reverb { delay, feedback, cutoff } => {
                    if delay <= 0.0 || cutoff <= 0.0 || !(0.0..1.0).contains(&feedback) {
                        return Err(AeolusError::InvalidConfig(
                            "reverb needs positive delay/cutoff and feedback in [0, 1)".to_string(),
                        ));
                    }
                }
                StageConfig::Distortion { amount } => {
                    if amount < 0.0 {
                        return Err(AeolusError::InvalidConfig("distortion amount must be >= 0".to_string()));
                    }
                }
                StageConfig::Tone { frequency } => {
                    if frequency <= 0.0 {
                        return Err(AeolusError::InvalidConfig("tone frequency must be positive".to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

// Biquad coefficients, normalized by a0
#[derive(Debug, Clone, Copy, Default)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

#[derive(Debug)]
struct FilterStage {
    kind: FilterKind,
    frequency: f32,
    q: f32,
    sample_rate: f32,
    coeffs: BiquadCoeffs,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl FilterStage {
    fn new(kind: FilterKind, frequency: f32, q: f32, sample_rate: f32) -> Self {
        let mut stage = FilterStage {
            kind,
            frequency,
            q,
            sample_rate,
            coeffs: BiquadCoeffs::default(),
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        stage.recompute();
        stage
    }

    fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency;
        self.recompute();
    }

    fn set_q(&mut self, q: f32) {
        self.q = q;
        self.recompute();
    }

    // Audio EQ cookbook coefficients; recomputed on parameter change,
    // never per sample
    fn recompute(&mut self) {
        let frequency = self.frequency.clamp(1.0, 0.45 * self.sample_rate);
        let q = self.q.max(0.1);
        let omega = TAU * frequency / self.sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let (b0, b1, b2, a0, a1, a2) = match self.kind {
            FilterKind::LowPass => (
                (1.0 - cos_omega) / 2.0,
                1.0 - cos_omega,
                (1.0 - cos_omega) / 2.0,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
            FilterKind::BandPass => (
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
        };

        self.coeffs = BiquadCoeffs {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        };
    }

    fn process(&mut self, input: f32) -> f32 {
        let c = self.coeffs;
        let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }
}

// Feedback delay line with a one-pole lowpass in the feedback path.
// Only the wet (delayed) signal continues down the chain.
#[derive(Debug)]
struct ReverbStage {
    feedback: f32,
    lowpass_coef: f32,
    lowpass_state: f32,
    buffer: VecDeque<f32>,
}

impl ReverbStage {
    fn new(delay: f32, feedback: f32, cutoff: f32, sample_rate: f32) -> Self {
        let delay_samples = ((delay * sample_rate) as usize).max(1);
        ReverbStage {
            feedback,
            lowpass_coef: 1.0 - (-TAU * cutoff / sample_rate).exp(),
            lowpass_state: 0.0,
            buffer: VecDeque::from(vec![0.0; delay_samples]),
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer.back().copied().unwrap_or(0.0);
        self.lowpass_state += (delayed - self.lowpass_state) * self.lowpass_coef;
        cycle_buffer(&mut self.buffer, input + self.lowpass_state * self.feedback);
        delayed
    }
}

#[derive(Debug)]
struct DistortionStage {
    curve: DistortionCurve,
}

#[derive(Debug)]
struct ToneStage {
    frequency: f32,
    phase: f32,
    sample_rate: f32,
}

impl ToneStage {
    fn process(&mut self, input: f32) -> f32 {
        let tone = (self.phase * TAU).sin();
        self.phase += self.frequency / self.sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        (input + tone) / 2.0
    }
}

#[derive(Debug)]
enum Stage {
    Filter(FilterStage),
    Reverb(ReverbStage),
    Distortion(DistortionStage),
    Tone(ToneStage),
}

impl Stage {
    fn process(&mut self, input: f32) -> f32 {
        match self {
            Stage::Filter(f) => f.process(input),
            Stage::Reverb(r) => r.process(input),
            Stage::Distortion(d) => d.curve.shape(input),
            Stage::Tone(t) => t.process(input),
        }
    }
}

// Master gain with a linear ramp-to-target, for click-free mute/unmute
#[derive(Debug)]
struct GainRamp {
    current: f32,
    target: f32,
    step: f32,
}

impl GainRamp {
    fn at(gain: f32) -> Self {
        GainRamp { current: gain, target: gain, step: 0.0 }
    }

    fn set(&mut self, gain: f32) {
        self.current = gain;
        self.target = gain;
        self.step = 0.0;
    }

    fn ramp(&mut self, target: f32, seconds: f32, sample_rate: f32) {
        self.target = target;
        let samples = (seconds * sample_rate).max(1.0);
        self.step = (target - self.current).abs() / samples;
    }

    fn next(&mut self) -> f32 {
        if self.current < self.target {
            self.current = (self.current + self.step).min(self.target);
        } else if self.current > self.target {
            self.current = (self.current - self.step).max(self.target);
        }
        self.current
    }
}

/// The wired signal path: every stage of a validated `GraphConfig` plus the
/// master gain, processed in order for each source sample.
#[derive(Debug)]
pub struct EffectGraph {
    sample_rate: f32,
    stages: Vec<Stage>,
    gain: GainRamp,
}

impl EffectGraph {
    pub fn build(config: &GraphConfig, sample_rate: f32) -> Result<Self, AeolusError> {
        if sample_rate <= 0.0 {
            return Err(AeolusError::InvalidConfig("sample rate must be positive".to_string()));
        }
        config.validate()?;

        let stages = config
            .stages
            .iter()
            .map(|stage| match *stage {
                StageConfig::Filter { kind, frequency, q } => {
                    Stage::Filter(FilterStage::new(kind, frequency, q, sample_rate))
                }
                StageConfig::Reverb { delay, feedback, cutoff } => {
                    Stage::Reverb(ReverbStage::new(delay, feedback, cutoff, sample_rate))
                }
                StageConfig::Distortion { amount } => {
                    Stage::Distortion(DistortionStage { curve: DistortionCurve::build(amount) })
                }
                StageConfig::Tone { frequency } => {
                    Stage::Tone(ToneStage { frequency, phase: 0.0, sample_rate })
                }
            })
            .collect();

        Ok(EffectGraph {
            sample_rate,
            stages,
            gain: GainRamp::at(config.master_gain.clamp(0.0, 1.0)),
        })
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let mut sample = input;
        for stage in &mut self.stages {
            sample = stage.process(sample);
        }
        sample * self.gain.next()
    }

    pub fn filter_count(&self) -> usize {
        self.stages.iter().filter(|s| matches!(s, Stage::Filter(_))).count()
    }

    /// Set the center frequency of the nth filter stage. Out-of-range
    /// indices are guarded no-ops.
    pub fn set_filter_frequency(&mut self, index: usize, frequency: f32) {
        if let Some(filter) = self.nth_filter_mut(index) {
            filter.set_frequency(frequency);
        }
    }

    pub fn set_filter_q(&mut self, index: usize, q: f32) {
        if let Some(filter) = self.nth_filter_mut(index) {
            filter.set_q(q);
        }
    }

    pub fn filter_frequency(&self, index: usize) -> Option<f32> {
        self.nth_filter(index).map(|f| f.frequency)
    }

    pub fn filter_q(&self, index: usize) -> Option<f32> {
        self.nth_filter(index).map(|f| f.q)
    }

    pub fn has_distortion(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Distortion(_)))
    }

    /// Rebuilds the waveshaper table; the curve is a pure function of the
    /// amount so no incremental update exists.
    pub fn set_distortion_amount(&mut self, amount: f32) {
        for stage in &mut self.stages {
            if let Stage::Distortion(d) = stage {
                d.curve = DistortionCurve::build(amount);
            }
        }
    }

    pub fn distortion_amount(&self) -> Option<f32> {
        self.stages.iter().find_map(|s| match s {
            Stage::Distortion(d) => Some(d.curve.amount()),
            _ => None,
        })
    }

    pub fn set_tone_frequency(&mut self, frequency: f32) {
        for stage in &mut self.stages {
            if let Stage::Tone(t) = stage {
                t.frequency = frequency;
            }
        }
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.gain.set(gain.clamp(0.0, 1.0));
    }

    pub fn ramp_master_gain(&mut self, target: f32, seconds: f32) {
        self.gain.ramp(target.clamp(0.0, 1.0), seconds, self.sample_rate);
    }

    pub fn master_gain(&self) -> f32 {
        self.gain.current
    }

    pub fn master_gain_target(&self) -> f32 {
        self.gain.target
    }

    fn nth_filter(&self, index: usize) -> Option<&FilterStage> {
        self.stages
            .iter()
            .filter_map(|s| match s {
                Stage::Filter(f) => Some(f),
                _ => None,
            })
            .nth(index)
    }

    fn nth_filter_mut(&mut self, index: usize) -> Option<&mut FilterStage> {
        self.stages
            .iter_mut()
            .filter_map(|s| match s {
                Stage::Filter(f) => Some(f),
                _ => None,
            })
            .nth(index)
    }
}

#[inline]
fn cycle_buffer(buffer: &mut VecDeque<f32>, new_value: f32) {
    buffer.pop_back();
    buffer.push_front(new_value);
}
