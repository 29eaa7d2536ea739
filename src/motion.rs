use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::engine::PlaybackSession;
use crate::error::AeolusError;
use crate::graph::{EffectGraph, GraphConfig, StageConfig};

/// Raw device tilt reading: beta is forward/back, gamma left/right,
/// both in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationSample {
    pub beta: f32,
    pub gamma: f32,
}

/// Running smoothed projection of the orientation magnitudes. Lives in the
/// playback session, so a fresh session starts from zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SmoothedOrientation {
    pub pitch: f32,
    pub roll: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Smoothing {
    /// Raw values are applied directly each sample.
    Off,
    /// smoothed += (value - smoothed) * alpha
    Exponential { alpha: f32 },
}

impl Default for Smoothing {
    fn default() -> Self {
        Smoothing::Exponential { alpha: 0.1 }
    }
}

/// Which projection of the orientation feeds a mapped parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionInput {
    Pitch,
    Roll,
    Combined,
}

impl MotionInput {
    pub fn value(&self, orientation: SmoothedOrientation) -> f32 {
        match self {
            MotionInput::Pitch => orientation.pitch,
            MotionInput::Roll => orientation.roll,
            MotionInput::Combined => orientation.pitch + orientation.roll,
        }
    }
}

/// Affine mapping for one filter stage:
/// frequency = base + input * coef, Q = base + input / divisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMapping {
    pub freq_input: MotionInput,
    pub base_frequency: f32,
    pub frequency_coef: f32,
    pub q_input: MotionInput,
    pub base_q: f32,
    pub q_divisor: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMapping {
    pub input: MotionInput,
    pub base: f32,
    pub coef: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModulatorConfig {
    pub smoothing: Smoothing,
    pub stages: Vec<StageMapping>,
    pub distortion: DistortionMapping,
    /// Filter stage whose frequency/Q the readout reflects.
    pub readout_stage: usize,
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        ModulatorConfig {
            smoothing: Smoothing::default(),
            stages: vec![
                StageMapping {
                    freq_input: MotionInput::Pitch,
                    base_frequency: 400.0,
                    frequency_coef: 20.0,
                    q_input: MotionInput::Roll,
                    base_q: 5.0,
                    q_divisor: 10.0,
                },
                StageMapping {
                    freq_input: MotionInput::Roll,
                    base_frequency: 800.0,
                    frequency_coef: 10.0,
                    q_input: MotionInput::Pitch,
                    base_q: 5.0,
                    q_divisor: 10.0,
                },
                StageMapping {
                    freq_input: MotionInput::Roll,
                    base_frequency: 1600.0,
                    frequency_coef: -5.0,
                    q_input: MotionInput::Combined,
                    base_q: 5.0,
                    q_divisor: 20.0,
                },
            ],
            distortion: DistortionMapping { input: MotionInput::Roll, base: 0.0, coef: 0.2 },
            readout_stage: 0,
        }
    }
}

/// Display values for the host UI, two decimal places via the `_text`
/// accessors. `resonance` is the readout stage's Q, or the distortion
/// amount when the graph carries a distortion tail.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Readout {
    pub frequency: f32,
    pub resonance: f32,
}

impl Readout {
    pub fn from_graph(graph: &EffectGraph, config: &ModulatorConfig) -> Readout {
        let frequency = graph.filter_frequency(config.readout_stage).unwrap_or(0.0);
        let resonance = graph
            .distortion_amount()
            .unwrap_or_else(|| graph.filter_q(config.readout_stage).unwrap_or(0.0));
        Readout { frequency, resonance }
    }

    /// Readout for an idle controller, derived from configuration alone.
    pub fn from_config(graph: &GraphConfig, config: &ModulatorConfig) -> Readout {
        let (frequency, q) = graph
            .stages
            .iter()
            .filter_map(|s| match s {
                StageConfig::Filter { frequency, q, .. } => Some((*frequency, *q)),
                _ => None,
            })
            .nth(config.readout_stage)
            .unwrap_or((0.0, 0.0));
        let distortion = graph.stages.iter().find_map(|s| match s {
            StageConfig::Distortion { amount } => Some(*amount),
            _ => None,
        });
        Readout { frequency, resonance: distortion.unwrap_or(q) }
    }

    pub fn frequency_text(&self) -> String {
        format!("{:.2}", self.frequency)
    }

    pub fn resonance_text(&self) -> String {
        format!("{:.2}", self.resonance)
    }
}

/// Cancellation handle for one orientation subscription. Cancelling is
/// idempotent; a cancelled subscription never delivers again.
#[derive(Debug, Clone)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new() -> Self {
        Subscription { active: Arc::new(AtomicBool::new(true)) }
    }

    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Subscription::new()
    }
}

pub type OrientationSink = Box<dyn FnMut(OrientationSample) + Send>;

/// Platform seam for the orientation event stream.
pub trait OrientationSource {
    fn request_permission(&mut self) -> Result<(), AeolusError>;
    fn subscribe(&mut self, sink: OrientationSink) -> Result<Subscription, AeolusError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorSupport {
    Granted,
    Denied,
    Unsupported,
}

/// Concrete orientation source fed by the host: bridge the platform's tilt
/// events into `push`. Clones share the same feed, so the host keeps one
/// clone to push through while the controller owns another.
#[derive(Clone)]
pub struct OrientationFeed {
    inner: Arc<Mutex<FeedInner>>,
}

struct FeedInner {
    support: SensorSupport,
    sinks: Vec<(Subscription, OrientationSink)>,
}

impl OrientationFeed {
    pub fn new() -> Self {
        Self::with_support(SensorSupport::Granted)
    }

    /// A feed on a platform where the user refused sensor access.
    pub fn denied() -> Self {
        Self::with_support(SensorSupport::Denied)
    }

    /// A feed on a platform without orientation sensors.
    pub fn unsupported() -> Self {
        Self::with_support(SensorSupport::Unsupported)
    }

    fn with_support(support: SensorSupport) -> Self {
        OrientationFeed { inner: Arc::new(Mutex::new(FeedInner { support, sinks: Vec::new() })) }
    }

    pub fn push(&self, sample: OrientationSample) {
        let mut inner = self.inner.lock().unwrap();
        inner.sinks.retain(|(subscription, _)| subscription.is_active());
        for (_, sink) in inner.sinks.iter_mut() {
            sink(sample);
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.sinks.retain(|(subscription, _)| subscription.is_active());
        inner.sinks.len()
    }
}

impl Default for OrientationFeed {
    fn default() -> Self {
        OrientationFeed::new()
    }
}

impl OrientationSource for OrientationFeed {
    fn request_permission(&mut self) -> Result<(), AeolusError> {
        match self.inner.lock().unwrap().support {
            SensorSupport::Granted => Ok(()),
            SensorSupport::Denied => Err(AeolusError::PermissionDenied),
            SensorSupport::Unsupported => Err(AeolusError::UnsupportedPlatform),
        }
    }

    fn subscribe(&mut self, sink: OrientationSink) -> Result<Subscription, AeolusError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.support {
            SensorSupport::Denied => Err(AeolusError::PermissionDenied),
            SensorSupport::Unsupported => Err(AeolusError::UnsupportedPlatform),
            SensorSupport::Granted => {
                let subscription = Subscription::new();
                inner.sinks.push((subscription.clone(), sink));
                Ok(subscription)
            }
        }
    }
}

/// Maps orientation samples onto the live graph's parameters. Holds at
/// most one subscription; re-subscribing cancels the previous one first.
pub struct MotionModulator {
    config: ModulatorConfig,
    session: Arc<Mutex<Option<PlaybackSession>>>,
    subscription: Option<Subscription>,
}

impl MotionModulator {
    pub fn new(session: Arc<Mutex<Option<PlaybackSession>>>, config: ModulatorConfig) -> Self {
        MotionModulator { config, session, subscription: None }
    }

    pub fn config(&self) -> &ModulatorConfig {
        &self.config
    }

    /// Takes effect the next time tracking starts; an already-active
    /// subscription keeps the config it was started with.
    pub fn set_config(&mut self, config: ModulatorConfig) {
        self.config = config;
    }

    pub fn start_tracking(&mut self, source: &mut dyn OrientationSource) -> Result<(), AeolusError> {
        self.stop_tracking();
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        let subscription = source.subscribe(Box::new(move |sample| {
            if let Err(err) = apply_to_session(&session, &config, sample) {
                trace!(?err, "orientation update dropped");
            }
        }))?;
        self.subscription = Some(subscription);
        Ok(())
    }

    pub fn stop_tracking(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    /// Apply one sample directly, outside any subscription.
    pub fn apply(&self, sample: OrientationSample) -> Result<(), AeolusError> {
        apply_to_session(&self.session, &self.config, sample)
    }
}

fn apply_to_session(
    session: &Arc<Mutex<Option<PlaybackSession>>>,
    config: &ModulatorConfig,
    sample: OrientationSample,
) -> Result<(), AeolusError> {
    let mut guard = session.lock().unwrap();
    let Some(active) = guard.as_mut() else {
        return Err(AeolusError::GraphNotActive);
    };

    let pitch = sample.beta.abs();
    let roll = sample.gamma.abs();
    match config.smoothing {
        Smoothing::Off => {
            active.smoothed.pitch = pitch;
            active.smoothed.roll = roll;
        }
        Smoothing::Exponential { alpha } => {
            active.smoothed.pitch += (pitch - active.smoothed.pitch) * alpha;
            active.smoothed.roll += (roll - active.smoothed.roll) * alpha;
        }
    }

    let orientation = active.smoothed;
    for (index, mapping) in config.stages.iter().enumerate() {
        let frequency = mapping.base_frequency + mapping.freq_input.value(orientation) * mapping.frequency_coef;
        if frequency.is_finite() {
            active.graph.set_filter_frequency(index, frequency);
        }
        let q = mapping.base_q + mapping.q_input.value(orientation) / mapping.q_divisor;
        if q.is_finite() {
            active.graph.set_filter_q(index, q);
        }
    }
    if active.graph.has_distortion() {
        let mapping = &config.distortion;
        let amount = mapping.base + mapping.input.value(orientation) * mapping.coef;
        if amount.is_finite() {
            active.graph.set_distortion_amount(amount);
        }
    }

    active.readout = Readout::from_graph(&active.graph, config);
    Ok(())
}
