use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info, warn};

use crate::error::AeolusError;
use crate::graph::{EffectGraph, GraphConfig};
use crate::motion::{ModulatorConfig, MotionModulator, OrientationSource, Readout, SmoothedOrientation};
use crate::noise::{NoiseBuffer, NoiseColor};

const BUFFER_SECONDS: f32 = 2.0;
const MUTE_RAMP_SECONDS: f32 = 0.1;
const DEFAULT_GAIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// Everything one playback run owns: the looping noise buffer, the wired
/// effect graph, the smoothed orientation state and the current display
/// readout. Created on start, dropped whole on stop.
pub struct PlaybackSession {
    pub(crate) buffer: NoiseBuffer,
    pub(crate) position: usize,
    pub(crate) graph: EffectGraph,
    pub(crate) smoothed: SmoothedOrientation,
    pub(crate) readout: Readout,
}

impl PlaybackSession {
    pub(crate) fn new(buffer: NoiseBuffer, graph: EffectGraph, config: &ModulatorConfig) -> Self {
        let readout = Readout::from_graph(&graph, config);
        PlaybackSession {
            buffer,
            position: 0,
            graph,
            smoothed: SmoothedOrientation::default(),
            readout,
        }
    }

    pub(crate) fn render_block(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in data.chunks_mut(channels) {
            let source = self.buffer.samples()[self.position];
            self.position = (self.position + 1) % self.buffer.len();
            let output = self.graph.process(source);
            for sample in frame.iter_mut() {
                *sample = output;
            }
        }
    }
}

/// Output seam: the realtime side that pulls from the shared session.
pub trait AudioBackend {
    fn sample_rate(&self) -> f32;
    fn start(&mut self, session: Arc<Mutex<Option<PlaybackSession>>>) -> Result<(), AeolusError>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub struct CpalBackend {
    device: cpal::Device,
    config: StreamConfig,
    sample_rate: f32,
    stream: Option<Stream>,
}

impl CpalBackend {
    /// Acquires the default output device up front; failing here keeps any
    /// graph from ever being built against a missing device.
    pub fn new() -> Result<Self, AeolusError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AeolusError::DeviceUnavailable("no output device found".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| AeolusError::DeviceUnavailable(e.to_string()))?
            .config();
        let sample_rate = config.sample_rate.0 as f32;

        Ok(CpalBackend { device, config, sample_rate, stream: None })
    }
}

impl AudioBackend for CpalBackend {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn start(&mut self, session: Arc<Mutex<Option<PlaybackSession>>>) -> Result<(), AeolusError> {
        self.stop();
        let channels = self.config.channels as usize;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut guard = session.lock().unwrap();
                    if let Some(active) = guard.as_mut() {
                        active.render_block(data, channels);
                    } else {
                        for sample in data.iter_mut() {
                            *sample = 0.0;
                        }
                    }
                },
                |err| error!("stream error: {err}"),
                None,
            )
            .map_err(|e| AeolusError::DeviceUnavailable(e.to_string()))?;

        stream.play().map_err(|e| AeolusError::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

/// Idle <-> Playing lifecycle over the shared session. At most one session
/// is live at a time; the backend's callback and the motion modulator both
/// reach it through the same mutex.
pub struct PlaybackController {
    backend: Box<dyn AudioBackend>,
    source: Box<dyn OrientationSource>,
    session: Arc<Mutex<Option<PlaybackSession>>>,
    modulator: MotionModulator,
    graph_config: GraphConfig,
    motion_available: bool,
    muted: bool,
    last_gain: f32,
    state: PlaybackState,
}

impl PlaybackController {
    pub fn new(backend: Box<dyn AudioBackend>, source: Box<dyn OrientationSource>) -> Self {
        Self::with_configs(backend, source, GraphConfig::default(), ModulatorConfig::default())
    }

    pub fn with_configs(
        backend: Box<dyn AudioBackend>,
        source: Box<dyn OrientationSource>,
        graph_config: GraphConfig,
        modulator_config: ModulatorConfig,
    ) -> Self {
        let session = Arc::new(Mutex::new(None));
        let modulator = MotionModulator::new(Arc::clone(&session), modulator_config);
        let last_gain = if graph_config.master_gain > 0.0 {
            graph_config.master_gain.clamp(0.0, 1.0)
        } else {
            DEFAULT_GAIN
        };

        PlaybackController {
            backend,
            source,
            session,
            modulator,
            graph_config,
            motion_available: true,
            muted: false,
            last_gain,
            state: PlaybackState::Idle,
        }
    }

    pub fn with_default_output(source: Box<dyn OrientationSource>) -> Result<Self, AeolusError> {
        Ok(Self::new(Box::new(CpalBackend::new()?), source))
    }

    /// Ask the platform for orientation access. On refusal or missing
    /// sensors, playback degrades to static (unmodulated) output.
    pub fn request_motion_permission(&mut self) -> Result<(), AeolusError> {
        match self.source.request_permission() {
            Ok(()) => {
                self.motion_available = true;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "motion input unavailable, playback will be unmodulated");
                self.motion_available = false;
                Err(err)
            }
        }
    }

    pub fn start(&mut self, color: NoiseColor) -> Result<(), AeolusError> {
        self.start_session(color, None)
    }

    /// Like `start`, with a sine at `tone_hz` blended into the noise.
    pub fn start_tonal(&mut self, color: NoiseColor, tone_hz: f32) -> Result<(), AeolusError> {
        self.start_session(color, Some(tone_hz))
    }

    // start while Playing restarts with the new parameters: the running
    // session is replaced wholesale, never doubled
    fn start_session(&mut self, color: NoiseColor, tone_hz: Option<f32>) -> Result<(), AeolusError> {
        self.halt();

        let sample_rate = self.backend.sample_rate();
        let length = (BUFFER_SECONDS * sample_rate) as usize;
        let buffer = match tone_hz {
            Some(tone_hz) => NoiseBuffer::generate_tonal(length, sample_rate, color, tone_hz)?,
            None => NoiseBuffer::generate(length, sample_rate, color)?,
        };

        let mut graph = EffectGraph::build(&self.graph_config, sample_rate)?;
        if self.graph_config.master_gain > 0.0 {
            self.last_gain = self.graph_config.master_gain.clamp(0.0, 1.0);
        }
        if self.muted {
            graph.set_master_gain(0.0);
        }

        *self.session.lock().unwrap() = Some(PlaybackSession::new(buffer, graph, self.modulator.config()));
        if let Err(err) = self.backend.start(Arc::clone(&self.session)) {
            *self.session.lock().unwrap() = None;
            return Err(err);
        }
        self.state = PlaybackState::Playing;
        info!(?color, sample_rate, "playback started");

        if self.motion_available {
            if let Err(err) = self.modulator.start_tracking(self.source.as_mut()) {
                warn!(%err, "orientation tracking unavailable, playback continues unmodulated");
                self.motion_available = false;
            }
        }

        Ok(())
    }

    /// Start with the selected color when idle, stop when playing.
    /// Returns the state the controller ends up in.
    pub fn toggle_sound(&mut self, color: NoiseColor) -> Result<PlaybackState, AeolusError> {
        match self.state {
            PlaybackState::Idle => self.start(color)?,
            PlaybackState::Playing => self.stop(),
        }
        Ok(self.state)
    }

    pub fn stop(&mut self) {
        if self.state == PlaybackState::Idle {
            return;
        }
        self.halt();
        info!("playback stopped");
    }

    // By the time this returns no orientation update can reach a live
    // graph: the subscription is cancelled and the session cleared under
    // its lock.
    fn halt(&mut self) {
        self.backend.stop();
        self.modulator.stop_tracking();
        *self.session.lock().unwrap() = None;
        self.state = PlaybackState::Idle;
    }

    /// Stop and restore every filter/effect parameter to its documented
    /// default. Does not resume playback.
    pub fn reset(&mut self) {
        self.halt();
        self.graph_config = GraphConfig::default();
        self.modulator.set_config(ModulatorConfig::default());
        self.muted = false;
        self.last_gain = self.graph_config.master_gain;
        info!("parameters reset to defaults");
    }

    /// Flips the mute flag; while Playing the master gain ramps between 0
    /// and its last nonzero value to avoid clicks. The flag also gates the
    /// initial gain of the next session.
    pub fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        if self.state != PlaybackState::Playing {
            return;
        }
        let mut guard = self.session.lock().unwrap();
        if let Some(active) = guard.as_mut() {
            if self.muted {
                let current = active.graph.master_gain_target();
                if current > 0.0 {
                    self.last_gain = current;
                }
                active.graph.ramp_master_gain(0.0, MUTE_RAMP_SECONDS);
            } else {
                active.graph.ramp_master_gain(self.last_gain, MUTE_RAMP_SECONDS);
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn motion_available(&self) -> bool {
        self.motion_available
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            PlaybackState::Playing => "Playing",
            PlaybackState::Idle => "Idle",
        }
    }

    /// Current display values: the live session's readout while playing,
    /// otherwise derived from the configured defaults.
    pub fn readout(&self) -> Readout {
        let guard = self.session.lock().unwrap();
        match guard.as_ref() {
            Some(active) => active.readout,
            None => Readout::from_config(&self.graph_config, self.modulator.config()),
        }
    }

    pub fn graph_config(&self) -> &GraphConfig {
        &self.graph_config
    }

    /// Takes effect on the next start.
    pub fn set_graph_config(&mut self, config: GraphConfig) -> Result<(), AeolusError> {
        config.validate()?;
        self.graph_config = config;
        Ok(())
    }

    pub fn modulator_config(&self) -> &ModulatorConfig {
        self.modulator.config()
    }

    /// Takes effect on the next start.
    pub fn set_modulator_config(&mut self, config: ModulatorConfig) {
        self.modulator.set_config(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageConfig;
    use crate::motion::{OrientationFeed, OrientationSample, Smoothing};
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        sample_rate: f32,
        active: bool,
        running: Arc<AtomicUsize>,
        starts: Arc<AtomicUsize>,
    }

    impl MockBackend {
        fn new(sample_rate: f32) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let running = Arc::new(AtomicUsize::new(0));
            let starts = Arc::new(AtomicUsize::new(0));
            let backend = MockBackend {
                sample_rate,
                active: false,
                running: Arc::clone(&running),
                starts: Arc::clone(&starts),
            };
            (backend, running, starts)
        }
    }

    impl AudioBackend for MockBackend {
        fn sample_rate(&self) -> f32 {
            self.sample_rate
        }

        fn start(&mut self, _session: Arc<Mutex<Option<PlaybackSession>>>) -> Result<(), AeolusError> {
            self.stop();
            self.active = true;
            self.running.fetch_add(1, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            if self.active {
                self.active = false;
                self.running.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn is_running(&self) -> bool {
            self.active
        }
    }

    struct FailingBackend;

    impl AudioBackend for FailingBackend {
        fn sample_rate(&self) -> f32 {
            48000.0
        }

        fn start(&mut self, _session: Arc<Mutex<Option<PlaybackSession>>>) -> Result<(), AeolusError> {
            Err(AeolusError::DeviceUnavailable("mock device gone".to_string()))
        }

        fn stop(&mut self) {}

        fn is_running(&self) -> bool {
            false
        }
    }

    fn controller_with_feed(smoothing: Smoothing) -> (PlaybackController, OrientationFeed, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (backend, running, starts) = MockBackend::new(48000.0);
        let feed = OrientationFeed::new();
        let modulator_config = ModulatorConfig { smoothing, ..ModulatorConfig::default() };
        let controller = PlaybackController::with_configs(
            Box::new(backend),
            Box::new(feed.clone()),
            GraphConfig::default(),
            modulator_config,
        );
        (controller, feed, running, starts)
    }

    #[test]
    fn start_builds_a_playing_session() {
        let (mut controller, feed, running, _) = controller_with_feed(Smoothing::default());
        controller.start(NoiseColor::White).unwrap();

        assert_eq!(controller.state(), PlaybackState::Playing);
        assert_eq!(controller.state_label(), "Playing");
        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(feed.active_subscriptions(), 1);

        let guard = controller.session.lock().unwrap();
        let session = guard.as_ref().unwrap();
        assert_eq!(session.buffer.len(), 96000); // two seconds at 48 kHz
        assert_eq!(session.readout.frequency_text(), "400.00");
        assert_eq!(session.readout.resonance_text(), "10.00");
    }

    #[test]
    fn restart_while_playing_keeps_one_context() {
        let (mut controller, _, running, starts) = controller_with_feed(Smoothing::default());
        controller.start(NoiseColor::White).unwrap();
        controller.start(NoiseColor::Pink).unwrap();

        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(controller.state(), PlaybackState::Playing);
    }

    #[test]
    fn stop_tears_everything_down() {
        let (mut controller, feed, running, _) = controller_with_feed(Smoothing::Off);
        controller.start(NoiseColor::Brown).unwrap();
        controller.stop();

        assert_eq!(controller.state(), PlaybackState::Idle);
        assert_eq!(controller.state_label(), "Idle");
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(feed.active_subscriptions(), 0);
        assert!(controller.session.lock().unwrap().is_none());

        // a late orientation event lands nowhere
        feed.push(OrientationSample { beta: 45.0, gamma: 30.0 });
        assert_eq!(controller.readout().frequency_text(), "400.00");

        // stop while idle is a no-op
        controller.stop();
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[test]
    fn fresh_session_resets_smoothing_state() {
        let (mut controller, feed, _, _) = controller_with_feed(Smoothing::default());
        controller.start(NoiseColor::White).unwrap();
        feed.push(OrientationSample { beta: 90.0, gamma: 45.0 });
        {
            let guard = controller.session.lock().unwrap();
            let smoothed = guard.as_ref().unwrap().smoothed;
            assert_relative_eq!(smoothed.pitch, 9.0);
            assert_relative_eq!(smoothed.roll, 4.5);
        }

        controller.stop();
        controller.start(NoiseColor::White).unwrap();
        let guard = controller.session.lock().unwrap();
        assert_eq!(guard.as_ref().unwrap().smoothed, SmoothedOrientation::default());
    }

    #[test]
    fn orientation_steers_the_live_graph() {
        let (mut controller, feed, _, _) = controller_with_feed(Smoothing::Off);
        controller.start(NoiseColor::White).unwrap();
        feed.push(OrientationSample { beta: 45.0, gamma: 30.0 });

        assert_eq!(controller.readout().frequency_text(), "1300.00");
        assert_eq!(controller.readout().resonance_text(), "8.00");
    }

    #[test]
    fn toggle_mute_ramps_between_zero_and_last_gain() {
        let (mut controller, _, _, _) = controller_with_feed(Smoothing::default());
        controller.start(NoiseColor::White).unwrap();

        controller.toggle_mute();
        assert!(controller.is_muted());
        {
            let guard = controller.session.lock().unwrap();
            assert_relative_eq!(guard.as_ref().unwrap().graph.master_gain_target(), 0.0);
        }

        controller.toggle_mute();
        assert!(!controller.is_muted());
        let guard = controller.session.lock().unwrap();
        assert_relative_eq!(guard.as_ref().unwrap().graph.master_gain_target(), 0.5);
    }

    #[test]
    fn mute_flag_carries_into_the_next_session() {
        let (mut controller, _, _, _) = controller_with_feed(Smoothing::default());
        controller.toggle_mute(); // while idle: flag only
        controller.start(NoiseColor::White).unwrap();
        {
            let guard = controller.session.lock().unwrap();
            assert_relative_eq!(guard.as_ref().unwrap().graph.master_gain(), 0.0);
        }

        controller.toggle_mute();
        let guard = controller.session.lock().unwrap();
        assert_relative_eq!(guard.as_ref().unwrap().graph.master_gain_target(), 0.5);
    }

    #[test]
    fn reset_restores_documented_defaults() {
        let (mut controller, feed, running, _) = controller_with_feed(Smoothing::Off);
        controller
            .set_graph_config(GraphConfig {
                stages: vec![StageConfig::lowpass(900.0, 2.0)],
                master_gain: 0.8,
            })
            .unwrap();
        controller.start(NoiseColor::Pink).unwrap();
        feed.push(OrientationSample { beta: 45.0, gamma: 0.0 });
        controller.toggle_mute();

        controller.reset();
        assert_eq!(controller.state(), PlaybackState::Idle);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(controller.graph_config(), &GraphConfig::default());
        assert!(!controller.is_muted());
        assert_eq!(controller.readout().frequency_text(), "400.00");
        assert_eq!(controller.readout().resonance_text(), "10.00");
    }

    #[test]
    fn invalid_graph_config_is_rejected() {
        let (mut controller, _, _, _) = controller_with_feed(Smoothing::default());
        let result = controller.set_graph_config(GraphConfig { stages: vec![], master_gain: 0.5 });
        assert!(matches!(result, Err(AeolusError::InvalidConfig(_))));
        // the previous config survives
        assert_eq!(controller.graph_config(), &GraphConfig::default());
    }

    #[test]
    fn denied_permission_degrades_to_static_playback() {
        let (backend, running, _) = MockBackend::new(48000.0);
        let feed = OrientationFeed::denied();
        let mut controller = PlaybackController::new(Box::new(backend), Box::new(feed.clone()));

        let result = controller.request_motion_permission();
        assert!(matches!(result, Err(AeolusError::PermissionDenied)));
        assert!(!controller.motion_available());

        controller.start(NoiseColor::White).unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[test]
    fn failed_subscribe_degrades_without_aborting_start() {
        let (backend, _, _) = MockBackend::new(48000.0);
        let feed = OrientationFeed::unsupported();
        let mut controller = PlaybackController::new(Box::new(backend), Box::new(feed.clone()));

        // no permission request: start finds out on subscribe
        controller.start(NoiseColor::White).unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        assert!(!controller.motion_available());
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[test]
    fn unavailable_device_fails_start_cleanly() {
        let feed = OrientationFeed::new();
        let mut controller = PlaybackController::new(Box::new(FailingBackend), Box::new(feed));

        let result = controller.start(NoiseColor::White);
        assert!(matches!(result, Err(AeolusError::DeviceUnavailable(_))));
        assert_eq!(controller.state(), PlaybackState::Idle);
        assert!(controller.session.lock().unwrap().is_none());
    }

    #[test]
    fn render_block_loops_the_buffer() {
        let sample_rate = 8000.0;
        let buffer = NoiseBuffer::generate(16, sample_rate, NoiseColor::White).unwrap();
        let graph = EffectGraph::build(&GraphConfig::default(), sample_rate).unwrap();
        let mut session = PlaybackSession::new(buffer, graph, &ModulatorConfig::default());

        let mut block = vec![0.0f32; 80]; // 40 frames at 2 channels, past the buffer end
        session.render_block(&mut block, 2);

        assert_eq!(session.position, 40 % 16);
        assert!(block.iter().all(|s| s.is_finite()));
        // both channels carry the same mono output
        for frame in block.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn toggle_sound_flips_between_states() {
        let (mut controller, _, running, _) = controller_with_feed(Smoothing::default());

        let state = controller.toggle_sound(NoiseColor::White).unwrap();
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(running.load(Ordering::SeqCst), 1);

        let state = controller.toggle_sound(NoiseColor::White).unwrap();
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tonal_start_plays_a_blended_buffer() {
        let (mut controller, _, running, _) = controller_with_feed(Smoothing::default());
        controller.start_tonal(NoiseColor::White, 220.0).unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        assert_eq!(running.load(Ordering::SeqCst), 1);

        let guard = controller.session.lock().unwrap();
        assert_eq!(guard.as_ref().unwrap().buffer.len(), 96000);
    }
}
