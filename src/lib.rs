//  _______  _______  _______  _        _     _  _______
// (  ___  )(  ____ \(  ___  )( \      ( )   ( )(  ____ \
// | (   ) || (    \/| (   ) || (      | |   | || (    \/
// | (___) || (__    | |   | || |      | |   | || (_____
// |  ___  ||  __)   | |   | || |      | |   | |(_____  )
// | (   ) || (      | |   | || |      | |   | |      ) |
// | )   ( || (____/\| (___) || (____/\| (___) |/\____) |
// |/     \|(_______/(_______)(_______/(_______)\_______)

pub mod error;
pub mod noise;
pub mod distortion;
pub mod graph;
pub mod motion;
pub mod engine;

pub use error::AeolusError;
pub use noise::{NoiseBuffer, NoiseColor};
pub use distortion::{CURVE_LEN, DistortionCurve};
pub use graph::{EffectGraph, FilterKind, GraphConfig, StageConfig};
pub use motion::{
    DistortionMapping, ModulatorConfig, MotionInput, MotionModulator, OrientationFeed,
    OrientationSample, OrientationSink, OrientationSource, Readout, SmoothedOrientation, Smoothing,
    StageMapping, Subscription,
};
pub use engine::{AudioBackend, CpalBackend, PlaybackController, PlaybackSession, PlaybackState};
