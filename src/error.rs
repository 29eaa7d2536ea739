use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AeolusError {
    #[error("Audio Output Error: {0}")]
    DeviceUnavailable(String),
    #[error("No Active Playback Session")]
    GraphNotActive,
    #[error("Motion Permission Denied")]
    PermissionDenied,
    #[error("No Orientation Sensor On This Platform")]
    UnsupportedPlatform,
    #[error("Invalid Configuration: {0}")]
    InvalidConfig(String),
}
