//! Everything between the platform's screen-capture machinery and a caller
//! asking for "the screen, as of now". The session manager ties the consent
//! flow, the capture surface and the single-slot frame buffer together.

pub mod consent;
pub mod frame;
pub mod indicator;
pub mod session;
pub mod surface;

#[cfg(feature = "desktop-capture")]
pub mod screen;

pub use consent::{AutoConsent, ConsentBridge, ConsentOutcome, ConsentPrompt, ConsentProvider, ConsentToken};
pub use frame::{monotonic_now_ns, Frame, FrameBuffer, FrameWait, PixelFormat};
pub use indicator::{spawn_activity_indicator, ActivityIndicator};
pub use session::{CaptureConfig, CaptureSessionManager, FrameOutcome, SessionState};
pub use surface::{CaptureSurface, FrameSink, SurfaceFactory};

/// Errors raised by capture plumbing. Consent denial and frame timeouts are
/// not errors; they are [`FrameOutcome`] values.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture surface failed to open: {0}")]
    SurfaceOpen(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Frame encoding failed: {0}")]
    Encode(String),
    #[error("Screen capture failed: {0}")]
    Platform(String),
}
