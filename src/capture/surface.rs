// surface.rs — The seam between the session manager and whatever actually
// produces pixels (a virtual display + image reader on mobile, a monitor
// grabber on desktop).

use std::fmt;
use std::sync::Arc;

use super::consent::ConsentToken;
use super::frame::{Frame, FrameBuffer};
use super::CaptureError;

/// Opens capture surfaces for a granted consent token.
pub trait SurfaceFactory: Send + Sync {
    /// Stand up a surface that publishes every captured frame into `sink`.
    fn open(
        &self,
        token: &ConsentToken,
        sink: FrameSink,
    ) -> Result<Box<dyn CaptureSurface>, CaptureError>;
}

/// A live capture surface.
///
/// `stop` may be called more than once and from any thread, including the
/// surface's own producer thread after it reported a revocation, so it must
/// not block waiting for that thread.
pub trait CaptureSurface: Send {
    fn stop(&mut self);
}

/// Write end handed to a surface: publishes frames into the session's buffer
/// and reports platform-initiated stops.
#[derive(Clone)]
pub struct FrameSink {
    buffer: Arc<FrameBuffer>,
    epoch: u64,
    on_revoked: Arc<dyn Fn(u64) + Send + Sync>,
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").field("epoch", &self.epoch).finish()
    }
}

impl FrameSink {
    pub(crate) fn new(
        buffer: Arc<FrameBuffer>,
        epoch: u64,
        on_revoked: Arc<dyn Fn(u64) + Send + Sync>,
    ) -> Self {
        Self {
            buffer,
            epoch,
            on_revoked,
        }
    }

    /// Replace the latest frame. Returns `false` once the session this sink
    /// belongs to has ended; producers should stop then.
    pub fn publish(&self, frame: Frame) -> bool {
        self.buffer.publish(self.epoch, frame)
    }

    /// Report that the platform stopped capture on its own (e.g. the user
    /// revoked it from system UI).
    pub fn revoke(&self) {
        (self.on_revoked)(self.epoch);
    }

    pub fn is_open(&self) -> bool {
        self.buffer.epoch() == self.epoch && !self.buffer.is_closed()
    }
}
