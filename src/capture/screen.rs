// screen.rs — Desktop capture surface: grabs the primary monitor with xcap on
// a background thread, downscales, and publishes RGBA frames into the sink.
//
// Desktop hosts have no consent dialog, so this pairs with `AutoConsent`.

use image::{imageops, DynamicImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::consent::ConsentToken;
use super::frame::Frame;
use super::surface::{CaptureSurface, FrameSink, SurfaceFactory};
use super::CaptureError;

/// Consecutive capture failures after which the surface reports itself gone.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Opens [`ScreenSurface`]s on the primary monitor.
pub struct ScreenSurfaceFactory {
    /// Milliseconds between successive grabs.
    interval_ms: u64,
    /// Frames wider than this are downscaled; 0 disables downscaling.
    max_width: u32,
}

impl ScreenSurfaceFactory {
    /// Typical values: `interval_ms = 33`, `max_width = 1024`.
    pub fn new(interval_ms: u64, max_width: u32) -> Self {
        Self {
            interval_ms,
            max_width,
        }
    }
}

impl SurfaceFactory for ScreenSurfaceFactory {
    fn open(
        &self,
        _token: &ConsentToken,
        sink: FrameSink,
    ) -> Result<Box<dyn CaptureSurface>, CaptureError> {
        // Fail fast here rather than on the capture thread.
        primary_monitor()?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let interval = Duration::from_millis(self.interval_ms);
        let max_width = self.max_width;

        std::thread::Builder::new()
            .name("keysight-screen".into())
            .spawn(move || capture_loop(flag, sink, interval, max_width))
            .map_err(|e| CaptureError::SurfaceOpen(format!("spawn capture thread: {e}")))?;

        log::info!(
            "Screen surface opened (interval={}ms, max_width={})",
            self.interval_ms,
            max_width
        );
        Ok(Box::new(ScreenSurface { running }))
    }
}

/// Handle to a running capture thread. Stopping flips the flag; the thread
/// exits after its current grab.
pub struct ScreenSurface {
    running: Arc<AtomicBool>,
}

impl CaptureSurface for ScreenSurface {
    fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::info!("Screen surface stopping");
        }
    }
}

impl Drop for ScreenSurface {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(running: Arc<AtomicBool>, sink: FrameSink, interval: Duration, max_width: u32) {
    let mut failures = 0u32;

    while running.load(Ordering::SeqCst) {
        match grab_frame(max_width) {
            Ok(frame) => {
                failures = 0;
                if !sink.publish(frame) {
                    log::debug!("Sink closed; capture thread exiting");
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                log::error!("Capture error ({} in a row): {}", failures, e);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    sink.revoke();
                    break;
                }
            }
        }
        std::thread::sleep(interval);
    }

    log::info!("Screen capture loop stopped");
}

fn primary_monitor() -> Result<xcap::Monitor, CaptureError> {
    let monitors =
        xcap::Monitor::all().map_err(|e| CaptureError::Platform(format!("enumerate monitors: {e}")))?;
    let mut fallback = None;
    for monitor in monitors {
        if monitor.is_primary() {
            return Ok(monitor);
        }
        fallback.get_or_insert(monitor);
    }
    fallback.ok_or_else(|| CaptureError::Platform("no monitors found".into()))
}

fn grab_frame(max_width: u32) -> Result<Frame, CaptureError> {
    let raw = primary_monitor()?
        .capture_image()
        .map_err(|e| CaptureError::Platform(format!("capture_image: {e}")))?;

    let raw = if max_width > 0 && raw.width() > max_width {
        let ratio = max_width as f64 / raw.width() as f64;
        let new_h = ((raw.height() as f64 * ratio).round() as u32).max(1);
        DynamicImage::ImageRgba8(raw)
            .resize_exact(max_width, new_h, imageops::FilterType::Triangle)
            .to_rgba8()
    } else {
        raw
    };

    Ok(Frame::from_rgba_image(raw))
}
