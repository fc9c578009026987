// frame.rs — Frames produced by a capture surface and the single-slot buffer
// that holds the latest one.
//
// The buffer is last-write-wins: a surface thread overwrites the slot on every
// capture callback and readers wait (with a deadline) for a frame newer than
// the one they were last handed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, GenericImageView, RgbImage, RgbaImage};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::CaptureError;

// ── Frame ───────────────────────────────────────────────────────────────

/// Pixel layout of a [`Frame`]'s buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, R G B A.
    Rgba8,
    /// 3 bytes per pixel, R G B.
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// An immutable screen snapshot.
///
/// Cloning a `Frame` copies the pixel buffer, so a frame handed to a caller is
/// never shared with the live buffer the surface keeps writing into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Monotonic capture time in nanoseconds (see [`monotonic_now_ns`]).
    timestamp_ns: u64,
}

impl Frame {
    /// Build a frame, checking that the buffer length matches the geometry.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp_ns: u64,
    ) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(CaptureError::InvalidFrame(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            format,
            timestamp_ns,
        })
    }

    /// Wrap an `image` RGBA buffer, stamped with the current monotonic time.
    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            pixels: img.into_raw(),
            width,
            height,
            format: PixelFormat::Rgba8,
            timestamp_ns: monotonic_now_ns(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn to_dynamic_image(&self) -> Result<DynamicImage, CaptureError> {
        let bad = || CaptureError::InvalidFrame("pixel buffer does not match geometry".into());
        match self.format {
            PixelFormat::Rgba8 => RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(bad),
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, self.pixels.clone())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(bad),
        }
    }

    /// Downscale to `max_width` (keeping aspect ratio), JPEG-encode, and
    /// base64-encode. Used when a frame has to travel as a data URL.
    pub fn to_jpeg_base64(&self, max_width: u32, jpeg_quality: u8) -> Result<String, CaptureError> {
        let img = self.to_dynamic_image()?;

        let img = if max_width > 0 && img.width() > max_width {
            let ratio = max_width as f64 / img.width() as f64;
            let new_h = ((img.height() as f64 * ratio).round() as u32).max(1);
            img.resize_exact(max_width, new_h, imageops::FilterType::Triangle)
        } else {
            img
        };

        let (w, h) = img.dimensions();
        let mut jpeg_buf: Vec<u8> = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg_buf, jpeg_quality)
            .encode(img.to_rgb8().as_raw(), w, h, image::ExtendedColorType::Rgb8)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        Ok(BASE64.encode(&jpeg_buf))
    }
}

/// Nanoseconds elapsed on a process-wide monotonic clock.
///
/// Surfaces stamp frames with this so timestamps from different capture
/// callbacks are directly comparable.
pub fn monotonic_now_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

// ── FrameBuffer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
enum SlotState {
    #[default]
    Empty,
    Ready(Arc<Frame>),
    /// The session producing into this buffer was released or revoked.
    Closed,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    /// Bumped each time the buffer is reopened for a new session, so a stale
    /// surface cannot publish into its successor's buffer.
    epoch: u64,
    state: SlotState,
}

/// Result of waiting on the buffer.
#[derive(Debug)]
pub enum FrameWait {
    Fresh(Frame),
    TimedOut,
    Closed,
}

/// Single-slot holder for the latest frame.
///
/// Backed by a `tokio::sync::watch` channel: writers replace the value from any
/// thread, readers suspend until the value satisfies their freshness check.
pub struct FrameBuffer {
    tx: watch::Sender<Slot>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// A new buffer starts closed; [`FrameBuffer::reopen`] readies it for a session.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            epoch: 0,
            state: SlotState::Closed,
        });
        Self { tx }
    }

    /// Clear the slot and start a new epoch. Returns the epoch producers must
    /// publish under.
    pub fn reopen(&self) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|slot| {
            slot.epoch += 1;
            slot.state = SlotState::Empty;
            epoch = slot.epoch;
        });
        epoch
    }

    /// Store `frame` as the latest one, discarding whatever was there.
    /// Returns `false` if the buffer is closed or `epoch` is stale.
    pub fn publish(&self, epoch: u64, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        self.tx.send_if_modified(|slot| {
            if slot.epoch != epoch || matches!(slot.state, SlotState::Closed) {
                return false;
            }
            slot.state = SlotState::Ready(Arc::clone(&frame));
            true
        })
    }

    /// Drop the latest frame and wake every waiter with [`FrameWait::Closed`].
    pub fn close(&self) {
        self.tx.send_modify(|slot| slot.state = SlotState::Closed);
    }

    /// Epoch of the session currently allowed to publish.
    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.tx.borrow().state, SlotState::Closed)
    }

    /// Copy of the latest frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        match &self.tx.borrow().state {
            SlotState::Ready(frame) => Some(Frame::clone(frame)),
            _ => None,
        }
    }

    /// Suspend until the slot holds a frame stamped strictly after
    /// `watermark`, the buffer closes, or `deadline` elapses.
    pub async fn wait_newer_than(&self, watermark: Option<u64>, deadline: Duration) -> FrameWait {
        let mut rx = self.tx.subscribe();
        let ready = rx.wait_for(|slot| match &slot.state {
            SlotState::Ready(frame) => watermark.map_or(true, |w| frame.timestamp_ns > w),
            SlotState::Closed => true,
            SlotState::Empty => false,
        });

        let wait = match tokio::time::timeout(deadline, ready).await {
            Ok(Ok(slot)) => match &slot.state {
                SlotState::Ready(frame) => FrameWait::Fresh(Frame::clone(frame)),
                _ => FrameWait::Closed,
            },
            Ok(Err(_)) => FrameWait::Closed,
            Err(_) => FrameWait::TimedOut,
        };
        wait
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(ts: u64) -> Frame {
        Frame::new(vec![0u8; 2 * 2 * 4], 2, 2, PixelFormat::Rgba8, ts).unwrap()
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let err = Frame::new(vec![0u8; 5], 2, 2, PixelFormat::Rgb8, 1).unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes"));
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn publish_keeps_only_the_latest_frame() {
        let buf = FrameBuffer::new();
        let epoch = buf.reopen();
        assert!(buf.publish(epoch, frame_at(1)));
        assert!(buf.publish(epoch, frame_at(2)));
        assert_eq!(buf.latest().unwrap().timestamp_ns(), 2);
    }

    #[test]
    fn closed_buffer_rejects_frames() {
        let buf = FrameBuffer::new();
        assert!(buf.is_closed());
        assert!(!buf.publish(0, frame_at(1)));
        assert!(buf.latest().is_none());
    }

    #[test]
    fn stale_epoch_cannot_publish() {
        let buf = FrameBuffer::new();
        let old = buf.reopen();
        let new = buf.reopen();
        assert!(!buf.publish(old, frame_at(1)));
        assert!(buf.publish(new, frame_at(1)));
    }

    #[test]
    fn jpeg_encoding_downscales_wide_frames() {
        let img = RgbaImage::from_pixel(64, 32, image::Rgba([200, 10, 10, 255]));
        let frame = Frame::from_rgba_image(img);
        let b64 = frame.to_jpeg_base64(16, 75).unwrap();
        let bytes = BASE64.decode(b64).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[tokio::test]
    async fn wait_returns_frame_newer_than_watermark() {
        let buf = FrameBuffer::new();
        let epoch = buf.reopen();
        buf.publish(epoch, frame_at(10));

        match buf.wait_newer_than(Some(5), Duration::from_millis(50)).await {
            FrameWait::Fresh(f) => assert_eq!(f.timestamp_ns(), 10),
            other => panic!("expected fresh frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_ignores_frame_at_watermark() {
        let buf = FrameBuffer::new();
        let epoch = buf.reopen();
        buf.publish(epoch, frame_at(10));

        let res = buf.wait_newer_than(Some(10), Duration::from_millis(40)).await;
        assert!(matches!(res, FrameWait::TimedOut));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let buf = Arc::new(FrameBuffer::new());
        buf.reopen();

        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.wait_newer_than(None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.close();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on close")
            .unwrap();
        assert!(matches!(res, FrameWait::Closed));
    }
}
