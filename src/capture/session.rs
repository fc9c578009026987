// session.rs — Capture session lifecycle: lazy consent, surface setup, fresh
// frame delivery under a deadline, release and platform revocation.
//
//   Uninitialized ──consent──▶ AwaitingConsent ──granted──▶ Active
//         ▲                          │ denied                  │ release / revoke
//         └──────────────────────────┘                         ▼
//                                                           Released
//
// A released session is re-armed by the next request (consent runs again).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::Instant;

use super::consent::{ConsentOutcome, ConsentProvider, ConsentToken};
use super::frame::{Frame, FrameBuffer, FrameWait};
use super::surface::{CaptureSurface, FrameSink, SurfaceFactory};

/// Hard ceiling on how long a request waits for a fresh frame.
pub const DEFAULT_FRAME_DEADLINE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AwaitingConsent,
    Active,
    Released,
}

/// What a frame request produced. Denial and timeout are ordinary outcomes
/// the caller may retry.
#[derive(Debug)]
pub enum FrameOutcome {
    Frame(Frame),
    Denied,
    Timeout,
    /// Consent was granted but the surface could not be opened.
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub frame_deadline: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_deadline: DEFAULT_FRAME_DEADLINE,
        }
    }
}

#[derive(Default)]
struct LiveSurface {
    surface: Option<Box<dyn CaptureSurface>>,
    token: Option<ConsentToken>,
}

/// State shared with surface callbacks. Surfaces only hold a weak reference
/// (through their `FrameSink`), so dropping the manager frees everything.
struct Inner {
    buffer: Arc<FrameBuffer>,
    live: Mutex<LiveSurface>,
    /// Timestamp of the last frame handed out.
    watermark: Mutex<Option<u64>>,
    state: watch::Sender<SessionState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::info!("Capture session: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    /// Stop the live surface and close the buffer.
    ///
    /// With `Some(epoch)` (a revocation) only that session is torn down and the
    /// state only moves if it was `Active`. With `None` (an explicit release)
    /// whatever is live goes and the state becomes `Released`.
    fn teardown(&self, epoch: Option<u64>) -> bool {
        let surface = {
            let mut live = lock(&self.live);
            if let Some(epoch) = epoch {
                if self.buffer.epoch() != epoch || self.buffer.is_closed() {
                    return false;
                }
            }
            self.buffer.close();
            live.token = None;
            if epoch.is_none() || self.state() == SessionState::Active {
                self.set_state(SessionState::Released);
            }
            live.surface.take()
        };
        if let Some(mut surface) = surface {
            surface.stop();
        }
        true
    }

    fn on_revoked(&self, epoch: u64) {
        if self.teardown(Some(epoch)) {
            log::warn!("Capture session stopped by the platform");
        }
    }
}

/// Restores the idle state if a consent flow ends without reaching `Active`
/// (denied, failed, or the request future was dropped mid-way).
struct PendingConsent<'a> {
    inner: &'a Inner,
    idle: Option<SessionState>,
}

impl PendingConsent<'_> {
    fn disarm(&mut self) {
        self.idle = None;
    }
}

impl Drop for PendingConsent<'_> {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.inner.state.send_if_modified(|current| {
                if *current != SessionState::AwaitingConsent {
                    return false;
                }
                log::debug!("Consent flow ended without a session; back to {:?}", idle);
                *current = idle;
                true
            });
        }
    }
}

/// Owns the capture surface and frame buffer for one capture session.
///
/// ## Ownership & thread-safety
/// * Callers only ever receive copied [`Frame`]s.
/// * `release` may be called from any thread; platform revocation arrives on
///   whatever thread the surface uses and is handled the same way.
/// * `consent_gate` serializes consent flows, so concurrent requests made
///   while consent is pending share that one dialog.
pub struct CaptureSessionManager {
    inner: Arc<Inner>,
    consent: Arc<dyn ConsentProvider>,
    factory: Arc<dyn SurfaceFactory>,
    consent_gate: TokioMutex<()>,
    config: CaptureConfig,
}

impl CaptureSessionManager {
    pub fn new(
        consent: Arc<dyn ConsentProvider>,
        factory: Arc<dyn SurfaceFactory>,
        config: CaptureConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(SessionState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                buffer: Arc::new(FrameBuffer::new()),
                live: Mutex::new(LiveSurface::default()),
                watermark: Mutex::new(None),
                state,
            }),
            consent,
            factory,
            consent_gate: TokioMutex::new(()),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Subscribe to lifecycle changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Get a frame captured after the previously delivered one.
    ///
    /// Runs the consent flow and opens the surface first if no session is
    /// active. Waits at most `frame_deadline` for a fresh frame.
    pub async fn request_frame(&self) -> FrameOutcome {
        if self.inner.state() != SessionState::Active {
            if let Err(outcome) = self.ensure_active().await {
                return outcome;
            }
        }
        self.deliver_fresh().await
    }

    /// Tear down the surface, clear the buffer, and mark the session
    /// `Released`. No-op if nothing was ever started or it is already released.
    pub fn release(&self) {
        match self.inner.state() {
            SessionState::Uninitialized | SessionState::Released => {
                log::debug!("Capture release: no live session");
            }
            _ => {
                self.inner.teardown(None);
                log::info!("Capture session released");
            }
        }
    }

    async fn ensure_active(&self) -> Result<(), FrameOutcome> {
        let _gate = self.consent_gate.lock().await;

        let idle = match self.inner.state() {
            SessionState::Active => return Ok(()),
            SessionState::Released => SessionState::Released,
            _ => SessionState::Uninitialized,
        };

        self.inner.set_state(SessionState::AwaitingConsent);
        let mut pending = PendingConsent {
            inner: &self.inner,
            idle: Some(idle),
        };

        log::info!("Requesting screen-capture consent");
        let token = match self.consent.request_consent().await {
            ConsentOutcome::Granted(token) => token,
            ConsentOutcome::Denied => {
                log::info!("Screen-capture consent denied");
                return Err(FrameOutcome::Denied);
            }
        };

        if self.inner.state() != SessionState::AwaitingConsent {
            log::info!("Capture session released while consent was pending");
            return Err(FrameOutcome::Timeout);
        }

        let epoch = self.inner.buffer.reopen();
        let sink = FrameSink::new(
            Arc::clone(&self.inner.buffer),
            epoch,
            revocation_hook(&self.inner),
        );

        let mut surface = match self.factory.open(&token, sink) {
            Ok(surface) => surface,
            Err(e) => {
                log::error!("Failed to open capture surface: {}", e);
                self.inner.buffer.close();
                return Err(FrameOutcome::Unavailable(e.to_string()));
            }
        };

        {
            let mut live = lock(&self.inner.live);
            let still_ours = self.inner.buffer.epoch() == epoch
                && !self.inner.buffer.is_closed()
                && self.inner.state() == SessionState::AwaitingConsent;
            if still_ours {
                live.surface = Some(surface);
                live.token = Some(token);
                pending.disarm();
                self.inner.set_state(SessionState::Active);
                return Ok(());
            }
        }

        log::warn!("Capture session ended while the surface was opening");
        surface.stop();
        Err(FrameOutcome::Timeout)
    }

    async fn deliver_fresh(&self) -> FrameOutcome {
        let deadline = Instant::now() + self.config.frame_deadline;

        loop {
            let watermark = *lock(&self.inner.watermark);
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.inner.buffer.wait_newer_than(watermark, remaining).await {
                FrameWait::Fresh(frame) => {
                    let mut mark = lock(&self.inner.watermark);
                    if mark.map_or(true, |w| frame.timestamp_ns() > w) {
                        *mark = Some(frame.timestamp_ns());
                        log::debug!(
                            "Delivering frame {}x{} @ {}ns",
                            frame.width(),
                            frame.height(),
                            frame.timestamp_ns()
                        );
                        return FrameOutcome::Frame(frame);
                    }
                    // A concurrent request claimed this frame; wait for the next.
                }
                FrameWait::TimedOut => {
                    log::debug!(
                        "No fresh frame within {}ms",
                        self.config.frame_deadline.as_millis()
                    );
                    return FrameOutcome::Timeout;
                }
                FrameWait::Closed => {
                    log::info!("Capture session ended while waiting for a frame");
                    return FrameOutcome::Timeout;
                }
            }
        }
    }
}

impl Drop for CaptureSessionManager {
    fn drop(&mut self) {
        self.release();
    }
}

fn revocation_hook(inner: &Arc<Inner>) -> Arc<dyn Fn(u64) + Send + Sync> {
    let weak = Arc::downgrade(inner);
    Arc::new(move |epoch| {
        if let Some(inner) = weak.upgrade() {
            inner.on_revoked(epoch);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::consent::AutoConsent;
    use crate::capture::frame::PixelFormat;
    use crate::capture::CaptureError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Surface that publishes nothing on its own; tests drive the sink.
    struct ManualFactory {
        sinks: Mutex<Vec<FrameSink>>,
        stops: Arc<AtomicUsize>,
    }

    struct ManualSurface {
        stops: Arc<AtomicUsize>,
    }

    impl CaptureSurface for ManualSurface {
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SurfaceFactory for ManualFactory {
        fn open(
            &self,
            _token: &ConsentToken,
            sink: FrameSink,
        ) -> Result<Box<dyn CaptureSurface>, CaptureError> {
            lock(&self.sinks).push(sink);
            Ok(Box::new(ManualSurface {
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    fn manual() -> (Arc<ManualFactory>, CaptureSessionManager) {
        let factory = Arc::new(ManualFactory {
            sinks: Mutex::new(Vec::new()),
            stops: Arc::new(AtomicUsize::new(0)),
        });
        let mgr = CaptureSessionManager::new(
            Arc::new(AutoConsent),
            Arc::clone(&factory) as Arc<dyn SurfaceFactory>,
            CaptureConfig {
                frame_deadline: Duration::from_millis(100),
            },
        );
        (factory, mgr)
    }

    fn frame_at(ts: u64) -> Frame {
        Frame::new(vec![7u8; 3], 1, 1, PixelFormat::Rgb8, ts).unwrap()
    }

    #[tokio::test]
    async fn first_request_opens_surface_and_times_out_without_frames() {
        let (factory, mgr) = manual();
        assert_eq!(mgr.state(), SessionState::Uninitialized);

        let outcome = mgr.request_frame().await;
        assert!(matches!(outcome, FrameOutcome::Timeout));
        assert_eq!(mgr.state(), SessionState::Active);
        assert_eq!(lock(&factory.sinks).len(), 1);
    }

    #[tokio::test]
    async fn published_frame_is_delivered_once() {
        let (factory, mgr) = manual();
        mgr.request_frame().await;

        let sink = lock(&factory.sinks)[0].clone();
        assert!(sink.publish(frame_at(42)));

        match mgr.request_frame().await {
            FrameOutcome::Frame(f) => assert_eq!(f.timestamp_ns(), 42),
            other => panic!("expected frame, got {:?}", other),
        }
        // Same frame again is stale.
        assert!(matches!(mgr.request_frame().await, FrameOutcome::Timeout));
    }

    #[tokio::test]
    async fn release_stops_surface_and_closes_sink() {
        let (factory, mgr) = manual();
        mgr.request_frame().await;
        let sink = lock(&factory.sinks)[0].clone();

        mgr.release();
        assert_eq!(mgr.state(), SessionState::Released);
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);
        assert!(!sink.is_open());
        assert!(!sink.publish(frame_at(1)));
    }

    #[tokio::test]
    async fn revocation_releases_session() {
        let (factory, mgr) = manual();
        mgr.request_frame().await;
        let sink = lock(&factory.sinks)[0].clone();

        sink.revoke();
        assert_eq!(mgr.state(), SessionState::Released);
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);

        // A second revoke from the same stale surface changes nothing.
        sink.revoke();
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_after_release_starts_a_new_session() {
        let (factory, mgr) = manual();
        mgr.request_frame().await;
        mgr.release();

        mgr.request_frame().await;
        assert_eq!(mgr.state(), SessionState::Active);
        assert_eq!(lock(&factory.sinks).len(), 2);

        let old = lock(&factory.sinks)[0].clone();
        assert!(!old.publish(frame_at(5)), "stale surface must not publish");
    }
}
