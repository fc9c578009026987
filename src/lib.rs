pub mod ai;
pub mod capture;
pub mod coordinator;
pub mod settings;

use std::sync::Arc;

pub use ai::{GenerationEvent, GenerationStream, InferenceError, InferenceSessionManager, InitOutcome};
pub use capture::{CaptureSessionManager, Frame, FrameOutcome, SessionState};
pub use coordinator::{Suggestion, SuggestionCoordinator, SuggestionError};
pub use settings::{AssetCatalog, Settings};

/// Initialise `env_logger` (default level `info`, `RUST_LOG` overrides).
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Wire both managers from settings and hand them to a coordinator.
///
/// The inference manager starts `Unloaded`; call
/// [`InferenceSessionManager::initialize`] before asking for suggestions.
pub fn build_coordinator(
    settings: Settings,
    consent: Arc<dyn capture::ConsentProvider>,
    surfaces: Arc<dyn capture::SurfaceFactory>,
    engine: Arc<dyn ai::InferenceEngine>,
) -> SuggestionCoordinator {
    let capture = Arc::new(CaptureSessionManager::new(
        consent,
        surfaces,
        capture::CaptureConfig {
            frame_deadline: settings.frame_deadline(),
        },
    ));

    let timeout = settings.generation_timeout();
    let models_dir = settings.models_dir.clone();
    let catalog: Arc<dyn AssetCatalog> = Arc::new(settings);
    let inference = Arc::new(InferenceSessionManager::new(
        engine,
        Arc::clone(&catalog),
        models_dir,
    ));

    log::info!("Suggestion coordinator ready (generation timeout {}ms)", timeout.as_millis());
    SuggestionCoordinator::new(capture, inference, catalog, timeout)
}

/// Desktop wiring: xcap screen surface, no consent dialog, local inference server.
#[cfg(feature = "desktop-capture")]
pub fn build_desktop_coordinator(settings: Settings) -> SuggestionCoordinator {
    let surfaces = Arc::new(capture::screen::ScreenSurfaceFactory::new(
        settings.capture_interval_ms,
        settings.screenshot_max_width,
    ));
    let engine = Arc::new(ai::local_server::LocalServerEngine::new(
        settings.inference_endpoint.clone(),
        settings.screenshot_max_width,
        settings.jpeg_quality,
    ));
    build_coordinator(settings, Arc::new(capture::AutoConsent), surfaces, engine)
}
