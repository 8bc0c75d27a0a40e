use roomscope_shared::Viewport;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EngineConfig;

/// Debounce windows per zoom band. Deeper zoom pans shorter distances per
/// gesture, so it gets the shortest window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceDelays {
    pub low_zoom: Duration,
    pub mid_zoom: Duration,
    pub high_zoom: Duration,
}

impl DebounceDelays {
    pub fn for_zoom(&self, zoom: f64) -> Duration {
        if zoom <= 5.0 {
            self.low_zoom
        } else if zoom <= 12.0 {
            self.mid_zoom
        } else {
            self.high_zoom
        }
    }
}

impl Default for DebounceDelays {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for DebounceDelays {
    fn from(config: &EngineConfig) -> Self {
        Self {
            low_zoom: Duration::from_millis(config.debounce_low_zoom_ms),
            mid_zoom: Duration::from_millis(config.debounce_mid_zoom_ms),
            high_zoom: Duration::from_millis(config.debounce_high_zoom_ms),
        }
    }
}

/// A stabilized viewport, ready to be fetched
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportSample {
    pub viewport: Viewport,
    pub category: Option<String>,
}

/// Turns a stream of raw viewport changes into at most one sample per window.
///
/// The debouncer holds no timers itself: the owner sleeps until
/// [`ViewportDebouncer::deadline`] and then calls [`ViewportDebouncer::poll`].
#[derive(Debug)]
pub struct ViewportDebouncer {
    delays: DebounceDelays,
    category: Option<String>,
    pending: Option<(Viewport, Instant)>,
    current: Option<Viewport>,
}

impl ViewportDebouncer {
    pub fn new(delays: DebounceDelays) -> Self {
        Self {
            delays,
            category: None,
            pending: None,
            current: None,
        }
    }

    /// Record a raw viewport change, superseding any sample still waiting.
    /// Returns the new deadline.
    pub fn push(&mut self, viewport: Viewport, now: Instant) -> Instant {
        let deadline = now + self.delays.for_zoom(viewport.zoom);
        self.pending = Some((viewport, deadline));
        deadline
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, deadline)| deadline)
    }

    /// Emit the waiting sample if its window has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<ViewportSample> {
        match self.pending {
            Some((viewport, deadline)) if deadline <= now => {
                self.pending = None;
                Some(self.emit(viewport))
            }
            _ => None,
        }
    }

    /// Switch category and emit right away, without waiting for a window.
    pub fn set_category(&mut self, category: Option<String>) -> Option<ViewportSample> {
        self.category = category;
        self.refresh()
    }

    /// Emit the latest known viewport immediately, cancelling any pending window.
    pub fn refresh(&mut self) -> Option<ViewportSample> {
        let viewport = match self.pending.take() {
            Some((viewport, _)) => viewport,
            None => self.current?,
        };
        Some(self.emit(viewport))
    }

    /// Last emitted sample
    pub fn current(&self) -> Option<ViewportSample> {
        self.current.map(|viewport| ViewportSample {
            viewport,
            category: self.category.clone(),
        })
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn emit(&mut self, viewport: Viewport) -> ViewportSample {
        self.current = Some(viewport);
        ViewportSample {
            viewport,
            category: self.category.clone(),
        }
    }
}
