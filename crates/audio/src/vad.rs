//! Voice activity edge detection
//!
//! Level-based VAD over the per-chunk meter output. The detector reports
//! only edges (silence→speech, speech→silence); the orchestrator's timers
//! own the endpointing and barge-in confirmation windows.

use avatar_voice_core::QualityMetrics;

/// Chunk-level voice activity detector
#[derive(Debug, Default)]
pub struct VadDetector {
    active: bool,
}

impl VadDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk's metrics. Returns `Some(new_state)` on an edge,
    /// `None` when activity is unchanged.
    pub fn update(&mut self, metrics: &QualityMetrics) -> Option<bool> {
        let voiced = !metrics.is_silent;
        if voiced != self.active {
            self.active = voiced;
            Some(voiced)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Forget accumulated state, e.g. when a capture stream restarts
    pub fn reset(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(is_silent: bool) -> QualityMetrics {
        QualityMetrics {
            volume: if is_silent { 1 } else { 60 },
            rms_dbfs: if is_silent { -60.0 } else { -20.0 },
            snr_db: 10.0,
            is_clipping: false,
            is_silent,
        }
    }

    #[test]
    fn test_edges_only() {
        let mut vad = VadDetector::new();
        assert_eq!(vad.update(&metrics(true)), None); // starts silent
        assert_eq!(vad.update(&metrics(false)), Some(true));
        assert_eq!(vad.update(&metrics(false)), None);
        assert_eq!(vad.update(&metrics(true)), Some(false));
        assert_eq!(vad.update(&metrics(true)), None);
    }

    #[test]
    fn test_reset_clears_activity() {
        let mut vad = VadDetector::new();
        vad.update(&metrics(false));
        assert!(vad.is_active());
        vad.reset();
        assert!(!vad.is_active());
        assert_eq!(vad.update(&metrics(false)), Some(true));
    }
}
