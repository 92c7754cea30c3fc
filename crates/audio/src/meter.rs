//! Per-chunk quality metering
//!
//! Peak/RMS measurement over float samples in `[-1.0, 1.0]`, with a slowly
//! adapting noise floor for the SNR estimate. One meter instance per capture
//! stream; it carries state across chunks.

use avatar_voice_core::QualityMetrics;

const DB_FLOOR: f32 = -100.0;
const CLIP_PEAK: f32 = 0.99;

/// Streaming audio quality meter
#[derive(Debug)]
pub struct QualityMeter {
    silence_threshold_db: f32,
    noise_floor_db: f32,
}

impl QualityMeter {
    pub fn new(silence_threshold_db: f32) -> Self {
        Self {
            silence_threshold_db,
            // Start pessimistic; silent chunks pull this toward the real floor.
            noise_floor_db: -70.0,
        }
    }

    /// Measure one chunk of samples
    pub fn measure(&mut self, samples: &[f32]) -> QualityMetrics {
        if samples.is_empty() {
            return QualityMetrics {
                volume: 0,
                rms_dbfs: DB_FLOOR,
                snr_db: 0.0,
                is_clipping: false,
                is_silent: true,
            };
        }

        let mut peak = 0.0f32;
        let mut sum_squares = 0.0f32;
        for &s in samples {
            peak = peak.max(s.abs());
            sum_squares += s * s;
        }
        let rms = (sum_squares / samples.len() as f32).sqrt();

        let rms_dbfs = if rms > 0.0 {
            (20.0 * rms.log10()).max(DB_FLOOR)
        } else {
            DB_FLOOR
        };

        let is_silent = rms_dbfs < self.silence_threshold_db;
        if is_silent {
            // Exponential moving floor, updated only from silent chunks
            self.noise_floor_db = 0.95 * self.noise_floor_db + 0.05 * rms_dbfs;
        }

        QualityMetrics {
            volume: (peak * 100.0).round().clamp(0.0, 100.0) as u8,
            rms_dbfs,
            snr_db: (rms_dbfs - self.noise_floor_db).max(0.0),
            is_clipping: peak >= CLIP_PEAK,
            is_silent,
        }
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.noise_floor_db
    }
}
