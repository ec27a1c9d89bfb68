pub struct EnergyMeter {
    epsilon: f32,
}

impl EnergyMeter {
    pub fn new() -> Self {
        Self { epsilon: 1e-10 }
    }

    /// RMS of a mono window, normalized to [0, 1].
    pub fn rms(&self, window: &[i16]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }

        let sum_squares: i64 = window
            .iter()
            .map(|&sample| {
                let s = sample as i64;
                s * s
            })
            .sum();

        let mean_square = sum_squares as f64 / window.len() as f64;
        (mean_square.sqrt() / 32768.0) as f32
    }

    pub fn rms_to_dbfs(&self, rms: f32) -> f32 {
        if rms <= self.epsilon {
            return -100.0;
        }
        20.0 * rms.log10()
    }

    pub fn dbfs(&self, window: &[i16]) -> f32 {
        self.rms_to_dbfs(self.rms(window))
    }
}

impl Default for EnergyMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 1200;

    #[test]
    fn silence_returns_floor_dbfs() {
        let meter = EnergyMeter::new();
        let silence = vec![0i16; WINDOW];
        assert!(meter.dbfs(&silence) <= -100.0);
    }

    #[test]
    fn full_scale_returns_zero_dbfs() {
        let meter = EnergyMeter::new();
        let full_scale = vec![32767i16; WINDOW];
        assert!(meter.dbfs(&full_scale).abs() < 0.1);
    }

    #[test]
    fn half_scale_sine_rms() {
        let meter = EnergyMeter::new();
        let sine: Vec<i16> = (0..WINDOW)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / WINDOW as f32;
                (phase.sin() * 16384.0) as i16
            })
            .collect();
        // Half scale sine: 0.5 / sqrt(2).
        assert!((meter.rms(&sine) - 0.354).abs() < 0.01);
    }

    #[test]
    fn empty_window_is_silent() {
        let meter = EnergyMeter::new();
        assert_eq!(meter.rms(&[]), 0.0);
        assert_eq!(meter.dbfs(&[]), -100.0);
    }
}
