use crate::page::Page;
use rand::Rng;
use std::time::Duration;

/// Normal sample centred on the middle of `[min, max]`, clamped to the range.
pub fn gaussian_between<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    // Box-Muller; `1 - u` keeps the log argument away from zero.
    let u: f64 = 1.0 - rng.gen::<f64>();
    let v: f64 = rng.gen();
    let z = (-2.0 * u.ln()).sqrt() * (2.0 * std::f64::consts::PI * v).cos();
    let mean = (min + max) / 2.0;
    let std_dev = (max - min) / 6.0;
    (z * std_dev + mean).clamp(min, max)
}

pub fn uniform_between(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Waits a human-looking amount of time through the page; returns the delay used.
pub async fn human_delay<P: Page + ?Sized>(page: &P, min_ms: u64, max_ms: u64) -> u64 {
    let ms = gaussian_between(&mut rand::thread_rng(), min_ms as f64, max_ms as f64).round() as u64;
    page.wait_for_timeout(ms).await;
    ms
}

/// 01:00 to 06:59 local time.
pub fn is_night_hour(hour: u8) -> bool {
    (1..7).contains(&hour)
}

pub fn night_mode_active(enabled: bool) -> bool {
    if !enabled {
        return false;
    }
    match time::OffsetDateTime::now_local() {
        Ok(now) => is_night_hour(now.hour()),
        Err(_) => is_night_hour(time::OffsetDateTime::now_utc().hour()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gaussian_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2_000 {
            let v = gaussian_between(&mut rng, 1_000.0, 3_000.0);
            assert!((1_000.0..=3_000.0).contains(&v));
        }
    }

    #[test]
    fn gaussian_centres_on_midpoint() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 5_000;
        let mean: f64 = (0..n)
            .map(|_| gaussian_between(&mut rng, 0.0, 600.0))
            .sum::<f64>()
            / n as f64;
        assert!((mean - 300.0).abs() < 15.0, "mean {mean}");
    }

    #[test]
    fn degenerate_range_returns_min() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(gaussian_between(&mut rng, 500.0, 500.0), 500.0);
    }

    #[test]
    fn night_window() {
        assert!(!is_night_hour(0));
        assert!(is_night_hour(1));
        assert!(is_night_hour(6));
        assert!(!is_night_hour(7));
        assert!(!night_mode_active(false));
    }
}
