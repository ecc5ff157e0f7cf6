//! Randomized pacing and per-session browser identity.
//!
//! Every remote interaction is preceded by [`Throttle::delay`], a uniformly
//! random pause inside the configured bounds. The browser fingerprint is
//! picked once and then pinned, so one authenticated session never changes
//! identity halfway through a run.

use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// User agents to rotate through between sessions
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768)];

const LOCALES: &[&str] = &["en-US", "en-GB"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Browser identity presented to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: Viewport,
    pub locale: String,
}

/// Delay bounds and identity pools. Read-only once loaded.
#[derive(Debug, Clone)]
pub struct ThrottleProfile {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub user_agents: Vec<String>,
    pub viewports: Vec<Viewport>,
    pub locales: Vec<String>,
}

impl Default for ThrottleProfile {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            user_agents: USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            viewports: VIEWPORTS
                .iter()
                .map(|&(width, height)| Viewport { width, height })
                .collect(),
            locales: LOCALES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ThrottleProfile {
    /// Default pools with delay bounds given in (fractional) seconds.
    pub fn from_secs(min_secs: f64, max_secs: f64) -> Result<Self> {
        for (name, value) in [("min", min_secs), ("max", max_secs)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::ThrottleConfiguration(format!(
                    "{} delay must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }
        let profile = Self {
            min_delay: Duration::from_secs_f64(min_secs),
            max_delay: Duration::from_secs_f64(max_secs),
            ..Self::default()
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_delay > self.max_delay {
            return Err(Error::ThrottleConfiguration(format!(
                "min delay {:?} is greater than max delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        if self.user_agents.is_empty() || self.viewports.is_empty() || self.locales.is_empty() {
            return Err(Error::ThrottleConfiguration(
                "fingerprint pools must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Throttle {
    profile: ThrottleProfile,
    pinned: Mutex<Option<Fingerprint>>,
}

impl Throttle {
    /// Validates the profile; bad bounds fail here, before any navigation.
    pub fn new(profile: ThrottleProfile) -> Result<Self> {
        profile.validate()?;
        Ok(Self {
            profile,
            pinned: Mutex::new(None),
        })
    }

    pub fn profile(&self) -> &ThrottleProfile {
        &self.profile
    }

    /// Draws one delay uniformly from `[min, max]`.
    pub fn sample_delay(&self) -> Duration {
        let (min, max) = (self.profile.min_delay, self.profile.max_delay);
        if min == max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Waits a random delay before the next remote interaction.
    pub async fn delay(&self, cancel: &CancellationToken) -> Result<Duration> {
        let delay = self.sample_delay();
        log::debug!("Waiting {:.2}s...", delay.as_secs_f64());
        pause(delay, cancel).await?;
        Ok(delay)
    }

    /// The identity for the current session, picked on first use.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        pinned
            .get_or_insert_with(|| self.pick_fingerprint())
            .clone()
    }

    /// Reuses the identity a restored session logged in with.
    pub fn pin(&self, fingerprint: Fingerprint) {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        *pinned = Some(fingerprint);
    }

    fn pick_fingerprint(&self) -> Fingerprint {
        let mut rng = rand::thread_rng();
        // Pools are validated non-empty in `new`.
        let user_agent = self
            .profile
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default();
        let viewport = self
            .profile
            .viewports
            .choose(&mut rng)
            .copied()
            .unwrap_or(Viewport {
                width: 1920,
                height: 1080,
            });
        let locale = self
            .profile
            .locales
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| "en-US".to_string());
        Fingerprint {
            user_agent,
            viewport,
            locale,
        }
    }
}

/// Suspends for `duration` unless `cancel` fires first.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_profile_is_valid() {
        assert!(ThrottleProfile::default().validate().is_ok());
    }

    #[test]
    fn test_min_greater_than_max_rejected() {
        let err = ThrottleProfile::from_secs(5.0, 2.0).unwrap_err();
        assert!(matches!(err, Error::ThrottleConfiguration(_)));

        let mut profile = ThrottleProfile::default();
        profile.min_delay = Duration::from_secs(9);
        assert!(matches!(
            Throttle::new(profile),
            Err(Error::ThrottleConfiguration(_))
        ));
    }

    #[test]
    fn test_negative_and_nan_bounds_rejected() {
        assert!(ThrottleProfile::from_secs(-1.0, 2.0).is_err());
        assert!(ThrottleProfile::from_secs(0.0, f64::NAN).is_err());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let mut profile = ThrottleProfile::default();
        profile.user_agents.clear();
        assert!(Throttle::new(profile).is_err());
    }

    #[test]
    fn test_equal_bounds_give_fixed_delay() {
        let throttle = Throttle::new(ThrottleProfile::from_secs(1.5, 1.5).unwrap()).unwrap();
        assert_eq!(throttle.sample_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_samples_spread_across_interval() {
        let throttle = Throttle::new(ThrottleProfile::from_secs(1.0, 3.0).unwrap()).unwrap();
        let samples: Vec<Duration> = (0..2000).map(|_| throttle.sample_delay()).collect();
        assert!(samples
            .iter()
            .all(|d| *d >= Duration::from_secs(1) && *d <= Duration::from_secs(3)));

        let below_mid = samples.iter().filter(|d| **d < Duration::from_secs(2)).count();
        // Uniform: roughly half the samples fall below the midpoint.
        assert!((700..1300).contains(&below_mid), "below_mid = {}", below_mid);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(min in 0u64..5_000, extra in 0u64..5_000) {
            let max = min + extra;
            let mut profile = ThrottleProfile::default();
            profile.min_delay = Duration::from_millis(min);
            profile.max_delay = Duration::from_millis(max);
            let throttle = Throttle::new(profile).unwrap();
            for _ in 0..50 {
                let d = throttle.sample_delay();
                prop_assert!(d >= Duration::from_millis(min));
                prop_assert!(d <= Duration::from_millis(max));
            }
        }

        #[test]
        fn prop_delay_within_sub_millisecond_bounds(min in 0u64..5_000_000_000, extra in 0u64..1_000_000) {
            let mut profile = ThrottleProfile::default();
            profile.min_delay = Duration::from_nanos(min);
            profile.max_delay = Duration::from_nanos(min + extra);
            let throttle = Throttle::new(profile.clone()).unwrap();
            for _ in 0..50 {
                let d = throttle.sample_delay();
                prop_assert!(d >= profile.min_delay);
                prop_assert!(d <= profile.max_delay);
            }
        }
    }

    #[test]
    fn test_fractional_millisecond_bounds_hold() {
        let throttle = Throttle::new(ThrottleProfile::from_secs(1.0004, 1.0006).unwrap()).unwrap();
        let min = throttle.profile().min_delay;
        let max = throttle.profile().max_delay;
        for _ in 0..1_000 {
            let d = throttle.sample_delay();
            assert!(d >= min && d <= max, "{:?} outside [{:?}, {:?}]", d, min, max);
        }
    }

    #[test]
    fn test_fingerprint_is_stable_until_pinned() {
        let throttle = Throttle::new(ThrottleProfile::default()).unwrap();
        let first = throttle.fingerprint();
        for _ in 0..20 {
            assert_eq!(throttle.fingerprint(), first);
        }
        assert!(USER_AGENTS.contains(&first.user_agent.as_str()));

        let restored = Fingerprint {
            user_agent: "restored-agent".into(),
            viewport: Viewport {
                width: 800,
                height: 600,
            },
            locale: "en-GB".into(),
        };
        throttle.pin(restored.clone());
        assert_eq!(throttle.fingerprint(), restored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_waits_within_bounds() {
        let throttle = Throttle::new(ThrottleProfile::from_secs(2.0, 4.0).unwrap()).unwrap();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let waited = throttle.delay(&cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited <= Duration::from_secs(4));
        assert!(elapsed >= waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_honours_cancellation() {
        let throttle = Throttle::new(ThrottleProfile::from_secs(10.0, 20.0).unwrap()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(throttle.delay(&cancel).await, Err(Error::Cancelled)));
    }
}
