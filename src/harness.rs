//! Synthetic keyed traffic for exercising limiters.
//!
//! Every limiter instance calls every key once per interval, the way a set of
//! service replicas would each route requests for the same handful of
//! endpoints. Allowed rates are logged once per second while running and
//! summarised in a [`TrafficReport`] at the end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use rand::Rng;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{LimiterError, Result};
use crate::ratelimit::RateLimiterBackend;

/// Shape of the generated traffic.
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Keys every instance calls
    pub keys: Vec<String>,
    /// Pause between two calls for the same key from the same instance
    pub interval: Duration,
    /// How long to keep calling
    pub duration: Duration,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            keys: Self::numbered_keys(5),
            interval: Duration::from_millis(10),
            duration: Duration::from_secs(5),
        }
    }
}

impl TrafficConfig {
    /// `Key0`, `Key1`, ... `Key{count-1}`.
    pub fn numbered_keys(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("Key{}", i)).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(LimiterError::Config("traffic needs at least one key".to_string()));
        }
        if self.interval.is_zero() {
            return Err(LimiterError::Config("traffic interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Outcome for one key, summed over all instances.
#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub key: String,
    pub allowed: u64,
    pub denied: u64,
    pub allowed_per_sec: f64,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub instances: usize,
    pub elapsed_secs: f64,
    pub keys: Vec<KeyReport>,
}

impl TrafficReport {
    /// Report for a single key.
    pub fn key(&self, key: &str) -> Option<&KeyReport> {
        self.keys.iter().find(|report| report.key == key)
    }
}

#[derive(Debug, Default)]
struct KeyCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Drive `instances` with the configured traffic until the duration elapses.
///
/// The first limiter error stops every caller and is returned.
pub async fn drive(
    instances: &[Arc<dyn RateLimiterBackend>],
    config: &TrafficConfig,
) -> Result<TrafficReport> {
    config.validate()?;
    if instances.is_empty() {
        return Err(LimiterError::Config("traffic needs at least one limiter".to_string()));
    }

    let counters: HashMap<&str, KeyCounters> = config
        .keys
        .iter()
        .map(|key| (key.as_str(), KeyCounters::default()))
        .collect();

    info!(
        instances = instances.len(),
        keys = config.keys.len(),
        interval_ms = config.interval.as_millis() as u64,
        duration_secs = config.duration.as_secs_f64(),
        "Starting synthetic traffic"
    );

    let started = Instant::now();
    let deadline = started + config.duration;

    let counters_ref = &counters;
    let interval = config.interval;
    let callers = instances.iter().enumerate().flat_map(move |(instance, limiter)| {
        config.keys.iter().map(move |key| {
            call_key(instance, limiter.as_ref(), key, counters_ref, interval, deadline)
        })
    });

    // Elapsed time is taken when the last caller stops, not when logging does.
    let callers = async {
        try_join_all(callers).await?;
        Ok::<_, LimiterError>(started.elapsed())
    };
    let (elapsed, ()) = tokio::try_join!(callers, log_rates(counters_ref, deadline))?;

    let elapsed = elapsed.as_secs_f64();
    let keys = config
        .keys
        .iter()
        .map(|key| {
            let counter = &counters[key.as_str()];
            let allowed = counter.allowed.load(Ordering::Relaxed);
            KeyReport {
                key: key.clone(),
                allowed,
                denied: counter.denied.load(Ordering::Relaxed),
                allowed_per_sec: if elapsed > 0.0 { allowed as f64 / elapsed } else { 0.0 },
            }
        })
        .collect();

    Ok(TrafficReport {
        instances: instances.len(),
        elapsed_secs: elapsed,
        keys,
    })
}

/// Call `key` on one limiter every `interval` until `deadline`.
async fn call_key(
    instance: usize,
    limiter: &dyn RateLimiterBackend,
    key: &str,
    counters: &HashMap<&str, KeyCounters>,
    interval: Duration,
    deadline: Instant,
) -> Result<()> {
    // Spread the first call over one interval so callers do not tick together.
    let jitter = Duration::from_micros(
        rand::thread_rng().gen_range(0..=interval.as_micros().max(1) as u64),
    );
    let mut ticker = tokio::time::interval_at(Instant::now() + jitter, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let counter = &counters[key];
    let stop = tokio::time::sleep_until(deadline);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            tick = ticker.tick() => {
                if tick >= deadline {
                    break;
                }
            }
            _ = &mut stop => break,
        }
        if limiter.is_limited(key).await? {
            counter.denied.fetch_add(1, Ordering::Relaxed);
        } else {
            counter.allowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    debug!(instance = instance, key = %key, "Caller finished");
    Ok(())
}

/// Log the allowed rate of every key once per second, returning at `deadline`.
async fn log_rates(counters: &HashMap<&str, KeyCounters>, deadline: Instant) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_at = ticker.tick().await;
    let mut last: HashMap<&str, u64> = counters.keys().map(|key| (*key, 0)).collect();
    let stop = tokio::time::sleep_until(deadline);
    tokio::pin!(stop);

    loop {
        let now = tokio::select! {
            now = ticker.tick() => now,
            _ = &mut stop => break,
        };
        if now > deadline {
            break;
        }
        let secs = (now - last_at).as_secs_f64();
        for (key, counter) in counters {
            let allowed = counter.allowed.load(Ordering::Relaxed);
            let previous = last.insert(*key, allowed).unwrap_or(0);
            let rate = (allowed - previous) as f64 / secs;
            info!(key = %key, rate = format!("{:.2}", rate), "Allowed rate");
        }
        last_at = now;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AllowAll;

    #[async_trait]
    impl RateLimiterBackend for AllowAll {
        async fn is_limited(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct Broken;

    #[async_trait]
    impl RateLimiterBackend for Broken {
        async fn is_limited(&self, _: &str) -> Result<bool> {
            Err(LimiterError::Reply("boom".to_string()))
        }
    }

    fn short_config(keys: usize) -> TrafficConfig {
        TrafficConfig {
            keys: TrafficConfig::numbered_keys(keys),
            interval: Duration::from_millis(10),
            duration: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_numbered_keys() {
        assert_eq!(TrafficConfig::numbered_keys(3), vec!["Key0", "Key1", "Key2"]);
    }

    #[tokio::test]
    async fn test_rejects_empty_inputs() {
        let instances: Vec<Arc<dyn RateLimiterBackend>> = vec![Arc::new(AllowAll)];
        assert!(drive(&instances, &short_config(0)).await.is_err());
        assert!(drive(&[], &short_config(1)).await.is_err());

        let config = TrafficConfig {
            interval: Duration::ZERO,
            ..short_config(1)
        };
        assert!(drive(&instances, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_counts_every_call() {
        let instances: Vec<Arc<dyn RateLimiterBackend>> = vec![Arc::new(AllowAll), Arc::new(AllowAll)];
        let report = drive(&instances, &short_config(2)).await.unwrap();

        assert_eq!(report.instances, 2);
        assert_eq!(report.keys.len(), 2);
        for key in &report.keys {
            assert_eq!(key.denied, 0);
            // ~30 ticks per instance in 300ms; leave room for slow machines.
            assert!(key.allowed > 10 && key.allowed <= 62, "allowed = {}", key.allowed);
        }
        assert!(report.key("Key1").is_some());
        assert!(report.key("Key9").is_none());
    }

    #[tokio::test]
    async fn test_elapsed_matches_fractional_duration() {
        let instances: Vec<Arc<dyn RateLimiterBackend>> = vec![Arc::new(AllowAll)];
        let config = TrafficConfig {
            duration: Duration::from_millis(1500),
            ..short_config(1)
        };

        let report = drive(&instances, &config).await.unwrap();
        assert!(
            report.elapsed_secs >= 1.5 && report.elapsed_secs < 1.6,
            "elapsed_secs = {}",
            report.elapsed_secs
        );
        // One call every 10ms from a single instance.
        let rate = report.keys[0].allowed_per_sec;
        assert!(rate > 50.0 && rate <= 101.0, "allowed_per_sec = {}", rate);
    }

    #[tokio::test]
    async fn test_first_error_stops_the_run() {
        let instances: Vec<Arc<dyn RateLimiterBackend>> = vec![Arc::new(AllowAll), Arc::new(Broken)];
        let config = TrafficConfig {
            duration: Duration::from_secs(30),
            ..short_config(1)
        };

        let result = tokio::time::timeout(Duration::from_secs(5), drive(&instances, &config))
            .await
            .expect("a failing limiter should end the run early");
        assert!(matches!(result, Err(LimiterError::Reply(_))));
    }

    #[test]
    fn test_report_serializes() {
        let report = TrafficReport {
            instances: 1,
            elapsed_secs: 1.0,
            keys: vec![KeyReport {
                key: "Key0".to_string(),
                allowed: 60,
                denied: 40,
                allowed_per_sec: 60.0,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["keys"][0]["key"], "Key0");
        assert_eq!(json["keys"][0]["allowed_per_sec"], 60.0);
    }
}
