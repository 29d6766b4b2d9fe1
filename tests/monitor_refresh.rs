//! The monitor's scheduler loop against a scripted refresher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use caam::error::Result;
use caam::pool::{AuthPool, MonitorConfig, PoolMonitor, PoolOptions, ProfileStatus, Refresher};
use caam::Provider;

struct CountingRefresher {
    calls: AtomicUsize,
    fail_profile: Option<&'static str>,
}

#[async_trait]
impl Refresher for CountingRefresher {
    async fn refresh(&self, _provider: Provider, name: &str) -> Result<DateTime<Utc>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_profile == Some(name) {
            return Err(caam::Error::RefreshFailed {
                key: name.to_string(),
                message: "provider said no".to_string(),
            });
        }
        Ok(Utc::now() + ChronoDuration::hours(4))
    }
}

fn seeded_pool() -> Arc<AuthPool> {
    let pool = Arc::new(AuthPool::new(PoolOptions::default()));
    for name in ["alpha", "beta"] {
        pool.add_profile(Provider::Claude, name).unwrap();
        pool.set_status(Provider::Claude, name, ProfileStatus::Expired)
            .unwrap();
    }
    pool
}

#[tokio::test]
async fn scheduler_loop_refreshes_expired_profiles() {
    let pool = seeded_pool();
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicUsize::new(0),
        fail_profile: None,
    });
    let monitor = Arc::new(
        PoolMonitor::new(
            Arc::clone(&pool),
            MonitorConfig {
                check_interval: Duration::from_millis(20),
                max_concurrent: 3,
            },
        )
        .with_refresher(Arc::clone(&refresher) as Arc<dyn Refresher>),
    );

    monitor.start().unwrap();

    // Give the loop a few ticks to claim and finish both refreshes.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ready = pool.get_ready_profiles(Some(Provider::Claude)).len();
        if ready == 2 {
            break;
        }
    }
    monitor.stop();

    assert_eq!(pool.get_ready_profiles(Some(Provider::Claude)).len(), 2);
    assert!(refresher.calls.load(Ordering::SeqCst) >= 2);

    // Ready profiles with distant expiries are left alone afterwards.
    let stats = monitor.stats();
    assert!(!stats.running);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.last_sweep.is_some());
}

#[tokio::test]
async fn failing_profile_collects_errors_without_blocking_others() {
    let pool = seeded_pool();
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicUsize::new(0),
        fail_profile: Some("beta"),
    });
    let monitor = Arc::new(
        PoolMonitor::new(
            Arc::clone(&pool),
            MonitorConfig {
                check_interval: Duration::from_millis(20),
                max_concurrent: 2,
            },
        )
        .with_refresher(Arc::clone(&refresher) as Arc<dyn Refresher>),
    );

    monitor.start().unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let beta_parked = pool.get_status(Provider::Claude, "beta") == Some(ProfileStatus::Error);
        let alpha_ready = pool.get_status(Provider::Claude, "alpha") == Some(ProfileStatus::Ready);
        if beta_parked && alpha_ready {
            break;
        }
    }
    monitor.stop();

    assert_eq!(
        pool.get_status(Provider::Claude, "alpha"),
        Some(ProfileStatus::Ready)
    );
    let beta = pool.get(Provider::Claude, "beta").unwrap();
    assert_eq!(beta.status, ProfileStatus::Error);
    assert!(beta.error_count >= 3);
    assert!(beta.error_message.contains("provider said no"));
}

#[tokio::test]
async fn cooldowns_expire_through_the_scheduler() {
    let pool = Arc::new(AuthPool::new(PoolOptions::default()));
    pool.add_profile(Provider::Codex, "parked").unwrap();
    pool.set_cooldown(Provider::Codex, "parked", Duration::from_millis(30));

    let monitor = Arc::new(PoolMonitor::new(
        Arc::clone(&pool),
        MonitorConfig {
            check_interval: Duration::from_millis(20),
            max_concurrent: 1,
        },
    ));
    monitor.start().unwrap();

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if pool.get_status(Provider::Codex, "parked") == Some(ProfileStatus::Ready) {
            break;
        }
    }
    monitor.stop();

    assert_eq!(
        pool.get_status(Provider::Codex, "parked"),
        Some(ProfileStatus::Ready)
    );
}
