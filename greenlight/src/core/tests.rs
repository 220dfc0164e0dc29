use super::{
    Admission, ClientThrottle, InMemoryRepository, RecordError, Repository, ThrottleConfig,
    ThrottleError, VersionedRecord,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn throttle(capacity: u32, rate: f64) -> ClientThrottle {
    ClientThrottle::new(ThrottleConfig::new(capacity, rate)).unwrap()
}

fn throttle_with_window(capacity: u32, rate: f64, window: Duration) -> ClientThrottle {
    ClientThrottle::new(ThrottleConfig::new(capacity, rate).eviction_window(window)).unwrap()
}

#[test]
fn test_fresh_client_gets_full_burst() {
    let throttle = throttle(10, 5.0);
    let now = Instant::now();

    for i in 0..10 {
        assert_eq!(
            throttle.admit("198.51.100.1", now),
            Admission::Allowed,
            "Request {} should be allowed",
            i + 1
        );
    }
    assert_eq!(throttle.admit("198.51.100.1", now), Admission::Denied);

    let later = now + Duration::from_secs(1);
    assert_eq!(throttle.admit("198.51.100.1", later), Admission::Allowed);
}

#[test]
fn test_clients_are_independent() {
    let throttle = throttle(2, 1.0);
    let now = Instant::now();

    assert!(throttle.admit("a", now).is_allowed());
    assert!(throttle.admit("a", now).is_allowed());
    assert!(!throttle.admit("a", now).is_allowed());

    // b still has its whole burst
    assert!(throttle.admit("b", now).is_allowed());
    assert!(throttle.admit("b", now).is_allowed());
    assert!(!throttle.admit("b", now).is_allowed());
    assert_eq!(throttle.len(), 2);
}

#[test]
fn test_disabled_throttle_admits_everything_without_tracking() {
    let throttle = ClientThrottle::new(ThrottleConfig::disabled()).unwrap();
    let now = Instant::now();

    for _ in 0..1_000 {
        assert_eq!(throttle.admit("203.0.113.9", now), Admission::Allowed);
    }
    assert!(throttle.is_empty());
}

#[test]
fn test_disabled_throttle_skips_validation() {
    let config = ThrottleConfig {
        enabled: false,
        ..ThrottleConfig::new(0, 0.0)
    };
    assert!(ClientThrottle::new(config).is_ok());
}

#[test]
fn test_config_validation() {
    assert_eq!(
        ClientThrottle::new(ThrottleConfig::new(0, 1.0)).err(),
        Some(ThrottleError::ZeroCapacity)
    );
    assert_eq!(
        ClientThrottle::new(ThrottleConfig::new(1, -2.0)).err(),
        Some(ThrottleError::InvalidRefillRate(-2.0))
    );
    assert!(matches!(
        ClientThrottle::new(ThrottleConfig::new(1, f64::NAN)).err(),
        Some(ThrottleError::InvalidRefillRate(_))
    ));
    assert_eq!(
        ClientThrottle::new(ThrottleConfig::new(1, 1.0).sweep_interval(Duration::ZERO)).err(),
        Some(ThrottleError::ZeroSweepInterval)
    );
    assert_eq!(
        ClientThrottle::new(ThrottleConfig::new(1, 1.0).eviction_window(Duration::ZERO)).err(),
        Some(ThrottleError::ZeroEvictionWindow)
    );
}

#[test]
fn test_default_eviction_window_is_three_sweeps() {
    let config = ThrottleConfig::new(4, 2.0);
    assert_eq!(config.sweep_interval, Duration::from_secs(60));
    assert_eq!(config.eviction_window, 3 * config.sweep_interval);
}

#[test]
fn test_evict_idle_clients_only() {
    let throttle = throttle(4, 2.0);
    let start = Instant::now();

    throttle.admit("idle", start);
    throttle.admit("active", start);
    throttle.admit("active", start + Duration::from_secs(150));

    let sweep = start + Duration::from_secs(180);
    assert_eq!(throttle.evict_idle(sweep), 1);
    assert!(!throttle.contains("idle"));
    assert!(throttle.contains("active"));
}

#[test]
fn test_eviction_boundary_is_inclusive() {
    let throttle = throttle_with_window(1, 1.0, Duration::from_secs(10));
    let start = Instant::now();
    throttle.admit("edge", start);

    assert_eq!(throttle.evict_idle(start + Duration::from_millis(9_999)), 0);
    assert_eq!(throttle.evict_idle(start + Duration::from_secs(10)), 1);
}

#[test]
fn test_denied_attempts_refresh_last_seen() {
    let throttle = throttle_with_window(1, 0.001, Duration::from_secs(10));
    let start = Instant::now();

    assert!(throttle.admit("noisy", start).is_allowed());
    // Keeps knocking while out of tokens
    let knock = start + Duration::from_secs(8);
    assert!(!throttle.admit("noisy", knock).is_allowed());

    assert_eq!(throttle.evict_idle(start + Duration::from_secs(12)), 0);
    assert!(throttle.contains("noisy"));
}

#[test]
fn test_evicted_client_comes_back_with_full_bucket() {
    let throttle = throttle_with_window(2, 0.001, Duration::from_secs(10));
    let start = Instant::now();

    assert!(throttle.admit("c", start).is_allowed());
    assert!(throttle.admit("c", start).is_allowed());
    assert!(!throttle.admit("c", start).is_allowed());

    let later = start + Duration::from_secs(11);
    assert_eq!(throttle.evict_idle(later), 1);
    assert!(throttle.admit("c", later).is_allowed());
    assert!(throttle.admit("c", later).is_allowed());
}

#[test]
fn test_concurrent_admissions_respect_capacity() {
    let throttle = Arc::new(throttle(50, 0.001));
    let now = Instant::now();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..100)
                    .filter(|_| throttle.admit("shared", now).is_allowed())
                    .count()
            })
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, 50);
}

#[test]
fn test_sweeps_racing_admissions_keep_every_client_admitted() {
    let throttle = Arc::new(throttle_with_window(1_000_000, 1.0, Duration::from_secs(1)));
    let start = Instant::now();

    thread::scope(|scope| {
        for worker in 0..4 {
            let throttle = Arc::clone(&throttle);
            scope.spawn(move || {
                for i in 0..500u64 {
                    let now = start + Duration::from_millis(i * 10);
                    assert!(throttle.admit(&format!("client-{worker}"), now).is_allowed());
                }
            });
        }

        let throttle = Arc::clone(&throttle);
        scope.spawn(move || {
            for i in 0..500u64 {
                // A sweep that outruns a worker may evict it; its next
                // admission starts a fresh bucket
                throttle.evict_idle(start + Duration::from_millis(i * 10));
            }
        });
    });

    assert_eq!(throttle.len(), 4);
}

#[test]
fn test_insert_starts_at_version_one() {
    let repo = InMemoryRepository::new();
    let first = repo.insert("a").unwrap();
    let second = repo.insert("b").unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 1);
    assert_ne!(first.id, second.id);
    assert_eq!(repo.len(), 2);
}

#[test]
fn test_conditional_update_scenario() {
    let repo = InMemoryRepository::new();
    for n in 1..=7 {
        repo.insert(format!("movie {n}")).unwrap();
    }

    // Bring record 7 to version 3
    for _ in 0..2 {
        let current = repo.fetch(7).unwrap();
        repo.update_if_version(&current).unwrap();
    }

    let mut writer_a = repo.fetch(7).unwrap();
    let mut writer_b = repo.fetch(7).unwrap();
    assert_eq!(writer_a.version, 3);
    assert_eq!(writer_b.version, 3);

    writer_a.payload = "from A".to_string();
    assert_eq!(repo.update_if_version(&writer_a), Ok(4));

    writer_b.payload = "from B".to_string();
    assert_eq!(repo.update_if_version(&writer_b), Err(RecordError::Conflict));

    let stored = repo.fetch(7).unwrap();
    assert_eq!(stored.version, 4);
    assert_eq!(stored.payload, "from A");
}

#[test]
fn test_retry_after_conflict_with_fresh_read_succeeds() {
    let repo = InMemoryRepository::new();
    let original = repo.insert(0u32).unwrap();

    let mut winner = original.clone();
    winner.payload = 1;
    repo.update_if_version(&winner).unwrap();

    let mut loser = original;
    loser.payload = 2;
    assert_eq!(repo.update_if_version(&loser), Err(RecordError::Conflict));

    let mut retry = repo.fetch(loser.id).unwrap();
    retry.payload = 2;
    assert_eq!(repo.update_if_version(&retry), Ok(3));
    assert_eq!(repo.fetch(loser.id).unwrap().payload, 2);
}

#[test]
fn test_concurrent_writers_exactly_one_wins() {
    for _ in 0..50 {
        let repo = Arc::new(InMemoryRepository::new());
        let seed = repo.insert(String::from("seed")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                let mut record = seed.clone();
                record.payload = name.to_string();
                thread::spawn(move || {
                    barrier.wait();
                    (name, repo.update_if_version(&record))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
        let conflicts = results
            .iter()
            .filter(|(_, r)| *r == Err(RecordError::Conflict))
            .count();

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 1);
        assert_eq!(winners[0].1, Ok(2));

        let stored = repo.fetch(seed.id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload, winners[0].0);
    }
}

#[test]
fn test_not_found_is_distinct_from_conflict() {
    let repo = InMemoryRepository::new();
    let record = repo.insert(1u8).unwrap();
    repo.delete(record.id).unwrap();

    assert_eq!(repo.update_if_version(&record), Err(RecordError::NotFound));
    assert_eq!(repo.fetch(record.id), Err(RecordError::NotFound));
    assert_eq!(repo.delete(record.id), Err(RecordError::NotFound));
}

#[test]
fn test_check_version_rejects_impossible_versions() {
    let good = VersionedRecord {
        id: 1,
        version: 1,
        payload: (),
    };
    assert!(good.check_version().is_ok());

    let zero = VersionedRecord { version: 0, ..good.clone() };
    assert!(matches!(zero.check_version(), Err(RecordError::Corrupt(_))));

    let negative = VersionedRecord { version: -4, ..good };
    assert!(matches!(negative.check_version(), Err(RecordError::Corrupt(_))));
}
