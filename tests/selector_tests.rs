mod common;

use chrono::Duration as ChronoDuration;
use common::{active, store_with};
use keypool_proxy::pool::{
    KeyFilter, KeyRecord, KeyStatus, RateLimiter, RateLimits, ReserveOutcome, Selector, Strategy,
};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const K1: &str = "sk-k1-selector-000001";
const K2: &str = "sk-k2-selector-000002";

fn with_history(id: &str, balance: f64, successes: u64, failures: u64) -> KeyRecord {
    let mut record = KeyRecord::new(id).with_status(KeyStatus::Active).with_balance(balance);
    record.success_count = successes;
    record.failure_count = failures;
    record.is_free = true;
    record
}

#[test]
fn high_balance_and_high_success_pick_different_keys() {
    let (store, _) = store_with(vec![with_history(K1, 10.0, 9, 1), with_history(K2, 100.0, 1, 9)]);
    let pool = store.list(KeyFilter::All);
    let mut rng = StdRng::seed_from_u64(7);
    let selector = Selector::default();
    let none = HashSet::new();

    let by_balance = selector.select(&pool, Strategy::HighBalance, store.now(), &none, &mut rng).unwrap();
    assert_eq!(by_balance.id, K2);

    let by_success = selector
        .select(&pool, Strategy::HighSuccessRate, store.now(), &none, &mut rng)
        .unwrap();
    assert_eq!(by_success.id, K1);
}

#[test]
fn disabled_key_is_skipped_by_every_strategy_until_it_expires() {
    let mut k1 = with_history(K1, 500.0, 10, 0);
    k1.status = KeyStatus::Disabled;
    let (store, clock) = store_with(vec![k1, with_history(K2, 1.0, 0, 10)]);
    let until = store.now() + ChronoDuration::seconds(60);
    let mut disabled = store.get(K1).unwrap();
    disabled.disabled_until = Some(until);
    store.upsert(disabled);

    let selector = Selector::default();
    let mut rng = StdRng::seed_from_u64(11);
    let none = HashSet::new();

    for step in 0..6 {
        let pool = store.list(KeyFilter::All);
        for strategy in Strategy::ALL {
            for _ in 0..20 {
                let chosen = selector.select(&pool, strategy, store.now(), &none, &mut rng).unwrap();
                assert_eq!(chosen.id, K2, "{strategy} picked the disabled key at step {step}");
            }
        }
        clock.advance(ChronoDuration::seconds(9));
    }

    clock.advance(ChronoDuration::seconds(10));
    let pool = store.list(KeyFilter::All);
    let chosen = selector
        .select(&pool, Strategy::HighBalance, store.now(), &none, &mut rng)
        .unwrap();
    assert_eq!(chosen.id, K1);
}

#[test]
fn normal_strategy_is_roughly_uniform() {
    let ids = ["sk-uniform-a-000001", "sk-uniform-b-000001", "sk-uniform-c-000001", "sk-uniform-d-000001"];
    let (store, _) = store_with(ids.iter().map(|id| active(id)).collect());
    let pool = store.list(KeyFilter::All);
    let selector = Selector::default();
    let mut rng = StdRng::seed_from_u64(42);
    let none = HashSet::new();

    let draws = 40_000;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..draws {
        let chosen = selector.select(&pool, Strategy::Normal, store.now(), &none, &mut rng).unwrap();
        *counts.entry(chosen.id.clone()).or_default() += 1;
    }

    let expected = draws / ids.len();
    for id in ids {
        let count = counts.get(id).copied().unwrap_or(0);
        let deviation = (count as f64 - expected as f64).abs() / expected as f64;
        assert!(deviation < 0.05, "{id} selected {count} times, expected about {expected}");
    }
}

#[test]
fn low_rpm_and_low_tpm_follow_window_usage() {
    let busy = "sk-window-busy-000001";
    let idle = "sk-window-idle-000001";
    let heavy = "sk-window-heavy-00001";
    let (store, _) = store_with(vec![active(busy), active(idle), active(heavy)]);
    let limiter = RateLimiter::new(store.clone(), RateLimits::default());

    // busy: 3 small requests, idle: 1 request, heavy: 1 huge request
    for (id, tokens) in [(busy, 10u64), (busy, 10), (busy, 10), (idle, 50), (heavy, 10_000)] {
        match limiter.try_reserve(id, tokens).unwrap() {
            ReserveOutcome::Allowed(reservation) => reservation.commit(tokens),
            other => panic!("unexpected {other:?}"),
        }
    }

    let pool = store.list(KeyFilter::All);
    let now = store.now();
    let selector = Selector::default();
    let mut rng = StdRng::seed_from_u64(3);
    let none = HashSet::new();

    let by_rpm = selector.select(&pool, Strategy::LowRpm, now, &none, &mut rng).unwrap();
    assert!(pool.iter().all(|r| by_rpm.current_rpm(now) <= r.current_rpm(now)));
    assert_ne!(by_rpm.id, busy);

    let by_tpm = selector.select(&pool, Strategy::LowTpm, now, &none, &mut rng).unwrap();
    assert!(pool.iter().all(|r| by_tpm.current_tpm(now) <= r.current_tpm(now)));
    assert_eq!(by_tpm.id, busy);
}

#[test]
fn equal_usage_goes_to_least_recently_used() {
    let recent = "sk-lru-recent-000001";
    let stale = "sk-lru-stale-0000001";
    let (store, clock) = store_with(vec![active(recent), active(stale)]);

    store.record_outcome(stale, true, 0, Duration::ZERO).unwrap();
    clock.advance(ChronoDuration::seconds(120));
    store.record_outcome(recent, true, 0, Duration::ZERO).unwrap();

    let pool = store.list(KeyFilter::All);
    let mut rng = StdRng::seed_from_u64(5);
    let chosen = Selector::default()
        .select(&pool, Strategy::LowRpm, store.now(), &HashSet::new(), &mut rng)
        .unwrap();
    assert_eq!(chosen.id, stale);
}

#[test]
fn excluded_keys_are_never_returned() {
    let (store, _) = store_with(vec![active(K1), active(K2)]);
    let pool = store.list(KeyFilter::All);
    let excluded: HashSet<String> = [K1.to_string()].into();
    let mut rng = StdRng::seed_from_u64(9);

    for strategy in Strategy::ALL.into_iter().filter(|s| *s != Strategy::Free) {
        let chosen = Selector::default()
            .select(&pool, strategy, store.now(), &excluded, &mut rng)
            .unwrap();
        assert_eq!(chosen.id, K2);
    }
}
