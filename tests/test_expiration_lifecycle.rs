// Integration tests for the expiring map lifecycle
//
// Covers the expiration protocol end to end: timer fire, listener fan-out,
// veto resets, drain auto-stop, and the pause/resume/stop state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

use expiremap::{ExpiringMap, ExpiringMapListener, ExpiringMapOptions, ItemSnapshot};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Added { key: i64 },
    Updated { key: i64 },
    Expiring { key: i64, vetoed: bool },
    Removed { key: i64, expired: bool },
}

/// Records every notification; grants a configurable number of vetoes.
struct Recorder {
    events: Mutex<Vec<Event>>,
    vetoes_left: Mutex<usize>,
    expiring_updated_at: Mutex<Vec<Instant>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Self::with_vetoes(0)
    }

    fn with_vetoes(vetoes: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            vetoes_left: Mutex::new(vetoes),
            expiring_updated_at: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn expiring_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Expiring { .. }))
            .collect()
    }

    fn removed_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Removed { .. }))
            .collect()
    }
}

impl ExpiringMapListener<String> for Recorder {
    fn on_item_added(&self, key: i64, _index: usize, _item: &ItemSnapshot<String>) {
        self.events.lock().push(Event::Added { key });
    }

    fn on_item_updated(&self, key: i64, _index: usize, _item: &ItemSnapshot<String>) {
        self.events.lock().push(Event::Updated { key });
    }

    fn on_item_expiring(&self, key: i64, _index: usize, item: &ItemSnapshot<String>) -> bool {
        let vetoed = {
            let mut left = self.vetoes_left.lock();
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        };
        self.expiring_updated_at.lock().push(item.updated_at());
        self.events.lock().push(Event::Expiring { key, vetoed });
        vetoed
    }

    fn on_item_removed(
        &self,
        key: i64,
        _index: usize,
        _item: &ItemSnapshot<String>,
        expired: bool,
    ) {
        self.events.lock().push(Event::Removed { key, expired });
    }
}

fn test_map(name: &str) -> ExpiringMap<String> {
    ExpiringMap::with_options(
        name,
        ExpiringMapOptions::new().with_default_timeout_ms(30_000),
    )
    .unwrap()
}

// Scenario A: an unobserved entry expires and is removed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_entry_expires_without_listeners() {
    init_tracing();
    let map = test_map("scenario_a");
    let recorder = Recorder::new();
    map.add_listener(recorder.clone());

    map.put_with_timeout(1, "a".to_string(), 100);
    assert_eq!(map.get(1), Some("a".to_string()));

    sleep(Duration::from_millis(400)).await;

    assert_eq!(map.get(1), None);
    assert_eq!(map.get_or(1, "fallback".to_string()), "fallback".to_string());
    assert_eq!(
        recorder.removed_events(),
        vec![Event::Removed {
            key: 1,
            expired: true
        }]
    );
}

// Scenario B: one veto resets the timer, the next fire removes the entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_veto_resets_then_expires() {
    init_tracing();
    let map = test_map("scenario_b");
    let recorder = Recorder::with_vetoes(1);
    map.add_listener(recorder.clone());

    map.put_with_timeout(2, "b".to_string(), 80);
    sleep(Duration::from_millis(600)).await;

    assert_eq!(
        recorder.expiring_events(),
        vec![
            Event::Expiring {
                key: 2,
                vetoed: true
            },
            Event::Expiring {
                key: 2,
                vetoed: false
            },
        ]
    );
    assert_eq!(
        recorder.removed_events(),
        vec![Event::Removed {
            key: 2,
            expired: true
        }]
    );
    assert_eq!(map.get(2), None);

    // The veto reset advanced the entry's update timestamp.
    let stamps = recorder.expiring_updated_at.lock();
    assert_eq!(stamps.len(), 2);
    assert!(stamps[1] > stamps[0]);
}

// Scenario C: iteration order is ascending by key, not insertion order.
#[tokio::test]
async fn test_keys_iterate_ascending() {
    let map = test_map("scenario_c");
    for key in [5, 3, 9, 1] {
        map.put_with_timeout(key, format!("v{key}"), 60_000);
    }
    assert_eq!(map.keys(), vec![1, 3, 5, 9]);
    let values: Vec<String> = map
        .snapshot()
        .into_iter()
        .map(|item| item.into_value())
        .collect();
    assert_eq!(values, vec!["v1", "v3", "v5", "v9"]);
}

// Scenario D: re-adding a removed key is an insert, never an update.
#[tokio::test]
async fn test_put_after_remove_reports_insert() {
    let map = test_map("scenario_d");
    let recorder = Recorder::new();
    map.add_listener(recorder.clone());

    assert!(map.put(1, "x".to_string()).is_inserted());
    map.remove(1);
    assert!(map.put(1, "y".to_string()).is_inserted());

    assert_eq!(
        recorder.events(),
        vec![
            Event::Added { key: 1 },
            Event::Removed {
                key: 1,
                expired: false
            },
            Event::Added { key: 1 },
        ]
    );
}

// Scenario E: after stop(), writes do not restart expiration processing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_suppresses_expiration_until_resume() {
    init_tracing();
    let map = test_map("scenario_e");
    let recorder = Recorder::new();
    map.add_listener(recorder.clone());

    map.stop();
    map.put_with_timeout(7, "kept".to_string(), 10);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(map.get(7), Some("kept".to_string()));
    assert!(recorder.removed_events().is_empty());

    // resume() restarts processing; the long-overdue entry expires.
    map.resume();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(map.get(7), None);
    assert_eq!(
        recorder.removed_events(),
        vec![Event::Removed {
            key: 7,
            expired: true
        }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_restarts_timer() {
    let map = test_map("touch");
    map.put_with_timeout(1, "a".to_string(), 250);

    // Keep refreshing faster than the timeout; the entry must survive.
    for _ in 0..4 {
        sleep(Duration::from_millis(100)).await;
        map.put_with_timeout(1, "a".to_string(), 250);
    }
    assert_eq!(map.get(1), Some("a".to_string()));

    // Stop refreshing; now it expires.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(map.get(1), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_holds_entries_resume_rearms() {
    let map = test_map("pause");
    map.put_with_timeout(1, "a".to_string(), 120);
    map.pause();

    sleep(Duration::from_millis(400)).await;
    assert_eq!(map.get(1), Some("a".to_string()));

    map.resume();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(map.get(1), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_timeout_change_spares_existing_entries() {
    let map = test_map("defaults");
    map.put(1, "long".to_string()); // default 30s

    map.set_default_timeout_ms(100);
    map.put(2, "short".to_string()); // new default

    sleep(Duration::from_millis(500)).await;
    assert_eq!(map.get(1), Some("long".to_string()));
    assert_eq!(map.get(2), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_autostops_then_next_write_restarts() {
    init_tracing();
    let map = test_map("drain");
    let recorder = Recorder::new();
    map.add_listener(recorder.clone());

    map.put_with_timeout(1, "first".to_string(), 80);
    sleep(Duration::from_millis(300)).await;
    assert!(map.is_empty());

    // Draining stopped processing, but it was not an explicit stop; the
    // next write starts it again.
    map.put_with_timeout(2, "second".to_string(), 80);
    sleep(Duration::from_millis(300)).await;
    assert!(map.is_empty());

    assert_eq!(
        recorder.removed_events(),
        vec![
            Event::Removed {
                key: 1,
                expired: true
            },
            Event::Removed {
                key: 2,
                expired: true
            },
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clear_removes_one_at_a_time() {
    let map = test_map("clear");
    let recorder = Recorder::new();
    map.add_listener(recorder.clone());

    for key in [1, 2, 3] {
        map.put_with_timeout(key, format!("v{key}"), 100);
    }
    map.clear();
    assert_eq!(map.size(), 0);

    // Each entry was removed through the normal path, none as expired,
    // and all timers were cancelled.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        recorder.removed_events(),
        vec![
            Event::Removed {
                key: 1,
                expired: false
            },
            Event::Removed {
                key: 2,
                expired: false
            },
            Event::Removed {
                key: 3,
                expired: false
            },
        ]
    );
    assert!(recorder.expiring_events().is_empty());
}

/// Listener that detaches another listener the first time an item is added.
struct Detacher {
    target: Mutex<Option<(ExpiringMap<String>, Arc<dyn ExpiringMapListener<String>>)>>,
}

impl ExpiringMapListener<String> for Detacher {
    fn on_item_added(&self, _key: i64, _index: usize, _item: &ItemSnapshot<String>) {
        if let Some((map, target)) = self.target.lock().take() {
            map.remove_listener(&target);
        }
    }
}

#[tokio::test]
async fn test_listener_detach_during_fanout() {
    let map = test_map("detach");
    let recorder = Recorder::new();
    let recorder_dyn: Arc<dyn ExpiringMapListener<String>> = recorder.clone();

    let detacher = Arc::new(Detacher {
        target: Mutex::new(Some((map.clone(), recorder_dyn))),
    });
    map.add_listener(detacher);
    map.add_listener(recorder.clone());

    // First put: the snapshot taken for fan-out still includes the
    // recorder, so it sees this one event. Second put: it is gone.
    map.put(1, "a".to_string());
    map.put(2, "b".to_string());

    assert_eq!(recorder.events(), vec![Event::Added { key: 1 }]);
}

/// Listener that calls back into the map from inside the expiring callback.
struct ReentrantVetoer {
    map: Mutex<Option<ExpiringMap<String>>>,
    observed_size: Mutex<Option<usize>>,
    vetoes_left: Mutex<usize>,
}

impl ExpiringMapListener<String> for ReentrantVetoer {
    fn on_item_expiring(&self, key: i64, _index: usize, _item: &ItemSnapshot<String>) -> bool {
        // Re-entering the map from a notification must not deadlock.
        if let Some(map) = self.map.lock().as_ref() {
            assert!(map.get(key).is_some());
            *self.observed_size.lock() = Some(map.size());
        }
        let mut left = self.vetoes_left.lock();
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_may_reenter_map_during_callback() {
    init_tracing();
    let map = test_map("reentrant");
    let vetoer = Arc::new(ReentrantVetoer {
        map: Mutex::new(Some(map.clone())),
        observed_size: Mutex::new(None),
        vetoes_left: Mutex::new(1),
    });
    map.add_listener(vetoer.clone());

    map.put_with_timeout(5, "e".to_string(), 80);
    sleep(Duration::from_millis(600)).await;

    assert_eq!(map.get(5), None);
    assert_eq!(*vetoer.observed_size.lock(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_disjoint_keys() {
    let map = test_map("concurrent");

    let mut handles = Vec::new();
    for writer in 0..4i64 {
        let map = map.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..50i64 {
                map.put_with_timeout(writer * 1000 + i, format!("{writer}:{i}"), 60_000);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(map.size(), 200);
    let keys = map.keys();
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    assert_eq!(map.get(2049), Some("2:49".to_string()));
}
