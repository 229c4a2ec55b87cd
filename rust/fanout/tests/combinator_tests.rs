use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use fanout::{CancellationToken, ExecutionOptions, Task};

fn sleeper(ms: u64) -> impl FnOnce() + Send + 'static {
    move || thread::sleep(Duration::from_millis(ms))
}

#[test]
fn test_race_returns_with_fastest_task() {
    let start = Instant::now();
    let winner = fanout::race([1000, 500, 50].map(sleeper));
    let elapsed = start.elapsed();

    assert_eq!(winner, Some(2));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(400), "race took {elapsed:?}");
}

#[test]
fn test_race_empty_returns_immediately() {
    let start = Instant::now();
    let tasks: Vec<Task<'static>> = Vec::new();
    assert_eq!(fanout::race(tasks), None);
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_race_with_fired_token() {
    let token = CancellationToken::new();
    token.cancel();
    let start = Instant::now();
    let winner = fanout::race_with_cancel(&token, [sleeper(1000), sleeper(1000)]);
    assert_eq!(winner, None);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_all_waits_for_slowest_task() {
    let start = Instant::now();
    fanout::all([1000, 500, 50].map(sleeper)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[test]
fn test_all_tasks_may_borrow() {
    let counters: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
    let tasks: Vec<_> = counters
        .iter()
        .enumerate()
        .map(|(i, counter)| {
            move || {
                counter.store(i + 1, Ordering::SeqCst);
            }
        })
        .collect();
    fanout::all_with(ExecutionOptions::new().with_worker_count(3), tasks).unwrap();

    let values: Vec<_> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(values, (1..=8).collect::<Vec<_>>());
}

#[test]
fn test_all_with_cancel_returns_on_deadline() {
    let start = Instant::now();
    let token = CancellationToken::with_timeout(Duration::from_millis(100));
    fanout::all_with_cancel(&token, ExecutionOptions::new(), [1000, 1000].map(sleeper)).unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(800), "returned after {elapsed:?}");
    assert_eq!(token.reason(), Some(fanout::CancelReason::DeadlineExceeded));
}

#[test]
fn test_all_with_cancel_honors_options() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let failed = failed.clone();
        ExecutionOptions::new()
            .with_worker_count(2)
            .with_panic_handler(move |failure| failed.lock().unwrap().push(failure.index()))
    };
    let tasks: Vec<Task<'static>> = (0..6)
        .map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                if i == 4 {
                    panic!("task {i}");
                }
            }) as Task<'static>
        })
        .collect();

    let token = CancellationToken::with_timeout(Duration::from_secs(30));
    fanout::all_with_cancel(&token, options, tasks).unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(*failed.lock().unwrap(), vec![4]);
    assert_eq!(token.reason(), None);
}
