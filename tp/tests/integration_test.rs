//! Integration tests for TaskPace
//!
//! These exercise the public API end to end: timers driven on paused tokio
//! time, and fan-outs checked for ordering and concurrency bounds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::eyre;
use proptest::prelude::*;
use taskpace::{CancellationToken, Delay, FanOut, FanOutError, RecurringTimer, TimerConfig, TimerState};
use tokio::time::{Instant, sleep};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

// =============================================================================
// RecurringTimer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timer_first_fire_respects_due_time() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let f = fired.clone();
    let timer = RecurringTimer::builder()
        .workload(move |_token| {
            let f = f.clone();
            async move {
                f.lock().unwrap().push(Instant::now());
                Ok(())
            }
        })
        .due_time(ms(300))
        .period(ms(500))
        .build()
        .expect("valid timer");

    let started = Instant::now();
    timer.start().await.expect("start");
    sleep(ms(350)).await;

    let fired = fired.lock().unwrap().clone();
    assert!(!fired.is_empty(), "timer should have fired");
    assert!(fired[0].duration_since(started) >= ms(300));

    timer.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_timer_stopped_before_due_never_fires() {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = RecurringTimer::new(
        move |_token| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        },
        ms(500),
        ms(500),
        false,
    );

    timer.start().await.unwrap();
    timer.stop().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_failure_reported_once_and_stop_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();

    let timer = RecurringTimer::builder()
        .workload(move |_token| {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 2 {
                    return Err(eyre!("Boom"));
                }
                Ok(())
            }
        })
        .due_time(Delay::ZERO)
        .period(ms(100))
        .on_error(move |err| e.lock().unwrap().push(err.to_string()))
        .build()
        .unwrap();

    timer.start().await.expect("start must not surface workload errors");
    sleep(Duration::from_secs(2)).await;

    assert_eq!(*errors.lock().unwrap(), vec!["Boom".to_string()]);
    assert_eq!(timer.state(), TimerState::Idle);
    timer.stop().await.expect("stop after failure");
}

#[tokio::test(start_paused = true)]
async fn test_timer_every_valid_cadence_starts_and_stops() {
    let cadences = [
        (0, 10),
        (0, 1),
        (-1, 10),
        (10, -1),
        (-1, -1),
        (250, 1000),
    ];

    for (due_time_ms, period_ms) in cadences {
        let config = TimerConfig {
            due_time_ms,
            period_ms,
            ..Default::default()
        };
        let timer = RecurringTimer::from_config(&config, |_token| async { Ok(()) }).unwrap();

        timer.start().await.unwrap();
        sleep(ms(30)).await;
        timer.stop().await.unwrap();
        timer.dispose().await;
    }
}

// A zero period never parks the runtime, so this one runs on real time
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timer_zero_period_still_stops() {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = RecurringTimer::new(
        move |_token| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        },
        Delay::ZERO,
        Delay::ZERO,
        false,
    );

    timer.start().await.unwrap();
    sleep(ms(20)).await;
    timer.stop().await.unwrap();

    let after_stop = count.load(Ordering::SeqCst);
    assert!(after_stop > 0);
    sleep(ms(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timer_shared_across_tasks() {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = Arc::new(RecurringTimer::new(
        move |token: CancellationToken| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(ms(5)) => {}
                }
                Ok(())
            }
        },
        Delay::ZERO,
        ms(5),
        false,
    ));

    let mut handles = Vec::new();
    for i in 0..16 {
        let timer = timer.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                timer.start().await
            } else {
                timer.stop().await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Whatever the interleaving, one final stop leaves the timer idle for good
    timer.stop().await.unwrap();
    let after_stop = count.load(Ordering::SeqCst);
    sleep(ms(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), after_stop);
    assert_eq!(timer.state(), TimerState::Idle);
}

// =============================================================================
// FanOut
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fanout_doubles_in_order_with_two_waves() {
    let started = Instant::now();
    let results = FanOut::bounded(2)
        .unwrap()
        .run_for_each_collecting(vec![1, 2, 3, 4, 5], |x: u32| async move {
            sleep(ms(100)).await;
            Ok(x * 2)
        })
        .await
        .unwrap();

    assert_eq!(results, vec![2, 4, 6, 8, 10]);
    let elapsed = started.elapsed();
    assert!(elapsed >= ms(300) && elapsed < ms(500), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_fanout_single_bound_is_sequential() {
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let (a, o) = (active.clone(), overlapped.clone());

    FanOut::new(Some(1))
        .unwrap()
        .run_for_each(vec!["a", "b", "c"], move |_name| {
            let (a, o) = (a.clone(), o.clone());
            async move {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                sleep(ms(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fanout_rejects_zero_bound() {
    assert!(matches!(FanOut::new(Some(0)), Err(FanOutError::OutOfRange { .. })));
}

fn collect_with_jitter(items: Vec<u32>, bound: Option<usize>) -> Vec<u64> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        FanOut::new(bound)
            .unwrap()
            .run_for_each_collecting(items, |x| async move {
                sleep(ms(u64::from(x % 13))).await;
                Ok(u64::from(x) * 3)
            })
            .await
            .unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_collecting_preserves_source_order(
        items in proptest::collection::vec(any::<u32>(), 0..40),
        bound in proptest::option::of(1usize..8),
    ) {
        let expected: Vec<u64> = items.iter().map(|x| u64::from(*x) * 3).collect();
        prop_assert_eq!(collect_with_jitter(items, bound), expected);
    }
}
