use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::context::{Context, ContextError};

use super::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key(&'static str);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OtherKey(u32);

#[derive(Debug, thiserror::Error)]
#[error("an error for testing")]
struct AnError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_are_coalesced() {
    let (ctx, _destroy) = with_cache(&Context::background());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let ctx = ctx.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            execute_outcome(&ctx, Key("k"), move |_ctx| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Outcome::from_value(1_u32).with_error(AnError)
            })
            .await
        }));
    }

    for handle in handles {
        let (outcome, extra) = handle.await.unwrap();
        assert_eq!(*outcome.value_as::<u32>().unwrap(), 1);
        assert!(outcome.error.unwrap().downcast_ref::<AnError>().is_some());
        assert_eq!(
            extra,
            Extra {
                is_memoized: true,
                is_executed: true
            }
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_populated_entries_win_over_execution() {
    let (ctx, _destroy) = with_cache(&Context::background());
    let calls = Arc::new(AtomicUsize::new(0));

    populate_cache(
        &ctx,
        [(Key("k"), Outcome::from_value(2_u32).with_error(AnError))],
    );

    let mut handles = Vec::new();
    for _ in 0..100 {
        let ctx = ctx.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            execute(&ctx, Key("k"), move |_ctx| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AnError>(1_u32)
            })
            .await
        }));
    }

    for handle in handles {
        let (outcome, extra) = handle.await.unwrap();
        assert_eq!(*outcome.value.unwrap(), 2);
        assert!(outcome.error.unwrap().downcast_ref::<AnError>().is_some());
        assert_eq!(
            extra,
            Extra {
                is_memoized: true,
                is_executed: false
            }
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_without_cache_every_call_executes() {
    let ctx = Context::background();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let ctx = ctx.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            execute(&ctx, Key("k"), move |_ctx| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AnError>(1_u32)
            })
            .await
        }));
    }

    for handle in handles {
        let (outcome, extra) = handle.await.unwrap();
        assert_eq!(*outcome.value.unwrap(), 1);
        assert_eq!(
            extra,
            Extra {
                is_memoized: false,
                is_executed: true
            }
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_panicking_function_yields_structured_error() {
    let (ctx, _destroy) = with_cache(&Context::background());

    let (outcome, extra) = execute::<_, u32, AnError, _, _>(&ctx, Key("k"), |_ctx| async {
        panic!("boom")
    })
    .await;

    assert!(outcome.value.is_none());
    match outcome.error.unwrap().downcast_ref::<CacheError>() {
        Some(CacheError::Panicked { message, .. }) => assert!(message.contains("boom")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        extra,
        Extra {
            is_memoized: true,
            is_executed: true
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_one_waiter_leaves_the_rest_unaffected() {
    let (ctx, _destroy) = with_cache(&Context::background());
    let calls = Arc::new(AtomicUsize::new(0));

    let slow_fn = |calls: Arc<AtomicUsize>| {
        move |_ctx: Context| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            Ok::<_, AnError>(7_u32)
        }
    };

    let (cancellable, cancel) = ctx.with_cancellation();
    let task_a = tokio::spawn({
        let calls = Arc::clone(&calls);
        async move { execute(&cancellable, Key("k"), slow_fn(calls)).await }
    });
    let task_b = tokio::spawn({
        let ctx = ctx.clone();
        let calls = Arc::clone(&calls);
        async move { execute(&ctx, Key("k"), slow_fn(calls)).await }
    });

    sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let (outcome_a, extra_a): (TypedOutcome<u32>, _) = task_a.await.unwrap();
    assert!(outcome_a.value.is_none());
    assert_eq!(
        outcome_a.error.unwrap().downcast_ref::<ContextError>(),
        Some(&ContextError::Cancelled)
    );
    assert!(extra_a.is_memoized);

    // The other waiter still receives the eventual outcome, and the
    // function ran to completion exactly once.
    let (outcome_b, extra_b) = task_b.await.unwrap();
    assert_eq!(*outcome_b.value.unwrap(), 7);
    assert!(outcome_b.error.is_none());
    assert_eq!(
        extra_b,
        Extra {
            is_memoized: true,
            is_executed: true
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_the_root_context_reaches_the_executor() {
    let (root, cancel_root) = Context::background().with_cancellation();
    let (ctx, _destroy) = with_cache(&root);

    // The waiter itself must survive the root cancellation to observe the
    // outcome, so it waits through a detached context.
    let waiter_ctx = ctx.detach();
    let task = tokio::spawn(async move {
        execute(&waiter_ctx, Key("k"), |ctx: Context| async move {
            tokio::select! {
                () = ctx.cancelled() => Ok::<_, AnError>("stopped".to_owned()),
                () = sleep(Duration::from_secs(60)) => Ok("slept".to_owned()),
            }
        })
        .await
    });

    sleep(Duration::from_millis(10)).await;
    cancel_root.cancel();

    let (outcome, _extra) = task.await.unwrap();
    assert_eq!(*outcome.value.unwrap(), "stopped");
}

#[tokio::test]
async fn test_destroyed_cache_refuses_new_executions() {
    let (ctx, destroy) = with_cache(&Context::background());
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |ctx: Context, calls: Arc<AtomicUsize>| async move {
        execute(&ctx, Key("k"), move |_ctx| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AnError>(1_u32)
        })
        .await
    };

    let (outcome, _) = run(ctx.clone(), Arc::clone(&calls)).await;
    assert_eq!(*outcome.value.unwrap(), 1);

    destroy.destroy();
    destroy.destroy(); // idempotent

    let (outcome, extra): (TypedOutcome<u32>, _) = run(ctx.clone(), Arc::clone(&calls)).await;
    assert!(outcome.value.is_none());
    assert_eq!(
        outcome.error.unwrap().downcast_ref::<CacheError>(),
        Some(&CacheError::Destroyed)
    );
    assert_eq!(extra, Extra::default());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Populating and harvesting are no-ops as well from here on.
    populate_cache(&ctx, [(Key("k2"), Outcome::from_value(2_u32))]);
    assert!(find_all_outcomes(&ctx).await.is_none());
}

#[tokio::test]
async fn test_dropping_the_handle_destroys_the_cache() {
    let ctx = {
        let (ctx, _destroy) = with_cache(&Context::background());
        ctx
    };

    let (outcome, _): (TypedOutcome<u32>, _) =
        execute(&ctx, Key("k"), |_ctx| async { Ok::<_, AnError>(1_u32) }).await;
    assert_eq!(
        outcome.error.unwrap().downcast_ref::<CacheError>(),
        Some(&CacheError::Destroyed)
    );
}

#[tokio::test]
async fn test_find_outcomes_filters_by_key_type() {
    let (ctx, _destroy) = with_cache(&Context::background());

    for i in 0..100 {
        let (outcome, _) =
            execute(&ctx, OtherKey(i), move |_ctx| async move { Ok::<_, AnError>(i) }).await;
        assert_eq!(*outcome.value.unwrap(), i);
    }
    let (_, _) = execute(&ctx, Key("b"), |_ctx| async { Ok::<_, AnError>(999_u32) }).await;

    let outcomes = find_outcomes::<OtherKey, u32>(&ctx).await.unwrap();
    assert_eq!(outcomes.len(), 100);
    for (key, outcome) in &outcomes {
        assert_eq!(*outcome.value.as_ref().unwrap().as_ref(), key.0);
    }

    let all = find_all_outcomes(&ctx).await.unwrap();
    assert_eq!(all.len(), 101);
}

#[tokio::test]
async fn test_find_outcomes_without_cache() {
    assert!(find_outcomes::<Key, u32>(&Context::background()).await.is_none());
    assert!(find_all_outcomes(&Context::background()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_find_outcomes_aborts_on_cancellation() {
    let (ctx, _destroy) = with_cache(&Context::background());

    // Park one never-completing promise in the table, waited on by a
    // detached caller so the promise outlives this test's cancellation.
    let background_waiter = ctx.detach();
    tokio::spawn(async move {
        execute(&background_waiter, Key("slow"), |_ctx| async {
            sleep(Duration::from_secs(3600)).await;
            Ok::<_, AnError>(1_u32)
        })
        .await
    });
    tokio::task::yield_now().await;

    let (harvest_ctx, cancel) = ctx.with_cancellation();
    let harvest = tokio::spawn(async move { find_outcomes::<Key, u32>(&harvest_ctx).await });

    sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(harvest.await.unwrap().is_none());
}

#[tokio::test]
async fn test_sharded_and_single_shard_agree() {
    let calls = Arc::new(AtomicUsize::new(0));

    let scenario = |ctx: Context, calls: Arc<AtomicUsize>| async move {
        let mut observations = Vec::new();

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let (outcome, extra) = execute(&ctx, Key("k"), move |_ctx| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AnError>(1_u32)
            })
            .await;
            observations.push((outcome.value.map(|v| *v), extra));
        }

        populate_cache(&ctx, [(OtherKey(5), Outcome::from_value(50_u32))]);
        let (outcome, extra) = execute(&ctx, OtherKey(5), |_ctx| async {
            Ok::<_, AnError>(0_u32)
        })
        .await;
        observations.push((outcome.value.map(|v| *v), extra));

        observations
    };

    let (single, _destroy_single) = with_cache(&Context::background());
    let (sharded, _destroy_sharded) = with_concurrent_cache(&Context::background(), 4);
    let (degenerate, _destroy_degenerate) = with_concurrent_cache(&Context::background(), 1);

    let expected = scenario(single, Arc::clone(&calls)).await;
    assert_eq!(scenario(sharded, Arc::clone(&calls)).await, expected);
    assert_eq!(scenario(degenerate, Arc::clone(&calls)).await, expected);

    // One invocation of the counting function per cache.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_type_mismatch_yields_no_value() {
    let (ctx, _destroy) = with_cache(&Context::background());

    populate_cache(&ctx, [(Key("k"), Outcome::from_value("a string".to_owned()))]);

    let (outcome, extra): (TypedOutcome<u32>, _) =
        execute(&ctx, Key("k"), |_ctx| async { Ok::<_, AnError>(1_u32) }).await;

    assert!(outcome.value.is_none());
    assert!(outcome.error.is_none());
    assert_eq!(
        extra,
        Extra {
            is_memoized: true,
            is_executed: false
        }
    );
}
