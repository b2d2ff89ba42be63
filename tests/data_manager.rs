//! Trace and trigger bookkeeping scenarios against the public data-plane API.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hindsight::agent::trace::TraceState;
use hindsight::agent::trigger_queue::TriggerQueue;
use hindsight::agent::{DataManager, TriggerManager};
use hindsight::{BufferId, QueueId, TraceId};

const HOUR: Duration = Duration::from_secs(3600);

/// A data manager whose clock sits far enough from process start that
/// subtracting an hour never underflows.
fn data_manager() -> (DataManager, Instant) {
    let t0 = Instant::now() + 2 * HOUR;
    let mut dm = DataManager::new();
    dm.set_now(t0);
    (dm, t0)
}

fn queue(dm: &DataManager, id: QueueId) -> &TriggerQueue {
    dm.queue_state(id)
        .unwrap_or_else(|| panic!("queue {id} should exist"))
}

fn assert_counts(dm: &DataManager, untriggered: (usize, usize), triggered: (usize, usize)) {
    assert_eq!(
        (dm.untriggered_trace_count(), dm.untriggered_buffer_count()),
        untriggered,
        "untriggered (traces, buffers)"
    );
    assert_eq!(
        (dm.triggered_trace_count(), dm.triggered_buffer_count()),
        triggered,
        "triggered (traces, buffers)"
    );
    assert_eq!(dm.trace_count(), untriggered.0 + triggered.0, "trace count");
    assert_eq!(dm.buffer_count(), untriggered.1 + triggered.1, "buffer count");
}

/// Traces 0..10 hold 1, 2, 3, ... buffers, numbered `1000 * (i + 1) + j`.
fn populate_untriggered(dm: &mut DataManager) {
    for i in 0..10u64 {
        let buffers = (0..=i as BufferId)
            .map(|j| 1000 * (i as BufferId + 1) + j)
            .collect();
        dm.add_buffers(i, buffers).unwrap();
    }
}

#[test]
fn test_data_manager_from_scratch() {
    let (mut dm, _) = data_manager();

    dm.add_buffers(75, vec![3, 12]).unwrap();
    assert_counts(&dm, (1, 2), (0, 0));
    assert!(matches!(dm.trace(75), Some(TraceState::Untriggered(_))));

    dm.add_buffers(75, vec![55, 2]).unwrap();
    assert_counts(&dm, (1, 4), (0, 0));
    assert_eq!(dm.trace(75).map(TraceState::buffer_count), Some(4));

    let immediate = dm
        .add_breadcrumbs(75, vec!["hello".into(), "world".into()])
        .unwrap();
    assert!(immediate.is_empty(), "untriggered traces hold breadcrumbs");
    assert_counts(&dm, (1, 4), (0, 0));

    dm.add_buffers(25, vec![100, 101, 102, 103, 104]).unwrap();
    dm.add_buffers(50, (200..208).collect()).unwrap();
    dm.add_breadcrumbs(100, vec!["breadcrumbs".into(), "only".into()])
        .unwrap();
    assert_counts(&dm, (4, 17), (0, 0));
    assert_eq!(dm.queue_count(), 0, "no queues before the first trigger");

    let breadcrumbs = dm.trigger(1, 75, &[75]).unwrap();
    assert_counts(&dm, (3, 13), (1, 4));
    assert_eq!(
        breadcrumbs,
        HashMap::from([(75, vec!["hello".to_string(), "world".to_string()])]),
        "held breadcrumbs are released on trigger"
    );

    assert_eq!(dm.queue_count(), 1);
    let q = queue(&dm, 1);
    assert_eq!(q.id(), 1);
    assert_eq!(q.trace_count(), 1);
    assert_eq!(q.buffer_count(), 4);
    assert_eq!(q.fired_count(), 1);

    let fired = q.fired(75).expect("fired trigger exists");
    assert_eq!(fired.id(), hindsight::TriggerId::new(1, 75));
    assert_eq!(fired.buffer_count(), 4);
    assert_eq!(fired.trace_count(), 1);
    assert!(fired.is_reporting());

    assert!(matches!(dm.trace(75), Some(TraceState::Reporting(_))));
    assert_eq!(dm.trace(75).map(TraceState::buffer_count), Some(4));

    // Breadcrumbs arriving after the trigger are disseminated at once.
    let immediate = dm.add_breadcrumbs(75, vec!["late".into()]).unwrap();
    assert_eq!(immediate, vec!["late".to_string()]);
}

#[test]
fn test_untriggered_lru() {
    let (mut dm, _) = data_manager();
    populate_untriggered(&mut dm);
    assert_counts(&dm, (10, 55), (0, 0));

    for i in 0..10u64 {
        let evicted = dm.evict().unwrap();
        let expected: Vec<BufferId> = (0..=i as BufferId)
            .map(|j| 1000 * (i as BufferId + 1) + j)
            .collect();
        assert_eq!(evicted, expected, "oldest trace {i} goes first");
        assert!(dm.trace(i).is_none());
        assert_eq!(dm.untriggered_trace_count(), 9 - i as usize);
    }
    assert_counts(&dm, (0, 0), (0, 0));
    assert!(dm.evict().unwrap().is_empty(), "nothing left to evict");

    // Touching a trace moves it to the back of the eviction order.
    for i in 0..5u64 {
        dm.add_buffers(i, vec![2 * i as BufferId, 2 * i as BufferId + 1])
            .unwrap();
    }
    dm.add_buffers(0, vec![100]).unwrap();
    assert_eq!(dm.evict().unwrap(), vec![2, 3]);
    assert_eq!(dm.evict().unwrap(), vec![4, 5]);
    assert_eq!(dm.evict().unwrap(), vec![6, 7]);
    assert_eq!(dm.evict().unwrap(), vec![8, 9]);
    assert_eq!(dm.evict().unwrap(), vec![0, 1, 100]);
    assert_counts(&dm, (0, 0), (0, 0));
}

#[test]
fn test_triggered_traces_are_not_evicted() {
    let (mut dm, _) = data_manager();
    populate_untriggered(&mut dm);

    for i in 0..10u64 {
        dm.trigger(0, i, &[i]).unwrap();
    }
    assert_counts(&dm, (0, 0), (10, 55));

    assert!(dm.evict().unwrap().is_empty());
    assert!(dm.evict_to_capacity(0).unwrap().is_empty());
    assert_counts(&dm, (0, 0), (10, 55));
}

#[test]
fn test_repeated_triggers_share_one_trace() {
    let (mut dm, _) = data_manager();
    dm.add_buffers(75, vec![1, 2, 3, 4, 5]).unwrap();

    for _ in 0..4 {
        dm.trigger(1, 75, &[75]).unwrap();
    }
    for _ in 0..4 {
        dm.trigger(2, 75, &[75]).unwrap();
    }

    assert_eq!(dm.queue_count(), 2);
    for id in [1, 2] {
        assert_eq!(queue(&dm, id).trace_count(), 1, "queue {id} traces");
        assert_eq!(queue(&dm, id).buffer_count(), 5, "queue {id} buffers");
    }
    assert_counts(&dm, (0, 0), (1, 5));

    assert!(
        dm.queue(1).evict_next().unwrap().is_empty(),
        "trace survives while another trigger holds it"
    );
    assert_eq!(dm.queue(2).evict_next().unwrap().len(), 5);
    assert_counts(&dm, (0, 0), (0, 0));
}

#[test]
fn test_lateral_traces_across_queues() {
    let (mut dm, _) = data_manager();
    dm.add_buffers(75, vec![1, 2, 3, 4, 5]).unwrap();
    dm.add_buffers(76, vec![7, 8, 9]).unwrap();

    dm.trigger(1, 75, &[75]).unwrap();
    dm.trigger(2, 76, &[75, 76]).unwrap();
    dm.trigger(3, 76, &[76]).unwrap();

    let shape = |dm: &DataManager, id: QueueId| {
        let q = queue(dm, id);
        (q.trace_count(), q.buffer_count(), q.reporting_count())
    };

    assert_eq!(dm.queue_count(), 3);
    assert_eq!(shape(&dm, 1), (1, 5, 1));
    assert_eq!(shape(&dm, 2), (2, 8, 1));
    assert_eq!(shape(&dm, 3), (1, 3, 1));
    assert_counts(&dm, (0, 0), (2, 8));

    assert_eq!(dm.queue(1).report_next().unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(shape(&dm, 1), (1, 0, 0));
    assert_eq!(shape(&dm, 2), (2, 3, 1));
    assert_eq!(shape(&dm, 3), (1, 3, 1));
    assert_counts(&dm, (0, 0), (2, 3));

    assert_eq!(dm.queue(3).report_next().unwrap(), vec![7, 8, 9]);
    assert_eq!(shape(&dm, 2), (2, 0, 0), "drained through the other queues");
    assert_eq!(shape(&dm, 3), (1, 0, 0));
    assert_counts(&dm, (0, 0), (2, 0));

    assert!(
        dm.queue(2).report_next().unwrap().is_empty(),
        "stale entry is skipped"
    );
    assert_eq!(shape(&dm, 2), (2, 0, 0));

    dm.add_buffers(75, vec![1, 2, 3, 4, 5]).unwrap();
    assert_eq!(shape(&dm, 1), (1, 5, 1));
    assert_eq!(shape(&dm, 2), (2, 5, 1));
    assert_eq!(shape(&dm, 3), (1, 0, 0));
    assert_counts(&dm, (0, 0), (2, 5));

    dm.add_buffers(76, vec![7, 8, 9]).unwrap();
    assert_eq!(shape(&dm, 1), (1, 5, 1));
    assert_eq!(shape(&dm, 2), (2, 8, 1));
    assert_eq!(shape(&dm, 3), (1, 3, 1));
    assert_counts(&dm, (0, 0), (2, 8));

    assert!(
        dm.queue(2).evict_next().unwrap().is_empty(),
        "both traces are still held by other queues"
    );
    assert_eq!(shape(&dm, 1), (1, 5, 1));
    assert_eq!(shape(&dm, 2), (0, 0, 0));
    assert_eq!(shape(&dm, 3), (1, 3, 1));
    assert_counts(&dm, (0, 0), (2, 8));

    assert_eq!(dm.queue(1).evict_next().unwrap().len(), 5);
    assert_eq!(shape(&dm, 1), (0, 0, 0));
    assert_counts(&dm, (0, 0), (1, 3));

    assert_eq!(dm.queue(3).evict_next().unwrap().len(), 3);
    assert_eq!(shape(&dm, 3), (0, 0, 0));
    assert_counts(&dm, (0, 0), (0, 0));
}

fn trigger_each(dm: &mut DataManager, queue_id: QueueId, ids: std::ops::Range<TraceId>) {
    for i in ids {
        dm.add_buffers(i, vec![i as BufferId]).unwrap();
        dm.trigger(queue_id, i, &[i]).unwrap();
    }
}

#[test]
fn test_queue_eviction_to_target_capacity() {
    let (mut dm, _) = data_manager();
    trigger_each(&mut dm, 1, 0..1000);
    assert_counts(&dm, (0, 0), (1000, 1000));

    for i in 0..10 {
        assert_eq!(dm.queue(1).report_next().unwrap(), vec![i as BufferId]);
    }

    assert_eq!(dm.queue(1).evict_to_capacity(900).unwrap().len(), 90);
    assert_eq!(
        dm.queue(1).evict_to_capacity(801).unwrap().len(),
        99,
        "evicts down to target"
    );
    assert_eq!(
        dm.queue(1).evict_to_capacity(800).unwrap().len(),
        8,
        "evicts at least target / 100"
    );
    assert_eq!(dm.triggered_buffer_count(), 793);
    assert_eq!(queue(&dm, 1).metrics().evicted, 197);
}

#[test]
fn test_eviction_prefers_high_base_ids() {
    let (mut dm, _) = data_manager();
    trigger_each(&mut dm, 1, 0..1000);

    for i in 0..400 {
        assert_eq!(
            dm.queue(1).report_next().unwrap(),
            vec![i as BufferId],
            "report trace {i}"
        );
        let evicted = dm.queue(1).evict_next().unwrap();
        assert!(evicted[0] > 500, "evicted trace {} is not large", evicted[0]);
    }
}

#[test]
fn test_reporting_lowest_base_id_first() {
    let (mut dm, _) = data_manager();
    let idle = |dm: &DataManager| queue(dm, 1).idle_count();

    dm.add_buffers(77, vec![7, 8, 9]).unwrap();
    dm.trigger(1, 77, &[77]).unwrap();
    dm.add_buffers(79, vec![21, 22, 23]).unwrap();
    dm.trigger(1, 79, &[79]).unwrap();
    dm.add_buffers(75, vec![1, 2, 3, 4, 5]).unwrap();
    dm.trigger(1, 75, &[75]).unwrap();
    dm.add_buffers(76, vec![6]).unwrap();
    dm.trigger(1, 76, &[76]).unwrap();
    dm.add_buffers(78, (10..=20).collect()).unwrap();
    dm.trigger(1, 78, &[78]).unwrap();

    assert_eq!(queue(&dm, 1).fired_count(), 5);
    assert_eq!(queue(&dm, 1).buffer_count(), 23);
    assert_counts(&dm, (0, 0), (5, 23));
    assert_eq!(idle(&dm), 0);

    assert_eq!(dm.queue(1).report_next().unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(dm.triggered_buffer_count(), 18);
    assert_eq!(idle(&dm), 1, "reported trigger is idle");

    assert_eq!(dm.queue(1).report_next().unwrap(), vec![6]);
    assert_eq!(idle(&dm), 2);

    assert_eq!(dm.queue(1).report_next().unwrap(), vec![7, 8, 9]);
    assert_eq!(dm.triggered_buffer_count(), 14);
    assert_eq!(idle(&dm), 3);

    dm.add_buffers(80, vec![24, 25, 26, 27, 28]).unwrap();
    dm.trigger(1, 80, &[80]).unwrap();
    assert_eq!(queue(&dm, 1).fired_count(), 6);
    assert_eq!(dm.triggered_buffer_count(), 19);
    assert_eq!(idle(&dm), 3);

    assert_eq!(
        dm.queue(1).report_next().unwrap(),
        (10..=20).collect::<Vec<BufferId>>()
    );
    assert_eq!(dm.triggered_buffer_count(), 8);
    assert_eq!(idle(&dm), 4);

    dm.add_buffers(75, vec![29, 30]).unwrap();
    assert_eq!(dm.triggered_buffer_count(), 10);
    assert_eq!(idle(&dm), 3, "new data wakes the trigger");

    assert_eq!(dm.queue(1).report_next().unwrap(), vec![29, 30]);
    assert_eq!(idle(&dm), 4);

    dm.add_buffers(70, vec![31, 32, 33]).unwrap();
    dm.trigger(1, 70, &[70]).unwrap();
    assert_eq!(dm.queue(1).report_next().unwrap(), vec![31, 32, 33]);
    assert_eq!(dm.triggered_trace_count(), 7);
    assert_eq!(queue(&dm, 1).fired_count(), 7);
    assert_eq!(idle(&dm), 5);
}

#[test]
fn test_idle_triggers_time_out() {
    let (mut dm, t0) = data_manager();
    trigger_each(&mut dm, 1, 0..10);
    assert_counts(&dm, (0, 0), (10, 10));
    assert_eq!(queue(&dm, 1).fired_count(), 10);

    for i in 0..5 {
        assert_eq!(dm.queue(1).report_next().unwrap(), vec![i as BufferId]);
    }
    assert_eq!(queue(&dm, 1).idle_count(), 5);
    assert_eq!(dm.triggered_buffer_count(), 5);

    assert_eq!(dm.queue(1).check_idle_triggers(t0 - HOUR).unwrap(), 0);
    assert_eq!(queue(&dm, 1).idle_count(), 5, "timeout not reached");
    assert_eq!(queue(&dm, 1).fired_count(), 10);

    assert_eq!(dm.queue(1).check_idle_triggers(t0 + HOUR).unwrap(), 5);
    assert_eq!(queue(&dm, 1).idle_count(), 0);
    assert_eq!(queue(&dm, 1).fired_count(), 5, "reporting triggers never time out");
    assert_counts(&dm, (0, 0), (5, 5));

    for i in 5..10 {
        assert_eq!(dm.queue(1).report_next().unwrap(), vec![i as BufferId]);
    }
    assert_eq!(queue(&dm, 1).idle_count(), 5);
    assert_eq!(dm.triggered_buffer_count(), 0);

    assert_eq!(dm.check_idle_triggers(t0 - HOUR).unwrap(), 0);
    assert_eq!(dm.check_idle_triggers(t0).unwrap(), 5, "cutoff is inclusive");
    assert_eq!(queue(&dm, 1).fired_count(), 0);
    assert_counts(&dm, (0, 0), (0, 0));
    assert!(queue(&dm, 1).is_vacant());
}

#[test]
fn test_untriggered_eviction_to_capacity() {
    let (mut dm, t0) = data_manager();
    dm.add_buffers(75, vec![1, 2, 3, 4, 5]).unwrap();
    dm.add_buffers(76, vec![6]).unwrap();
    dm.add_buffers(77, vec![7, 8, 9]).unwrap();
    dm.add_buffers(78, (10..=20).collect()).unwrap();
    dm.set_now(t0 + Duration::from_secs(1));
    dm.add_buffers(79, vec![21, 22, 23]).unwrap();
    assert_counts(&dm, (5, 23), (0, 0));
    assert_eq!(dm.event_horizon(), None);

    assert!(dm.evict_to_capacity(100).unwrap().is_empty());
    assert_counts(&dm, (5, 23), (0, 0));

    assert_eq!(dm.evict_to_capacity(20).unwrap(), vec![1, 2, 3, 4, 5]);
    assert_counts(&dm, (4, 18), (0, 0));
    assert_eq!(dm.event_horizon(), Some(t0));

    assert!(dm.evict_to_capacity(18).unwrap().is_empty());

    assert_eq!(dm.evict_to_capacity(15).unwrap(), vec![6, 7, 8, 9]);
    assert_counts(&dm, (2, 14), (0, 0));

    assert_eq!(dm.evict_to_capacity(2).unwrap().len(), 14);
    assert_counts(&dm, (0, 0), (0, 0));
    assert_eq!(dm.event_horizon(), Some(t0 + Duration::from_secs(1)));

    for i in 0..=10_000u64 {
        let b = i as BufferId;
        dm.add_buffers(i, vec![b, b + 1, b + 2, b + 3, b + 4]).unwrap();
    }
    assert_counts(&dm, (10_001, 50_005), (0, 0));

    assert_eq!(
        dm.evict_to_capacity(50_000).unwrap().len(),
        500,
        "evicts in batches of target / 100"
    );
    assert_counts(&dm, (9_901, 49_505), (0, 0));

    assert!(dm.evict_to_capacity(1_000_000).unwrap().is_empty());
    assert!(dm.evict_to_capacity(-1).unwrap().is_empty(), "negative target");

    assert_eq!(dm.evict_to_capacity(0).unwrap().len(), 49_505);
    assert_counts(&dm, (0, 0), (0, 0));
}

#[test]
fn test_triggered_eviction_targets_largest_queue() {
    let (mut dm, _) = data_manager();

    for round in 0..2 {
        for i in 0..1000u64 {
            let b = i as BufferId;
            dm.add_buffers(i, vec![2 * b, 2 * b + 1]).unwrap();
            dm.trigger(1, i, &[i]).unwrap();
        }
        for i in 1000..2000u64 {
            dm.add_buffers(i, vec![2 * i as BufferId]).unwrap();
            dm.trigger(2, i, &[i]).unwrap();
        }

        let shape = |dm: &DataManager| {
            (
                queue(dm, 1).trace_count(),
                queue(dm, 1).buffer_count(),
                queue(dm, 2).trace_count(),
                queue(dm, 2).buffer_count(),
            )
        };

        assert_counts(&dm, (0, 0), (2000, 3000));
        assert_eq!(shape(&dm), (1000, 2000, 1000, 1000), "round {round}");

        assert!(dm.evict_triggered_to_capacity(3000).unwrap().is_empty());

        assert_eq!(dm.evict_triggered_to_capacity(2500).unwrap().len(), 500);
        assert_counts(&dm, (0, 0), (1750, 2500));
        assert_eq!(shape(&dm), (750, 1500, 1000, 1000));

        assert_eq!(dm.evict_triggered_to_capacity(2100).unwrap().len(), 400);
        assert_eq!(shape(&dm), (550, 1100, 1000, 1000));

        assert_eq!(dm.evict_triggered_to_capacity(1900).unwrap().len(), 200);
        assert_eq!(shape(&dm), (450, 900, 1000, 1000));

        assert_eq!(
            dm.evict_triggered_to_capacity(1700).unwrap().len(),
            200,
            "queue 2 is now the largest"
        );
        assert_counts(&dm, (0, 0), (1250, 1700));
        assert_eq!(shape(&dm), (450, 900, 800, 800));

        assert_eq!(
            dm.evict_triggered_to_capacity(0).unwrap().len(),
            900,
            "one queue per call"
        );
        assert_eq!(shape(&dm), (0, 0, 800, 800));

        assert_eq!(dm.evict_triggered_to_capacity(0).unwrap().len(), 800);
        assert_counts(&dm, (0, 0), (0, 0));
        assert_eq!(shape(&dm), (0, 0, 0, 0));
    }
}

fn trigger_manager(buffer_size: usize, trigger_limit: f64) -> (TriggerManager, Instant) {
    let (dm, t0) = data_manager();
    (TriggerManager::new(dm, buffer_size, trigger_limit), t0)
}

#[test]
fn test_local_trigger_rate_limit() {
    let (mut tm, t0) = trigger_manager(1024, 2.0);

    let accepted = (0..4u64)
        .filter(|&i| tm.trigger_local(7, i, &[i]).unwrap().is_some())
        .count();
    assert_eq!(accepted, 3, "a full bucket admits its burst plus one in debt");

    let metrics = *queue(tm.data_manager(), 7).metrics();
    assert_eq!(metrics.local, 3);
    assert_eq!(metrics.dropped, 1);

    // Remote triggers bypass the limit.
    assert!(tm.trigger_remote(7, 100, &[100]).unwrap().is_some());

    tm.data_manager_mut().set_now(t0 + Duration::from_secs(1));
    assert!(tm.trigger_local(7, 200, &[200]).unwrap().is_some());
}

#[test]
fn test_local_trigger_returns_held_breadcrumbs() {
    let (mut tm, _) = trigger_manager(1024, 0.0);
    let dm = tm.data_manager_mut();
    dm.add_buffers(5, vec![1]).unwrap();
    dm.add_breadcrumbs(5, vec!["10.0.0.2:5050".into()]).unwrap();
    dm.add_breadcrumbs(6, vec!["10.0.0.3:5050".into()]).unwrap();

    let breadcrumbs = tm.trigger_local(1, 5, &[5, 6]).unwrap().unwrap();
    assert_eq!(breadcrumbs.len(), 2);
    assert_eq!(breadcrumbs[&5], vec!["10.0.0.2:5050".to_string()]);
    assert_eq!(breadcrumbs[&6], vec!["10.0.0.3:5050".to_string()]);
}

#[test]
fn test_report_batches_share_bandwidth_fairly() {
    let buffer_size = 32 * 1024;
    let (mut tm, _) = trigger_manager(buffer_size, 0.0);
    assert_eq!(tm.batch_size(), 5);

    for i in 1..=10u64 {
        tm.data_manager_mut()
            .add_buffers(i, vec![100 + i as BufferId])
            .unwrap();
        tm.trigger_remote(1, i, &[i]).unwrap();
    }
    for i in 11..=20u64 {
        tm.data_manager_mut()
            .add_buffers(i, vec![200 + i as BufferId])
            .unwrap();
        tm.trigger_remote(2, i, &[i]).unwrap();
    }

    let batch = tm.next_batch_to_report().unwrap();
    assert_eq!(batch.len(), 5);
    let from_first = batch.iter().filter(|&&b| b < 200).count();
    assert!(
        (2..=3).contains(&from_first),
        "queues alternate, got {from_first} of 5 from queue 1"
    );

    let mut reported = batch;
    while tm.data_manager().triggered_buffer_count() > 0 {
        let batch = tm.next_batch_to_report().unwrap();
        assert!(!batch.is_empty());
        reported.extend(batch);
    }
    reported.sort_unstable();
    let mut expected: Vec<BufferId> = (101..=110).chain(211..=220).collect();
    expected.sort_unstable();
    assert_eq!(reported, expected);

    let vt1 = tm.virtual_time(1).unwrap();
    let vt2 = tm.virtual_time(2).unwrap();
    assert!(vt1.abs_diff(vt2) <= 1, "virtual times {vt1} and {vt2} diverged");
}

#[test]
fn test_rate_limited_queue_stops_batch_early() {
    let (mut tm, _) = trigger_manager(32 * 1024, 0.0);
    tm.configure_rate_limits(&HashMap::from([(1, 0.001)]));

    for i in 1..=3u64 {
        tm.data_manager_mut()
            .add_buffers(i, vec![i as BufferId])
            .unwrap();
        tm.trigger_remote(1, i, &[i]).unwrap();
    }

    assert_eq!(tm.next_batch_to_report().unwrap(), vec![1]);
    assert!(
        tm.next_batch_to_report().unwrap().is_empty(),
        "queue is in debt until its bucket refills"
    );
    assert_eq!(tm.data_manager().triggered_buffer_count(), 2);
}

#[test]
fn test_queue_limit_retires_vacant_queues() {
    let (mut tm, t0) = trigger_manager(1024, 0.0);
    tm.set_max_queues(1);

    assert!(tm.trigger_remote(1, 10, &[10]).unwrap().is_some());
    assert!(
        tm.trigger_remote(2, 20, &[20]).unwrap().is_none(),
        "queue 1 still has a fired trigger"
    );
    assert_eq!(tm.take_rejected_triggers(), 1);
    assert_eq!(tm.take_rejected_triggers(), 0);

    tm.data_manager_mut().check_idle_triggers(t0).unwrap();
    assert!(tm.trigger_remote(2, 20, &[20]).unwrap().is_some());
    assert!(!tm.data_manager().has_queue(1));
    assert!(tm.data_manager().has_queue(2));
    assert_eq!(tm.data_manager().queue_count(), 1);
}

#[test]
fn test_trace_shared_across_queues_is_released_after_report() {
    let (mut tm, t0) = trigger_manager(1024, 0.0);
    tm.data_manager_mut().add_buffers(3, vec![1, 2]).unwrap();
    tm.trigger_remote(1, 3, &[3]).unwrap();
    tm.trigger_remote(2, 3, &[3]).unwrap();
    assert_counts(tm.data_manager(), (0, 0), (1, 2));

    let mut reported = tm.next_batch_to_report().unwrap();
    reported.sort_unstable();
    assert_eq!(reported, vec![1, 2], "reported once, through one queue");
    assert!(tm.next_batch_to_report().unwrap().is_empty());

    for id in [1, 2] {
        let q = queue(tm.data_manager(), id);
        assert_eq!(
            (q.buffer_count(), q.reporting_count(), q.idle_count()),
            (0, 0, 1),
            "queue {id} holds an idle trigger"
        );
    }

    let dm = tm.data_manager_mut();
    assert_eq!(dm.check_idle_triggers(t0 + HOUR).unwrap(), 2);
    assert!(dm.trace(3).is_none(), "no trigger left to hold the trace");
    assert_counts(dm, (0, 0), (0, 0));
}
