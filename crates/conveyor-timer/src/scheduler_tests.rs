    use super::*;
    use async_trait::async_trait;
    use conveyor_protocols::{BroadcastPublisher, ManualClock, ProtocolError};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use crate::sqlite::SqliteTimerStore;
    use crate::store::MemoryTimerStore;
    use crate::timer::TimerStatus;

    #[derive(Default)]
    struct CollectingSink {
        items: parking_lot::Mutex<Vec<WorkItem>>,
    }

    #[async_trait]
    impl WorkSink for CollectingSink {
        async fn submit(&self, item: WorkItem) -> Result<Uuid, ProtocolError> {
            let id = item.id;
            self.items.lock().push(item);
            Ok(id)
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        publisher: Arc<BroadcastPublisher>,
        scheduler: TimerScheduler,
    }

    fn harness_with(config: SchedulerConfig, store: Arc<dyn TimerStore>) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let scheduler = TimerScheduler::new(config, store)
            .with_clock(clock.clone())
            .with_publisher(publisher.clone());
        Harness {
            clock,
            publisher,
            scheduler,
        }
    }

    fn harness() -> Harness {
        harness_with(SchedulerConfig::default(), Arc::new(MemoryTimerStore::new()))
    }

    fn drain_events(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::TimerLifecycle(e) = event {
                events.push(e);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_retry_backoff_delays() {
        let h = harness();
        let now = h.clock.now();

        for (attempt, expected_ms) in [(0, 1000), (1, 2000), (2, 4000)] {
            let timer = h
                .scheduler
                .schedule_retry(WorkItem::new("deploy", serde_json::json!({})), attempt, None)
                .await
                .unwrap();
            assert_eq!((timer.fire_at - now).num_milliseconds(), expected_ms);
            assert_eq!(timer.action, TimerAction::Retry);
            assert_eq!(timer.status, TimerStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_retry_delay_caps_at_max_delay() {
        let h = harness();
        let now = h.clock.now();

        for attempt in [10, 31, 200] {
            let timer = h
                .scheduler
                .schedule_retry(WorkItem::new("deploy", serde_json::json!({})), attempt, None)
                .await
                .unwrap();
            assert_eq!((timer.fire_at - now).num_milliseconds(), 300_000);
        }
        assert_eq!(h.scheduler.pending_timers().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_when_configured() {
        let h = harness();
        let bounded = RetryPolicy {
            max_attempts: Some(3),
            ..*h.scheduler.retry_policy()
        };

        assert!(h
            .scheduler
            .schedule_retry(WorkItem::new("deploy", serde_json::json!({})), 2, Some(&bounded))
            .await
            .is_ok());
        let err = h
            .scheduler
            .schedule_retry(WorkItem::new("deploy", serde_json::json!({})), 3, Some(&bounded))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TimerError::RetryExhausted {
                attempt: 3,
                max_attempts: 3
            }
        ));
        assert_eq!(h.scheduler.pending_timers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fired_retry_resubmits_with_incremented_count() {
        let sink = Arc::new(CollectingSink::default());
        let mut h = harness();
        h.scheduler = h.scheduler.with_work_sink(sink.clone());

        let item = WorkItem::new("deploy", serde_json::json!({"v": 2})).with_retry_count(1);
        h.scheduler.schedule_retry(item.clone(), 1, None).await.unwrap();

        assert_eq!(h.scheduler.scan_once().await.unwrap(), 0);
        h.clock.advance(Duration::from_millis(2000));
        assert_eq!(h.scheduler.scan_once().await.unwrap(), 1);

        let items = sink.items.lock();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);
        assert_eq!(items[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_overdue_timer_fires_once_across_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conveyor.db");
        let clock = Arc::new(ManualClock::starting_now());

        let owner = OwnerRef::run("run-1").with_phase("build");
        let timer_id = {
            let store = Arc::new(SqliteTimerStore::open(&path).await.unwrap());
            let scheduler = TimerScheduler::new(SchedulerConfig::default(), store)
                .with_clock(clock.clone());
            scheduler
                .schedule_timeout(owner.clone(), Duration::from_secs(60))
                .await
                .unwrap()
                .id
        };

        // Process is down while the timebox elapses.
        clock.advance(Duration::from_secs(120));

        let store = Arc::new(SqliteTimerStore::open(&path).await.unwrap());
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let mut rx = publisher.subscribe();
        let scheduler = TimerScheduler::new(SchedulerConfig::default(), store)
            .with_clock(clock.clone())
            .with_publisher(publisher.clone());

        assert_eq!(scheduler.recover().await.unwrap(), 1);
        assert_eq!(scheduler.scan_once().await.unwrap(), 0);

        let events = drain_events(&mut rx);
        let timeouts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TimerEvent::PhaseTimedOut { .. }))
            .collect();
        assert_eq!(
            timeouts,
            vec![&TimerEvent::PhaseTimedOut { timer_id, owner }]
        );

        let fired = scheduler.get_timer(timer_id).await.unwrap().unwrap();
        assert_eq!(fired.status, TimerStatus::Fired);
        assert!(fired.fired_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_timer() {
        let h = harness();
        let timer = h
            .scheduler
            .schedule_timeout(OwnerRef::run("r"), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(h.scheduler.cancel_timer(timer.id).await.unwrap());
        assert!(!h.scheduler.cancel_timer(timer.id).await.unwrap());

        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.scheduler.scan_once().await.unwrap(), 0);
        assert!(h.scheduler.pending_timers().await.unwrap().is_empty());

        let missing = Uuid::new_v4();
        assert!(matches!(
            h.scheduler.cancel_timer(missing).await,
            Err(TimerError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_cancel_fired_timer_is_noop() {
        let h = harness();
        let timer = h
            .scheduler
            .schedule_timeout(OwnerRef::run("r"), Duration::from_secs(1))
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(1));
        h.scheduler.scan_once().await.unwrap();

        assert!(!h.scheduler.cancel_timer(timer.id).await.unwrap());
        let loaded = h.scheduler.get_timer(timer.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TimerStatus::Fired);
    }

    #[tokio::test]
    async fn test_cancel_for_owner() {
        let h = harness();
        for owner in [
            OwnerRef::run("run-1").with_phase("design"),
            OwnerRef::run("run-1").with_phase("build"),
            OwnerRef::run("run-2").with_phase("design"),
        ] {
            h.scheduler
                .schedule_timeout(owner, Duration::from_secs(30))
                .await
                .unwrap();
        }

        let cancelled = h
            .scheduler
            .cancel_for_owner(&OwnerRef::run("run-1"))
            .await
            .unwrap();
        assert_eq!(cancelled, 2);

        let remaining = h.scheduler.pending_timers().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].owner.run_id.as_deref(), Some("run-2"));
    }

    #[tokio::test]
    async fn test_failing_action_is_isolated() {
        let h = harness();
        let mut rx = h.publisher.subscribe();
        let now = h.clock.now();

        let custom = h
            .scheduler
            .schedule_timer(now, TimerAction::Custom, serde_json::json!({"job": "x"}))
            .await
            .unwrap();
        h.scheduler
            .schedule_timeout(OwnerRef::run("r"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(h.scheduler.scan_once().await.unwrap(), 2);

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TimerEvent::ActionFailed { timer_id, .. } if *timer_id == custom.id
        )));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TimerEvent::PhaseTimedOut { .. }))
        );
    }

    #[tokio::test]
    async fn test_custom_handler_runs() {
        struct Flag(parking_lot::Mutex<Vec<Uuid>>);

        #[async_trait]
        impl TimerActionHandler for Flag {
            async fn handle(
                &self,
                timer: &Timer,
                _ctx: &ActionContext<'_>,
            ) -> Result<(), TimerError> {
                self.0.lock().push(timer.id);
                Ok(())
            }
        }

        let h = harness();
        let flag = Arc::new(Flag(parking_lot::Mutex::new(Vec::new())));
        h.scheduler.register_handler(TimerAction::Custom, flag.clone());

        let timer = h
            .scheduler
            .schedule_timer(h.clock.now(), TimerAction::Custom, serde_json::Value::Null)
            .await
            .unwrap();
        h.scheduler.scan_once().await.unwrap();
        assert_eq!(*flag.0.lock(), vec![timer.id]);
    }

    #[tokio::test]
    async fn test_scan_is_batch_capped_in_fire_order() {
        let h = harness_with(
            SchedulerConfig {
                batch_size: 2,
                ..Default::default()
            },
            Arc::new(MemoryTimerStore::new()),
        );
        let mut rx = h.publisher.subscribe();
        let now = h.clock.now();

        let mut ids = Vec::new();
        for offset in [30, 10, 20] {
            let timer = h
                .scheduler
                .schedule_timer(
                    now - chrono::Duration::seconds(offset),
                    TimerAction::Cleanup,
                    serde_json::Value::Null,
                )
                .await
                .unwrap();
            ids.push(timer.id);
        }

        assert_eq!(h.scheduler.scan_once().await.unwrap(), 2);
        assert_eq!(h.scheduler.scan_once().await.unwrap(), 1);

        let fired: Vec<Uuid> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                TimerEvent::Fired { timer_id, .. } => Some(timer_id),
                _ => None,
            })
            .collect();
        assert_eq!(fired, vec![ids[0], ids[2], ids[1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_recovers_then_stops() {
        let h = harness();
        let scheduler = Arc::new(h.scheduler);
        let timer = scheduler
            .schedule_timeout(OwnerRef::run("r"), Duration::ZERO)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&scheduler).start(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let loaded = scheduler.get_timer(timer.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TimerStatus::Fired);

        shutdown.cancel();
        handle.await.unwrap();
    }
