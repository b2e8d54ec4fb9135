    use super::*;
    use std::time::Duration;

    use conveyor_config::BackPressureConfig;
    use conveyor_protocols::{BroadcastPublisher, ManualClock};
    use serde_json::json;

    use crate::handler::handler_fn;

    fn small_queue(max: usize) -> DispatchQueue {
        DispatchQueue::new(DispatchConfig {
            max_queue_size: max,
            back_pressure: BackPressureConfig {
                max_delay_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_submit_and_len() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        let id = queue.submit(WorkItem::new("deploy", json!({}))).await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].id, id);
    }

    #[tokio::test]
    async fn test_saturated_at_max() {
        let queue = small_queue(1);
        queue.submit(WorkItem::new("a", json!(1))).await.unwrap();

        let err = queue.submit(WorkItem::new("a", json!(2))).await.unwrap_err();
        assert!(matches!(err, DispatchError::QueueSaturated { size: 1, max: 1 }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_sheds_at_ninety_percent() {
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let mut events = publisher.subscribe();
        let queue = small_queue(10).with_publisher(publisher);

        for i in 0..9 {
            queue.submit(WorkItem::new("a", json!(i))).await.unwrap();
        }
        let err = queue.submit(WorkItem::new("a", json!(9))).await.unwrap_err();
        assert!(matches!(err, DispatchError::Shed { .. }));
        assert_eq!(queue.len(), 9);

        let mut saw_back_pressure = false;
        let mut saw_shed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::QueueStateChanged(QueueEvent::BackPressureApplied { .. }) => {
                    saw_back_pressure = true
                }
                CoreEvent::QueueStateChanged(QueueEvent::LoadShed { .. }) => saw_shed = true,
                _ => {}
            }
        }
        assert!(saw_back_pressure);
        assert!(saw_shed);
    }

    #[tokio::test]
    async fn test_back_pressure_holds_submit_for_ramped_delay() {
        let clock = Arc::new(ManualClock::starting_now());
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let mut events = publisher.subscribe();
        let queue = Arc::new(
            DispatchQueue::new(DispatchConfig {
                max_queue_size: 10,
                back_pressure: BackPressureConfig {
                    max_delay_ms: 1000,
                    ..Default::default()
                },
                ..Default::default()
            })
            .with_clock(clock.clone())
            .with_publisher(publisher),
        );
        for i in 0..8 {
            queue.submit(WorkItem::new("a", json!(i))).await.unwrap();
        }

        // 80% sits halfway between threshold and ceiling.
        let submitter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.submit(WorkItem::new("a", json!(8))).await })
        };
        let delay_ms = loop {
            if let CoreEvent::QueueStateChanged(QueueEvent::BackPressureApplied {
                delay_ms, ..
            }) = events.recv().await.unwrap()
            {
                break delay_ms;
            }
        };
        assert_eq!(delay_ms, 500);

        clock.advance(Duration::from_millis(499));
        tokio::task::yield_now().await;
        assert!(!submitter.is_finished());
        assert_eq!(queue.len(), 8);

        clock.advance(Duration::from_millis(1));
        submitter.await.unwrap().unwrap();
        assert_eq!(queue.len(), 9);
    }

    #[tokio::test]
    async fn test_pending_in_priority_order() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        queue
            .submit(WorkItem::new("a", json!("low")).with_priority(1))
            .await
            .unwrap();
        queue
            .submit(WorkItem::new("a", json!("high")).with_priority(9))
            .await
            .unwrap();
        queue
            .submit(WorkItem::new("a", json!("mid")).with_priority(5))
            .await
            .unwrap();

        let order: Vec<_> = queue.pending().into_iter().map(|i| i.payload).collect();
        assert_eq!(order, vec![json!("high"), json!("mid"), json!("low")]);
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        let first = queue.subscribe("deploy", handler_fn(|_| async { Ok(()) }));
        let second = queue.subscribe("deploy", handler_fn(|_| async { Ok(()) }));
        assert_eq!(queue.handler_count("deploy"), 2);

        assert!(queue.unsubscribe(first));
        assert!(!queue.unsubscribe(first));
        assert_eq!(queue.handler_count("deploy"), 1);

        assert!(queue.unsubscribe(second));
        assert_eq!(queue.handler_count("deploy"), 0);
    }

    #[tokio::test]
    async fn test_shutting_down_rejects() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        queue.shutdown().await;

        let err = queue.submit(WorkItem::new("a", json!({}))).await.unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        queue.submit(WorkItem::new("a", json!({}))).await.unwrap();
        queue.record_sample(12);

        queue.reset();
        let stats = queue.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.average_processing_ms, None);
        assert_eq!(stats.utilization, 0.0);
    }

    #[tokio::test]
    async fn test_samples_are_bounded() {
        let queue = DispatchQueue::new(DispatchConfig {
            processing_sample_size: 2,
            ..Default::default()
        });
        queue.record_sample(100);
        queue.record_sample(10);
        queue.record_sample(20);

        assert_eq!(queue.stats().average_processing_ms, Some(15.0));
    }

    #[tokio::test]
    async fn test_replay_unknown_dead_letter() {
        let queue = DispatchQueue::new(DispatchConfig::default());
        let id = Uuid::new_v4();
        let err = queue.replay_dead_letter(id).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeadLetterNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_failed_replay_restores_entry() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let queue = small_queue(1).with_dead_letter_store(store.clone());
        queue.submit(WorkItem::new("a", json!({}))).await.unwrap();

        let dead = WorkItem::new("b", json!({})).with_retry_count(3);
        let entry = DeadLetterEntry::new(dead, "boom", chrono::Utc::now());
        store.save(&entry).await.unwrap();

        assert!(queue.replay_dead_letter(entry.id()).await.is_err());
        assert!(store.get(&entry.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_work_sink_maps_rejection() {
        let queue = small_queue(0);
        let sink: &dyn WorkSink = &queue;
        let err = sink.enqueue("a", json!({})).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(_)));
    }
