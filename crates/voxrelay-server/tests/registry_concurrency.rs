//! Session registry under concurrent use.

use std::collections::HashSet;
use tokio::sync::{mpsc, watch};
use voxrelay_server::registry::{RouteError, SessionHandle, SessionRegistry};
use voxrelay_types::{OutboundEvent, SessionState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_receive_only_their_own_events() {
    let registry = SessionRegistry::new();
    let mut handles = Vec::new();

    for n in 0..32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("session-{}", n);
            let (tx, mut rx) = mpsc::channel(16);
            let (_state_tx, state_rx) = watch::channel(SessionState::Active);
            registry
                .insert(id.clone(), SessionHandle::new(tx, state_rx, None))
                .await;

            for i in 0..10 {
                registry
                    .route(&id, OutboundEvent::ReplyToken(format!("{}-{}", n, i)))
                    .await
                    .expect("route should succeed while registered");
                match rx.recv().await {
                    Some(OutboundEvent::ReplyToken(token)) => {
                        assert_eq!(token, format!("{}-{}", n, i))
                    }
                    other => panic!("Expected own reply token, got {:?}", other),
                }
            }

            assert!(registry.remove(&id).await.is_some());
            match registry.route(&id, OutboundEvent::Error("late".into())).await {
                Err(RouteError::UnknownSession(missing)) => assert_eq!(missing, id),
                other => panic!("Expected UnknownSession error, got {:?}", other),
            }
            id
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.expect("task should not panic")));
    }
    assert_eq!(seen.len(), 32);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_route_waits_for_queue_space() {
    let registry = SessionRegistry::new();
    let (tx, mut rx) = mpsc::channel(1);
    let (_state_tx, state_rx) = watch::channel(SessionState::Active);
    registry
        .insert("s".to_string(), SessionHandle::new(tx, state_rx, None))
        .await;

    registry.route("s", OutboundEvent::ReplyToken("1".into())).await.unwrap();
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.route("s", OutboundEvent::ReplyToken("2".into())).await })
    };
    tokio::task::yield_now().await;
    assert!(!pending.is_finished());

    assert_eq!(rx.recv().await, Some(OutboundEvent::ReplyToken("1".into())));
    pending.await.unwrap().unwrap();
    assert_eq!(rx.recv().await, Some(OutboundEvent::ReplyToken("2".into())));
}
