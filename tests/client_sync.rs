//! End-to-end scenarios: a full client against the fake in-process backend.

mod common;

use std::time::Duration;

use common::{client, doc_key, next_snapshot, version};
use firestore_offline::model::ResourcePath;
use firestore_offline::mutation::MutationResult;
use firestore_offline::remote::watch_change::{
    ExistenceFilterChange, ListenRequest, TargetChangeState, WatchChange, WatchTargetChange,
};
use firestore_offline::remote::write_stream::{WriteRequest, WriteResponse};
use firestore_offline::sync::DocumentChangeType;
use firestore_offline::value::{object_from_pairs, FieldValue};
use firestore_offline::{Mutation, Query};

fn cities_query() -> Query {
    Query::collection(ResourcePath::from_string("cities").unwrap())
}

fn city(population: i64) -> firestore_offline::ObjectValue {
    object_from_pairs([("population", FieldValue::Integer(population))])
}

async fn expect_add_target(stream: &common::ServerStream) -> (i32, Vec<u8>) {
    match stream.recv_listen_request().await {
        ListenRequest::AddTarget {
            target_id,
            resume_token,
            ..
        } => (target_id, resume_token),
        other => panic!("expected AddTarget, got {other:?}"),
    }
}

async fn expect_remove_target(stream: &common::ServerStream) -> i32 {
    match stream.recv_listen_request().await {
        ListenRequest::RemoveTarget { target_id } => target_id,
        other => panic!("expected RemoveTarget, got {other:?}"),
    }
}

async fn ack_targets(stream: &common::ServerStream, target_ids: Vec<i32>) {
    stream
        .send_watch_change(&WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Add,
            target_ids,
        )))
        .await;
}

#[tokio::test]
async fn watch_stream_delivers_a_synced_snapshot() {
    let (engine, backend) = client();
    let events = engine.events();

    let initial = engine.listen(cities_query()).await.unwrap();
    assert!(initial.documents.is_empty());
    assert!(initial.from_cache);

    let listen = backend.next_listen_stream().await;
    let (target_id, resume_token) = expect_add_target(&listen).await;
    assert!(resume_token.is_empty());

    ack_targets(&listen, vec![target_id]).await;
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;

    let snapshot = next_snapshot(&events).await;
    assert_eq!(snapshot.documents.len(), 1);
    assert_eq!(snapshot.documents[0].key(), &doc_key("cities/sf"));
    assert!(!snapshot.from_cache);
    assert!(!snapshot.has_pending_writes);
    assert_eq!(snapshot.changes.len(), 1);
    assert_eq!(snapshot.changes[0].change_type, DocumentChangeType::Added);
}

#[tokio::test]
async fn writes_acknowledge_in_batch_order_and_converge() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 1)
        .await;
    next_snapshot(&events).await; // empty, synced

    let first_ack = engine
        .write_mutations(vec![Mutation::set(doc_key("cities/sf"), city(100))])
        .await
        .unwrap();
    let second_ack = engine
        .write_mutations(vec![Mutation::set(doc_key("cities/la"), city(50))])
        .await
        .unwrap();
    // Two optimistic snapshots, both pending.
    assert!(next_snapshot(&events).await.has_pending_writes);
    assert!(next_snapshot(&events).await.has_pending_writes);

    let write = backend.next_write_stream().await;
    match write.recv_write_request().await {
        WriteRequest::Handshake => {}
        other => panic!("expected handshake, got {other:?}"),
    }
    write
        .send_write_response(&WriteResponse {
            stream_token: b"wt-1".to_vec(),
            commit_version: None,
            write_results: Vec::new(),
        })
        .await;

    for (seconds, token) in [(10, b"wt-2".to_vec()), (11, b"wt-3".to_vec())] {
        match write.recv_write_request().await {
            WriteRequest::Writes { writes, .. } => assert_eq!(writes.len(), 1),
            other => panic!("expected writes, got {other:?}"),
        }
        write
            .send_write_response(&WriteResponse {
                stream_token: token,
                commit_version: Some(version(seconds)),
                write_results: vec![MutationResult::new(version(seconds))],
            })
            .await;
    }

    // Batches acknowledge strictly in batch id order.
    first_ack.recv().await.unwrap().unwrap();
    second_ack.recv().await.unwrap().unwrap();

    // The watch stream catches up to the committed versions; pending state
    // drains and the view converges.
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 10)
        .await;
    listen
        .send_document(vec![target_id], "cities/la", city(50), 11)
        .await;
    listen.close_snapshot(12).await;

    let mut converged = next_snapshot(&events).await;
    while converged.has_pending_writes || converged.from_cache {
        converged = next_snapshot(&events).await;
    }
    assert_eq!(converged.documents.len(), 2);
}

#[tokio::test]
async fn existence_filter_mismatch_forces_a_fresh_listen() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;
    assert!(!next_snapshot(&events).await.from_cache);

    // The backend claims the target holds no documents while the client
    // tracks one; without a bloom filter the listen restarts from scratch.
    listen
        .send_watch_change(&WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count: 0,
            unchanged_names: None,
        }))
        .await;
    listen.close_snapshot(6).await;

    let removed = expect_remove_target(&listen).await;
    assert_eq!(removed, target_id);
    let (readded, resume_token) = expect_add_target(&listen).await;
    assert_eq!(readded, target_id);
    assert!(resume_token.is_empty(), "mismatch must clear the resume token");
}

#[tokio::test]
async fn limbo_documents_resolve_to_deletions() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;
    assert!(!next_snapshot(&events).await.from_cache);

    // The backend drops the document from the target without asserting
    // deletion; the cached copy is now in limbo.
    listen
        .send_watch_change(&WatchChange::DocumentRemove(
            firestore_offline::remote::watch_change::DocumentRemove {
                key: doc_key("cities/sf"),
                read_time: Some(version(6)),
                removed_target_ids: vec![target_id],
            },
        ))
        .await;
    listen.close_snapshot(6).await;

    // The cached document stays visible but the view drops to cache mode
    // while the limbo listen runs.
    let limbo_snapshot = next_snapshot(&events).await;
    assert_eq!(limbo_snapshot.documents.len(), 1);
    assert!(limbo_snapshot.from_cache);

    // The engine opened a single-document listen with an odd target id.
    let (limbo_target, _) = expect_add_target(&listen).await;
    assert_eq!(limbo_target % 2, 1);
    assert_ne!(limbo_target, target_id);

    // CURRENT with no document means the backend does not have it: the
    // engine deletes it locally at the limbo-resolution version.
    ack_targets(&listen, vec![limbo_target]).await;
    listen
        .mark_current_and_close_snapshot(vec![limbo_target], 7)
        .await;

    let resolved = next_snapshot(&events).await;
    assert!(resolved.documents.is_empty());
    assert!(!resolved.from_cache);
    assert_eq!(resolved.changes.len(), 1);
    assert_eq!(resolved.changes[0].change_type, DocumentChangeType::Removed);

    // The resolved limbo target gets torn down.
    let removed = expect_remove_target(&listen).await;
    assert_eq!(removed, limbo_target);
}

#[tokio::test]
async fn watch_stream_reconnects_with_the_persisted_resume_token() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;
    assert!(!next_snapshot(&events).await.from_cache);

    // Transient stream failure: the client backs off, reconnects, and
    // resumes from the persisted token instead of restarting from scratch.
    listen
        .fail(firestore_offline::error::unavailable("stream reset"))
        .await;

    let reconnected = backend.next_listen_stream().await;
    let (readded, resume_token) = expect_add_target(&reconnected).await;
    assert_eq!(readded, target_id);
    assert_eq!(resume_token, b"rt-5".to_vec());
}

#[tokio::test]
async fn network_toggle_replays_registered_targets() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;
    assert!(!next_snapshot(&events).await.from_cache);

    engine.remote_store().disable_network().await.unwrap();
    engine.remote_store().enable_network().await.unwrap();

    // The fresh stream re-registers the still-active target with the
    // persisted resume token.
    let reopened = backend.next_listen_stream().await;
    let (readded, resume_token) = expect_add_target(&reopened).await;
    assert_eq!(readded, target_id);
    assert_eq!(resume_token, b"rt-5".to_vec());
}

#[tokio::test]
async fn replayed_remote_events_are_idempotent() {
    let (engine, backend) = client();
    let events = engine.events();
    engine.listen(cities_query()).await.unwrap();

    let listen = backend.next_listen_stream().await;
    let (target_id, _) = expect_add_target(&listen).await;
    ack_targets(&listen, vec![target_id]).await;
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen
        .mark_current_and_close_snapshot(vec![target_id], 5)
        .await;
    assert_eq!(next_snapshot(&events).await.documents.len(), 1);

    // Replaying the identical document at the same version changes nothing
    // and emits no snapshot.
    listen
        .send_document(vec![target_id], "cities/sf", city(100), 5)
        .await;
    listen.close_snapshot(5).await;

    let replay = tokio::time::timeout(Duration::from_millis(300), next_snapshot(&events)).await;
    assert!(replay.is_err(), "replayed event must not re-notify listeners");
}
