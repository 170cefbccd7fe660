use std::collections::HashMap;

use ferry_core::{Message, SessionId};
use ferry_services::discovery::discover;
use ferry_services::{Datagram, Decision, SessionState};

use crate::*;

#[tokio::test]
async fn loopback_transfer_is_byte_exact() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let data = payload(2500);
    let outcome = export_payload(&mut exporter, importer.addr, data.clone()).await?;

    assert_eq!(outcome.identity.name, "ferry-test");
    assert_eq!(outcome.report.state, SessionState::Completed);
    assert_eq!(outcome.report.bytes, 2500);
    assert_eq!(outcome.report.chunks, 3);

    let finished = importer.wait_persisted(1).await?;
    assert_eq!(finished[0].state, SessionState::Completed);
    assert_eq!(finished[0].digest, outcome.report.digest);
    assert_eq!(importer.store.saved()[0].1, data.to_vec());
    Ok(())
}

#[tokio::test]
async fn large_payload_through_small_window() -> Result<()> {
    let mut config = test_config();
    config.transfer.window = 2;
    config.transfer.chunk_size = 512;
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let data = payload(200 * 1024);
    let outcome = export_payload(&mut exporter, importer.addr, data.clone()).await?;
    assert_eq!(outcome.report.chunks, 400);

    importer.wait_persisted(1).await?;
    assert_eq!(importer.store.saved()[0].1, data.to_vec());
    Ok(())
}

#[tokio::test]
async fn empty_payload_completes() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let outcome = export_payload(&mut exporter, importer.addr, Bytes::new()).await?;
    assert_eq!(outcome.report.chunks, 1);
    assert_eq!(outcome.report.bytes, 0);

    importer.wait_persisted(1).await?;
    assert!(importer.store.saved()[0].1.is_empty());
    Ok(())
}

#[tokio::test]
async fn manual_accept_then_transfer() -> Result<()> {
    let mut config = test_config();
    config.storage.auto_accept = false;
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let target = importer.addr;
    let data = payload(4096);
    let sent = data.clone();
    let export = tokio::spawn(async move { export_payload(&mut exporter, target, sent).await });

    let key = importer.next_offer().await?;
    // Let the sender repeat its request a few times while we "think".
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(importer.handle.decide(key, Decision::Accept).await);

    let outcome = export.await??;
    assert_eq!(outcome.report.bytes, 4096);

    importer.wait_persisted(1).await?;
    assert_eq!(importer.store.saved()[0].1, data.to_vec());
    Ok(())
}

#[tokio::test]
async fn rejection_reaches_sender() -> Result<()> {
    let mut config = test_config();
    config.storage.auto_accept = false;
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let target = importer.addr;
    let export =
        tokio::spawn(async move { export_payload(&mut exporter, target, payload(100)).await });

    let key = importer.next_offer().await?;
    assert!(importer.handle.decide(key, Decision::Reject).await);

    match export.await? {
        Err(TransferError::Rejected { reason, .. }) => assert_eq!(reason, "rejected"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(importer.store.saved().is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_source_fails_before_any_traffic() -> Result<()> {
    let config = test_config();
    let importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let (_shutdown, rx) = broadcast::channel(1);
    let err = exporter
        .export(importer.addr, &MemoryStore::default(), rx)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::SourceNotFound(_)));
    assert!(importer.handle.sessions().is_empty());
    Ok(())
}

#[tokio::test]
async fn discovery_reports_identity() -> Result<()> {
    let config = test_config();
    let importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let identity = exporter.discover(importer.addr).await?;
    assert_eq!(identity.name, "ferry-test");
    assert_eq!(identity.addresses, vec!["127.0.0.1".parse::<std::net::IpAddr>()?]);
    Ok(())
}

#[tokio::test]
async fn offline_peer_is_unreachable() -> Result<()> {
    // Bound but never read: probes vanish.
    let silent = loopback().await?;
    let target = silent.local_addr()?;

    let probe = loopback().await?;
    let started = tokio::time::Instant::now();
    let err = discover(&probe, target, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PeerUnreachable(addr) if addr == target));
    assert!(started.elapsed() >= Duration::from_millis(200));
    Ok(())
}

#[tokio::test]
async fn concurrent_exports_stay_separate() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;
    let target = importer.addr;

    let mut tasks = Vec::new();
    for len in [3000usize, 7000, 12_000] {
        let mut exporter = exporter(&config, plain).await?;
        tasks.push(tokio::spawn(async move {
            export_payload(&mut exporter, target, payload(len)).await
        }));
    }
    for task in tasks {
        task.await??;
    }

    importer.wait_persisted(3).await?;
    let mut lengths: Vec<usize> = importer.store.saved().iter().map(|(_, p)| p.len()).collect();
    lengths.sort_unstable();
    assert_eq!(lengths, vec![3000, 7000, 12_000]);
    for (_, saved) in importer.store.saved() {
        assert_eq!(saved, payload(saved.len()).to_vec());
    }
    Ok(())
}

/// One peer, two session ids, chunks interleaved by hand: each session
/// reassembles only its own bytes.
#[tokio::test]
async fn same_peer_sessions_do_not_mix() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;
    let peer = loopback().await?;

    let bodies: HashMap<SessionId, &[u8]> = [
        (SessionId([1; 8]), &b"first session body"[..]),
        (SessionId([2; 8]), &b"second, different body"[..]),
    ]
    .into_iter()
    .collect();

    for sid in bodies.keys() {
        let start = Message::DataStart {
            session_id: Some(*sid),
            total_bytes: None,
        };
        peer.send(importer.addr, &start.encode()).await?;
    }

    // Two chunks each, sent second-halves first.
    for half in [1u32, 0] {
        for (sid, body) in &bodies {
            let mid = body.len() / 2;
            let part = if half == 0 { &body[..mid] } else { &body[mid..] };
            let chunk = Message::Chunk {
                session_id: *sid,
                chunk: ferry_core::Chunk {
                    sequence: half,
                    payload: Bytes::copy_from_slice(part),
                    is_final: half == 1,
                },
            };
            peer.send(importer.addr, &chunk.encode()).await?;
        }
    }

    importer.wait_persisted(2).await?;
    for (key, saved) in importer.store.saved() {
        assert_eq!(key.peer, peer.local_addr()?);
        assert_eq!(saved, bodies[&key.session_id].to_vec());
    }
    Ok(())
}

#[tokio::test]
async fn duplicate_start_leaves_original_intact() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;
    let peer = loopback().await?;
    let sid = SessionId([0x42; 8]);

    let start = Message::DataStart {
        session_id: Some(sid),
        total_bytes: Some(4),
    }
    .encode();
    peer.send(importer.addr, &start).await?;
    peer.send(importer.addr, &start).await?;

    match importer.next_event().await? {
        ImportEvent::Refused { key, error } => {
            assert_eq!(key.session_id, sid);
            assert!(matches!(error, TransferError::DuplicateSession { .. }));
        }
        other => panic!("expected refusal, got {other:?}"),
    }

    let key = SessionKey::new(peer.local_addr()?, sid);
    assert_eq!(importer.handle.state_of(&key), Some(SessionState::Transferring));
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_pending_export() -> Result<()> {
    let mut config = test_config();
    config.storage.auto_accept = false;
    let mut importer = start_importer(&config, plain).await?;
    let mut exporter = exporter(&config, plain).await?;

    let (shutdown, rx) = broadcast::channel(1);
    let target = importer.addr;
    let export = tokio::spawn(async move {
        let store = MemoryStore::with_source(payload(100));
        exporter.export(target, &store, rx).await
    });

    importer.next_offer().await?;
    shutdown.send(())?;

    match export.await? {
        Err(TransferError::Cancelled(reason)) => assert_eq!(reason, "shutdown"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    Ok(())
}
