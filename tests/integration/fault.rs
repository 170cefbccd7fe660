use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferry_core::Message;
use ferry_services::{Datagram, Decision, SessionState, SharedTransport, UdpTransport};

use crate::*;

// ── FaultyTransport ──────────────────────────────────────────────────────────

/// What to do with one outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Pass,
    Drop,
    Duplicate,
}

type Rule = Box<dyn FnMut(&Message) -> Fault + Send>;

/// Wraps a real socket and applies `rule` to every datagram it sends.
/// Receiving is untouched; wrap both ends to disturb both directions.
pub struct FaultyTransport {
    inner: UdpTransport,
    rule: Mutex<Rule>,
    dropped: Arc<AtomicUsize>,
}

impl FaultyTransport {
    pub fn wrap(
        inner: UdpTransport,
        rule: impl FnMut(&Message) -> Fault + Send + 'static,
    ) -> (SharedTransport, Arc<AtomicUsize>) {
        let dropped = Arc::new(AtomicUsize::new(0));
        let transport: SharedTransport = Arc::new(Self {
            inner,
            rule: Mutex::new(Box::new(rule)),
            dropped: dropped.clone(),
        });
        (transport, dropped)
    }

    fn judge(&self, bytes: &[u8]) -> Fault {
        match Message::decode(bytes) {
            Ok(message) => {
                let mut rule = self.rule.lock().unwrap();
                (*rule)(&message)
            }
            Err(_) => Fault::Pass,
        }
    }
}

impl Datagram for FaultyTransport {
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            match self.judge(bytes) {
                Fault::Pass => self.inner.send_to(bytes, addr).await,
                Fault::Drop => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Fault::Duplicate => {
                    self.inner.send_to(bytes, addr).await?;
                    self.inner.send_to(bytes, addr).await
                }
            }
        })
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Random loss on chunks and acks only; control messages always pass.
fn lossy(seed: u64, loss: f64) -> impl FnMut(&Message) -> Fault + Send + 'static {
    let mut rng = StdRng::seed_from_u64(seed);
    move |message| match message {
        Message::Chunk { .. } | Message::Ack { .. } if rng.gen_bool(loss) => Fault::Drop,
        _ => Fault::Pass,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Chunk 1 is lost once: it must be retransmitted after the timeout, chunk 2
/// is held until it arrives, and the payload still matches.
#[tokio::test]
async fn dropped_chunk_is_retransmitted() -> Result<()> {
    let config = test_config();
    let mut importer = start_importer(&config, plain).await?;

    let mut exporter = exporter(&config, |udp| {
        let mut lost_once = false;
        FaultyTransport::wrap(udp, move |message| match message {
            Message::Chunk { chunk, .. } if chunk.sequence == 1 && !lost_once => {
                lost_once = true;
                Fault::Drop
            }
            _ => Fault::Pass,
        })
        .0
    })
    .await?;

    let data = payload(2500);
    let outcome = export_payload(&mut exporter, importer.addr, data.clone()).await?;
    assert_eq!(outcome.report.chunks, 3);
    assert!(outcome.report.retransmissions >= 1);

    importer.wait_persisted(1).await?;
    assert_eq!(importer.store.saved()[0].1, data.to_vec());
    Ok(())
}

#[tokio::test]
async fn lossy_link_in_both_directions() -> Result<()> {
    let mut config = test_config();
    config.transfer.window = 4;

    let mut importer =
        start_importer(&config, |udp| FaultyTransport::wrap(udp, lossy(7, 0.2)).0).await?;
    let (transport, dropped) = FaultyTransport::wrap(loopback().await?, lossy(11, 0.2));
    let mut exporter = Exporter::with_transport(transport, &config);

    let data = payload(64 * 1024);
    let outcome = export_payload(&mut exporter, importer.addr, data.clone()).await?;
    assert_eq!(outcome.report.bytes, data.len() as u64);
    assert!(dropped.load(Ordering::Relaxed) > 0);

    let finished = importer.wait_persisted(1).await?;
    assert_eq!(importer.store.saved()[0].1, data.to_vec());
    assert_eq!(finished[0].digest, outcome.report.digest);
    Ok(())
}

#[tokio::test]
async fn duplicated_datagrams_are_harmless() -> Result<()> {
    let config = test_config();
    let duplicate_all = |udp| FaultyTransport::wrap(udp, |_: &Message| Fault::Duplicate).0;

    let mut importer = start_importer(&config, duplicate_all).await?;
    let mut exporter = exporter(&config, duplicate_all).await?;

    let data = payload(10_000);
    export_payload(&mut exporter, importer.addr, data.clone()).await?;

    importer.wait_persisted(1).await?;
    let saved = importer.store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].1, data.to_vec());
    Ok(())
}

/// Acks stop after the first one: the sender spends its retry budget on the
/// next chunk and gives up with a reason.
#[tokio::test]
async fn silent_receiver_exhausts_retry_budget() -> Result<()> {
    let config = test_config();
    let importer = start_importer(&config, |udp| {
        let mut acks_sent = 0;
        FaultyTransport::wrap(udp, move |message| match message {
            Message::Ack { .. } => {
                acks_sent += 1;
                if acks_sent > 1 {
                    Fault::Drop
                } else {
                    Fault::Pass
                }
            }
            _ => Fault::Pass,
        })
        .0
    })
    .await?;
    let mut exporter = exporter(&config, plain).await?;

    let err = export_payload(&mut exporter, importer.addr, payload(5000))
        .await
        .unwrap_err();
    match err {
        TransferError::PeerUnresponsive { reason, .. } => {
            assert!(reason.contains("unacknowledged"), "reason: {reason}");
        }
        other => panic!("expected PeerUnresponsive, got {other}"),
    }
    Ok(())
}

/// Nobody answers the prompt: the sender keeps repeating its request without
/// burning retries, then gives up once the accept window closes.
#[tokio::test]
async fn unanswered_offer_times_out_sender() -> Result<()> {
    let mut import_config = test_config();
    import_config.storage.auto_accept = false;
    let mut importer = start_importer(&import_config, plain).await?;

    let mut export_config = test_config();
    export_config.transfer.accept_timeout_secs = 1;
    let mut exporter = exporter(&export_config, plain).await?;

    let target = importer.addr;
    let export = tokio::spawn(async move {
        export_payload(&mut exporter, target, payload(3000)).await
    });

    let key = importer.next_offer().await?;
    assert_eq!(importer.handle.state_of(&key), Some(SessionState::AwaitingAccept));

    let err = export.await?.unwrap_err();
    assert!(
        matches!(err, TransferError::PeerUnresponsive { .. }),
        "unexpected error: {err}"
    );
    Ok(())
}

/// The first ABORT carrying the rejection is lost: the sender's next request
/// is answered with the same rejection instead of a second offer.
#[tokio::test]
async fn lost_rejection_is_repeated() -> Result<()> {
    let mut config = test_config();
    config.storage.auto_accept = false;
    let mut importer = start_importer(&config, |udp| {
        let mut aborts_seen = 0;
        FaultyTransport::wrap(udp, move |message| match message {
            Message::Abort { .. } => {
                aborts_seen += 1;
                if aborts_seen == 1 {
                    Fault::Drop
                } else {
                    Fault::Pass
                }
            }
            _ => Fault::Pass,
        })
        .0
    })
    .await?;
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
    while let Ok(event) = importer.events.try_recv() {
        assert!(!matches!(event, ImportEvent::Offer { .. }), "offered twice");
    }
    Ok(())
}
