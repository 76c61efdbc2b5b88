use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use frames::{ProtocolMessage, decode_message};

use super::*;

fn reply(id: &str) -> HttpMessage {
    let raw = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransac-id: {id}\r\ncontent-length: 2\r\n\r\n{{}}"
    );
    match decode_message(raw.as_bytes()).expect("decode") {
        ProtocolMessage::Http(message) => message,
        ProtocolMessage::Binary(_) => panic!("expected http message"),
    }
}

#[test]
fn ids_follow_the_clock_when_it_advances() {
    let mut correlator = Correlator::new();
    assert_eq!(correlator.next_id_at(1_000), "1000");
    assert_eq!(correlator.next_id_at(1_500), "1500");
}

#[test]
fn ids_stay_strictly_increasing_within_one_millisecond() {
    let mut correlator = Correlator::new();
    assert_eq!(correlator.next_id_at(1_000), "1000");
    assert_eq!(correlator.next_id_at(1_000), "1001");
    assert_eq!(correlator.next_id_at(1_000), "1002");
    assert_eq!(correlator.next_id_at(999), "1003");
    assert_eq!(correlator.next_id_at(2_000), "2000");
}

#[test]
fn wall_clock_ids_are_unique() {
    let mut correlator = Correlator::new();
    let ids: Vec<i64> = (0..100)
        .map(|_| correlator.next_transaction_id().parse().expect("numeric id"))
        .collect();
    assert!(ids.windows(2).all(|pair| pair[1] > pair[0]));
}

#[tokio::test]
async fn resolve_settles_only_the_matching_entry() {
    let mut correlator = Correlator::new();
    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, mut rx_b) = oneshot::channel();
    correlator.register("1".to_owned(), tx_a, None);
    correlator.register("2".to_owned(), tx_b, None);

    assert!(correlator.resolve(reply("1")).is_ok());

    let message = rx_a.await.expect("sender").expect("reply");
    assert_eq!(message.transaction_id(), Some("1"));
    assert!(rx_b.try_recv().is_err());
    assert_eq!(correlator.len(), 1);
    assert!(correlator.contains("2"));
}

#[test]
fn unmatched_message_is_handed_back() {
    let mut correlator = Correlator::new();
    let message = correlator.resolve(reply("9")).expect_err("nothing pending");
    assert_eq!(message.transaction_id(), Some("9"));
}

#[tokio::test]
async fn second_reply_for_same_id_is_unmatched() {
    let mut correlator = Correlator::new();
    let (tx, _rx) = oneshot::channel();
    correlator.register("5".to_owned(), tx, None);
    assert!(correlator.resolve(reply("5")).is_ok());
    assert!(correlator.resolve(reply("5")).is_err());
}

#[tokio::test]
async fn expire_rejects_with_timeout_once() {
    let mut correlator = Correlator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("3".to_owned(), tx, None);

    assert!(correlator.expire("3", Duration::from_millis(50)));
    assert!(!correlator.expire("3", Duration::from_millis(50)));

    let err = rx.await.expect("sender").expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout { ref transaction_id, .. } if transaction_id == "3"));
}

#[tokio::test]
async fn reject_all_fails_every_pending_request() {
    let mut correlator = Correlator::new();
    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, rx_b) = oneshot::channel();
    correlator.register("1".to_owned(), tx_a, None);
    correlator.register("2".to_owned(), tx_b, None);

    assert_eq!(correlator.reject_all(), 2);
    assert_eq!(correlator.len(), 0);

    for rx in [rx_a, rx_b] {
        let err = rx.await.expect("sender").expect_err("closed");
        assert!(matches!(err, ClientError::ClosedWhilePending { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn resolving_aborts_the_timer() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let mut correlator = Correlator::new();
    let (tx, _rx) = oneshot::channel();
    correlator.register("4".to_owned(), tx, Some(timer));
    assert!(correlator.resolve(reply("4")).is_ok());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn removed_entry_never_reports_back() {
    let mut correlator = Correlator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("8".to_owned(), tx, None);
    assert!(correlator.remove("8"));
    assert!(!correlator.remove("8"));
    assert!(rx.await.is_err());
}
