//! Failover chain behavior of the runtime dispatcher.

mod init_logging;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ouro::runtime::{
    ApiKey, AttemptRecord, ChainEntry, DispatchError, Dispatcher, ErrorClass, LlmRequest,
    MetricsSink, MockOutcome, MockProvider, Provider,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<AttemptRecord>>,
}

impl MetricsSink for RecordingSink {
    fn record_attempt(&self, record: AttemptRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn dispatcher_with(
    providers: Vec<Arc<MockProvider>>,
    chain: Vec<ChainEntry>,
    sink: Arc<RecordingSink>,
) -> Dispatcher {
    let mut builder = Dispatcher::builder()
        .chain(chain)
        .key_cooldown(Duration::from_secs(60))
        .metrics(sink);
    for p in &providers {
        let name = p.name().to_string();
        builder = builder
            .provider(Arc::clone(p) as Arc<dyn ouro::runtime::Provider>)
            .keys(&name, vec![ApiKey::new(format!("k{name}1"), "secret")]);
    }
    builder.build()
}

fn request() -> LlmRequest {
    LlmRequest {
        task_type: "chat".into(),
        prompt: "hello".into(),
        ..Default::default()
    }
}

/// **Scenario**: key `kA1` is unauthorized, provider B answers. The
/// dispatcher returns B's content, marks `kA1` auth-failed, and makes
/// exactly one call against each pair.
#[tokio::test]
async fn auth_failure_fails_over_and_marks_key() {
    init_logging::init();
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    a.push(MockOutcome::Fail("Unauthorized".into()));
    b.push(MockOutcome::Succeed("ok".into()));

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a), Arc::clone(&b)],
        vec![ChainEntry::new("A", "m1"), ChainEntry::new("B", "m2")],
        Arc::clone(&sink),
    );

    let resp = d.dispatch(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(resp.provider, "B");
    assert_eq!(resp.model, "m2");

    assert_eq!(a.calls(), vec![("m1".to_string(), "kA1".to_string())]);
    assert_eq!(b.calls(), vec![("m2".to_string(), "kB1".to_string())]);

    let health = d.provider_health();
    let ka1 = health
        .iter()
        .find(|h| h.provider == "A" && h.key_id == "kA1")
        .unwrap();
    assert_eq!(ka1.consecutive_auth_failures, 1);
    assert!(ka1.cooldown_until.is_some());
}

/// **Scenario**: every pair in a 3-long chain fails with the same class.
/// Exactly 3 attempts happen, once each, in order; the surfaced error is the
/// last provider's, annotated with the full chain.
#[tokio::test]
async fn exhausted_chain_attempts_each_pair_once_in_order() {
    init_logging::init();
    let providers: Vec<Arc<MockProvider>> = ["A", "B", "C"]
        .iter()
        .map(|n| {
            let p = Arc::new(MockProvider::new(*n));
            p.push(MockOutcome::Fail("HTTP 503: service unavailable".into()));
            p
        })
        .collect();

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        providers.iter().cloned().collect(),
        vec![
            ChainEntry::new("A", "m1"),
            ChainEntry::new("B", "m2"),
            ChainEntry::new("C", "m3"),
        ],
        Arc::clone(&sink),
    );

    let err = d.dispatch(&request(), &CancellationToken::new()).await.unwrap_err();
    match err {
        DispatchError::ChainExhausted { last, attempted } => {
            assert_eq!(last.provider, "C");
            assert_eq!(last.class, ErrorClass::Unavailable);
            assert_eq!(
                attempted,
                vec![
                    ("A".to_string(), "m1".to_string()),
                    ("B".to_string(), "m2".to_string()),
                    ("C".to_string(), "m3".to_string()),
                ]
            );
        }
        other => panic!("expected ChainExhausted, got {other:?}"),
    }
    for p in &providers {
        assert_eq!(p.calls().len(), 1, "{} called more than once", p.name());
    }

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.class == Some(ErrorClass::Unavailable)));
}

/// **Scenario**: a rate-limited provider does not mark its key; the same key
/// is offered again on the next dispatch.
#[tokio::test]
async fn transient_errors_do_not_mark_keys() {
    init_logging::init();
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    a.push(MockOutcome::Fail("HTTP 429: Too Many Requests".into()));
    b.push(MockOutcome::Succeed("ok".into()));

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a), Arc::clone(&b)],
        vec![ChainEntry::new("A", "m1"), ChainEntry::new("B", "m2")],
        sink,
    );

    d.dispatch(&request(), &CancellationToken::new()).await.unwrap();
    let ka1 = d
        .provider_health()
        .into_iter()
        .find(|h| h.provider == "A")
        .unwrap();
    assert_eq!(ka1.consecutive_auth_failures, 0);
    assert!(ka1.cooldown_until.is_none());

    // Next dispatch tries A's same key again.
    d.dispatch(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(a.calls().len(), 2);
    assert!(a.calls().iter().all(|(_, k)| k == "kA1"));
}

/// **Scenario**: the same provider appears twice in the chain with different
/// models; the key chosen for it is reused rather than rotated mid-dispatch.
#[tokio::test]
async fn key_is_reused_while_provider_is_unchanged() {
    init_logging::init();
    let a = Arc::new(MockProvider::new("A"));
    a.push(MockOutcome::Fail("request timed out".into()));
    a.push(MockOutcome::Succeed("second model worked".into()));

    let sink = Arc::new(RecordingSink::default());
    let mut builder = Dispatcher::builder()
        .chain(vec![ChainEntry::new("A", "m1"), ChainEntry::new("A", "m2")])
        .metrics(sink);
    builder = builder
        .provider(Arc::clone(&a) as Arc<dyn ouro::runtime::Provider>)
        .keys(
            "A",
            vec![ApiKey::new("kA1", "s1"), ApiKey::new("kA2", "s2")],
        );
    let d = builder.build();

    let resp = d.dispatch(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(resp.content, "second model worked");
    let calls = a.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, calls[1].1, "key must not rotate mid-provider");
}

/// **Scenario**: streaming commits at the first delta; a mid-stream error
/// terminates the stream instead of restarting on the fallback provider.
#[tokio::test]
async fn stream_does_not_fail_over_after_first_delta() {
    init_logging::init();
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    a.push(MockOutcome::StreamChunksThenFail(
        vec!["partial ".into()],
        "the model is overloaded".into(),
    ));

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a), Arc::clone(&b)],
        vec![ChainEntry::new("A", "m1"), ChainEntry::new("B", "m2")],
        sink,
    );

    let mut stream = d
        .dispatch_stream(&request(), &CancellationToken::new())
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.text, "partial ");
    assert!(matches!(stream.next().await, Some(Err(_))));
    assert!(stream.next().await.is_none());
    assert!(b.calls().is_empty(), "no failover after the first delta");
}

/// **Scenario**: a stream that errors before any delta fails over exactly
/// like a non-streaming call.
#[tokio::test]
async fn stream_error_before_first_delta_fails_over() {
    init_logging::init();
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    a.push(MockOutcome::StreamChunksThenFail(
        vec![],
        "HTTP 503: service unavailable".into(),
    ));
    b.push(MockOutcome::StreamChunks(vec!["he".into(), "llo".into()]));

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a), Arc::clone(&b)],
        vec![ChainEntry::new("A", "m1"), ChainEntry::new("B", "m2")],
        sink,
    );

    let stream = d
        .dispatch_stream(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "hello");
    assert_eq!(a.calls().len(), 1);
    assert_eq!(b.calls().len(), 1);
}

/// **Scenario**: an empty chain is a configuration error, not a panic.
#[tokio::test]
async fn empty_chain_is_an_error() {
    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(vec![], vec![], sink);
    assert!(matches!(
        d.dispatch(&request(), &CancellationToken::new()).await,
        Err(DispatchError::EmptyChain)
    ));
}

/// **Scenario**: cancellation before dispatch returns the marked result.
#[tokio::test]
async fn cancelled_dispatch_is_marked() {
    let a = Arc::new(MockProvider::new("A"));
    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a)],
        vec![ChainEntry::new("A", "m1")],
        sink,
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        d.dispatch(&request(), &cancel).await,
        Err(DispatchError::Cancelled)
    ));
    assert!(a.calls().is_empty());
}

/// **Scenario**: a preferred `"provider:model"` pair moves to the front of
/// the chain.
#[tokio::test]
async fn preferred_model_reorders_the_chain() {
    let a = Arc::new(MockProvider::new("A"));
    let b = Arc::new(MockProvider::new("B"));
    b.push(MockOutcome::Succeed("from b".into()));

    let sink = Arc::new(RecordingSink::default());
    let d = dispatcher_with(
        vec![Arc::clone(&a), Arc::clone(&b)],
        vec![ChainEntry::new("A", "m1"), ChainEntry::new("B", "m2")],
        sink,
    );

    let mut req = request();
    req.preferred_model = Some("B:m2".into());
    let resp = d.dispatch(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(resp.content, "from b");
    assert!(a.calls().is_empty());
}
