//! Cross-crate flow: relay generation through the fallback store into a
//! polling session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use rivulet::prelude::*;
use rivulet::rrelay::BoxedTokenStream;
use tokio::sync::oneshot;

/// Yields one token immediately, then holds the stream open until the test
/// releases the gate.
struct GatedBackend {
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatedBackend {
    fn new(gate: oneshot::Receiver<()>) -> Self {
        Self {
            gate: Mutex::new(Some(gate)),
        }
    }
}

impl CompletionBackend for GatedBackend {
    fn stream_completion<'a>(
        &'a self,
        _route: &'a ResolvedRoute,
        _request: CompletionRequest,
    ) -> BoxFuture<'a, Result<BoxedTokenStream, RelayError>> {
        Box::pin(async move {
            let gate = self.gate.lock().expect("gate lock").take();
            let stream = stream::unfold((0u8, gate), |(step, mut gate)| async move {
                match step {
                    0 => Some((Ok(TokenUnit::Answer("Hello".to_string())), (1, gate))),
                    1 => {
                        if let Some(rx) = gate.take() {
                            let _ = rx.await;
                        }
                        Some((Ok(TokenUnit::Answer(" world".to_string())), (2, gate)))
                    }
                    _ => None,
                }
            })
            .boxed();
            Ok(stream as BoxedTokenStream)
        })
    }
}

fn trial_route(catalog: &ProviderCatalog) -> ResolvedRoute {
    resolve(
        catalog,
        "openrouter/openai/gpt-4o-mini",
        &CredentialSet::new(),
        Some("sk-shared"),
    )
    .expect("trial route")
}

#[tokio::test]
async fn generation_reaches_a_polling_subscriber_joined_mid_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (release, gate) = oneshot::channel();

    let config = RuntimeConfig::new()
        .with_store(StoreConfig::default().with_snapshot_path(dir.path().join("state.json")))
        .with_shared_aggregator_key("sk-shared")
        .with_poll(
            PollSettings::default()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(100),
        );
    let bundle =
        rivulet::build_runtime_with(config, Arc::new(GatedBackend::new(gate)), None)
            .await
            .expect("build runtime");

    let user = UserId::new("u1");
    let conversation = ConversationId::new("c1");
    bundle
        .store
        .init_conversation(&user, &conversation, "openrouter/openai/gpt-4o-mini", DEFAULT_TITLE)
        .await
        .expect("init");

    let route = trial_route(&bundle.catalog);
    let relay = Arc::clone(&bundle.relay);
    let request = RelayRequest::new(
        user.clone(),
        conversation.clone(),
        "openrouter/openai/gpt-4o-mini",
        route,
        "okay, say hello to the world",
    );
    let run = tokio::spawn(async move { relay.run(request).await });

    // Wait until the first token is buffered, then join mid-stream.
    loop {
        let buffer = bundle
            .store
            .read_buffer(&conversation)
            .await
            .expect("read buffer");
        if buffer == "Hello" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut rx = bundle
        .sessions
        .join(&ConnectionId::new("conn-1"), &user, &conversation)
        .await
        .expect("join");
    assert_eq!(
        rx.recv().await,
        Some(ClientEvent::StreamProgress("Hello".to_string()))
    );

    release.send(()).expect("release the gate");
    let outcome = run.await.expect("join task").expect("relay run");
    assert_eq!(
        outcome,
        RelayOutcome::Completed {
            content: "Hello world".to_string(),
            reasoning: None,
        }
    );

    // The fallback store has no live channel; the poller delivers the full
    // persisted answer once the streaming flag clears.
    assert_eq!(
        rx.recv().await,
        Some(ClientEvent::StreamResume("Hello world".to_string()))
    );
    assert_eq!(rx.recv().await, Some(ClientEvent::StreamEnded));

    let record = bundle
        .store
        .get_conversation(&conversation)
        .await
        .expect("get")
        .expect("record");
    assert!(!record.streaming);
    assert_eq!(record.title, "Say hello to the world");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(
        bundle.store.message_count(&user).await.expect("count"),
        1
    );
}
