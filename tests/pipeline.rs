mod common;

use std::time::Duration;

use mailpress::application::render::{
    DOCUMENT_CSP, ProcessorSettings, RenderErrorKind, RenderOutcome,
};

use common::{FakeBehavior, Pipeline, payload, pool_config};

fn failure_kind(outcome: &RenderOutcome) -> Option<(RenderErrorKind, bool)> {
    outcome
        .failure()
        .map(|failure| (failure.kind, failure.retryable))
}

#[tokio::test]
async fn first_delivery_creates_and_redelivery_is_skipped() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(2, 50));
    let message = payload("m1");

    let first = pipeline.processor.process(&message).await;
    let RenderOutcome::Created {
        document_id,
        size_bytes,
    } = first
    else {
        panic!("expected a created document, got {first:?}");
    };
    assert_eq!(size_bytes, 1024);

    let second = pipeline.processor.process(&message).await;
    match second {
        RenderOutcome::SkippedDuplicate { document_id: id } => assert_eq!(id, document_id),
        other => panic!("expected skipped duplicate, got {other:?}"),
    }

    assert_eq!(pipeline.documents.len(), 1);
    assert_eq!(pipeline.engine.counters().renders(), 1);

    let stored = pipeline
        .documents
        .get("tenant-a", "m1")
        .expect("document stored");
    assert_eq!(stored.title, "Quarterly report");
    assert!(stored.pdf.starts_with(b"%PDF"));
}

#[tokio::test]
async fn identical_html_under_two_message_ids_yields_two_documents() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(2, 50));
    let first_message = payload("m1");
    let second_message = payload("m2");
    assert_eq!(first_message.html_body, second_message.html_body);

    let mut created = Vec::new();
    for message in [&first_message, &second_message] {
        match pipeline.processor.process(message).await {
            RenderOutcome::Created { document_id, .. } => created.push(document_id),
            other => panic!("expected a created document, got {other:?}"),
        }
    }
    assert_ne!(created[0], created[1]);
    assert_eq!(pipeline.documents.len(), 2);
    assert_eq!(pipeline.engine.counters().renders(), 2);

    for (message, expected) in [(&first_message, created[0]), (&second_message, created[1])] {
        match pipeline.processor.process(message).await {
            RenderOutcome::SkippedDuplicate { document_id } => assert_eq!(document_id, expected),
            other => panic!("expected skipped duplicate, got {other:?}"),
        }
    }
    assert_eq!(pipeline.documents.len(), 2);
    assert_eq!(pipeline.engine.counters().renders(), 2);

    let first = pipeline.documents.get("tenant-a", "m1").expect("m1 stored");
    let second = pipeline.documents.get("tenant-a", "m2").expect("m2 stored");
    assert_eq!(first.stored.id, created[0]);
    assert_eq!(second.stored.id, created[1]);
    assert_ne!(first.stored.stored_path, second.stored.stored_path);
}

#[tokio::test]
async fn missing_body_never_leases_a_context() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(2, 50));
    let mut message = payload("empty");
    message.html_body = Some("   ".into());
    message.text_body = None;

    let outcome = pipeline.processor.process(&message).await;

    assert_eq!(
        failure_kind(&outcome),
        Some((RenderErrorKind::BodyMissing, false))
    );
    assert_eq!(pipeline.engine.counters().launched(), 0);
    assert_eq!(pipeline.pool.stats().contexts_acquired, 0);
    assert!(pipeline.documents.is_empty());
}

#[tokio::test]
async fn oversized_output_is_never_persisted() {
    let behavior = FakeBehavior {
        output_size: 4096,
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::with_settings(
        behavior,
        pool_config(1, 50),
        ProcessorSettings {
            max_output_bytes: 2048,
        },
    );

    let outcome = pipeline.processor.process(&payload("big")).await;

    assert_eq!(
        failure_kind(&outcome),
        Some((RenderErrorKind::OutputTooLarge, false))
    );
    assert!(pipeline.documents.is_empty());

    let stats = pipeline.pool.stats();
    assert_eq!(stats.contexts_acquired, stats.contexts_released);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn sanitized_document_reaches_the_renderer() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let mut message = payload("scripted");
    message.html_body = Some(
        r#"<p onclick="steal()">Invoice</p><script>alert(1)</script><img src="https://tracker.example/pixel.gif">"#
            .into(),
    );

    let outcome = pipeline.processor.process(&message).await;
    assert!(matches!(outcome, RenderOutcome::Created { .. }));

    let pages = pipeline.engine.pages();
    let page = pages.last().expect("renderer received a page");
    assert!(page.contains("Invoice"));
    assert!(page.contains(DOCUMENT_CSP));
    assert!(page.contains("alice@example.com"));
    assert!(!page.contains("<script"));
    assert!(!page.contains("onclick"));
}

#[tokio::test]
async fn plain_text_body_is_rendered_preformatted() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let mut message = payload("plain");
    message.html_body = None;
    message.text_body = Some("totals: a < b\nthanks".into());

    let outcome = pipeline.processor.process(&message).await;
    assert!(matches!(outcome, RenderOutcome::Created { .. }));

    let pages = pipeline.engine.pages();
    let page = pages.last().expect("renderer received a page");
    assert!(page.contains(r#"<pre class="mp-plain">"#));
    assert!(page.contains("a &lt; b"));
}

#[tokio::test]
async fn slow_render_times_out_and_discards_the_instance() {
    let behavior = FakeBehavior {
        render_delay: Duration::from_millis(600),
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(1, 50));

    let outcome = pipeline.processor.process(&payload("slow")).await;

    assert_eq!(
        failure_kind(&outcome),
        Some((RenderErrorKind::RenderTimeout, true))
    );
    assert!(pipeline.documents.is_empty());

    let counters = pipeline.engine.counters();
    assert_eq!(counters.contexts_opened(), counters.contexts_closed());
    assert_eq!(counters.active_contexts(), 0);

    let stats = pipeline.pool.stats();
    assert_eq!(stats.recycled, 1);
    assert_eq!(stats.in_use, 0);
    assert!(stats.total <= 1);
}

#[tokio::test]
async fn renderer_panic_is_a_crash_and_the_context_is_released() {
    let behavior = FakeBehavior {
        panic: true,
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(1, 50));

    let outcome = pipeline.processor.process(&payload("panics")).await;
    assert_eq!(
        failure_kind(&outcome),
        Some((RenderErrorKind::RendererCrash, true))
    );

    let stats = pipeline.pool.stats();
    assert_eq!(stats.contexts_acquired, 1);
    assert_eq!(stats.contexts_released, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(pipeline.engine.counters().active_contexts(), 0);

    pipeline.engine.set_behavior(FakeBehavior::default());
    let retried = pipeline.processor.process(&payload("panics")).await;
    assert!(matches!(retried, RenderOutcome::Created { .. }));
}

#[tokio::test]
async fn renderer_crash_is_retryable() {
    let behavior = FakeBehavior {
        crash: true,
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(1, 50));

    let outcome = pipeline.processor.process(&payload("crash")).await;

    assert_eq!(
        failure_kind(&outcome),
        Some((RenderErrorKind::RendererCrash, true))
    );
    assert_eq!(pipeline.pool.stats().recycled, 1);
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_store_one_document() {
    let behavior = FakeBehavior {
        render_delay: Duration::from_millis(50),
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(2, 50));
    let message = payload("race");

    let (left, right) = tokio::join!(
        pipeline.processor.process(&message),
        pipeline.processor.process(&message)
    );

    let created = [&left, &right]
        .iter()
        .filter(|outcome| matches!(outcome, RenderOutcome::Created { .. }))
        .count();
    let skipped = [&left, &right]
        .iter()
        .filter(|outcome| matches!(outcome, RenderOutcome::SkippedDuplicate { .. }))
        .count();

    assert_eq!(created, 1, "left={left:?} right={right:?}");
    assert_eq!(skipped, 1, "left={left:?} right={right:?}");
    assert_eq!(pipeline.documents.len(), 1);
}
