mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cnxbook::config::RetryPolicy;
use common::{Fixture, parse_output};

const PAGE: &str = "3fb20c92-9515-420b-ab5e-6de221b89e99";
const BOOK: &str = "00000000-0000-0000-0000-000000000000";

fn exercise_json() -> String {
    serde_json::json!({
        "total_count": 1,
        "items": [{
            "uid": "1234@5",
            "nickname": "foo",
            "tags": [format!("context-cnxmod:{PAGE}"), "context-cnxfeature:bar", "lo:phys:1-1"],
            "stimulus_html": "<p>Look at the figure.</p>",
            "questions": [{
                "id": 77,
                "stem_html": "<p>Which is a vector?</p>",
                "formats": ["multiple-choice"],
                "answers": [
                    {"id": 1, "content_html": "velocity", "correctness": "1.0", "feedback_html": "Yes."},
                    {"id": 2, "content_html": "speed", "correctness": "0.0"}
                ],
                "collaborator_solutions": [{"content_html": "Direction matters.", "solution_type": "detailed"}]
            }]
        }]
    })
    .to_string()
}

/// Exercise search stub. The first `FOO` request answers 503; `MISSING` finds
/// nothing. Returns the base URL and the number of `FOO` requests served.
fn spawn_exercise_server() -> (String, Arc<AtomicUsize>, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let base_url = format!("http://{}", server.server_addr());
    let foo_requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&foo_requests);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };
            let url = request.url().to_string();
            let authorized = request
                .headers()
                .iter()
                .any(|h| h.field.equiv("Authorization") && h.value.as_str() == "Bearer secret");

            let (status, body) = if !authorized {
                (401, String::from("{}"))
            } else if url.contains("tag%3AFOO") {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    (503, String::from("busy"))
                } else {
                    (200, exercise_json())
                }
            } else if url.contains("tag%3AMISSING") {
                (200, String::from(r#"{"total_count":0,"items":[]}"#))
            } else {
                (404, String::from("not found"))
            };
            let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                .expect("build header");
            let _ = request.respond(
                tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header),
            );
        }
    });

    (base_url, foo_requests, shutdown_tx, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn embeds_exercise_with_context_and_placeholder() -> anyhow::Result<()> {
    let (base_url, foo_requests, shutdown_tx, server) = spawn_exercise_server();

    let mut fixture = Fixture::new()?;
    fixture.module(
        "m00001",
        PAGE,
        "Vectors",
        r##"<para id="bar">A feature paragraph.</para>
<para><link class="os-embed end-of-chapter" url="#ost/api/ex/FOO"/></para>
<para><link class="os-embed" url="#ost/api/ex/MISSING"/></para>"##,
    )?;
    fixture.book("physics", BOOK, "Physics", &["m00001"])?;

    let mut config = fixture.config();
    config.exercises.url_template = format!("{base_url}/api/exercises?q={{itemCode}}");
    config.exercises.token = Some("secret".to_owned());
    config.exercises.retry = RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_elapsed: Duration::from_secs(10),
    };
    let result = cnxbook::build::run(config).await;
    let _ = shutdown_tx.send(());
    let _ = server.join();
    result?;

    assert_eq!(foo_requests.load(Ordering::SeqCst), 2);

    let html = parse_output(&fixture.assembled("physics")?)?;
    let feature = format!("auto_{PAGE}_bar");
    assert!(html.element_by_id(&feature).is_some());

    let exercise = html
        .find(|el| el.data_type() == Some("injected-exercise"))
        .ok_or_else(|| anyhow::anyhow!("exercise not injected"))?;
    assert_eq!(exercise.attr("class"), Some("end-of-chapter"));
    assert_eq!(exercise.attr("data-injected-from-uid"), Some("1234@5"));
    assert_eq!(exercise.attr("data-required-context-module"), Some(PAGE));
    assert_eq!(exercise.attr("data-required-context-feature"), Some("bar"));
    assert_eq!(exercise.attr("data-required-context-ref"), Some(feature.as_str()));

    let context_link = exercise
        .find(|el| el.is("a") && el.has_class("autogenerated-content"))
        .ok_or_else(|| anyhow::anyhow!("context link missing"))?;
    assert_eq!(context_link.attr("href"), Some(format!("#{feature}").as_str()));

    let answers = exercise.find_all(|el| el.data_type() == Some("question-answer"));
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].attr("data-correctness"), Some("1.0"));
    assert!(exercise.find(|el| el.data_type() == Some("question-solution")).is_some());

    let missing = html
        .find(|el| el.data_type() == Some("missing-exercise"))
        .ok_or_else(|| anyhow::anyhow!("placeholder missing"))?;
    assert_eq!(missing.text(), "MISSING EXERCISE: tag:MISSING");
    assert!(html.find(|el| el.has_class("os-embed")).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn feature_missing_from_tagged_page_fails() -> anyhow::Result<()> {
    let (base_url, _, shutdown_tx, server) = spawn_exercise_server();

    let mut fixture = Fixture::new()?;
    fixture.module(
        "m00001",
        PAGE,
        "Vectors",
        r##"<para><link class="os-embed" url="#ost/api/ex/FOO"/></para>"##,
    )?;
    fixture.book("physics", BOOK, "Physics", &["m00001"])?;

    let mut config = fixture.config();
    config.exercises.url_template = format!("{base_url}/api/exercises?q={{itemCode}}");
    config.exercises.token = Some("secret".to_owned());
    config.exercises.retry.base_delay = Duration::from_millis(10);
    let result = cnxbook::build::run(config).await;
    let _ = shutdown_tx.send(());
    let _ = server.join();

    let err = result
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected a context failure"))?;
    assert!(
        matches!(
            cnxbook::error::find_assemble_error(&err),
            Some(cnxbook::error::AssembleError::FeatureNotOnTargetPage { .. })
        ),
        "{err:#}"
    );
    assert!(!fixture.out().join("physics.assembled.xhtml").exists());
    Ok(())
}
