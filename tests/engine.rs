use std::io::Write;

use httptest::responders;
use httptest::{Expectation, Server, matchers::*};
use regex::Regex;
use tokio::sync::mpsc;
use webfuzz::config::FuzzConfig;
use webfuzz::{Engine, FuzzEvent, RequestTemplate};

fn wordlist(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("failed to create temp wordlist");
    file.write_all(content.as_bytes())
        .expect("failed to write temp wordlist");
    file
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn base_config(files: &[&tempfile::NamedTempFile]) -> FuzzConfig {
    let mut config = FuzzConfig::default();
    config.wordlists.files = files.iter().map(|f| f.path().to_path_buf()).collect();
    config
}

fn inline_template(url: String) -> Vec<RequestTemplate> {
    vec![RequestTemplate::new(
        url,
        "GET".to_string(),
        Vec::new(),
        String::new(),
    )]
}

/// Runs the engine to completion and returns (total, errors, events).
async fn run_engine(
    mut config: FuzzConfig,
    templates: Vec<RequestTemplate>,
) -> (u64, u64, Vec<FuzzEvent>) {
    config.finalize();
    let (tx, mut rx) = mpsc::channel(1024);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let engine = Engine::new(config, client(), templates, tx);
    engine.run().await.expect("engine run failed");
    let total = engine.counter().total();
    let errors = engine.counter().errors();
    drop(engine);
    let events = collector.await.unwrap();
    (total, errors, events)
}

fn match_lines(events: &[FuzzEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            FuzzEvent::Match(line) => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn single_wordlist_fuzz_with_no_hits() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/admin"))
            .times(1)
            .respond_with(responders::status_code(404)),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/secret"))
            .times(1)
            .respond_with(responders::status_code(404)),
    );

    let words = wordlist("admin\nsecret");
    let config = base_config(&[&words]);
    let templates = inline_template(server.url("/@0@").to_string());

    let (total, errors, events) = run_engine(config, templates).await;
    assert_eq!(total, 2);
    assert_eq!(errors, 0);
    assert!(match_lines(&events).is_empty());
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, FuzzEvent::RecursionJob { .. }))
    );
}

#[tokio::test]
async fn brute_mode_multiplies_wordlists_and_extensions() {
    let server = Server::run();
    let expected_paths = [
        "/a.txt_c.txt",
        "/a.php_c.php",
        "/a.txt_d.txt",
        "/a.php_d.php",
        "/b.txt_c.txt",
        "/b.php_c.php",
        "/b.txt_d.txt",
        "/b.php_d.php",
    ];
    for path in expected_paths {
        server.expect(
            Expectation::matching(request::method_path("GET", path))
                .times(1)
                .respond_with(responders::status_code(404)),
        );
    }

    let first = wordlist("a\nb");
    let second = wordlist("c\nd");
    let mut config = base_config(&[&first, &second]);
    config.wordlists.extensions = vec![".txt".to_string(), ".php".to_string()];
    let templates = inline_template(server.url("/@0@_@1@").to_string());

    let (total, errors, _) = run_engine(config, templates).await;
    assert_eq!(total, 8);
    assert_eq!(errors, 0);
}

#[tokio::test]
async fn combo_mode_zips_wordlists() {
    let server = Server::run();
    for path in ["/a_c", "/b_d"] {
        server.expect(
            Expectation::matching(request::method_path("GET", path))
                .times(1)
                .respond_with(responders::status_code(404)),
        );
    }

    let first = wordlist("a\nb");
    let second = wordlist("c\nd");
    let mut config = base_config(&[&first, &second]);
    config.wordlists.no_brute = true;
    let templates = inline_template(server.url("/@0@_@1@").to_string());

    let (total, _, _) = run_engine(config, templates).await;
    assert_eq!(total, 2);
}

#[tokio::test]
async fn recursion_follows_redirects_to_the_depth_limit() {
    let server = Server::run();
    for path in ["/recurse/c", "/recurse/c/c", "/recurse/c/c/c"] {
        server.expect(
            Expectation::matching(request::method_path("GET", path))
                .times(1)
                .respond_with(responders::status_code(301)),
        );
    }

    let words = wordlist("c");
    let mut config = base_config(&[&words]);
    config.recursion.depth = 3;
    let templates = inline_template(server.url("/recurse/@0@").to_string());

    let (total, errors, events) = run_engine(config, templates).await;
    // the counter resets per recursion iteration
    assert_eq!(total, 1);
    assert_eq!(errors, 0);
    let recursion_jobs = events
        .iter()
        .filter(|e| matches!(e, FuzzEvent::RecursionJob { .. }))
        .count();
    assert_eq!(recursion_jobs, 2);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, FuzzEvent::DepthSkipped { .. }))
    );
    // every 301 is in the default match codes
    assert_eq!(match_lines(&events).len(), 3);
}

#[tokio::test]
async fn chained_requests_see_earlier_responses() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/csrf"))
            .times(1)
            .respond_with(responders::status_code(200).body("X-Csrf-Token: ABC123")),
    );
    server.expect(
        Expectation::matching(all_of(vec![
            Box::new(request::method_path("GET", "/login")),
            Box::new(request::headers(contains(("x-token", "ABC123")))),
        ]))
        .times(1)
        .respond_with(responders::status_code(200)),
    );

    let words = wordlist("go");
    let mut config = base_config(&[&words]);
    config.transforms.transforms =
        vec![r"regex(prevResponse(0),`X-Csrf-Token: (.*)`,1)".to_string()];
    let templates = vec![
        RequestTemplate::new(
            server.url("/csrf").to_string(),
            "GET".to_string(),
            Vec::new(),
            String::new(),
        ),
        RequestTemplate::new(
            server.url("/login").to_string(),
            "GET".to_string(),
            vec!["X-Token: @t0@".to_string()],
            String::new(),
        ),
    ];

    let (total, errors, _) = run_engine(config, templates).await;
    assert_eq!(total, 1);
    assert_eq!(errors, 0);
}

#[tokio::test]
async fn transform_pipeline_builds_the_encoded_path() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path(
            "GET",
            "/Yzp0ZXN0IQ%3D%3D%2CYzpoZWxsbw%3D%3D",
        ))
        .times(1)
        .respond_with(responders::status_code(404)),
    );

    let words = wordlist("c");
    let mut config = base_config(&[&words]);
    config.transforms.transforms =
        vec![r"urlEncode(concat(b64Encode(@0@:test!),\,,b64Encode(@0@:hello)))".to_string()];
    let templates = inline_template(server.url("/@t0@").to_string());

    let (total, _, _) = run_engine(config, templates).await;
    assert_eq!(total, 1);
}

#[tokio::test]
async fn error_filter_consumes_the_retry_budget() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/w"))
            .times(3)
            .respond_with(responders::status_code(200).body("blocked by waf")),
    );

    let words = wordlist("w");
    let mut config = base_config(&[&words]);
    config.general.retry = 2;
    config.error_filters.match_regex = Some(Regex::new("blocked by waf").unwrap());
    let templates = inline_template(server.url("/@0@").to_string());

    let (total, errors, events) = run_engine(config, templates).await;
    assert_eq!(total, 0);
    assert_eq!(errors, 1);
    assert!(match_lines(&events).is_empty());
    assert!(events.iter().any(|e| matches!(e, FuzzEvent::Error(_))));
}

#[tokio::test]
async fn requeued_trigger_behaves_like_an_error() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/w"))
            .times(2)
            .respond_with(responders::status_code(200)),
    );

    let words = wordlist("w");
    let mut config = base_config(&[&words]);
    config.general.retry = 1;
    config.trigger.bank.match_codes = vec![200];
    config.trigger.requeue = true;
    let templates = inline_template(server.url("/@0@").to_string());

    let (total, errors, _) = run_engine(config, templates).await;
    assert_eq!(total, 0);
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn filter_bank_suppresses_by_size() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/a"))
            .times(1)
            .respond_with(responders::status_code(200).body("aaaa")),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/b"))
            .times(1)
            .respond_with(responders::status_code(200).body("bb")),
    );

    let words = wordlist("a\nb");
    let mut config = base_config(&[&words]);
    config.filters.filter_sizes = vec![4];
    let templates = inline_template(server.url("/@0@").to_string());

    let (total, _, events) = run_engine(config, templates).await;
    assert_eq!(total, 2);
    let lines = match_lines(&events);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with("[b]"));
    assert!(lines[0].contains("Size:2"));
}

#[tokio::test]
async fn capture_regex_appends_to_the_capture_file() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/a"))
            .times(1)
            .respond_with(responders::status_code(200).body("token=abc123 token=def456")),
    );

    let dir = tempfile::tempdir().unwrap();
    let capture_path = dir.path().join("cap.txt");
    let words = wordlist("a");
    let mut config = base_config(&[&words]);
    config.capture.regex = Some(Regex::new(r"token=([a-z0-9]+)").unwrap());
    config.capture.group = 1;
    config.capture.file = capture_path.clone();
    let templates = inline_template(server.url("/@0@").to_string());

    let (total, _, _) = run_engine(config, templates).await;
    assert_eq!(total, 1);
    let captured = std::fs::read_to_string(&capture_path).unwrap();
    assert_eq!(captured, "abc123\ndef456\n");
}

#[tokio::test]
async fn content_length_tracks_the_substituted_body() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of(vec![
            Box::new(request::method_path("POST", "/login")),
            Box::new(request::body("user=abc")),
            Box::new(request::headers(contains(("content-length", "8")))),
        ]))
        .times(1)
        .respond_with(responders::status_code(200)),
    );

    let words = wordlist("abc");
    let config = base_config(&[&words]);
    let templates = vec![RequestTemplate::new(
        server.url("/login").to_string(),
        "POST".to_string(),
        vec!["Content-Length: 999".to_string()],
        "user=@0@".to_string(),
    )];

    let (total, errors, _) = run_engine(config, templates).await;
    assert_eq!(total, 1);
    assert_eq!(errors, 0);
}

#[tokio::test]
async fn network_failures_count_as_errors_after_retries() {
    // bind and drop to find a port with nothing listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let words = wordlist("x");
    let mut config = base_config(&[&words]);
    config.general.retry = 1;
    let templates = inline_template(format!("http://127.0.0.1:{port}/@0@"));

    let (total, errors, events) = run_engine(config, templates).await;
    assert_eq!(total, 0);
    assert_eq!(errors, 1);
    assert!(events.iter().any(|e| matches!(e, FuzzEvent::Error(_))));
}

#[tokio::test]
async fn out_of_range_markers_are_sent_verbatim() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/x/@5@"))
            .times(1)
            .respond_with(responders::status_code(404)),
    );

    let words = wordlist("x");
    let config = base_config(&[&words]);
    let templates = inline_template(server.url("/@0@/@5@").to_string());

    let (total, _, _) = run_engine(config, templates).await;
    assert_eq!(total, 1);
}
