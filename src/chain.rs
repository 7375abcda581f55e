use std::time::{Duration, Instant};

use crate::response::{self, Disposition, Response};
use crate::template::{RequestTemplate, substitute_positions, substitute_transforms};
use crate::transform::apply_transform;
use crate::{EngineShared, FuzzEvent, IterationContext};

/// Executes the whole request chain for one job tuple.
///
/// Templates are sent strictly in order; each completed response is
/// appended to the chain's response list before the next template is
/// instantiated, so transforms can reference any earlier step. A step
/// whose attempts all fail (network error, error-filter hit, or requeued
/// trigger) aborts the chain and counts it as an error; a chain whose
/// final step completes counts once as progress.
pub(crate) async fn run_chain(shared: &EngineShared, iter: &IterationContext, job: &[String]) {
    let mut previous: Vec<Response> = Vec::new();
    let attempts = shared.config.general.retry + 1;

    for template in &shared.templates {
        let mut completed = false;
        let mut last_error: Option<String> = None;

        for attempt in 1..=attempts {
            let outcome = {
                // sends pause while a trigger command holds the write half
                let _send_slot = shared.req_lock.read().await;
                send_once(shared, iter, template, job, &previous, attempt).await
            };
            match outcome {
                Ok(resp) => match response::classify(shared, iter, job, &resp).await {
                    Disposition::Accepted => {
                        previous.push(resp);
                        completed = true;
                    }
                    Disposition::Retry => {
                        last_error =
                            Some(format!("response classified as error (status {})", resp.code));
                    }
                },
                Err(err) => last_error = Some(err),
            }
            if completed {
                break;
            }
            if attempt < attempts && shared.config.request.rate > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(1.0 / shared.config.request.rate))
                    .await;
            }
        }

        if !completed {
            shared.counter.inc_error();
            if let Some(err) = last_error {
                let _ = shared.events.send(FuzzEvent::Error(err)).await;
            }
            return;
        }
    }

    shared.counter.inc();
}

/// Instantiates one template for the job and sends it once.
///
/// Substitution order: position markers, then (when transforms are
/// configured and the template references them) transform outputs, then
/// the Content-Length correction against the final body.
async fn send_once(
    shared: &EngineShared,
    iter: &IterationContext,
    template: &RequestTemplate,
    job: &[String],
    previous: &[Response],
    attempt: u32,
) -> Result<Response, String> {
    let cfg = &shared.config;
    let rp = cfg.recursion.position;
    let prefix = iter.prefix.as_str();

    let mut url = substitute_positions(&template.url, job, rp, prefix);
    let mut method = substitute_positions(&template.method, job, rp, prefix);
    let mut headers: Vec<String> = template
        .headers
        .iter()
        .map(|h| substitute_positions(h, job, rp, prefix))
        .collect();
    let mut body = substitute_positions(&template.body, job, rp, prefix);

    if !cfg.transforms.transforms.is_empty() && template.has_transform() {
        let outputs: Vec<String> = cfg
            .transforms
            .transforms
            .iter()
            .map(|expr| apply_transform(expr, &shared.registry, job, rp, prefix, previous))
            .collect();
        url = substitute_transforms(&url, &outputs);
        method = substitute_transforms(&method, &outputs);
        headers = headers
            .iter()
            .map(|h| substitute_transforms(h, &outputs))
            .collect();
        body = substitute_transforms(&body, &outputs);
    }

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|err| format!("invalid method {method:?}: {err}"))?;
    let mut request = shared.client.request(method, &url);

    let mut has_accept_encoding = false;
    for header in &headers {
        let Some((name, value)) = header.split_once(": ") else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            request = request.header(name, body.len().to_string());
        } else {
            if name.eq_ignore_ascii_case("accept-encoding") {
                has_accept_encoding = true;
            }
            request = request.header(name, value);
        }
    }
    if !has_accept_encoding {
        request = request.header("Accept-Encoding", "*");
    }
    if let Some(timeout) = scaled_timeout(cfg.request.timeout_secs, cfg.general.retry, attempt) {
        request = request.timeout(timeout);
    }
    request = request.body(body);

    let started = Instant::now();
    let result = request.send().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(resp) => {
            let code = i32::from(resp.status().as_u16());
            let resp_headers = resp
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = resp.text().await.unwrap_or_default();
            Ok(Response::new(code, body, resp_headers, elapsed_ms))
        }
        Err(err) => {
            let text = err.to_string();
            // a redirect with no Location still carries a usable status
            match Response::from_error_text(&text, elapsed_ms) {
                Some(resp) => Ok(resp),
                None => Err(text),
            }
        }
    }
}

/// Per-attempt deadline. With retries enabled the deadline grows linearly
/// with the attempt number so early attempts fail fast and later ones get
/// progressively more time. A zero base timeout disables the deadline
/// entirely.
fn scaled_timeout(base_secs: u64, retry: u32, attempt: u32) -> Option<Duration> {
    if base_secs == 0 {
        return None;
    }
    if retry == 0 {
        return Some(Duration::from_secs(base_secs));
    }
    Some(Duration::from_secs_f64(
        f64::from(attempt) * base_secs as f64 / f64::from(retry),
    ))
}
