use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::{EngineShared, FuzzEvent, IterationContext};

static MISSING_LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) response missing Location header").unwrap());

/// One observed HTTP response. `code == 0` together with `error` marks a
/// client-side failure; a status parsed out of a redirect diagnostic is
/// materialized as a real code so the classifier never conflates the two.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: i32,
    pub time_ms: u64,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub error: Option<String>,
    pub size: usize,
    pub words: usize,
    pub lines: usize,
}

impl Response {
    pub fn new(code: i32, body: String, headers: Vec<(String, String)>, time_ms: u64) -> Self {
        let size = body.chars().count();
        let words = body.matches(' ').count() + 1;
        let lines = body.matches('\n').count() + 1;
        Self {
            code,
            time_ms,
            body,
            headers,
            error: None,
            size,
            words,
            lines,
        }
    }

    /// Recovers a response from a client error of the "`NNN response missing
    /// Location header`" class: the status code is real even though the
    /// client refused to hand over a response.
    pub fn from_error_text(text: &str, time_ms: u64) -> Option<Self> {
        let code = MISSING_LOCATION_RE
            .captures(text)?
            .get(1)?
            .as_str()
            .parse::<i32>()
            .ok()?;
        let mut resp = Self::new(code, String::new(), Vec::new(), time_ms);
        resp.error = Some(text.to_string());
        Some(resp)
    }

    /// Serialized form handed to transform functions:
    /// status line, header lines, blank line, body.
    pub fn to_raw_string(&self) -> String {
        let mut out = format!("{}\n", self.code);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}

/// Outcome of classifying one response within a chain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The step completed; the chain may advance.
    Accepted,
    /// The response was classified as an error (or a requeued trigger) and
    /// consumes a retry slot.
    Retry,
}

/// Runs the filter banks over one response in their fixed order, emitting
/// match output and feeding the capture file and recursion frontier.
pub(crate) async fn classify(
    shared: &EngineShared,
    iter: &IterationContext,
    job: &[String],
    resp: &Response,
) -> Disposition {
    let cfg = &shared.config;

    if cfg.error_filters.passes_armed(resp) {
        return Disposition::Retry;
    }

    if cfg.trigger.bank.passes_armed(resp) {
        if let Some(cmd) = &cfg.trigger.on_trigger {
            // pause all sends for the duration of the command
            let _pause = shared.req_lock.write().await;
            run_trigger(shared, cmd, &resp.body).await;
        }
        if cfg.trigger.requeue {
            return Disposition::Retry;
        }
    }

    if cfg.filters.passes(resp) && !job.is_empty() {
        let mut display = job.to_vec();
        let p = cfg.recursion.position;
        if p < display.len() {
            display[p] = format!("{}{}", iter.prefix, job[p]);
        }
        let _ = shared
            .events
            .send(FuzzEvent::Match(format_match_line(resp, &display)))
            .await;
    }

    if let Some(re) = &cfg.capture.regex {
        let captured = capture_matches(re, cfg.capture.group, &resp.body);
        if !captured.is_empty() {
            if let Err(err) = append_capture(&cfg.capture.file, &captured).await {
                let _ = shared
                    .events
                    .send(FuzzEvent::Error(format!(
                        "could not write capture file {}: {err}",
                        cfg.capture.file.display()
                    )))
                    .await;
            }
        }
    }

    if cfg.recursion.codes.contains(&resp.code) {
        let p = cfg.recursion.position;
        if p < job.len() {
            shared.frontier.push_child(
                &iter.head,
                format!("{}{}", job[p], cfg.recursion.delimiter),
            );
        }
    }

    Disposition::Accepted
}

/// Formats a matched response into the fixed-column result line.
pub fn format_match_line(resp: &Response, display: &[String]) -> String {
    let cols = [
        format!("Size:{}", resp.size),
        format!("Words:{}", resp.words),
        format!("Lines:{}", resp.lines),
        format!("Time:{}ms", resp.time_ms),
    ];
    let mut line = format!("{} - ", resp.code);
    for mut col in cols {
        if col.len() >= 12 {
            col.push(' ');
        }
        line.push_str(&format!("{col:<12}"));
    }
    line.push_str(&format!("- [{}]", display.join(" ")));
    line
}

/// Extracts the configured capture group from every match in the body.
pub fn capture_matches(re: &Regex, group: usize, body: &str) -> Vec<String> {
    re.captures_iter(body)
        .filter_map(|caps| caps.get(group).map(|m| m.as_str().to_string()))
        .collect()
}

/// Appends captured values to the capture file, one per line.
pub async fn append_capture(path: &std::path::Path, values: &[String]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut block = String::new();
    for value in values {
        block.push_str(value);
        block.push('\n');
    }
    file.write_all(block.as_bytes()).await?;
    file.flush().await
}

/// Runs the trigger shell command with the response body exported as `RES`.
async fn run_trigger(shared: &EngineShared, cmd: &str, body: &str) {
    let result = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .env("RES", body)
        .output()
        .await;
    if let Err(err) = result {
        let _ = shared
            .events
            .send(FuzzEvent::Error(format!("trigger command failed: {err}")))
            .await;
    }
}
