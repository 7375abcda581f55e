use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;

static POSITION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(\d+)@").unwrap());
static TRANSFORM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@t(\d+)@").unwrap());
static METHOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").unwrap());
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+\s(\S+)").unwrap());
static BODY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)(?:\r\n\r\n|\n\n)(.*)").unwrap());
static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w-]+:\s.*").unwrap());
static NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n]").unwrap());

/// One request to instantiate per job. All fields are captured verbatim at
/// construction and substituted per request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub body: String,
    has_transform: bool,
}

impl RequestTemplate {
    pub fn new(url: String, method: String, headers: Vec<String>, body: String) -> Self {
        let has_transform = [&url, &method, &body]
            .into_iter()
            .chain(headers.iter())
            .any(|field| TRANSFORM_RE.is_match(field));
        Self {
            url,
            method,
            headers,
            body,
            has_transform,
        }
    }

    /// Whether any field references a transform output marker (`@tN@`).
    pub fn has_transform(&self) -> bool {
        self.has_transform
    }

    /// Parses a saved raw request (the format exported by proxy tools):
    /// request line, headers, blank line, optional body. The path from the
    /// request line is appended to `base_url`. Headers whose name starts
    /// with an entry of `remove_headers` are dropped.
    pub fn from_request_file(
        content: &str,
        base_url: &str,
        remove_headers: &[String],
    ) -> Result<Self> {
        let content = strip_trailing_newline(content);
        let method = METHOD_RE
            .find(content)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let Some(path) = PATH_RE.captures(content).and_then(|c| c.get(1)) else {
            bail!("could not parse a request path from the request file");
        };
        let url = format!("{}{}", base_url.trim_end_matches('/'), path.as_str());

        let body = BODY_RE
            .captures(content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        // header section = everything above the blank line
        let head_section = BODY_RE.replace(content, "");
        let headers = HEADER_RE
            .find_iter(&head_section)
            .map(|m| NEWLINE_RE.replace_all(m.as_str(), "").into_owned())
            .filter(|h| {
                let name = h.split(':').next().unwrap_or("");
                !remove_headers
                    .iter()
                    .any(|r| name.to_ascii_lowercase().starts_with(&r.to_ascii_lowercase()))
            })
            .collect();

        Ok(Self::new(url, method, headers, body))
    }
}

/// Replaces every `@N@` marker with the N-th element of the job tuple. The
/// recursion position additionally receives the current frontier prefix.
/// Markers indexing past the tuple are preserved verbatim.
pub fn substitute_positions(
    input: &str,
    tuple: &[String],
    recurse_position: usize,
    prefix: &str,
) -> String {
    POSITION_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match caps[1].parse::<usize>() {
                Ok(idx) if idx < tuple.len() => {
                    if idx == recurse_position {
                        format!("{}{}", prefix, tuple[idx])
                    } else {
                        tuple[idx].clone()
                    }
                }
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Replaces every `@tN@` marker with the N-th transform output. Markers
/// indexing past the output list are preserved verbatim.
pub fn substitute_transforms(input: &str, outputs: &[String]) -> String {
    TRANSFORM_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match caps[1].parse::<usize>() {
                Ok(idx) if idx < outputs.len() => outputs[idx].clone(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Trims the single trailing CRLF some editors append when saving a request
/// file. A double CRLF is a legitimate header/body separator and is kept.
pub fn strip_trailing_newline(content: &str) -> &str {
    if content.ends_with("\r\n") && !content.ends_with("\r\n\r\n") {
        &content[..content.len() - 2]
    } else {
        content
    }
}
