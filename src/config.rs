use std::path::PathBuf;

use regex::Regex;

use crate::response::Response;

/// Match code sentinel meaning "any status code".
pub const MATCH_ANY_CODE: i32 = -1;

pub const DEFAULT_MATCH_CODES: &[i32] = &[
    200, 204, 301, 302, 303, 307, 308, 400, 401, 403, 405, 500,
];

pub const DEFAULT_RECURSE_CODES: &[i32] = &[301, 302, 303, 307, 308];

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub url: String,
    pub data: String,
    pub method: String,
    pub headers: Vec<String>,
    pub remove_headers: Vec<String>,
    pub req_files: Vec<PathBuf>,
    pub proxy: Option<String>,
    /// Base request timeout in seconds. 0 disables the per-request deadline.
    pub timeout_secs: u64,
    /// Requests per second; 0 disables pacing.
    pub rate: f64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1/".to_string(),
            data: String::new(),
            method: "GET".to_string(),
            headers: Vec::new(),
            remove_headers: Vec::new(),
            req_files: Vec::new(),
            proxy: None,
            timeout_secs: 15,
            rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneralOptions {
    pub threads: usize,
    pub retry: u32,
    pub dos: bool,
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            threads: 10,
            retry: 3,
            dos: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecursionOptions {
    /// Maximum prefix length to fuzz; 0 is unlimited, 1 disables recursion.
    pub depth: usize,
    /// The wordlist position the frontier prefix applies to.
    pub position: usize,
    /// Appended to the matched segment before it joins the frontier.
    pub delimiter: String,
    pub codes: Vec<i32>,
}

impl Default for RecursionOptions {
    fn default() -> Self {
        Self {
            depth: 1,
            position: 0,
            delimiter: "/".to_string(),
            codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WordlistOptions {
    pub no_brute: bool,
    pub extensions: Vec<String>,
    pub files: Vec<PathBuf>,
}

/// One bank of response predicates: match axes select responses, filter axes
/// exclude them. An empty list or zero threshold leaves that axis
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct FilterBank {
    pub match_codes: Vec<i32>,
    pub match_sizes: Vec<usize>,
    pub match_words: Vec<usize>,
    pub match_lines: Vec<usize>,
    pub match_time_ms: u64,
    pub match_regex: Option<Regex>,
    pub filter_codes: Vec<i32>,
    pub filter_sizes: Vec<usize>,
    pub filter_words: Vec<usize>,
    pub filter_lines: Vec<usize>,
    pub filter_time_ms: u64,
    pub filter_regex: Option<Regex>,
}

impl FilterBank {
    fn passed_code(&self, resp: &Response) -> bool {
        self.match_codes.contains(&MATCH_ANY_CODE) || self.match_codes.contains(&resp.code)
    }

    /// Like `passed_code`, but an empty code list matches anything. Used by
    /// the armed banks, which have no default code list.
    fn passed_code_or_empty(&self, resp: &Response) -> bool {
        self.match_codes.is_empty() || self.passed_code(resp)
    }

    fn passed_time(&self, resp: &Response) -> bool {
        if self.filter_time_ms != 0 {
            resp.time_ms < self.filter_time_ms
        } else if self.match_time_ms != 0 {
            resp.time_ms >= self.match_time_ms
        } else {
            true
        }
    }

    fn passed_length_match(&self, resp: &Response) -> bool {
        let axes = [
            (&self.match_sizes, resp.size),
            (&self.match_words, resp.words),
            (&self.match_lines, resp.lines),
        ];
        axes.iter()
            .all(|(list, value)| list.is_empty() || list.contains(value))
    }

    fn passed_length_filter(&self, resp: &Response) -> bool {
        let axes = [
            (&self.filter_sizes, resp.size),
            (&self.filter_words, resp.words),
            (&self.filter_lines, resp.lines),
        ];
        axes.iter().all(|(list, value)| !list.contains(value))
    }

    fn passed_regex(&self, resp: &Response) -> bool {
        self.match_regex
            .as_ref()
            .is_none_or(|re| re.is_match(&resp.body))
            && self
                .filter_regex
                .as_ref()
                .is_none_or(|re| !re.is_match(&resp.body))
    }

    /// Main-bank predicate: the response is selected for output.
    pub fn passes(&self, resp: &Response) -> bool {
        self.passed_code(resp)
            && self.passed_length_match(resp)
            && self.passed_length_filter(resp)
            && self.passed_time(resp)
            && self.passed_regex(resp)
    }

    /// True when the user constrained at least one axis.
    pub fn is_armed(&self) -> bool {
        !self.match_codes.is_empty()
            || !self.match_sizes.is_empty()
            || !self.match_words.is_empty()
            || !self.match_lines.is_empty()
            || self.match_time_ms != 0
            || self.match_regex.is_some()
            || !self.filter_codes.is_empty()
            || !self.filter_sizes.is_empty()
            || !self.filter_words.is_empty()
            || !self.filter_lines.is_empty()
            || self.filter_time_ms != 0
            || self.filter_regex.is_some()
    }

    /// Error/trigger-bank predicate. An unconfigured bank never fires, and
    /// an empty code list on a configured bank matches any code.
    pub fn passes_armed(&self, resp: &Response) -> bool {
        self.is_armed()
            && self.passed_code_or_empty(resp)
            && self.passed_length_match(resp)
            && self.passed_length_filter(resp)
            && self.passed_time(resp)
            && self.passed_regex(resp)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub bank: FilterBank,
    /// Shell command executed when the bank fires; the response body is
    /// exported as `RES`.
    pub on_trigger: Option<String>,
    /// Treat a fired trigger as a retryable failure.
    pub requeue: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub regex: Option<Regex>,
    pub group: usize,
    pub file: PathBuf,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            regex: None,
            group: 0,
            file: PathBuf::from("cap.txt"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub transforms: Vec<String>,
}

/// Complete engine configuration. Construct, adjust, then call `finalize`
/// before handing it to the engine.
#[derive(Debug, Clone, Default)]
pub struct FuzzConfig {
    pub request: RequestOptions,
    pub general: GeneralOptions,
    pub recursion: RecursionOptions,
    pub wordlists: WordlistOptions,
    pub filters: FilterBank,
    pub error_filters: FilterBank,
    pub trigger: TriggerOptions,
    pub capture: CaptureOptions,
    pub transforms: TransformOptions,
}

impl FuzzConfig {
    /// Applies defaults and derived settings:
    /// default match/recurse codes and remove-headers, filter codes
    /// subtracted from match codes, the guaranteed empty extension, and
    /// forced DoS mode when no wordlists were supplied.
    pub fn finalize(&mut self) {
        if self.filters.match_codes.is_empty() {
            self.filters.match_codes = DEFAULT_MATCH_CODES.to_vec();
        }
        if self.recursion.codes.is_empty() {
            self.recursion.codes = DEFAULT_RECURSE_CODES.to_vec();
        }
        if self.request.remove_headers.is_empty() {
            self.request.remove_headers = vec![
                "Connection".to_string(),
                "Accept-Encoding".to_string(),
            ];
        }
        let filtered = &self.filters.filter_codes;
        self.filters.match_codes.retain(|c| !filtered.contains(c));
        if self.wordlists.extensions.is_empty() {
            self.wordlists.extensions.push(String::new());
        }
        if self.wordlists.files.is_empty() {
            self.general.dos = true;
        }
    }
}
