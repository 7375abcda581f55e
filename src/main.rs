use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::Client;
use tokio::sync::mpsc;

use webfuzz::config::{
    CaptureOptions, FilterBank, FuzzConfig, GeneralOptions, RecursionOptions, RequestOptions,
    TransformOptions, TriggerOptions, WordlistOptions,
};
use webfuzz::{Engine, FuzzEvent, RequestTemplate, count_jobs};

fn parse_code(s: &str) -> Result<i32, String> {
    if s == "all" {
        return Ok(-1);
    }
    s.parse::<i32>()
        .map_err(|e| format!("invalid status code '{s}': {e}"))
}

fn wordlist_path_parser(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.exists() {
        Ok(path)
    } else {
        Err(format!("wordlist file not found: {s}"))
    }
}

fn parse_threads(s: &str) -> Result<usize, String> {
    let threads = s
        .parse::<usize>()
        .map_err(|e| format!("invalid thread count: {e}"))?;
    if threads == 0 {
        Err("thread count must be at least 1".to_string())
    } else {
        Ok(threads)
    }
}

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "A concurrent HTTP fuzzer with request chaining, recursion and wordlist transforms",
    help_template = "{about}\n\n{usage}\n{all-args}"
)]
struct Cli {
    /// The URL of the website to fuzz. Use @0@, @1@, ... as wordlist
    /// position markers and @t0@, @t1@, ... for transform outputs.
    #[arg(short, long, default_value = "http://127.0.0.1/", help_heading = "Request")]
    url: String,

    /// The data to send in the request body.
    #[arg(short, long, default_value = "", help_heading = "Request")]
    data: String,

    /// A request template file (usually saved from an intercepting proxy).
    /// When supplied multiple times, the requests are sent in sequence per
    /// job and later requests may reference earlier responses.
    #[arg(short = 'f', long = "req-file", value_name = "FILE", help_heading = "Request")]
    req_files: Vec<PathBuf>,

    /// The HTTP method to use.
    #[arg(long, default_value = "GET", help_heading = "Request")]
    method: String,

    /// A header to send, one per flag: -H 'Name: value'.
    #[arg(short = 'H', long = "header", value_name = "HEADER", help_heading = "Request")]
    headers: Vec<String>,

    /// A header name prefix to strip from parsed request files, one per
    /// flag. Defaults to Connection and Accept-Encoding.
    #[arg(long = "rh", value_name = "NAME", help_heading = "Request")]
    remove_headers: Vec<String>,

    /// The timeout for each request in seconds. 0 disables the deadline.
    #[arg(long = "to", default_value = "15", help_heading = "Request")]
    timeout: u64,

    /// The proxy to send requests through, e.g. http://127.0.0.1:8080.
    #[arg(long, help_heading = "Request")]
    proxy: Option<String>,

    /// The request rate limit in requests per second.
    #[arg(long, default_value = "0", help_heading = "Request")]
    rate: f64,

    /// The number of concurrent workers.
    #[arg(short, long, default_value = "10", value_parser = parse_threads, help_heading = "General")]
    threads: usize,

    /// How many times to retry a failed request before giving up.
    #[arg(long, default_value = "3", help_heading = "General")]
    retry: u32,

    /// Repeat the wordlists indefinitely (stress testing). Implied when no
    /// wordlist is supplied.
    #[arg(long, help_heading = "General")]
    dos: bool,

    /// The recursion depth. 0 is unlimited, 1 disables recursion.
    #[arg(long = "rd", default_value = "1", help_heading = "Recursion")]
    depth: usize,

    /// The wordlist position to recurse on.
    #[arg(long = "rp", default_value = "0", help_heading = "Recursion")]
    recurse_position: usize,

    /// The delimiter appended to a matched segment when recursing.
    #[arg(long = "rdl", default_value = "/", help_heading = "Recursion")]
    recurse_delimiter: String,

    /// The response codes that mark a directory worth recursing into.
    #[arg(long = "rc", value_delimiter = ',', value_parser = parse_code, help_heading = "Recursion")]
    recurse_codes: Vec<i32>,

    /// Read the wordlists line by line in lockstep instead of taking their
    /// cartesian product.
    #[arg(long, help_heading = "Wordlist")]
    no_brute: bool,

    /// File extensions to fuzz with, comma separated: -e .txt,.php
    #[arg(short, long, value_delimiter = ',', help_heading = "Wordlist")]
    extensions: Vec<String>,

    /// The response codes to match. Use -1 or 'all' for any code.
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Filter")]
    mc: Vec<i32>,
    /// Match responses by size.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    ms: Vec<usize>,
    /// Match responses by word count.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    mw: Vec<usize>,
    /// Match responses by line count.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    ml: Vec<usize>,
    /// Match responses that took at least this many milliseconds.
    #[arg(long, default_value = "0", help_heading = "Filter")]
    mt: u64,
    /// Match responses whose body matches this regular expression.
    #[arg(long, help_heading = "Filter")]
    mr: Option<String>,
    /// The response codes to filter out.
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Filter")]
    fc: Vec<i32>,
    /// Filter responses by size.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    fs: Vec<usize>,
    /// Filter responses by word count.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    fw: Vec<usize>,
    /// Filter responses by line count.
    #[arg(long, value_delimiter = ',', help_heading = "Filter")]
    fl: Vec<usize>,
    /// Filter responses that took at least this many milliseconds.
    #[arg(long, default_value = "0", help_heading = "Filter")]
    ft: u64,
    /// Filter responses whose body matches this regular expression.
    #[arg(long, help_heading = "Filter")]
    fr: Option<String>,

    /// Error-filter: response codes that mark a soft failure worth retrying.
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Error filter")]
    emc: Vec<i32>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    ems: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    emw: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    eml: Vec<usize>,
    #[arg(long, default_value = "0", help_heading = "Error filter")]
    emt: u64,
    #[arg(long, help_heading = "Error filter")]
    emr: Option<String>,
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Error filter")]
    efc: Vec<i32>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    efs: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    efw: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Error filter")]
    efl: Vec<usize>,
    #[arg(long, default_value = "0", help_heading = "Error filter")]
    eft: u64,
    #[arg(long, help_heading = "Error filter")]
    efr: Option<String>,

    /// Trigger-filter: responses that fire the trigger command.
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Trigger filter")]
    tmc: Vec<i32>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tms: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tmw: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tml: Vec<usize>,
    #[arg(long, default_value = "0", help_heading = "Trigger filter")]
    tmt: u64,
    #[arg(long, help_heading = "Trigger filter")]
    tmr: Option<String>,
    #[arg(long, value_delimiter = ',', value_parser = parse_code, help_heading = "Trigger filter")]
    tfc: Vec<i32>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tfs: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tfw: Vec<usize>,
    #[arg(long, value_delimiter = ',', help_heading = "Trigger filter")]
    tfl: Vec<usize>,
    #[arg(long, default_value = "0", help_heading = "Trigger filter")]
    tft: u64,
    #[arg(long, help_heading = "Trigger filter")]
    tfr: Option<String>,
    /// A shell command executed when the trigger filter fires. The response
    /// body is exported in the RES environment variable.
    #[arg(long = "on-trigger", value_name = "CMD", help_heading = "Trigger filter")]
    on_trigger: Option<String>,
    /// Re-send a request that fired the trigger, up to the retry limit.
    #[arg(long, help_heading = "Trigger filter")]
    trigger_requeue: bool,

    /// A regular expression used to capture data from response bodies.
    #[arg(long, help_heading = "Capture")]
    capture: Option<String>,
    /// The capture group to save; 0 is the whole match.
    #[arg(long, default_value = "0", help_heading = "Capture")]
    capture_group: usize,
    /// The file captured data is appended to.
    #[arg(long, default_value = "cap.txt", help_heading = "Capture")]
    capture_file: PathBuf,

    /// A transform expression applied per job; reference the result with
    /// @t0@, @t1@, ... One per flag.
    #[arg(long = "transform", value_name = "EXPR", help_heading = "Transform")]
    transforms: Vec<String>,

    /// The wordlists, one per fuzzing position.
    #[arg(value_name = "WORDLIST", value_parser = wordlist_path_parser)]
    wordlists: Vec<PathBuf>,
}

fn compile(pattern: &Option<String>, what: &str) -> Result<Option<Regex>> {
    pattern
        .as_ref()
        .map(|p| Regex::new(p).with_context(|| format!("invalid {what} regex: {p}")))
        .transpose()
}

fn build_config(cli: &Cli) -> Result<FuzzConfig> {
    let mut config = FuzzConfig {
        request: RequestOptions {
            url: cli.url.clone(),
            data: cli.data.clone(),
            method: cli.method.clone(),
            headers: cli.headers.clone(),
            remove_headers: cli.remove_headers.clone(),
            req_files: cli.req_files.clone(),
            proxy: cli.proxy.clone(),
            timeout_secs: cli.timeout,
            rate: cli.rate,
        },
        general: GeneralOptions {
            threads: cli.threads,
            retry: cli.retry,
            dos: cli.dos,
        },
        recursion: RecursionOptions {
            depth: cli.depth,
            position: cli.recurse_position,
            delimiter: cli.recurse_delimiter.clone(),
            codes: cli.recurse_codes.clone(),
        },
        wordlists: WordlistOptions {
            no_brute: cli.no_brute,
            extensions: cli.extensions.clone(),
            files: cli.wordlists.clone(),
        },
        filters: FilterBank {
            match_codes: cli.mc.clone(),
            match_sizes: cli.ms.clone(),
            match_words: cli.mw.clone(),
            match_lines: cli.ml.clone(),
            match_time_ms: cli.mt,
            match_regex: compile(&cli.mr, "match")?,
            filter_codes: cli.fc.clone(),
            filter_sizes: cli.fs.clone(),
            filter_words: cli.fw.clone(),
            filter_lines: cli.fl.clone(),
            filter_time_ms: cli.ft,
            filter_regex: compile(&cli.fr, "filter")?,
        },
        error_filters: FilterBank {
            match_codes: cli.emc.clone(),
            match_sizes: cli.ems.clone(),
            match_words: cli.emw.clone(),
            match_lines: cli.eml.clone(),
            match_time_ms: cli.emt,
            match_regex: compile(&cli.emr, "error match")?,
            filter_codes: cli.efc.clone(),
            filter_sizes: cli.efs.clone(),
            filter_words: cli.efw.clone(),
            filter_lines: cli.efl.clone(),
            filter_time_ms: cli.eft,
            filter_regex: compile(&cli.efr, "error filter")?,
        },
        trigger: TriggerOptions {
            bank: FilterBank {
                match_codes: cli.tmc.clone(),
                match_sizes: cli.tms.clone(),
                match_words: cli.tmw.clone(),
                match_lines: cli.tml.clone(),
                match_time_ms: cli.tmt,
                match_regex: compile(&cli.tmr, "trigger match")?,
                filter_codes: cli.tfc.clone(),
                filter_sizes: cli.tfs.clone(),
                filter_words: cli.tfw.clone(),
                filter_lines: cli.tfl.clone(),
                filter_time_ms: cli.tft,
                filter_regex: compile(&cli.tfr, "trigger filter")?,
            },
            on_trigger: cli.on_trigger.clone(),
            requeue: cli.trigger_requeue,
        },
        capture: CaptureOptions {
            regex: compile(&cli.capture, "capture")?,
            group: cli.capture_group,
            file: cli.capture_file.clone(),
        },
        transforms: TransformOptions {
            transforms: cli.transforms.clone(),
        },
    };
    config.finalize();
    Ok(config)
}

/// Builds the request templates: one per request file, or a single inline
/// template from the URL flags.
fn load_templates(config: &FuzzConfig) -> Result<Vec<RequestTemplate>> {
    let request = &config.request;
    if request.req_files.is_empty() {
        return Ok(vec![RequestTemplate::new(
            request.url.clone(),
            request.method.clone(),
            request.headers.clone(),
            request.data.clone(),
        )]);
    }
    let mut templates = Vec::with_capacity(request.req_files.len());
    for path in &request.req_files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not open request file {}", path.display()))?;
        let template =
            RequestTemplate::from_request_file(&content, &request.url, &request.remove_headers)
                .with_context(|| format!("could not parse request file {}", path.display()))?;
        templates.push(template);
    }
    Ok(templates)
}

fn build_client(config: &FuzzConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(500);
    if let Some(proxy) = &config.request.proxy {
        url::Url::parse(proxy).with_context(|| format!("invalid proxy url: {proxy}"))?;
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }
    Ok(builder.build()?)
}

/// Renders engine events: matched lines above the bar, progress on it.
fn spawn_printer(
    mut rx: mpsc::Receiver<FuzzEvent>,
    total_jobs: Option<u64>,
) -> tokio::task::JoinHandle<()> {
    let bar = match total_jobs {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {pos} {msg}")
                    .unwrap(),
            );
            bar
        }
    };
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                FuzzEvent::Match(line) => bar.suspend(|| println!("{line}")),
                FuzzEvent::Error(line) => bar.suspend(|| eprintln!("Error: {line}")),
                FuzzEvent::RecursionJob { prefix } => {
                    bar.suspend(|| println!("Starting recursion job on: {prefix}"));
                    bar.set_position(0);
                }
                FuzzEvent::DepthSkipped { prefix } => {
                    bar.suspend(|| {
                        println!("Skipping recursion job due to depth exceeded on: {prefix}")
                    });
                }
                FuzzEvent::Progress { done, errors, rate } => {
                    bar.set_position(done);
                    bar.set_message(format!("{rate}/s - Errors: {errors}"));
                }
                FuzzEvent::Finished => bar.finish_and_clear(),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    println!("webfuzz v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&cli)?;
    let templates = load_templates(&config)?;

    if config.capture.regex.is_some() && config.capture.group > 0 {
        let groups = config.capture.regex.as_ref().map(|re| re.captures_len());
        if let Some(groups) = groups {
            if config.capture.group >= groups {
                bail!(
                    "capture group {} does not exist in the capture regex",
                    config.capture.group
                );
            }
        }
    }

    let total_jobs = if config.general.dos {
        None
    } else {
        Some(
            count_jobs(
                &config.wordlists.files,
                config.wordlists.no_brute,
                &config.wordlists.extensions,
            )
            .await?,
        )
    };

    println!(":: URL      : {}", config.request.url);
    println!(":: Method   : {}", config.request.method);
    println!(":: Threads  : {}", config.general.threads);
    println!(
        ":: Wordlists: {}",
        config
            .wordlists
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if let Some(total) = total_jobs {
        println!(":: Requests : {total}");
    } else {
        println!(":: Requests : unbounded (dos)");
    }
    println!();

    let client = build_client(&config)?;
    let (events_tx, events_rx) = mpsc::channel(1024);
    let printer = spawn_printer(events_rx, total_jobs);

    let engine = Engine::new(config, client, templates, events_tx);
    let run_result = engine.run().await;

    let done = engine.counter().total();
    let errors = engine.counter().errors();
    drop(engine);
    printer.await?;
    run_result?;

    match total_jobs {
        Some(total) => println!("Progress: {done}/{total} - Errors: {errors}"),
        None => println!("Progress: {done} - Errors: {errors}"),
    }
    Ok(())
}
