use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use regex::Regex;

use crate::response::Response;
use crate::template::substitute_positions;

static FUNC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)\((.*)\)").unwrap());
static ESCAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\(.)").unwrap());

/// Evaluation context handed to every transform function.
pub struct TransformContext<'a> {
    pub args: Vec<String>,
    pub previous_responses: &'a [Response],
}

pub type TransformFn = fn(&TransformContext<'_>) -> String;

/// Named string functions available to transform expressions.
pub struct TransformRegistry {
    funcs: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            funcs: HashMap::new(),
        };
        registry.register("b64Encode", b64_encode);
        registry.register("b64Decode", b64_decode);
        registry.register("hexEncode", hex_encode);
        registry.register("hexDecode", hex_decode);
        registry.register("urlEncode", url_encode);
        registry.register("urlDecode", url_decode);
        registry.register("concat", concat);
        registry.register("randStr", rand_str);
        registry.register("randInt", rand_int);
        registry.register("randBytes", rand_bytes);
        registry.register("regex", regex_extract);
        registry.register("prevResponse", prev_response);
        registry
    }

    pub fn register(&mut self, name: &str, func: TransformFn) {
        self.funcs.insert(name.to_string(), func);
    }

    pub fn get(&self, name: &str) -> Option<TransformFn> {
        self.funcs.get(name).copied()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Evaluates one transform expression for the current job.
///
/// A bare literal is unescaped and position-substituted. A call evaluates
/// its arguments depth-first and invokes the registered function; the
/// function name itself is position-substituted before lookup, so markers
/// can select a function. Errors evaluate to the empty string.
pub fn apply_transform(
    expr: &str,
    registry: &TransformRegistry,
    tuple: &[String],
    recurse_position: usize,
    prefix: &str,
    previous: &[Response],
) -> String {
    let Some((name, raw_args)) = parse_call(expr) else {
        let literal = normalize(expr);
        return substitute_positions(&literal, tuple, recurse_position, prefix);
    };
    let args = split_args(&raw_args)
        .iter()
        .map(|arg| apply_transform(arg, registry, tuple, recurse_position, prefix, previous))
        .collect();
    let name = substitute_positions(&name, tuple, recurse_position, prefix);
    match registry.get(&name) {
        Some(func) => {
            let ctx = TransformContext {
                args,
                previous_responses: previous,
            };
            func(&ctx)
        }
        None => {
            eprintln!("Warning: unknown transform function: {name}");
            String::new()
        }
    }
}

/// Splits `name(args)` out of an expression; `None` means it is a literal.
fn parse_call(input: &str) -> Option<(String, String)> {
    let caps = FUNC_RE.captures(input)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Strips the escape backslash: `\x` becomes `x`.
fn normalize(input: &str) -> String {
    ESCAPE_RE.replace_all(input, "$1").into_owned()
}

/// Splits a call's argument list on top-level unescaped commas. Parentheses
/// nest; `\(`, `\)` and `\,` are treated as plain characters.
fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut escaped = false;
    let mut current = String::new();
    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                current.push(ch);
                escaped = true;
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    args.push(current);
    args
}

fn first_arg<'a>(ctx: &'a TransformContext<'_>) -> &'a str {
    ctx.args.first().map(String::as_str).unwrap_or("")
}

/// Optional numeric bounds with per-position defaults, normalized so the
/// lower bound never exceeds the upper one.
fn bounds(ctx: &TransformContext<'_>, default_lo: i64, default_hi: i64) -> (i64, i64) {
    let parse = |idx: usize, default: i64| {
        ctx.args
            .get(idx)
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(default)
    };
    let lo = parse(0, default_lo);
    let hi = parse(1, default_hi);
    (lo.min(hi), lo.max(hi))
}

fn b64_encode(ctx: &TransformContext<'_>) -> String {
    BASE64.encode(first_arg(ctx))
}

fn b64_decode(ctx: &TransformContext<'_>) -> String {
    let input = first_arg(ctx);
    match BASE64.decode(input) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            eprintln!("Warning: cannot decode base64 string {input}");
            String::new()
        }
    }
}

fn hex_encode(ctx: &TransformContext<'_>) -> String {
    hex::encode(first_arg(ctx))
}

fn hex_decode(ctx: &TransformContext<'_>) -> String {
    let input = first_arg(ctx);
    match hex::decode(input) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            eprintln!("Warning: cannot decode hex string {input}");
            String::new()
        }
    }
}

fn url_encode(ctx: &TransformContext<'_>) -> String {
    urlencoding::encode(first_arg(ctx)).into_owned()
}

fn url_decode(ctx: &TransformContext<'_>) -> String {
    let input = first_arg(ctx);
    match urlencoding::decode(input) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => {
            eprintln!("Warning: cannot decode url string {input}");
            String::new()
        }
    }
}

fn concat(ctx: &TransformContext<'_>) -> String {
    ctx.args.concat()
}

fn rand_str(ctx: &TransformContext<'_>) -> String {
    let (lo, hi) = bounds(ctx, 10, 65);
    let len = thread_rng().gen_range(lo..=hi).max(0) as usize;
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn rand_int(ctx: &TransformContext<'_>) -> String {
    let (lo, hi) = bounds(ctx, 0, i64::MAX - 1);
    thread_rng().gen_range(lo..=hi).to_string()
}

fn rand_bytes(ctx: &TransformContext<'_>) -> String {
    let (lo, hi) = bounds(ctx, 10, 1024);
    let len = thread_rng().gen_range(lo..=hi).max(0) as usize;
    let mut rng = thread_rng();
    (0..len).map(|_| rng.gen_range(0u8..=255) as char).collect()
}

fn regex_extract(ctx: &TransformContext<'_>) -> String {
    let input = first_arg(ctx);
    let Some(pattern) = ctx.args.get(1) else {
        eprintln!("Warning: regex transform needs an input and a pattern");
        return String::new();
    };
    // a backtick-quoted pattern is taken literally
    let pattern = pattern
        .strip_prefix('`')
        .and_then(|p| p.strip_suffix('`'))
        .unwrap_or(pattern);
    let group = ctx
        .args
        .get(2)
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0);
    match Regex::new(pattern) {
        Ok(re) => re
            .captures(input)
            .and_then(|caps| caps.get(group))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        Err(err) => {
            eprintln!("Warning: invalid regex in transform: {err}");
            String::new()
        }
    }
}

fn prev_response(ctx: &TransformContext<'_>) -> String {
    let Some(idx) = first_arg(ctx).trim().parse::<usize>().ok() else {
        eprintln!("Warning: prevResponse needs a numeric index");
        return String::new();
    };
    match ctx.previous_responses.get(idx) {
        Some(resp) => resp.to_raw_string(),
        None => {
            eprintln!("Warning: prevResponse index {idx} is out of range");
            String::new()
        }
    }
}
