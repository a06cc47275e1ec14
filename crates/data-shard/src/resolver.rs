//! Shard reference resolution
//!
//! Turns an explicit URL list, a brace pattern (`shard-{000..099}.tar`) or a
//! JSON manifest document into an ordered [`Manifest`].

use serde_json::Value;
use shard_core::{scheme_of, Error, Manifest, Result, ShardLocator};

/// The ways a caller can name a dataset's shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSpec {
    /// Explicit shard URLs, each of which may itself be a brace pattern
    List(Vec<String>),

    /// One brace pattern
    Pattern(String),

    /// Inline JSON manifest text
    ManifestJson(String),

    /// Location of a JSON manifest (path or URL), fetched once
    ManifestAt(String),
}

impl ShardSpec {
    /// Guess the spec kind from a single string.
    ///
    /// JSON text (leading `{` or `[` after trimming) is an inline manifest,
    /// a `.json` suffix is a manifest location, anything else is a pattern.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim_start();
        if trimmed.starts_with('[') || (trimmed.starts_with('{') && trimmed.contains(':')) {
            ShardSpec::ManifestJson(input.to_string())
        } else if input.ends_with(".json") {
            ShardSpec::ManifestAt(input.to_string())
        } else {
            ShardSpec::Pattern(input.to_string())
        }
    }
}

/// Resolve a spec, reading `ManifestAt` locations from the local filesystem
pub fn resolve(spec: &ShardSpec) -> Result<Manifest> {
    resolve_with(spec, |location| {
        std::fs::read_to_string(location).map_err(|e| Error::open(location, e))
    })
}

/// Resolve a spec with a caller-supplied fetcher for manifest documents
pub fn resolve_with<F>(spec: &ShardSpec, fetch: F) -> Result<Manifest>
where
    F: FnOnce(&str) -> Result<String>,
{
    let manifest = match spec {
        ShardSpec::List(urls) => {
            let mut shards = Vec::new();
            for url in urls {
                shards.extend(expand_braces(url)?.into_iter().map(ShardLocator::new));
            }
            Manifest::new(shards)
        }
        ShardSpec::Pattern(pattern) => Manifest::new(
            expand_braces(pattern)?
                .into_iter()
                .map(ShardLocator::new)
                .collect(),
        ),
        ShardSpec::ManifestJson(text) => parse_manifest(text, None)?,
        ShardSpec::ManifestAt(location) => {
            let text = fetch(location)?;
            parse_manifest(&text, parent_of(location))?
        }
    };

    tracing::debug!(shards = manifest.len(), "Resolved shard spec");
    Ok(manifest)
}

/// Expand every `{lo..hi}` group into the Cartesian product of its values.
///
/// Values are zero-padded to the digit count of `lo`. Groups expand
/// left-to-right with the leftmost group varying slowest.
pub fn expand_braces(pattern: &str) -> Result<Vec<String>> {
    let malformed = |reason: &str| Error::MalformedPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    // Literal text segments interleaved with the value lists of each group
    let mut literals: Vec<String> = Vec::new();
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current = String::new();
    let mut rest = pattern;

    while let Some(pos) = rest.find(['{', '}']) {
        let (before, tail) = rest.split_at(pos);
        current.push_str(before);
        if tail.starts_with('}') {
            return Err(malformed("'}' without matching '{'"));
        }
        let close = tail
            .find('}')
            .ok_or_else(|| malformed("'{' without matching '}'"))?;
        let body = &tail[1..close];
        if body.contains('{') {
            return Err(malformed("nested '{' inside range"));
        }
        groups.push(expand_range(body).map_err(|reason| malformed(&reason))?);
        literals.push(std::mem::take(&mut current));
        rest = &tail[close + 1..];
    }
    current.push_str(rest);
    literals.push(current);

    let mut results = vec![String::new()];
    for (i, group) in groups.iter().enumerate() {
        let mut next = Vec::with_capacity(results.len() * group.len());
        for prefix in &results {
            for value in group {
                next.push(format!("{}{}{}", prefix, literals[i], value));
            }
        }
        results = next;
    }
    let tail = &literals[groups.len()];
    Ok(results.into_iter().map(|r| r + tail).collect())
}

fn expand_range(body: &str) -> std::result::Result<Vec<String>, String> {
    let (lo, hi) = body
        .split_once("..")
        .ok_or_else(|| format!("range '{}' is not of the form lo..hi", body))?;
    let is_numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !is_numeric(lo) || !is_numeric(hi) {
        return Err(format!("range '{}' is not numeric", body));
    }
    let lo_value: u64 = lo.parse().map_err(|e| format!("bad lower bound: {}", e))?;
    let hi_value: u64 = hi.parse().map_err(|e| format!("bad upper bound: {}", e))?;
    if lo_value > hi_value {
        return Err(format!("range '{}' is empty (lo > hi)", body));
    }
    let width = lo.len();
    Ok((lo_value..=hi_value)
        .map(|v| format!("{:0width$}", v, width = width))
        .collect())
}

/// Parse a JSON manifest document.
///
/// Accepts `{"base": .., "total_samples": .., "shards": [..]}` or a bare
/// array of shard entries. Each entry needs `url` and `nsamples`; `nbytes`
/// defaults to 0 (unknown). `default_base` applies when the document has
/// no `base` of its own.
pub fn parse_manifest(text: &str, default_base: Option<String>) -> Result<Manifest> {
    let parse_err = |reason: String| Error::ManifestParse { reason };
    let doc: Value =
        serde_json::from_str(text).map_err(|e| parse_err(format!("invalid JSON: {}", e)))?;

    let (entries, base, total_samples) = match &doc {
        Value::Array(entries) => (entries, None, None),
        Value::Object(map) => {
            let entries = map
                .get("shards")
                .and_then(Value::as_array)
                .ok_or_else(|| parse_err("missing 'shards' array".to_string()))?;
            let base = match map.get("base") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => return Err(parse_err("'base' must be a string".to_string())),
            };
            let total = match map.get("total_samples") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_u64()
                        .ok_or_else(|| parse_err("'total_samples' must be a non-negative integer".to_string()))?,
                ),
            };
            (entries, base, total)
        }
        _ => return Err(parse_err("manifest must be an object or array".to_string())),
    };

    let base = base.or(default_base);
    let mut shards = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let url = entry
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| parse_err(format!("shard {} is missing 'url'", i)))?;
        let nsamples = entry
            .get("nsamples")
            .and_then(Value::as_u64)
            .ok_or_else(|| parse_err(format!("shard {} is missing 'nsamples'", i)))?;
        let nbytes = match entry.get("nbytes") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| parse_err(format!("shard {} has invalid 'nbytes'", i)))?,
        };
        shards.push(ShardLocator::with_counts(
            join_base(base.as_deref(), url),
            nbytes,
            nsamples,
        ));
    }

    let manifest = Manifest {
        shards,
        base,
        total_samples,
    };
    manifest.validate()?;
    Ok(manifest)
}

/// Join a relative shard URL onto a base; absolute URLs and paths pass through
pub fn join_base(base: Option<&str>, url: &str) -> String {
    match base {
        Some(base) if !base.is_empty() && scheme_of(url).is_none() && !url.starts_with('/') => {
            format!("{}/{}", base.trim_end_matches('/'), url)
        }
        _ => url.to_string(),
    }
}

fn parent_of(location: &str) -> Option<String> {
    location
        .rfind('/')
        .map(|pos| location[..pos].to_string())
        .filter(|parent| !parent.is_empty() && !parent.ends_with(':') && !parent.ends_with("/"))
}
