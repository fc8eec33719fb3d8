//! Wildcard expansion of source and destination names.
//!
//! `*` and `?` never cross a `/`; `**` as a whole path component matches any
//! number of directories, including none. Runs of three or more `*` behave
//! like a single `*`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};

use crate::api::CloudApi;
use crate::resource::{CloudUrl, FileObjectResource, ObjectResource, Resource, CLOUD_DELIMITER};

const WILDCARD_CHARS: &[char] = &['*', '?', '[', ']'];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

pub fn contains_wildcard(s: &str) -> bool {
    s.contains(WILDCARD_CHARS)
}

/// Replaces every run of three or more `*` with one `*`.
pub fn compress_wildcards(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut stars = 0usize;
    for c in s.chars() {
        if c == '*' {
            stars += 1;
            continue;
        }
        push_stars(&mut out, stars);
        stars = 0;
        out.push(c);
    }
    push_stars(&mut out, stars);
    out
}

fn push_stars(out: &mut String, n: usize) {
    let n = if n >= 3 { 1 } else { n };
    out.extend(std::iter::repeat('*').take(n));
}

/// The part of `name` before its first wildcard character.
fn literal_prefix(name: &str) -> &str {
    match name.find(WILDCARD_CHARS) {
        Some(i) => &name[..i],
        None => name,
    }
}

/// Patterns an object name may match: the pattern itself, plus variants where
/// a `**/` component matches zero directories.
fn name_patterns(pattern: &str) -> Result<Vec<Pattern>> {
    let mut raw = vec![pattern.to_string()];
    let collapsed = pattern.replace("/**/", "/");
    if collapsed != pattern {
        raw.push(collapsed.clone());
    }
    for p in [pattern, collapsed.as_str()] {
        if let Some(rest) = p.strip_prefix("**/") {
            raw.push(rest.to_string());
        }
    }
    raw.iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid wildcard {:?}", p)))
        .collect()
}

/// Objects named by `url`, which may contain wildcards in its object part.
///
/// Without wildcards only an exact name match is returned. Names ending in
/// the delimiter (folder placeholders) never match a wildcard.
pub fn expand_cloud_wildcard(api: &dyn CloudApi, url: &CloudUrl) -> Result<Vec<ObjectResource>> {
    if contains_wildcard(&url.bucket) {
        anyhow::bail!("bucket wildcards are not supported: {}", url);
    }
    if url.is_bucket() {
        anyhow::bail!("{} names a bucket, not an object; recursive copies are not supported", url);
    }
    let name = compress_wildcards(&url.object);
    let prefix = literal_prefix(&name);
    let listed = api
        .list_objects(&url.bucket, prefix)
        .with_context(|| format!("list gs://{}/{}", url.bucket, prefix))?;

    let generation_matches = |o: &ObjectResource| match &url.generation {
        Some(g) => o.generation.as_deref() == Some(g.as_str()),
        None => true,
    };

    if !contains_wildcard(&name) {
        return Ok(listed
            .into_iter()
            .filter(|o| o.url.object == name && generation_matches(o))
            .collect());
    }

    let patterns = name_patterns(&name)?;
    let mut matched: Vec<ObjectResource> = listed
        .into_iter()
        .filter(|o| !o.url.object.ends_with(CLOUD_DELIMITER))
        .filter(|o| generation_matches(o))
        .filter(|o| {
            patterns
                .iter()
                .any(|p| p.matches_with(&o.url.object, MATCH_OPTIONS))
        })
        .collect();
    matched.sort_by(|a, b| a.url.object.cmp(&b.url.object));
    tracing::debug!(url = %url, matched = matched.len(), "expanded cloud wildcard");
    Ok(matched)
}

/// Local files and directories matching `pattern`. A pattern ending in `**`
/// yields only files.
pub fn expand_file_wildcard(pattern: &str) -> Result<Vec<Resource>> {
    let pattern = compress_wildcards(pattern);
    let files_only = pattern.ends_with("**");
    let mut out = Vec::new();
    let paths = glob::glob_with(&pattern, MATCH_OPTIONS)
        .with_context(|| format!("invalid wildcard {:?}", pattern))?;
    for entry in paths {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if path.is_dir() {
            if !files_only {
                out.push(Resource::FileDirectory(path));
            }
        } else {
            out.push(Resource::File(FileObjectResource::new(path)));
        }
    }
    Ok(out)
}

/// Resolves a local destination string to exactly one resource. Wildcards
/// must match exactly one existing path; otherwise the literal path is used,
/// as a directory if it exists as one or ends with a separator.
pub fn resolve_file_destination(destination: &str) -> Result<Resource> {
    if contains_wildcard(destination) {
        let mut matched = expand_file_wildcard(destination)?;
        return match matched.len() {
            1 => Ok(matched.remove(0)),
            0 => anyhow::bail!("destination ({}) contains an unexpected wildcard", destination),
            _ => anyhow::bail!("destination ({}) must match exactly one path", destination),
        };
    }
    let path = PathBuf::from(destination);
    if path.is_dir() || ends_with_separator(destination) {
        Ok(Resource::FileDirectory(path))
    } else {
        Ok(Resource::File(FileObjectResource::new(path)))
    }
}

fn ends_with_separator(s: &str) -> bool {
    s.ends_with(std::path::MAIN_SEPARATOR) || s.ends_with('/')
}
