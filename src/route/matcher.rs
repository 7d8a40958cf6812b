//! URL-to-route matching.
//!
//! # Responsibilities
//! - Turn a pathname into the chain of route matches from root to leaf
//! - Extract dynamic params, including the `*` splat remainder
//! - Rank sibling candidates so static segments beat dynamic ones
//!
//! # Design Decisions
//! - Optional segments are expanded into explicit variants up front, so
//!   consumption itself is a simple linear walk and ranking can score each
//!   variant for what it actually consumes.
//! - Matching is greedy with backtracking: at each level candidates are
//!   tried in specificity order and the first branch that consumes the
//!   whole remaining pathname wins.
//! - Static segment comparison is ASCII case-insensitive; extracted param
//!   values keep the URL's original text.
//! - The matcher is a trait so hosts can swap in their own strategy; the
//!   engine only depends on the returned match chains.

use std::sync::Arc;

use crate::data::Params;

use super::{RouteMatch, RouteRecord, RouteTree};

/// Resolves a pathname against the route tree.
///
/// `pathname` has the basename already stripped. A return of `None` means
/// nothing matched and the caller renders its 404 path.
pub trait RouteMatcher: Send + Sync {
    fn match_routes(&self, tree: &RouteTree, pathname: &str) -> Option<Vec<RouteMatch>>;
}

/// The built-in segment-wise matcher.
pub struct SegmentMatcher;

impl RouteMatcher for SegmentMatcher {
    fn match_routes(&self, tree: &RouteTree, pathname: &str) -> Option<Vec<RouteMatch>> {
        let segments: Vec<&str> = pathname.split('/').filter(|s| !s.is_empty()).collect();
        match_level(tree.roots(), &segments, "", &Params::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Static(String),
    Param(String),
    Splat,
}

/// Parse a route path into segments, expanding `?`-suffixed optionals into
/// every with/without combination.
fn parse_variants(path: &str) -> Vec<Vec<Seg>> {
    let mut variants: Vec<Vec<Seg>> = vec![Vec::new()];
    for raw in path.split('/').filter(|s| !s.is_empty()) {
        if raw == "*" {
            for v in &mut variants {
                v.push(Seg::Splat);
            }
            continue;
        }
        let (body, optional) = match raw.strip_suffix('?') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let seg = match body.strip_prefix(':') {
            Some(name) => Seg::Param(name.to_string()),
            None => Seg::Static(body.to_string()),
        };
        if optional {
            let mut expanded = Vec::with_capacity(variants.len() * 2);
            for v in &variants {
                let mut with = v.clone();
                with.push(seg.clone());
                expanded.push(with);
            }
            expanded.extend(variants);
            variants = expanded;
        } else {
            for v in &mut variants {
                v.push(seg.clone());
            }
        }
    }
    variants
}

const STATIC_SEGMENT_SCORE: i32 = 10;
const PARAM_SEGMENT_SCORE: i32 = 3;
const SPLAT_PENALTY: i32 = -2;
const EMPTY_PATH_SCORE: i32 = 1;
const INDEX_SCORE: i32 = 2;

fn variant_score(segs: &[Seg]) -> i32 {
    if segs.is_empty() {
        return EMPTY_PATH_SCORE;
    }
    segs.iter()
        .map(|seg| match seg {
            Seg::Static(_) => STATIC_SEGMENT_SCORE,
            Seg::Param(_) => PARAM_SEGMENT_SCORE,
            Seg::Splat => SPLAT_PENALTY,
        })
        .sum()
}

/// Ordering score for records that do not consume segments themselves.
/// Pathless routes borrow their best descendant's score so they slot in
/// where their children would.
fn record_score(record: &RouteRecord) -> i32 {
    if record.index {
        return INDEX_SCORE;
    }
    match &record.path {
        Some(path) => parse_variants(path)
            .iter()
            .map(|v| variant_score(v))
            .max()
            .unwrap_or(EMPTY_PATH_SCORE),
        None => record
            .children()
            .iter()
            .map(|c| record_score(c))
            .max()
            .unwrap_or(0),
    }
}

enum Candidate<'r> {
    Index(&'r Arc<RouteRecord>),
    Pathless(&'r Arc<RouteRecord>),
    Variant(&'r Arc<RouteRecord>, Vec<Seg>),
}

fn match_level(
    records: &[Arc<RouteRecord>],
    segments: &[&str],
    base: &str,
    params: &Params,
) -> Option<Vec<RouteMatch>> {
    let mut candidates: Vec<(i32, usize, Candidate<'_>)> = Vec::new();
    for (decl, record) in records.iter().enumerate() {
        if record.index {
            candidates.push((INDEX_SCORE, decl, Candidate::Index(record)));
            continue;
        }
        match &record.path {
            None => candidates.push((record_score(record), decl, Candidate::Pathless(record))),
            Some(path) => {
                for variant in parse_variants(path) {
                    let score = variant_score(&variant);
                    candidates.push((score, decl, Candidate::Variant(record, variant)));
                }
            }
        }
    }
    // Highest score first; declaration order breaks ties.
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, _, candidate) in candidates {
        let chain = match candidate {
            Candidate::Index(record) => {
                if !segments.is_empty() {
                    continue;
                }
                Some(vec![RouteMatch {
                    route: record.clone(),
                    params: params.clone(),
                    pathname: present(base),
                    pathname_base: present(base),
                }])
            }
            Candidate::Pathless(record) => {
                match_level(record.children(), segments, base, params).map(|rest| {
                    let mut out = vec![RouteMatch {
                        route: record.clone(),
                        params: params.clone(),
                        pathname: present(base),
                        pathname_base: present(base),
                    }];
                    out.extend(rest);
                    out
                })
            }
            Candidate::Variant(record, variant) => {
                try_variant(record, &variant, segments, base, params)
            }
        };
        if chain.is_some() {
            return chain;
        }
    }
    None
}

fn try_variant(
    record: &Arc<RouteRecord>,
    variant: &[Seg],
    segments: &[&str],
    base: &str,
    params: &Params,
) -> Option<Vec<RouteMatch>> {
    let consumed = consume(variant, segments, params)?;
    let remaining = &segments[consumed.eaten..];

    let matched_base = extend_base(base, &segments[..consumed.base_eaten]);
    let matched_full = extend_base(base, &segments[..consumed.eaten]);
    let this_match = RouteMatch {
        route: record.clone(),
        params: consumed.params.clone(),
        pathname: present(&matched_full),
        pathname_base: present(&matched_base),
    };

    if remaining.is_empty() {
        // Prefer finishing in an index (or pathless-to-index) child.
        if let Some(rest) =
            match_level(record.children(), remaining, &matched_base, &consumed.params)
        {
            let mut out = vec![this_match];
            out.extend(rest);
            return Some(out);
        }
        return Some(vec![this_match]);
    }

    let rest = match_level(record.children(), remaining, &matched_base, &consumed.params)?;
    let mut out = vec![this_match];
    out.extend(rest);
    Some(out)
}

struct Consumed {
    params: Params,
    /// URL segments eaten in total, splat included.
    eaten: usize,
    /// URL segments eaten before any splat; the child resolution base.
    base_eaten: usize,
}

fn consume(segs: &[Seg], url: &[&str], inherited: &Params) -> Option<Consumed> {
    let mut params = inherited.clone();
    let mut at = 0;
    for seg in segs {
        match seg {
            Seg::Splat => {
                params.insert("*".to_string(), url[at..].join("/"));
                return Some(Consumed {
                    params,
                    eaten: url.len(),
                    base_eaten: at,
                });
            }
            Seg::Static(value) => {
                if at < url.len() && url[at].eq_ignore_ascii_case(value) {
                    at += 1;
                } else {
                    return None;
                }
            }
            Seg::Param(name) => {
                if at < url.len() {
                    params.insert(name.clone(), url[at].to_string());
                    at += 1;
                } else {
                    return None;
                }
            }
        }
    }
    Some(Consumed {
        params,
        eaten: at,
        base_eaten: at,
    })
}

fn extend_base(base: &str, consumed: &[&str]) -> String {
    if consumed.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{}", consumed.join("/"))
    }
}

fn present(pathname: &str) -> String {
    if pathname.is_empty() {
        "/".to_string()
    } else {
        pathname.to_string()
    }
}
