//! Pattern Search
//!
//! Evaluates one term against the token values of a single field, producing
//! matching TIDs. Works against any [`TokenProvider`]: the active fraction's
//! in-memory dictionary or a sealed fraction's token blocks.
//!
//! When the provider is *ordered* (sealed fractions keep a field's tokens
//! sorted), literal, prefix and lexicographic-range terms binary-search to
//! the start of the candidate run and scan forward only while the predicate
//! can still hold. Suffix/middle wildcards, numeric ranges and IP ranges
//! inspect every candidate: their match set is not contiguous in
//! lexicographic order.

use std::net::Ipv4Addr;

use seqdb_core::query::{RangeTerm, Term, Wildcard};
use seqdb_core::{Result, Tid};

use crate::context::SearchContext;

/// Candidate tokens of one field, addressable by dense position.
pub trait TokenProvider {
    /// Number of candidate tokens.
    fn count(&self) -> usize;

    /// Value of the candidate at `pos`.
    fn token_at(&self, pos: usize) -> Result<Vec<u8>>;

    /// TID of the candidate at `pos`.
    fn tid_at(&self, pos: usize) -> Tid;

    /// Candidates are sorted ascending by value.
    fn ordered(&self) -> bool;
}

/// Collect the TIDs of all tokens matching `term`, in position order.
pub fn search(
    ctx: &SearchContext,
    provider: &dyn TokenProvider,
    term: &Term,
) -> Result<Vec<Tid>> {
    let matcher = Matcher::new(term);
    let count = provider.count();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut tids = Vec::new();

    if provider.ordered() {
        if let Some(lower) = matcher.scan_lower_bound() {
            let start = lower_bound(provider, lower.as_slice())?;
            for pos in start..count {
                ctx.check()?;
                let token = provider.token_at(pos)?;
                if matcher.past_upper_bound(&token) {
                    break;
                }
                if matcher.matches(&token) {
                    tids.push(provider.tid_at(pos));
                }
            }
            return Ok(tids);
        }
    }

    for pos in 0..count {
        ctx.check()?;
        let token = provider.token_at(pos)?;
        if matcher.matches(&token) {
            tids.push(provider.tid_at(pos));
        }
    }
    Ok(tids)
}

/// Compiled form of one term.
pub struct Matcher {
    kind: MatcherKind,
}

enum MatcherKind {
    Literal(Vec<u8>),
    Wildcard(Wildcard),
    LexRange(RangeTerm),
    NumRange(RangeTerm),
    Ip { from: u32, to: u32 },
}

impl Matcher {
    pub fn new(term: &Term) -> Matcher {
        let kind = match term {
            Term::Literal(v) => MatcherKind::Literal(v.to_ascii_lowercase().into_bytes()),
            Term::Wildcard(w) => {
                let lowered = Wildcard {
                    segments: w.segments.iter().map(|s| s.to_ascii_lowercase()).collect(),
                    anchored_start: w.anchored_start,
                    anchored_end: w.anchored_end,
                };
                MatcherKind::Wildcard(lowered)
            }
            Term::Range(r) => {
                if r.is_numeric() {
                    MatcherKind::NumRange(r.clone())
                } else {
                    MatcherKind::LexRange(r.clone())
                }
            }
            Term::IpRange { from, to } => MatcherKind::Ip {
                from: u32::from(*from),
                to: u32::from(*to),
            },
        };
        Matcher { kind }
    }

    pub fn matches(&self, token: &[u8]) -> bool {
        match &self.kind {
            MatcherKind::Literal(v) => token == v.as_slice(),
            MatcherKind::Wildcard(w) => wildcard_matches(w, token),
            MatcherKind::LexRange(r) => lex_range_matches(r, token),
            MatcherKind::NumRange(r) => num_range_matches(r, token),
            MatcherKind::Ip { from, to } => match std::str::from_utf8(token)
                .ok()
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
            {
                Some(ip) => {
                    let ip = u32::from(ip);
                    *from <= ip && ip <= *to
                }
                None => false,
            },
        }
    }

    /// Value an ordered scan can start from, when the match set is a
    /// contiguous lexicographic run.
    fn scan_lower_bound(&self) -> Option<Vec<u8>> {
        match &self.kind {
            MatcherKind::Literal(v) => Some(v.clone()),
            MatcherKind::Wildcard(w) => w.prefix().map(|p| p.as_bytes().to_vec()),
            MatcherKind::LexRange(r) => {
                Some(r.from.as_deref().unwrap_or("").as_bytes().to_vec())
            }
            // numeric order disagrees with lexicographic order
            MatcherKind::NumRange(_) | MatcherKind::Ip { .. } => None,
        }
    }

    /// On an ordered provider, no token at or past this point can match.
    fn past_upper_bound(&self, token: &[u8]) -> bool {
        match &self.kind {
            MatcherKind::Literal(v) => token > v.as_slice(),
            MatcherKind::Wildcard(w) => match w.prefix() {
                Some(prefix) => !token.starts_with(prefix.as_bytes()),
                None => false,
            },
            MatcherKind::LexRange(r) => match &r.to {
                Some(to) => {
                    if r.include_to {
                        token > to.as_bytes()
                    } else {
                        token >= to.as_bytes()
                    }
                }
                None => false,
            },
            _ => false,
        }
    }
}

fn wildcard_matches(w: &Wildcard, token: &[u8]) -> bool {
    let mut rest = token;
    for (i, segment) in w.segments.iter().enumerate() {
        let seg = segment.as_bytes();
        let is_first = i == 0;
        let is_last = i == w.segments.len() - 1;

        if is_first && w.anchored_start {
            if !rest.starts_with(seg) {
                return false;
            }
            rest = &rest[seg.len()..];
            if is_last && w.anchored_end {
                return rest.is_empty();
            }
            continue;
        }

        if is_last && w.anchored_end {
            return rest.len() >= seg.len() && rest.ends_with(seg);
        }

        match find(rest, seg) {
            Some(at) => rest = &rest[at + seg.len()..],
            None => return false,
        }
    }
    true
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn lex_range_matches(r: &RangeTerm, token: &[u8]) -> bool {
    if let Some(from) = &r.from {
        let from = from.as_bytes();
        if r.include_from {
            if token < from {
                return false;
            }
        } else if token <= from {
            return false;
        }
    }
    if let Some(to) = &r.to {
        let to = to.as_bytes();
        if r.include_to {
            if token > to {
                return false;
            }
        } else if token >= to {
            return false;
        }
    }
    true
}

fn num_range_matches(r: &RangeTerm, token: &[u8]) -> bool {
    let value: f64 = match std::str::from_utf8(token).ok().and_then(|s| s.parse().ok()) {
        Some(v) => v,
        None => return false,
    };
    if let Some(from) = &r.from {
        // bounds pre-validated by is_numeric
        let from: f64 = match from.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        if r.include_from {
            if value < from {
                return false;
            }
        } else if value <= from {
            return false;
        }
    }
    if let Some(to) = &r.to {
        let to: f64 = match to.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        if r.include_to {
            if value > to {
                return false;
            }
        } else if value >= to {
            return false;
        }
    }
    true
}

/// First position whose token is >= `bound`.
fn lower_bound(provider: &dyn TokenProvider, bound: &[u8]) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = provider.count();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if provider.token_at(mid)?.as_slice() < bound {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}
