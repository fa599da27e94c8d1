//! Query Expression AST
//!
//! The query parser lives outside the storage engine; this module defines the
//! expression tree it produces and the search operators consume. A query is a
//! boolean combination of token expressions; a token expression names a field
//! and a term to match against that field's token values.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Boolean query tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    Token(TokenExpr),
    Not(Box<Query>),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    pub fn token(field: impl Into<String>, term: Term) -> Query {
        Query::Token(TokenExpr {
            field: field.into(),
            term,
        })
    }

    pub fn not(q: Query) -> Query {
        Query::Not(Box::new(q))
    }

    pub fn and(a: Query, b: Query) -> Query {
        Query::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Query, b: Query) -> Query {
        Query::Or(Box::new(a), Box::new(b))
    }
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExpr {
    pub field: String,
    pub term: Term,
}

/// Term kinds a field predicate can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Exact literal match.
    Literal(String),
    /// Wildcard pattern (`abc*`, `*abc`, `*abc*`, `a*b*c`).
    Wildcard(Wildcard),
    /// Lexicographic/numeric range `[a TO b]`, `*` bounds open.
    Range(RangeTerm),
    /// Inclusive IP range, already expanded from a pair or CIDR notation.
    IpRange { from: Ipv4Addr, to: Ipv4Addr },
}

impl Term {
    /// Build a term from a pattern string: returns `Literal` when the pattern
    /// carries no `*`, `Wildcard` otherwise.
    pub fn pattern(pattern: &str) -> Term {
        if !pattern.contains('*') {
            return Term::Literal(pattern.to_string());
        }
        Term::Wildcard(Wildcard::parse(pattern))
    }

    /// Expand CIDR notation (`a.b.c.d/N`) into an inclusive IP range term.
    pub fn ip_cidr(cidr: &str) -> Result<Term> {
        let (addr, bits) = cidr
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("not a CIDR: {cidr}")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad ip address: {addr}")))?;
        let bits: u32 = bits
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad prefix length: {bits}")))?;
        if bits > 32 {
            return Err(Error::InvalidArgument(format!(
                "prefix length out of range: {bits}"
            )));
        }
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        let base = u32::from(addr) & mask;
        Ok(Term::IpRange {
            from: Ipv4Addr::from(base),
            to: Ipv4Addr::from(base | !mask),
        })
    }
}

/// Wildcard pattern split on `*`: `a*b*c` becomes segments `[a, b, c]` with
/// anchored head/tail; `*abc*` becomes one unanchored segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wildcard {
    pub segments: Vec<String>,
    pub anchored_start: bool,
    pub anchored_end: bool,
}

impl Wildcard {
    pub fn parse(pattern: &str) -> Wildcard {
        let anchored_start = !pattern.starts_with('*');
        let anchored_end = !pattern.ends_with('*');
        let segments = pattern
            .split('*')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Wildcard {
            segments,
            anchored_start,
            anchored_end,
        }
    }

    /// Prefix the pattern pins the match to, if any (used by ordered
    /// providers to narrow the scan).
    pub fn prefix(&self) -> Option<&str> {
        if self.anchored_start {
            self.segments.first().map(String::as_str)
        } else {
            None
        }
    }
}

/// Range bounds; `None` stands for the `*` open bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTerm {
    pub from: Option<String>,
    pub to: Option<String>,
    pub include_from: bool,
    pub include_to: bool,
}

impl RangeTerm {
    pub fn closed(from: impl Into<String>, to: impl Into<String>) -> RangeTerm {
        RangeTerm {
            from: Some(from.into()),
            to: Some(to.into()),
            include_from: true,
            include_to: true,
        }
    }

    /// True when both bounds parse as numbers, switching comparisons from
    /// lexicographic to numeric.
    pub fn is_numeric(&self) -> bool {
        let parses = |b: &Option<String>| match b {
            Some(v) => v.parse::<f64>().is_ok(),
            None => true,
        };
        (self.from.is_some() || self.to.is_some()) && parses(&self.from) && parses(&self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_without_star_is_literal() {
        assert_eq!(Term::pattern("error"), Term::Literal("error".to_string()));
    }

    #[test]
    fn test_wildcard_prefix() {
        let w = Wildcard::parse("abc*");
        assert_eq!(w.segments, vec!["abc"]);
        assert!(w.anchored_start);
        assert!(!w.anchored_end);
        assert_eq!(w.prefix(), Some("abc"));
    }

    #[test]
    fn test_wildcard_suffix() {
        let w = Wildcard::parse("*abc");
        assert!(!w.anchored_start);
        assert!(w.anchored_end);
        assert_eq!(w.prefix(), None);
    }

    #[test]
    fn test_wildcard_middle() {
        let w = Wildcard::parse("*abc*");
        assert_eq!(w.segments, vec!["abc"]);
        assert!(!w.anchored_start);
        assert!(!w.anchored_end);
    }

    #[test]
    fn test_wildcard_multi_segment() {
        let w = Wildcard::parse("a*b*c");
        assert_eq!(w.segments, vec!["a", "b", "c"]);
        assert!(w.anchored_start);
        assert!(w.anchored_end);
    }

    #[test]
    fn test_cidr_expansion() {
        let term = Term::ip_cidr("192.168.0.0/24").unwrap();
        assert_eq!(
            term,
            Term::IpRange {
                from: "192.168.0.0".parse().unwrap(),
                to: "192.168.0.255".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_cidr_host_route() {
        let term = Term::ip_cidr("10.0.0.7/32").unwrap();
        assert_eq!(
            term,
            Term::IpRange {
                from: "10.0.0.7".parse().unwrap(),
                to: "10.0.0.7".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_cidr_invalid() {
        assert!(Term::ip_cidr("192.168.0.0").is_err());
        assert!(Term::ip_cidr("not-an-ip/8").is_err());
        assert!(Term::ip_cidr("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_range_numeric_detection() {
        assert!(RangeTerm::closed("0", "63").is_numeric());
        assert!(!RangeTerm::closed("a", "63").is_numeric());
        let open = RangeTerm {
            from: None,
            to: Some("10".to_string()),
            include_from: true,
            include_to: true,
        };
        assert!(open.is_numeric());
    }
}
