//! Space-separated glob pattern matching for `charts_pattern` / `hosts_pattern`.
//!
//! A pattern is a space-separated list of glob-style terms. A term prefixed with `!`
//! negates a match. Terms are evaluated left to right and the first matching term
//! (positive or negated) decides the outcome, mirroring netdata's `SIMPLE_PATTERN`.

#[derive(Debug, Clone)]
pub struct SimplePattern {
    terms: Vec<Term>,
}

#[derive(Debug, Clone)]
struct Term {
    negate: bool,
    glob: Glob,
}

#[derive(Debug, Clone)]
enum Glob {
    /// No wildcard: exact match.
    Exact(String),
    /// A single `*` somewhere in the term, split into (prefix, suffix).
    Star(String, String),
    /// Matches everything.
    Any,
}

impl SimplePattern {
    /// Parses a pattern string. An empty or all-whitespace pattern matches everything.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut terms = Vec::new();
        for raw in spec.split_whitespace() {
            let (negate, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            if body.is_empty() {
                return Err(format!("empty term in pattern '{spec}'"));
            }
            let glob = match body.matches('*').count() {
                0 => Glob::Exact(body.to_string()),
                1 if body == "*" => Glob::Any,
                1 => {
                    let idx = body.find('*').unwrap();
                    Glob::Star(body[..idx].to_string(), body[idx + 1..].to_string())
                }
                _ => return Err(format!("term '{body}' has more than one wildcard")),
            };
            terms.push(Term { negate, glob });
        }
        Ok(Self { terms })
    }

    /// Returns true if `candidate` matches this pattern, false otherwise.
    ///
    /// An empty pattern (no terms) matches everything, matching netdata's default of
    /// "no filter configured means export everything".
    pub fn matches(&self, candidate: &str) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        for term in &self.terms {
            if term.glob.matches(candidate) {
                return !term.negate;
            }
        }
        false
    }
}

impl Glob {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Glob::Exact(s) => s == candidate,
            Glob::Any => true,
            Glob::Star(prefix, suffix) => {
                candidate.len() >= prefix.len() + suffix.len()
                    && candidate.starts_with(prefix.as_str())
                    && candidate.ends_with(suffix.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_matches_everything() {
        let p = SimplePattern::parse("").unwrap();
        assert!(p.matches("anything"));
    }

    #[test]
    fn exact_term_matches_only_itself() {
        let p = SimplePattern::parse("system.cpu").unwrap();
        assert!(p.matches("system.cpu"));
        assert!(!p.matches("system.ram"));
    }

    #[test]
    fn wildcard_prefix_suffix() {
        let p = SimplePattern::parse("system.*").unwrap();
        assert!(p.matches("system.cpu"));
        assert!(!p.matches("disk.sda"));
    }

    #[test]
    fn negation_takes_precedence_over_later_terms() {
        let p = SimplePattern::parse("!system.cpu *").unwrap();
        assert!(!p.matches("system.cpu"));
        assert!(p.matches("system.ram"));
    }

    #[test]
    fn first_matching_term_wins() {
        let p = SimplePattern::parse("system.cpu !*").unwrap();
        assert!(p.matches("system.cpu"));
        assert!(!p.matches("system.ram"));
    }

    #[test]
    fn rejects_multiple_wildcards() {
        assert!(SimplePattern::parse("a*b*c").is_err());
    }
}
