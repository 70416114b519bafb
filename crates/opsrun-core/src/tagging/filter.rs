use super::Tags;
use crate::error::{OpsError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// One character of filter source, with whether it was `%`-escaped.
pub(crate) type Symbol = (char, bool);

pub(crate) fn unescape(text: &str, expression: &str) -> Result<Vec<Symbol>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let next = chars
                .next()
                .ok_or_else(|| OpsError::tag_filter(expression, "dangling '%' escape"))?;
            out.push((next, true));
        } else {
            out.push((c, false));
        }
    }
    Ok(out)
}

fn literal(symbols: &[Symbol]) -> String {
    symbols.iter().map(|(c, _)| *c).collect()
}

fn trim(symbols: &[Symbol]) -> &[Symbol] {
    let start = symbols
        .iter()
        .position(|(c, esc)| *esc || !c.is_whitespace())
        .unwrap_or(symbols.len());
    let end = symbols
        .iter()
        .rposition(|(c, esc)| *esc || !c.is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &symbols[start..end.max(start)]
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Matcher for one side of a term: a tag name or a tag value.
#[derive(Debug, Clone)]
pub(crate) enum Pattern {
    /// Exactly `*`.
    Any,
    Exact(String),
    /// Contains unescaped `*` wildcards (prefix, suffix or contains).
    Wildcard(Regex),
    /// `\`-prefixed regular expression, anchored at the start of the text.
    Regex(Regex),
}

impl Pattern {
    fn parse(symbols: &[Symbol], expression: &str) -> Result<Self> {
        match symbols.first() {
            Some(('\\', false)) => {
                let source = literal(&symbols[1..]);
                let re = Regex::new(&format!("^(?:{source})")).map_err(|e| {
                    OpsError::tag_filter(expression, format!("invalid regex '{source}': {e}"))
                })?;
                return Ok(Pattern::Regex(re));
            }
            Some(('*', false)) if symbols.len() == 1 => return Ok(Pattern::Any),
            _ => {}
        }

        if !symbols.iter().any(|(c, esc)| *c == '*' && !esc) {
            return Ok(Pattern::Exact(literal(symbols)));
        }
        let mut source = String::from("^");
        for (c, esc) in symbols {
            if *c == '*' && !esc {
                source.push_str(".*");
            } else {
                source.push_str(&regex::escape(&c.to_string()));
            }
        }
        source.push('$');
        Regex::new(&source)
            .map(Pattern::Wildcard)
            .map_err(|e| OpsError::tag_filter(expression, e.to_string()))
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(s) => s == text,
            Pattern::Wildcard(re) | Pattern::Regex(re) => re.is_match(text),
        }
    }
}

// ---------------------------------------------------------------------------
// TagFilter
// ---------------------------------------------------------------------------

/// A single term: `[!]name[=[!]value]`.
///
/// `name=!value` matches a tag named `name` whose value does not match;
/// a leading `!` negates the whole term.
#[derive(Debug, Clone)]
pub struct TagFilter {
    source: String,
    negated: bool,
    name: Pattern,
    name_source: String,
    value: Option<(Pattern, bool)>,
}

impl TagFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let symbols = unescape(text, text)?;
        Self::from_symbols(&symbols, text)
    }

    pub(crate) fn from_symbols(symbols: &[Symbol], expression: &str) -> Result<Self> {
        let symbols = trim(symbols);
        let (negated, body) = match symbols.first() {
            Some(('!', false)) => (true, &symbols[1..]),
            _ => (false, symbols),
        };

        let split = body.iter().position(|(c, esc)| *c == '=' && !esc);
        let (name_part, value_part) = match split {
            Some(i) => (&body[..i], Some(&body[i + 1..])),
            None => (body, None),
        };
        let name_part = trim(name_part);
        if name_part.is_empty() {
            return Err(OpsError::tag_filter(expression, "empty tag name in term"));
        }

        let value = match value_part {
            Some(v) => {
                let v = trim(v);
                let (value_negated, v) = match v.first() {
                    Some(('!', false)) => (true, &v[1..]),
                    _ => (false, v),
                };
                Some((Pattern::parse(v, expression)?, value_negated))
            }
            None => None,
        };

        Ok(TagFilter {
            source: literal(symbols),
            negated,
            name: Pattern::parse(name_part, expression)?,
            name_source: literal(name_part),
            value,
        })
    }

    /// The name side as written, used for key pre-filtering.
    pub fn name(&self) -> &str {
        &self.name_source
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn matches_name(&self, key: &str) -> bool {
        self.name.is_match(key)
    }

    /// Whether one tag satisfies the term, ignoring a leading `!`.
    pub fn matches_pair(&self, key: &str, value: &str) -> bool {
        if !self.name.is_match(key) {
            return false;
        }
        match &self.value {
            None => true,
            Some((pattern, negated)) => pattern.is_match(value) != *negated,
        }
    }

    pub fn is_match(&self, tags: &Tags) -> bool {
        tags.iter().any(|(k, v)| self.matches_pair(k, v)) != self.negated
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// TagFilterSet
// ---------------------------------------------------------------------------

/// A comma separated list of terms; a tag set matches when any term does.
#[derive(Debug, Clone)]
pub struct TagFilterSet {
    filters: Vec<TagFilter>,
}

impl TagFilterSet {
    pub fn parse(text: &str) -> Result<Self> {
        let symbols = unescape(text, text)?;
        let filters = symbols
            .split(|(c, esc)| *c == ',' && !esc)
            .filter(|part| !trim(part).is_empty())
            .map(|part| TagFilter::from_symbols(part, text))
            .collect::<Result<Vec<_>>>()?;
        Ok(TagFilterSet { filters })
    }

    pub fn filters(&self) -> &[TagFilter] {
        &self.filters
    }

    pub fn is_match(&self, tags: &Tags) -> bool {
        self.filters.iter().any(|f| f.is_match(tags))
    }

    /// Every tag accepted by at least one term.
    pub fn pairs_matching_any_filter(&self, tags: &Tags) -> Tags {
        tags.iter()
            .filter(|(k, v)| {
                self.filters
                    .iter()
                    .any(|f| f.matches_pair(k, v) != f.is_negated())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The tags picked by the terms, but only when every term matches the
    /// set; otherwise empty.
    pub fn all_pairs_matching_filter(&self, tags: &Tags) -> Tags {
        if self.filters.iter().all(|f| f.is_match(tags)) {
            self.pairs_matching_any_filter(tags)
        } else {
            Tags::new()
        }
    }

    pub fn tag_names(&self) -> BTreeSet<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_and_name_only_terms() {
        let t = tags(&[("Env", "Prod"), ("Team", "")]);
        assert!(TagFilter::parse("Env=Prod").unwrap().is_match(&t));
        assert!(!TagFilter::parse("Env=prod").unwrap().is_match(&t));
        assert!(TagFilter::parse("Team").unwrap().is_match(&t));
        assert!(TagFilter::parse("Team=").unwrap().is_match(&t));
        assert!(!TagFilter::parse("Owner").unwrap().is_match(&t));
    }

    #[test]
    fn wildcards() {
        let t = tags(&[("backup-policy", "daily-7")]);
        assert!(TagFilter::parse("backup*=daily*").unwrap().is_match(&t));
        assert!(TagFilter::parse("*policy=*7").unwrap().is_match(&t));
        assert!(TagFilter::parse("*up-pol*=*ly*").unwrap().is_match(&t));
        assert!(TagFilter::parse("*=*").unwrap().is_match(&t));
        assert!(!TagFilter::parse("backup*=weekly*").unwrap().is_match(&t));
    }

    #[test]
    fn regex_is_anchored_at_start() {
        let t = tags(&[("Name", "web-01")]);
        assert!(TagFilter::parse("Name=\\web-\\d+").unwrap().is_match(&t));
        assert!(!TagFilter::parse("Name=\\\\d+").unwrap().is_match(&t));
        assert!(TagFilter::parse("Name=\\(").is_err());
    }

    #[test]
    fn value_negation_requires_the_tag() {
        let t = tags(&[("Env", "Dev")]);
        assert!(TagFilter::parse("Env=!Prod").unwrap().is_match(&t));
        assert!(!TagFilter::parse("Env=!Prod").unwrap().is_match(&Tags::new()));
        assert!(TagFilter::parse("!Env=Prod").unwrap().is_match(&Tags::new()));
    }

    #[test]
    fn escapes_make_operators_literal() {
        let t = tags(&[("a=b", "*")]);
        assert!(TagFilter::parse("a%=b=%*").unwrap().is_match(&t));
        assert!(TagFilter::parse("dangling%").is_err());
    }

    #[test]
    fn filter_set_selects_pairs() {
        let set = TagFilterSet::parse("Env, Owner=team-*").unwrap();
        let t = tags(&[("Env", "Prod"), ("Owner", "team-a"), ("Cost", "1")]);
        let picked = set.pairs_matching_any_filter(&t);
        assert_eq!(picked, tags(&[("Env", "Prod"), ("Owner", "team-a")]));
        assert_eq!(set.all_pairs_matching_filter(&t), picked);
        let partial = tags(&[("Env", "Prod"), ("Cost", "1")]);
        assert!(set.all_pairs_matching_filter(&partial).is_empty());
        assert!(set.is_match(&t));
        assert_eq!(
            set.tag_names().into_iter().collect::<Vec<_>>(),
            vec!["Env".to_string(), "Owner".to_string()]
        );
    }
}
