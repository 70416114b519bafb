//! Tag filters: single terms, comma separated sets and boolean expressions.

mod expression;
mod filter;

pub use expression::TagFilterExpression;
pub use filter::{TagFilter, TagFilterSet};

use std::collections::BTreeMap;

pub type Tags = BTreeMap<String, String>;

/// Whether writing `proposed` onto a resource tagged `current` would make
/// `filter` fire again.
///
/// A write only counts when it changes the value of at least one tag the
/// filter references and the merged tag set matches. Re-checking a write
/// that is already applied therefore never retriggers.
pub fn would_retrigger(current: &Tags, proposed: &Tags, filter: &TagFilterExpression) -> bool {
    let mut merged = current.clone();
    merged.extend(proposed.iter().map(|(k, v)| (k.clone(), v.clone())));
    retriggers(current, &merged, filter)
}

/// Like [`would_retrigger`], for a write that replaces the tag set `before`
/// with `after`. Removed tags count as changed.
pub fn retriggers(before: &Tags, after: &Tags, filter: &TagFilterExpression) -> bool {
    let mut changed = before
        .keys()
        .chain(after.keys())
        .filter(|k| before.get(*k) != after.get(*k));
    if !changed.any(|k| filter.references(k)) {
        return false;
    }
    filter.is_match(after)
}
