//! Traits shared between the reader, the symbol loader and the stack walker.

use std::borrow::Cow;
use std::fmt::Debug;

use debugid::{CodeId, DebugId};
use range_map::{Range, RangeMap};
use tracing::warn;

/// An executable or shared library loaded in a process.
pub trait Module {
    /// The base address of this code module as it was loaded by the process.
    fn base_address(&self) -> u64;
    /// The size of the code module.
    fn size(&self) -> u64;
    /// The path or file name that the code module was loaded from.
    fn code_file(&self) -> Cow<str>;
    /// An identifier for the module binary, on Linux the hex ELF build id.
    fn code_identifier(&self) -> Option<CodeId>;
    /// The file name that symbol files for this module are stored under.
    ///
    /// For ELF modules debug info lives in the binary itself, so this is
    /// the basename of `code_file`.
    fn debug_file(&self) -> Option<Cow<str>>;
    /// The identifier symbol files for this module must carry.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// A human-readable representation of the code module's version.
    fn version(&self) -> Option<Cow<str>>;
}

/// `(debug_file, debug_id)` pairs are enough to look up symbols.
impl Module for (&str, DebugId) {
    fn base_address(&self) -> u64 {
        0
    }
    fn size(&self) -> u64 {
        0
    }
    fn code_file(&self) -> Cow<str> {
        Cow::Borrowed("")
    }
    fn code_identifier(&self) -> Option<CodeId> {
        None
    }
    fn debug_file(&self) -> Option<Cow<str>> {
        Some(Cow::Borrowed(self.0))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        Some(self.1)
    }
    fn version(&self) -> Option<Cow<str>> {
        None
    }
}

/// Build a [`RangeMap`] from possibly messy input without panicking.
///
/// `RangeMap`'s `FromIterator` panics on overlapping ranges. Input
/// from symbol files and dumps makes no such promise, so entries with no
/// range are dropped, adjacent entries with equal values are merged, and an
/// entry overlapping an earlier one with a different value is discarded
/// with a warning.
pub trait IntoRangeMapSafe<V>: IntoIterator<Item = (Option<Range<u64>>, V)> + Sized
where
    V: Clone + Eq + Debug,
{
    fn into_rangemap_safe(self) -> RangeMap<u64, V> {
        let mut input: Vec<_> = self.into_iter().collect();
        input.sort_by_key(|(range, _)| range.as_ref().map(|r| (r.start, r.end)));

        let mut vec: Vec<(Range<u64>, V)> = Vec::with_capacity(input.len());
        for (range, val) in input {
            let Some(range) = range else {
                warn!("Unable to create valid range for {:?}", val);
                continue;
            };

            if let Some((last_range, last_val)) = vec.last_mut() {
                if range.start <= last_range.end {
                    if &val != last_val {
                        warn!(
                            "overlapping ranges {:?} and {:?} map to values {:?} and {:?}",
                            last_range, range, last_val, val
                        );
                        continue;
                    }
                    // Same value, absorb into the previous entry.
                    if range.end > last_range.end {
                        *last_range = Range::new(last_range.start, range.end);
                    }
                    continue;
                }

                if range.start == last_range.end.saturating_add(1) && &val == last_val {
                    *last_range = Range::new(last_range.start, range.end);
                    continue;
                }
            }

            vec.push((range, val));
        }

        // Already sorted and disjoint, so nothing is discarded here.
        RangeMap::try_from_iter(vec).unwrap_or_else(|e| e.non_overlapping)
    }
}

impl<I, V> IntoRangeMapSafe<V> for I
where
    I: IntoIterator<Item = (Option<Range<u64>>, V)> + Sized,
    V: Clone + Eq + Debug,
{
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rangemap_merges_and_skips() {
        let map = vec![
            (Some(Range::new(10, 19)), 1),
            (Some(Range::new(0, 9)), 1),
            (Some(Range::new(15, 30)), 2),
            (None, 3),
            (Some(Range::new(40, 49)), 4),
        ]
        .into_rangemap_safe();

        assert_eq!(map.get(0), Some(&1));
        assert_eq!(map.get(19), Some(&1));
        assert_eq!(map.get(25), None);
        assert_eq!(map.get(45), Some(&4));
        assert_eq!(map.ranges_values().count(), 2);
    }
}
