//! Strings annotated with capture-group ranges.

/// A string value along with the half-open index ranges that pattern matching
/// designated as capture groups. Substitution patterns refer to these ranges
/// by one-based `$N` indices.
///
/// The derived ordering (value first, then groups) lets vectors of captured
/// strings be sorted deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapturedString {
    pub value: String,
    pub captured_groups: Vec<(usize, usize)>,
}

impl CapturedString {
    /// The substring designated by group `index`, or `None` when the group
    /// does not exist. Rules referring to more groups than their input
    /// patterns capture are user errors, so absence is recoverable.
    pub fn sub_string(&self, index: usize) -> Option<&str> {
        let &(start, end) = self.captured_groups.get(index)?;
        Some(&self.value[start..end])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_group_sub_strings() {
        let cs = CapturedString {
            value: "src/lib/foo.cpp".to_string(),
            captured_groups: vec![(4, 11)],
        };
        assert_eq!(cs.sub_string(0), Some("lib/foo"));
        assert_eq!(cs.sub_string(1), None);
    }

    #[test]
    fn orders_by_value_then_groups() {
        let a = CapturedString { value: "a".to_string(), captured_groups: vec![(0, 1)] };
        let b = CapturedString { value: "b".to_string(), captured_groups: vec![] };
        assert!(a < b);
    }
}
