//! Sub-resource allow-lists.
//!
//! Resource records store the sub-resources (database names, db indexes) they
//! may open as one delimited string, e.g. `"shop  crm"` or `"0,1,2"`.

/// Parsed allow-list of sub-resource names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList(Vec<String>);

impl AllowList {
    /// Parses a whitespace and/or comma delimited list. Empty items are dropped.
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    /// Whether `name` is an allowed sub-resource.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|s| s == name)
    }

    /// Allowed names in configured order.
    pub fn items(&self) -> &[String] {
        &self.0
    }

    /// First configured name.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Names present in `self` but not in `other`.
    pub fn removed_from(&self, other: &AllowList) -> Vec<String> {
        self.0
            .iter()
            .filter(|s| !other.contains(s))
            .cloned()
            .collect()
    }

    /// Whether nothing is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_delimiters() {
        let list = AllowList::parse(" shop  crm,logs ");
        assert_eq!(list.items(), ["shop", "crm", "logs"]);
        assert!(list.contains("crm"));
        assert!(!list.contains("payroll"));
    }

    #[test]
    fn test_no_substring_match() {
        let list = AllowList::parse("payroll_archive");
        assert!(!list.contains("payroll"));
    }

    #[test]
    fn test_removed_from() {
        let old = AllowList::parse("a b c");
        let new = AllowList::parse("b,d");
        assert_eq!(old.removed_from(&new), vec!["a", "c"]);
        assert!(AllowList::parse("  ").is_empty());
    }
}
