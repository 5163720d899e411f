//! Discovery acceptance criteria parsed from category strings.
//!
//! A category string has one of three shapes:
//!
//! ```text
//! BASE                      no application, no namespaces
//! BASE/appId                required application id
//! BASE/appId/ns1,ns2,...    required application id + namespaces
//! ```
//!
//! The application segment may be empty (`BASE//ns1`) to require
//! namespaces without pinning an application.

use std::collections::BTreeSet;
use thiserror::Error;

/// Category string parse failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CriteriaError {
    /// Empty category string
    #[error("empty category")]
    EmptyCategory,

    /// Namespace segment present but containing only blank entries
    #[error("blank namespace list in category {0:?}")]
    BlankNamespaces(String),
}

/// Parsed acceptance rule for discovered devices.
///
/// Equality and hashing cover the full `(category, app_id, namespaces)`
/// triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryCriteria {
    /// The original category string
    pub category: String,
    /// Application id the device must be able to run, if any
    pub app_id: Option<String>,
    /// Namespaces a running application must expose
    pub namespaces: BTreeSet<String>,
}

impl DiscoveryCriteria {
    /// Parse a category string
    pub fn parse(category: &str) -> Result<Self, CriteriaError> {
        if category.is_empty() {
            return Err(CriteriaError::EmptyCategory);
        }

        let mut segments = category.splitn(3, '/');
        let _base = segments.next().expect("splitn yields at least one");
        let app_segment = segments.next();
        let namespace_segment = segments.next();

        let app_id = app_segment
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);

        let namespaces = match namespace_segment {
            None | Some("") => BTreeSet::new(),
            Some(list) => {
                let parsed: BTreeSet<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect();
                if parsed.is_empty() {
                    return Err(CriteriaError::BlankNamespaces(category.to_string()));
                }
                parsed
            }
        };

        Ok(Self {
            category: category.to_string(),
            app_id,
            namespaces,
        })
    }

    /// Whether this criterion names a required application
    pub fn requires_app(&self) -> bool {
        self.app_id.is_some()
    }

    /// Whether this criterion requires any namespaces
    pub fn requires_namespaces(&self) -> bool {
        !self.namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> BTreeSet<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_base_only() {
        let criteria = DiscoveryCriteria::parse("urn:cast-category").unwrap();
        assert_eq!(criteria.app_id, None);
        assert!(criteria.namespaces.is_empty());
        assert_eq!(criteria.category, "urn:cast-category");
    }

    #[test]
    fn test_parse_with_app_id() {
        let criteria = DiscoveryCriteria::parse("BASE/app1").unwrap();
        assert_eq!(criteria.app_id.as_deref(), Some("app1"));
        assert!(criteria.namespaces.is_empty());
    }

    #[test]
    fn test_parse_with_namespaces() {
        let criteria = DiscoveryCriteria::parse("BASE/app1/ns1,ns2").unwrap();
        assert_eq!(criteria.app_id.as_deref(), Some("app1"));
        assert_eq!(criteria.namespaces, set(&["ns1", "ns2"]));
    }

    #[test]
    fn test_parse_empty_app_segment() {
        let criteria = DiscoveryCriteria::parse("BASE//ns1").unwrap();
        assert_eq!(criteria.app_id, None);
        assert_eq!(criteria.namespaces, set(&["ns1"]));
    }

    #[test]
    fn test_blank_namespace_list_is_rejected() {
        assert_eq!(
            DiscoveryCriteria::parse("BASE/app1/,,"),
            Err(CriteriaError::BlankNamespaces("BASE/app1/,,".to_string()))
        );
    }

    #[test]
    fn test_trailing_empty_namespace_segment_is_allowed() {
        let criteria = DiscoveryCriteria::parse("BASE/app1/").unwrap();
        assert!(criteria.namespaces.is_empty());
    }

    #[test]
    fn test_equality_on_triple() {
        let a = DiscoveryCriteria::parse("BASE/app1/ns1,ns2").unwrap();
        let b = DiscoveryCriteria::parse("BASE/app1/ns2,ns1").unwrap();
        // Namespace order in the string does not matter.
        assert_eq!(a.app_id, b.app_id);
        assert_eq!(a.namespaces, b.namespaces);
    }
}
