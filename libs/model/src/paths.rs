//! Instance path helpers.
//!
//! Paths are `/`-separated instance names starting at a root instance:
//! `/vm1/tomcat/webapp`.

use crate::ModelError;

/// Builds the path of a child instance.
pub fn child_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}/{name}"),
        None => format!("/{name}"),
    }
}

/// Returns the path of the parent, or `None` for a root path.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Splits a path into its segment names.
pub fn segments(path: &str) -> Result<Vec<&str>, ModelError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(ModelError::InvalidPath(path.to_string()));
    };

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ModelError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Name of the root instance of a path.
pub fn root_name(path: &str) -> Option<&str> {
    path.strip_prefix('/')
        .and_then(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
}

/// True if `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path() {
        assert_eq!(child_path(None, "vm"), "/vm");
        assert_eq!(child_path(Some("/vm"), "tomcat"), "/vm/tomcat");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/vm/tomcat/app"), Some("/vm/tomcat"));
        assert_eq!(parent_path("/vm"), None);
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("/vm/tomcat").unwrap(), vec!["vm", "tomcat"]);
        assert!(segments("vm/tomcat").is_err());
        assert!(segments("/vm//tomcat").is_err());
        assert!(segments("/").is_err());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/vm/tomcat", "/vm"));
        assert!(is_within("/vm", "/vm"));
        assert!(!is_within("/vm2/tomcat", "/vm"));
    }

    #[test]
    fn test_root_name() {
        assert_eq!(root_name("/vm/tomcat"), Some("vm"));
        assert_eq!(root_name("vm"), None);
    }
}
