//! Tree layout: `base/service/instance`

use crate::coordinator::join_path;

/// Derives registration paths under a base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    base: String,
}

impl ServicePaths {
    /// Create a layout rooted at `base`
    pub fn new(base: impl AsRef<str>) -> Self {
        Self {
            base: join_path(base.as_ref(), ""),
        }
    }

    /// Normalized base path
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Path of a service node
    pub fn for_name(&self, name: &str) -> String {
        join_path(&self.base, name)
    }

    /// Path of an instance node
    pub fn for_instance(&self, name: &str, id: &str) -> String {
        join_path(&self.for_name(name), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = ServicePaths::new("/services/");
        assert_eq!(paths.base(), "/services");
        assert_eq!(paths.for_name("api"), "/services/api");
        assert_eq!(paths.for_instance("api", "1"), "/services/api/1");
    }
}
