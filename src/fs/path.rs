//! Absolute path handling.
//!
//! All paths are absolute POSIX-style paths rooted at the mount point.
//! Resolution never escapes the root: `..` (and `.`) are rejected outright
//! rather than interpreted.

use super::layout::NAME_LEN;

/// The reasons a path can be rejected before touching the volume.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathError {
    /// The path does not start with `/`.
    Relative,
    /// The path contains an empty component (`//`).
    EmptyComponent,
    /// The path contains `.` or `..`.
    Traversal,
    /// A component is longer than [`NAME_LEN`] bytes.
    ComponentTooLong,
    /// A component contains a byte outside printable ASCII.
    BadCharacter,
    /// The operation needs a named target but the path is the bare root.
    IsRoot,
}

/// Validate `path` and iterate its components.
pub fn components(path: &str) -> Result<Components<'_>, PathError> {
    if !path.starts_with('/') {
        return Err(PathError::Relative);
    }
    // A single trailing slash is tolerated: "/logs/" names "/logs".
    let trimmed = if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    };
    if trimmed.len() > 1 {
        for component in trimmed[1..].split('/') {
            validate_component(component)?;
        }
    }
    Ok(Components {
        rest: &trimmed[1..],
    })
}

/// Split `path` into its parent directory path and final name component.
pub fn split_parent(path: &str) -> Result<(&str, &str), PathError> {
    let trimmed = if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    };
    // Validates everything up front so callers only deal with good parts.
    components(trimmed)?;
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() == 1 => Err(PathError::IsRoot),
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Err(PathError::Relative),
    }
}

fn validate_component(component: &str) -> Result<(), PathError> {
    if component.is_empty() {
        return Err(PathError::EmptyComponent);
    }
    if component == "." || component == ".." {
        return Err(PathError::Traversal);
    }
    if component.len() > NAME_LEN {
        return Err(PathError::ComponentTooLong);
    }
    if !component.bytes().all(|b| (0x21..=0x7E).contains(&b)) {
        return Err(PathError::BadCharacter);
    }
    Ok(())
}

/// Iterator over the validated components of an absolute path.
///
/// The bare root yields no components.
pub struct Components<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Components<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.find('/') {
            Some(idx) => {
                let component = &self.rest[..idx];
                self.rest = &self.rest[idx + 1..];
                Some(component)
            }
            None => {
                let component = self.rest;
                self.rest = "";
                Some(component)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(path: &str) -> Vec<&str> {
        components(path).unwrap().collect()
    }

    #[test]
    fn splits_components() {
        assert_eq!(collect("/"), Vec::<&str>::new());
        assert_eq!(collect("/a.txt"), vec!["a.txt"]);
        assert_eq!(collect("/logs/2024/jan.csv"), vec!["logs", "2024", "jan.csv"]);
        assert_eq!(collect("/logs/"), vec!["logs"]);
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(matches!(components("relative"), Err(PathError::Relative)));
        assert!(matches!(components("a/b"), Err(PathError::Relative)));
        assert!(matches!(components("/a//b"), Err(PathError::EmptyComponent)));
        assert!(matches!(components("/../etc"), Err(PathError::Traversal)));
        assert!(matches!(components("/a/./b"), Err(PathError::Traversal)));
        assert!(matches!(
            components("/this-name-is-way-too-long-to-store"),
            Err(PathError::ComponentTooLong)
        ));
        assert!(matches!(components("/with space"), Err(PathError::BadCharacter)));
    }

    #[test]
    fn splits_parents() {
        assert_eq!(split_parent("/a.txt"), Ok(("/", "a.txt")));
        assert_eq!(split_parent("/logs/jan.csv"), Ok(("/logs", "jan.csv")));
        assert_eq!(split_parent("/logs/"), Ok(("/", "logs")));
        assert_eq!(split_parent("/"), Err(PathError::IsRoot));
    }
}
