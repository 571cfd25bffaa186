//! Path arithmetic over workspace-absolute, `/`-separated paths.
//!
//! The runtime never touches the host filesystem for module resolution; all
//! paths are normalized strings against the in-memory file registry, so the
//! helpers here are deliberately string-level.

/// Separator used when serialising path lists (module identifiers).
pub const PATH_LIST_SEPARATOR: char = ':';

/// Directory segment that marks installed packages.
pub const NODE_MODULES_SEGMENT: &str = "node_modules";

/// Collapse `.` and `..` segments and duplicate slashes into a canonical
/// absolute path.
pub fn normalize_absolute(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            value => stack.push(value),
        }
    }

    if stack.is_empty() {
        return "/".to_string();
    }

    format!("/{}", stack.join("/"))
}

/// Join a child onto a base directory; absolute children win.
pub fn join(base: &str, child: &str) -> String {
    if child.starts_with('/') {
        return child.to_string();
    }

    if base.ends_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}

/// Parent directory of a normalized path; the root is its own parent.
pub fn dirname(path: &str) -> String {
    let normalized = normalize_absolute(path);
    if normalized == "/" {
        return normalized;
    }

    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => normalized[..index].to_string(),
    }
}

/// Final segment of a path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// File extension including the dot, or empty.
pub fn extension(path: &str) -> &str {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => "",
        Some(index) => &name[index..],
    }
}

/// Whether the path contains an installed-package segment.
pub fn in_node_modules(path: &str) -> bool {
    path.split('/').any(|segment| segment == NODE_MODULES_SEGMENT)
}

/// Whether the specifier is relative (`./x`, `../x`).
pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../")
}

/// Render a path relative to a root directory for user-facing messages.
pub fn relative_to(root: &str, path: &str) -> String {
    let root = normalize_absolute(root);
    let path = normalize_absolute(path);
    let prefix = if root.ends_with('/') {
        root.clone()
    } else {
        format!("{root}/")
    };
    match path.strip_prefix(&prefix) {
        Some(stripped) => stripped.to_string(),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_dot_segments() {
        assert_eq!(normalize_absolute("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_absolute("/a//b/"), "/a/b");
        assert_eq!(normalize_absolute("/.."), "/");
    }

    #[test]
    fn dirname_and_basename_split_cleanly() {
        assert_eq!(dirname("/t/sub/M.js"), "/t/sub");
        assert_eq!(dirname("/top.js"), "/");
        assert_eq!(basename("/t/sub/M.js"), "M.js");
        assert_eq!(extension("/t/sub/M.js"), ".js");
        assert_eq!(extension("/t/sub/M"), "");
        assert_eq!(extension("/t/.hidden"), "");
    }

    #[test]
    fn node_modules_detection_matches_whole_segments() {
        assert!(in_node_modules("/p/node_modules/A/index.js"));
        assert!(!in_node_modules("/p/my_node_modules_fork/index.js"));
    }

    #[test]
    fn relative_rendering_strips_the_root() {
        assert_eq!(relative_to("/repo", "/repo/src/a.js"), "src/a.js");
        assert_eq!(relative_to("/repo", "/elsewhere/a.js"), "/elsewhere/a.js");
    }
}
