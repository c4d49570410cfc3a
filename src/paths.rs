//! Path plumbing shared by both engines: containment-checked joins,
//! root-relative wire strings, remote-to-local translation and listing.
//!
//! Wire paths are always relative to the shared root, use `/` separators,
//! and the root itself is the empty string.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};
use regex::Regex;
use walkdir::WalkDir;

/// Join a wire-supplied relative path onto `root`, rejecting anything that
/// could step outside it: parent components, absolute paths, NUL bytes.
pub fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.contains('\0') {
        bail!("path contains NUL byte");
    }
    let mut joined = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("path {rel:?} contains disallowed component");
            }
        }
    }
    Ok(joined)
}

/// Root-relative wire form of `path`, or `None` if it is not under `root`.
pub fn rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Whether `path` equals `prefix` or lies inside it. The empty prefix (the
/// shared root) contains everything.
pub fn within(prefix: &str, path: &str) -> bool {
    prefix.is_empty() || path == prefix || path.starts_with(&format!("{prefix}/"))
}

/// Translate a remote wire path into the local mirror: substitute the
/// synced remote root with the local target directory.
pub fn translate(remote: &str, remote_root: &str, target: &Path) -> Result<PathBuf> {
    if !within(remote_root, remote) {
        bail!("remote path {remote:?} is outside synced root {remote_root:?}");
    }
    let rest = if remote_root.is_empty() {
        remote
    } else {
        remote[remote_root.len()..].trim_start_matches('/')
    };
    resolve_under(target, rest)
}

/// Whether the ignore pattern drops this wire path.
pub fn ignored(ignore: Option<&Regex>, rel: &str) -> bool {
    ignore.is_some_and(|re| re.is_match(rel))
}

/// Recursively list every file under `root` as sorted root-relative wire
/// paths, skipping ignored entries (an ignored directory hides its whole
/// subtree).
pub fn list_files(root: &Path, ignore: Option<&Regex>) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            rel_string(root, entry.path())
                .is_none_or(|rel| rel.is_empty() || !ignored(ignore, &rel))
        });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = rel_string(root, entry.path()) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Default)]
struct TreeNode {
    children: BTreeMap<String, TreeNode>,
}

/// Render a flat listing of wire paths as an ASCII tree, the way the
/// `inspect` subcommand prints it.
pub fn draw_tree(root_label: &str, paths: &[String]) -> String {
    let mut root = TreeNode::default();
    for path in paths {
        let mut node = &mut root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children.entry(part.to_string()).or_default();
        }
    }
    let mut out = format!("-- {root_label}\n");
    draw_items(&root, "", &mut out);
    out
}

fn draw_items(node: &TreeNode, prepend: &str, out: &mut String) {
    let count = node.children.len();
    for (i, (name, child)) in node.children.iter().enumerate() {
        out.push_str(prepend);
        out.push_str("    |\n");
        out.push_str(prepend);
        out.push_str("    |-- ");
        out.push_str(name);
        out.push('\n');
        if !child.children.is_empty() {
            let offset = if i + 1 == count { "     " } else { "    |" };
            draw_items(child, &format!("{prepend}{offset}"), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn resolve_under_accepts_safe_paths() {
        let root = Path::new("/srv/shared");
        assert_eq!(
            resolve_under(root, "sub/file.txt").unwrap(),
            root.join("sub/file.txt")
        );
        assert_eq!(resolve_under(root, "").unwrap(), root);
        assert_eq!(
            resolve_under(root, "./sub/./x").unwrap(),
            root.join("sub/x")
        );
    }

    #[test]
    fn resolve_under_rejects_escapes() {
        let root = Path::new("/srv/shared");
        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "sub/../../etc").is_err());
        assert!(resolve_under(root, "/etc/passwd").is_err());
        assert!(resolve_under(root, "bad\0name").is_err());
    }

    #[test]
    fn rel_string_round_trips() {
        let root = Path::new("/srv/shared");
        assert_eq!(
            rel_string(root, &root.join("a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(rel_string(root, root).as_deref(), Some(""));
        assert_eq!(rel_string(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn within_prefix_matching() {
        assert!(within("", "anything/at/all"));
        assert!(within("sub", "sub"));
        assert!(within("sub", "sub/file.txt"));
        assert!(!within("sub", "subdir/file.txt"));
        assert!(!within("sub", "other"));
    }

    #[test]
    fn translate_substitutes_roots() {
        let target = Path::new("/tmp/mirror");
        assert_eq!(
            translate("sub/b.txt", "sub", target).unwrap(),
            target.join("b.txt")
        );
        assert_eq!(
            translate("a.txt", "", target).unwrap(),
            target.join("a.txt")
        );
        assert_eq!(translate("sub", "sub", target).unwrap(), target);
        assert!(translate("other/b.txt", "sub", target).is_err());
    }

    #[test]
    fn list_files_recurses_and_filters() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("x.txt"), "x").unwrap();
        fs::create_dir(tmp.path().join("y")).unwrap();
        fs::write(tmp.path().join("y/z.txt"), "z").unwrap();
        fs::write(tmp.path().join("skip.log"), "no").unwrap();

        let all = list_files(tmp.path(), None).unwrap();
        assert_eq!(all, vec!["skip.log", "x.txt", "y/z.txt"]);

        let ignore = Regex::new(r"\.log$").unwrap();
        let kept = list_files(tmp.path(), Some(&ignore)).unwrap();
        assert_eq!(kept, vec!["x.txt", "y/z.txt"]);
    }

    #[test]
    fn ignored_directory_hides_subtree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("node_modules")).unwrap();
        fs::write(tmp.path().join("node_modules/dep.js"), "x").unwrap();
        fs::write(tmp.path().join("main.rs"), "x").unwrap();

        let ignore = Regex::new("^node_modules").unwrap();
        let kept = list_files(tmp.path(), Some(&ignore)).unwrap();
        assert_eq!(kept, vec!["main.rs"]);
    }

    #[test]
    fn draw_tree_renders_nested_entries() {
        let paths = vec!["a.txt".to_string(), "sub/b.txt".to_string()];
        let tree = draw_tree("shared", &paths);
        assert!(tree.starts_with("-- shared\n"));
        assert!(tree.contains("|-- a.txt"));
        assert!(tree.contains("|-- sub"));
        assert!(tree.contains("|-- b.txt"));
    }
}
