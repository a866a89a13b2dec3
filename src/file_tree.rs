//! Anchors a [`PathGraph`] to a concrete filesystem root and exposes
//! path-keyed [`Element`] handles over it. Mirrors the way the
//! reference tool's own `fs_tree` walks a directory into a `tree::Tree`,
//! but serves lookups rather than content-addressed chunking.

use std::fs;
use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{trace, warn};

use crate::path_graph::{Attribute, NodeId, NodeType, PathGraph};

/// Magic prefix written at the start of a cache file so a wrong-format
/// file is rejected immediately rather than partially parsed.
const CACHE_MAGIC: &[u8; 8] = b"ALBMGRPH";

pub struct FileTree {
    root: Utf8PathBuf,
    graph: PathGraph,
}

/// A value-typed handle into a [`FileTree`]: a type tag plus an
/// absolute path. Cheap to copy; callers must tolerate the underlying
/// file having vanished since the tree was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub node_type: NodeType,
    pub path: Utf8PathBuf,
}

impl FileTree {
    /// Recursively walks `path`, inserting a directory node for every
    /// directory and a file node for every regular file. Symlinks are
    /// followed as the platform's directory-iteration API follows them;
    /// symlink loops are not detected or handled.
    pub fn build(path: &Utf8Path) -> Result<FileTree> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to stat {path}"))?;
        if !metadata.is_dir() {
            bail!("not a directory: {path}");
        }

        let root = path
            .canonicalize_utf8()
            .with_context(|| format!("failed to canonicalize {path}"))?;

        let mut graph = PathGraph::new();
        walk_into(&root, &root, &mut graph)?;

        Ok(FileTree { root, graph })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn graph(&self) -> &PathGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut PathGraph {
        &mut self.graph
    }

    /// Deserialises a tree previously written by [`FileTree::to_stream`].
    /// Any parse failure (truncated file, bad magic, unknown attribute
    /// variant) is reported as an error rather than panicking; callers
    /// treat that as "cache corrupt" and fall back to a fresh walk.
    pub fn from_stream(reader: &mut impl Read) -> Result<FileTree> {
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .context("cache file too short to contain a magic prefix")?;
        if &magic != CACHE_MAGIC {
            bail!("cache file has the wrong magic prefix");
        }

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).context("truncated cache file")?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut root_buf = vec![0u8; len];
        reader.read_exact(&mut root_buf).context("truncated cache file")?;
        let root = Utf8PathBuf::from(
            String::from_utf8(root_buf).context("cache file root path is not valid UTF-8")?,
        );

        let graph = PathGraph::deserialise(reader)?;

        Ok(FileTree { root, graph })
    }

    /// Writes the binary form: magic, length-prefixed root path, then
    /// the serialised path graph.
    pub fn to_stream(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(CACHE_MAGIC)?;
        let root_bytes = self.root.as_str().as_bytes();
        writer.write_all(&(root_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(root_bytes)?;
        self.graph.serialise(writer)
    }

    /// True iff `path` is the root or a descendant of it.
    pub fn is_subpath(&self, path: &Utf8Path) -> bool {
        subpath_segments(&self.root, path).is_some()
    }

    fn segments_for(&self, path: &Utf8Path) -> Option<Vec<String>> {
        subpath_segments(&self.root, path)
    }

    pub fn get_element(&self, path: &Utf8Path) -> Option<Element> {
        let segments = self.segments_for(path)?;
        let id = self.graph.get_node(&segments)?;
        Some(Element {
            node_type: self.graph.get_node_type(id),
            path: path.to_path_buf(),
        })
    }

    pub fn get_root_element(&self) -> Element {
        Element {
            node_type: NodeType::Directory,
            path: self.root.clone(),
        }
    }

    /// Appends the children of `path` to `out`. Returns false if `path`
    /// is not a node in the tree.
    pub fn get_elements_under_path(&self, path: &Utf8Path, out: &mut Vec<Element>) -> bool {
        let Some(segments) = self.segments_for(path) else {
            return false;
        };
        let Some(id) = self.graph.get_node(&segments) else {
            return false;
        };

        for &child in self.graph.get_node_children(id) {
            let Ok(child_segments) = self.graph.get_node_path(child) else {
                continue;
            };
            let mut child_path = self.root.clone();
            for s in &child_segments {
                child_path.push(s);
            }
            out.push(Element {
                node_type: self.graph.get_node_type(child),
                path: child_path,
            });
        }
        true
    }

    pub fn set_metadata(&mut self, path: &Utf8Path, key: &str, value: Attribute) -> Option<Attribute> {
        let segments = self.segments_for(path)?;
        let id = self.graph.get_node(&segments)?;
        self.graph.set_node_metadata(id, key, value)
    }

    pub fn get_metadata(&self, path: &Utf8Path, key: &str) -> Option<&Attribute> {
        let segments = self.segments_for(path)?;
        let id = self.graph.get_node(&segments)?;
        self.graph.get_node_metadata(id, key)
    }

    pub fn remove_metadata(&mut self, path: &Utf8Path, key: &str) -> Option<Attribute> {
        let segments = self.segments_for(path)?;
        let id = self.graph.get_node(&segments)?;
        self.graph.remove_node_metadata(id, key)
    }

    /// Yields every Element, including the root, exactly once. Order is
    /// implementation-defined (arena insertion order).
    pub fn iter(&self) -> impl Iterator<Item = Element> + '_ {
        self.graph.node_ids().map(move |id| {
            if id == NodeId::ROOT {
                return self.get_root_element();
            }
            let segments = self
                .graph
                .get_node_path(id)
                .expect("node reachable from arena order has a valid path");
            let mut path = self.root.clone();
            for s in &segments {
                path.push(s);
            }
            Element {
                node_type: self.graph.get_node_type(id),
                path,
            }
        })
    }
}

fn walk_into(root: &Utf8Path, dir: &Utf8Path, graph: &mut PathGraph) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read directory {dir}"))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to iterate directory {dir}"))?;
        let path = match Utf8PathBuf::from_path_buf(entry.path()) {
            Ok(p) => p,
            Err(raw) => {
                warn!("skipping non-UTF-8 path {}", raw.display());
                continue;
            }
        };

        let metadata = match entry.file_type().and_then(|ft| {
            if ft.is_symlink() {
                fs::metadata(&path)
            } else {
                entry.metadata()
            }
        }) {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {path}: {e}");
                continue;
            }
        };

        let Some(segments) = subpath_segments(root, &path) else {
            continue;
        };

        if metadata.is_dir() {
            graph.add_node(&segments, NodeType::Directory);
            walk_into(root, &path, graph)?;
        } else if metadata.is_file() {
            graph.add_node(&segments, NodeType::File);
        } else {
            trace!("skipping non-regular entry {path}");
        }
    }

    Ok(())
}

/// Computes the segment list for `path` relative to `root`, or `None`
/// if `path` is not `root` or a descendant of it.
fn subpath_segments(root: &Utf8Path, path: &Utf8Path) -> Option<Vec<String>> {
    if path == root {
        return Some(Vec::new());
    }

    let relative = path.strip_prefix(root).ok()?;
    let mut segments: Vec<String> = Vec::new();
    for component in relative.components() {
        let s = component.as_str();
        if s == ".." {
            return None;
        }
        if s.is_empty() || s == "." {
            continue;
        }
        segments.push(s.to_string());
    }

    if segments.is_empty() {
        Some(Vec::new())
    } else {
        Some(segments)
    }
}
