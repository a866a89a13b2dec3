//! A typed, serialisable path trie: an arena of nodes connected by
//! named parent-to-child edges, with a per-node string-keyed attribute
//! store. This is the data structure the rest of the crate calls the
//! Path Graph.

use std::io::{Read, Write};

use anyhow::{Context, Result, bail, ensure};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Handle into a [`PathGraph`]'s node arena. Stable for the lifetime of
/// the graph; invalidated only by nothing (nodes are never removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Directory,
    File,
}

/// One of the two shapes a node attribute can take: free text, or a
/// dense row-major byte matrix (used for stored perceptual/cryptographic
/// hashes, which are small fixed-shape buffers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Text(String),
    Matrix {
        width: u32,
        height: u32,
        element_type: String,
        element_size: u32,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl Attribute {
    /// Convenience constructor for the common case of stashing a flat
    /// byte buffer (e.g. a perceptual hash) as a 1×N matrix of bytes.
    pub fn bytes(payload: Vec<u8>) -> Attribute {
        let len = payload.len() as u32;
        Attribute::Matrix {
            width: len,
            height: 1,
            element_type: "u8".to_string(),
            element_size: 1,
            payload,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Attribute::Text(s) => Some(s),
            Attribute::Matrix { .. } => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Matrix { payload, .. } => Some(payload),
            Attribute::Text(_) => None,
        }
    }
}

struct NodeRecord {
    node_type: NodeType,
    /// None only for the root.
    parent: Option<NodeId>,
    /// The edge name from the parent to this node; None only for the root.
    name: Option<String>,
    children: Vec<NodeId>,
    attributes: FxHashMap<String, Attribute>,
}

/// In-memory arena-backed path trie. See the module docs.
///
/// The lookup cache is advisory and never serialised; it is cleared on
/// any mutation that could invalidate a cached resolution (currently
/// just [`PathGraph::rename_node`]).
pub struct PathGraph {
    nodes: Vec<NodeRecord>,
    lookup_cache: FxHashMap<u64, NodeId>,
}

impl PathGraph {
    pub fn new() -> PathGraph {
        let root = NodeRecord {
            node_type: NodeType::Directory,
            parent: None,
            name: None,
            children: Vec::new(),
            attributes: FxHashMap::default(),
        };
        PathGraph {
            nodes: vec![root],
            lookup_cache: FxHashMap::default(),
        }
    }

    fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.nodes[id.0 as usize]
    }

    fn segment_hash(segments: &[String]) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = rustc_hash::FxHasher::default();
        segments.hash(&mut h);
        h.finish()
    }

    /// Creates all missing ancestors as directories and the final node
    /// with the given type. A no-op on an empty segment list. If the
    /// terminal node already exists its type is left untouched.
    pub fn add_node(&mut self, segments: &[String], node_type: NodeType) -> NodeId {
        if segments.is_empty() {
            return NodeId::ROOT;
        }

        let mut current = NodeId::ROOT;
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            let existing = self
                .node(current)
                .children
                .iter()
                .copied()
                .find(|&child| self.node(child).name.as_deref() == Some(segment.as_str()));

            current = match existing {
                Some(child) => child,
                None => {
                    let child_type = if is_last {
                        node_type
                    } else {
                        NodeType::Directory
                    };
                    let id = NodeId(self.nodes.len() as u32);
                    self.nodes.push(NodeRecord {
                        node_type: child_type,
                        parent: Some(current),
                        name: Some(segment.clone()),
                        children: Vec::new(),
                        attributes: FxHashMap::default(),
                    });
                    self.node_mut(current).children.push(id);
                    id
                }
            };
        }

        self.lookup_cache
            .insert(Self::segment_hash(segments), current);
        current
    }

    /// Resolves a segment list to a node, if one exists. The empty
    /// list, or the single segment ".", resolves to the root.
    pub fn get_node(&self, segments: &[String]) -> Option<NodeId> {
        if segments.is_empty() || (segments.len() == 1 && segments[0] == ".") {
            return Some(NodeId::ROOT);
        }

        let key = Self::segment_hash(segments);
        if let Some(&cached) = self.lookup_cache.get(&key) {
            return Some(cached);
        }

        let mut current = NodeId::ROOT;
        for segment in segments {
            let next = self
                .node(current)
                .children
                .iter()
                .copied()
                .find(|&child| self.node(child).name.as_deref() == Some(segment.as_str()))?;
            current = next;
        }
        Some(current)
    }

    pub fn get_node_type(&self, id: NodeId) -> NodeType {
        self.node(id).node_type
    }

    pub fn get_node_children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All node ids in arena order (root first). Order beyond that is
    /// implementation-defined.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Walks parent edges back to the root to reconstruct the segment
    /// list for `id`.
    pub fn get_node_path(&self, id: NodeId) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = id;
        while current != NodeId::ROOT {
            let record = self.node(current);
            let name = record.name.clone().ok_or_else(|| {
                AnalysisError::StructuralInvariantViolated(format!(
                    "node {current:?} has no edge name"
                ))
            })?;
            segments.push(name);
            current = record.parent.ok_or_else(|| {
                AnalysisError::StructuralInvariantViolated(format!(
                    "node {current:?} has no parent"
                ))
            })?;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Renames the incoming edge of the target node. Returns false
    /// (without effect) if `segments` resolves to the root, since the
    /// root has no incoming edge to rename.
    pub fn rename_node(&mut self, segments: &[String], new_name: &str) -> bool {
        let Some(id) = self.get_node(segments) else {
            return false;
        };
        if id == NodeId::ROOT {
            return false;
        }
        self.node_mut(id).name = Some(new_name.to_string());
        self.lookup_cache.clear();
        true
    }

    pub fn set_node_metadata(
        &mut self,
        id: NodeId,
        key: &str,
        value: Attribute,
    ) -> Option<Attribute> {
        self.node_mut(id).attributes.insert(key.to_string(), value)
    }

    pub fn get_node_metadata(&self, id: NodeId, key: &str) -> Option<&Attribute> {
        self.node(id).attributes.get(key)
    }

    pub fn remove_node_metadata(&mut self, id: NodeId, key: &str) -> Option<Attribute> {
        self.node_mut(id).attributes.remove(key)
    }

    /// Structural equality: same node/edge count and, for every node
    /// reachable in the same traversal order, the same type and
    /// attribute map. Used by round-trip tests.
    pub fn structurally_equals(&self, other: &PathGraph) -> bool {
        if self.nodes.len() != other.nodes.len() {
            return false;
        }
        for (a, b) in self.nodes.iter().zip(other.nodes.iter()) {
            if a.node_type != b.node_type || a.name != b.name || a.parent != b.parent {
                return false;
            }
            if a.attributes.len() != b.attributes.len() {
                return false;
            }
            for (k, v) in &a.attributes {
                if b.attributes.get(k) != Some(v) {
                    return false;
                }
            }
        }
        true
    }

    pub fn serialise(&self, writer: &mut impl Write) -> Result<()> {
        let wire = WireGraph::from_graph(self);
        ciborium::into_writer(&wire, writer).context("failed to serialise path graph")
    }

    pub fn deserialise(reader: &mut impl Read) -> Result<PathGraph> {
        let wire: WireGraph =
            ciborium::from_reader(reader).context("failed to deserialise path graph")?;
        wire.into_graph()
    }
}

impl Default for PathGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct WireNode {
    node_type: NodeType,
    attributes: Vec<(String, Attribute)>,
}

#[derive(Serialize, Deserialize)]
struct WireEdge {
    parent: u32,
    child: u32,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct WireGraph {
    nodes: Vec<WireNode>,
    edges: Vec<WireEdge>,
}

impl WireGraph {
    fn from_graph(graph: &PathGraph) -> WireGraph {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| WireNode {
                node_type: n.node_type,
                attributes: n
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect();

        let mut edges = Vec::new();
        for (i, record) in graph.nodes.iter().enumerate() {
            for &child in &record.children {
                edges.push(WireEdge {
                    parent: i as u32,
                    child: child.0,
                    name: graph.node(child).name.clone().unwrap_or_default(),
                });
            }
        }

        WireGraph { nodes, edges }
    }

    fn into_graph(self) -> Result<PathGraph> {
        ensure!(!self.nodes.is_empty(), "path graph has no root node");

        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .into_iter()
            .map(|n| NodeRecord {
                node_type: n.node_type,
                parent: None,
                name: None,
                children: Vec::new(),
                attributes: n.attributes.into_iter().collect(),
            })
            .collect();

        for edge in &self.edges {
            let (parent, child) = (edge.parent as usize, edge.child as usize);
            if parent >= nodes.len() || child >= nodes.len() {
                bail!("path graph edge references out-of-range node");
            }
            nodes[child].parent = Some(NodeId(edge.parent));
            nodes[child].name = Some(edge.name.clone());
            nodes[parent].children.push(NodeId(edge.child));
        }

        Ok(PathGraph {
            nodes,
            lookup_cache: FxHashMap::default(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn add_and_get_node() {
        let mut g = PathGraph::new();
        let id = g.add_node(&segs(&["a", "b", "c.jpg"]), NodeType::File);
        assert_eq!(g.get_node_type(id), NodeType::File);
        assert_eq!(g.get_node(&segs(&["a", "b", "c.jpg"])), Some(id));
        assert_eq!(g.get_node_path(id).unwrap(), segs(&["a", "b", "c.jpg"]));
    }

    #[test]
    fn empty_segments_is_root() {
        let g = PathGraph::new();
        assert_eq!(g.get_node(&[]), Some(NodeId::ROOT));
        assert_eq!(g.get_node(&segs(&["."])), Some(NodeId::ROOT));
    }

    #[test]
    fn add_node_does_not_duplicate_or_downgrade() {
        let mut g = PathGraph::new();
        let dir = g.add_node(&segs(&["photos"]), NodeType::Directory);
        let again = g.add_node(&segs(&["photos"]), NodeType::File);
        assert_eq!(dir, again);
        assert_eq!(g.get_node_type(dir), NodeType::Directory);
    }

    #[test]
    fn metadata_roundtrip() {
        let mut g = PathGraph::new();
        let id = g.add_node(&segs(&["a.jpg"]), NodeType::File);
        assert_eq!(
            g.set_node_metadata(id, "k", Attribute::Text("v1".into())),
            None
        );
        assert_eq!(
            g.get_node_metadata(id, "k"),
            Some(&Attribute::Text("v1".into()))
        );
        assert_eq!(
            g.set_node_metadata(id, "k", Attribute::Text("v2".into())),
            Some(Attribute::Text("v1".into()))
        );
        assert_eq!(
            g.remove_node_metadata(id, "k"),
            Some(Attribute::Text("v2".into()))
        );
        assert_eq!(g.get_node_metadata(id, "k"), None);
    }

    #[test]
    fn rename_invalidates_lookup() {
        let mut g = PathGraph::new();
        g.add_node(&segs(&["a.jpg"]), NodeType::File);
        assert!(g.rename_node(&segs(&["a.jpg"]), "b.jpg"));
        assert_eq!(g.get_node(&segs(&["a.jpg"])), None);
        assert!(g.get_node(&segs(&["b.jpg"])).is_some());
    }

    #[test]
    fn root_cannot_be_renamed() {
        let mut g = PathGraph::new();
        assert!(!g.rename_node(&[], "whatever"));
    }

    #[test]
    fn serialise_round_trips() {
        let mut g = PathGraph::new();
        let id = g.add_node(&segs(&["dir", "photo.jpg"]), NodeType::File);
        g.set_node_metadata(id, "HASH_AVERAGE_HASH", Attribute::bytes(vec![1, 2, 3]));

        let mut buf = Vec::new();
        g.serialise(&mut buf).unwrap();
        let g2 = PathGraph::deserialise(&mut &buf[..]).unwrap();

        assert!(g.structurally_equals(&g2));
    }
}
