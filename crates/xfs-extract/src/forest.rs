//! Arena-backed record of everything extracted during a run.
//!
//! Nodes refer to each other by index only. Each extractor pass gets a
//! synthetic root directory node whose parent is the node of the artifact it
//! ran on, so the forest is a DAG of passes hanging off artifact files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::entry::{NodeKind, ProducedEntry};
use crate::plugin::Strategy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArtifactId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PassId(pub usize);

#[derive(Clone, Debug)]
pub struct ExtractionNode {
    pub id: NodeId,
    /// `None` only for the firmware image itself.
    pub pass: Option<PassId>,
    pub parent: Option<NodeId>,
    /// Path relative to the pass output directory; empty for pass roots.
    pub path: PathBuf,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub digest: Option<String>,
    /// Content warrants another round of extraction.
    pub recurse: bool,
    pub children: Vec<NodeId>,
}

impl ExtractionNode {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File)
    }

    pub fn is_executable(&self) -> bool {
        self.is_file() && self.mode & 0o111 != 0
    }
}

/// A byte blob queued for extraction.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: ArtifactId,
    pub node: NodeId,
    pub path: PathBuf,
    pub depth: usize,
    pub size: u64,
    pub digest: String,
    pub parent: Option<ArtifactId>,
}

/// One (extractor, artifact) invocation and where its output lives.
#[derive(Clone, Debug)]
pub struct Pass {
    pub id: PassId,
    pub extractor: String,
    pub strategy: Strategy,
    pub artifact: ArtifactId,
    pub output_dir: PathBuf,
    pub root: NodeId,
}

#[derive(Debug, Default)]
pub struct ExtractionForest {
    nodes: Vec<ExtractionNode>,
    artifacts: Vec<Artifact>,
    passes: Vec<Pass>,
}

impl ExtractionForest {
    /// Start a forest whose only node is the firmware image.
    pub fn new(firmware: impl Into<PathBuf>, size: u64, digest: impl Into<String>) -> Self {
        let digest = digest.into();
        let mut forest = Self::default();
        let node = forest.push_node(ExtractionNode {
            id: NodeId(0),
            pass: None,
            parent: None,
            path: PathBuf::new(),
            kind: NodeKind::File,
            size,
            mode: 0o644,
            digest: Some(digest.clone()),
            recurse: false,
            children: Vec::new(),
        });
        forest.artifacts.push(Artifact {
            id: ArtifactId(0),
            node,
            path: firmware.into(),
            depth: 0,
            size,
            digest,
            parent: None,
        });
        forest
    }

    pub fn firmware(&self) -> &Artifact {
        &self.artifacts[0]
    }

    pub fn node(&self, id: NodeId) -> &ExtractionNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[ExtractionNode] {
        &self.nodes
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id.0]
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn pass(&self, id: PassId) -> &Pass {
        &self.passes[id.0]
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    /// Absolute location of a node inside the scratch workspace.
    pub fn disk_path(&self, id: NodeId) -> PathBuf {
        let node = self.node(id);
        match node.pass {
            Some(pass) if node.path.as_os_str().is_empty() => self.pass(pass).output_dir.clone(),
            Some(pass) => self.pass(pass).output_dir.join(&node.path),
            None => self.firmware().path.clone(),
        }
    }

    /// Register a file node of an earlier pass as a new artifact.
    pub fn add_artifact(&mut self, node: NodeId, depth: usize, parent: ArtifactId) -> ArtifactId {
        let id = ArtifactId(self.artifacts.len());
        let extraction_node = self.node(node);
        let artifact = Artifact {
            id,
            node,
            path: self.disk_path(node),
            depth,
            size: extraction_node.size,
            digest: extraction_node.digest.clone().unwrap_or_default(),
            parent: Some(parent),
        };
        self.artifacts.push(artifact);
        id
    }

    /// Append the output of one pass, synthesizing missing parent directories.
    pub fn add_pass(
        &mut self,
        extractor: impl Into<String>,
        strategy: Strategy,
        artifact: ArtifactId,
        output_dir: impl Into<PathBuf>,
        entries: &[ProducedEntry],
    ) -> PassId {
        let pass = PassId(self.passes.len());
        let origin = self.artifact(artifact).node;
        let root = self.push_node(ExtractionNode {
            id: NodeId(0),
            pass: Some(pass),
            parent: Some(origin),
            path: PathBuf::new(),
            kind: NodeKind::Directory,
            size: 0,
            mode: 0o755,
            digest: None,
            recurse: false,
            children: Vec::new(),
        });
        self.nodes[origin.0].children.push(root);
        self.passes.push(Pass {
            id: pass,
            extractor: extractor.into(),
            strategy,
            artifact,
            output_dir: output_dir.into(),
            root,
        });

        let mut sorted: Vec<&ProducedEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut by_path: HashMap<PathBuf, NodeId> = HashMap::new();
        by_path.insert(PathBuf::new(), root);
        for entry in sorted {
            if by_path.contains_key(&entry.path) {
                continue;
            }
            let parent = self.ensure_dir(pass, &mut by_path, entry.path.parent().unwrap_or(Path::new("")));
            let id = self.push_node(ExtractionNode {
                id: NodeId(0),
                pass: Some(pass),
                parent: Some(parent),
                path: entry.path.clone(),
                kind: entry.kind.clone(),
                size: entry.size,
                mode: entry.mode,
                digest: entry.digest.clone(),
                recurse: entry.recurse,
                children: Vec::new(),
            });
            self.nodes[parent.0].children.push(id);
            by_path.insert(entry.path.clone(), id);
        }
        pass
    }

    fn ensure_dir(&mut self, pass: PassId, by_path: &mut HashMap<PathBuf, NodeId>, path: &Path) -> NodeId {
        if let Some(&id) = by_path.get(path) {
            return id;
        }
        let parent = self.ensure_dir(pass, by_path, path.parent().unwrap_or(Path::new("")));
        let id = self.push_node(ExtractionNode {
            id: NodeId(0),
            pass: Some(pass),
            parent: Some(parent),
            path: path.to_path_buf(),
            kind: NodeKind::Directory,
            size: 0,
            mode: 0o755,
            digest: None,
            recurse: false,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        by_path.insert(path.to_path_buf(), id);
        id
    }

    fn push_node(&mut self, mut node: ExtractionNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        self.nodes.push(node);
        id
    }

    /// Nodes below `id` within the same pass, depth first, children in path order.
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        let pass = self.node(id).pass;
        let mut stack: Vec<NodeId> = self.node(id).children.clone();
        stack.reverse();
        Descendants {
            forest: self,
            pass,
            stack,
        }
    }

    /// Whether `artifact` or one of its ancestors has content `digest`.
    pub fn is_ancestor_digest(&self, artifact: ArtifactId, digest: &str) -> bool {
        let mut current = Some(artifact);
        while let Some(id) = current {
            let artifact = self.artifact(id);
            if artifact.digest == digest {
                return true;
            }
            current = artifact.parent;
        }
        false
    }
}

pub struct Descendants<'f> {
    forest: &'f ExtractionForest,
    pass: Option<PassId>,
    stack: Vec<NodeId>,
}

impl<'f> Iterator for Descendants<'f> {
    type Item = &'f ExtractionNode;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.stack.pop()?;
            let node = self.forest.node(id);
            if node.pass != self.pass {
                continue;
            }
            self.stack.extend(node.children.iter().rev().copied());
            return Some(node);
        }
    }
}
