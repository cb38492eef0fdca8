//! Reference resolution: RFC 6901 JSON pointers and external documents.
//!
//! Local references (`#/...`) navigate the current document. External
//! references load `file://`, `http(s)://`, or `stdlib:` URIs, cached per
//! URI, with a depth bound and cycle detection over the chain of loaded
//! URIs. Chained `$ref` -> `$ref` aliases are followed until a concrete
//! value appears.
//!
//! AIR documents additionally forbid recursion outright: any local `$ref`
//! node is rejected, and a reference-graph cycle detector catches `ref`-id
//! cycles that do not go through `$ref` at all.

use std::collections::HashMap;
use std::path::PathBuf;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value as Json;
use tracing::debug;

use spiral_core::document::{walk_expr, Document};
use spiral_core::error::SpiralError;
use spiral_core::expr::Arg;
use spiral_core::node::NodeBody;

use crate::diagnostics::pointer_hint;

/// Default bound on the depth of chained reference resolution.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Splits a pointer string into decoded tokens. Accepts an optional leading
/// `#`; the empty pointer addresses the whole document.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, SpiralError> {
    let body = pointer.strip_prefix('#').unwrap_or(pointer);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if !body.starts_with('/') {
        let mut reason = "pointer must start with '/'".to_string();
        if let Some(hint) = pointer_hint(pointer) {
            reason = format!("{reason} ({hint})");
        }
        return Err(SpiralError::InvalidPointer {
            pointer: pointer.to_string(),
            reason,
        });
    }
    Ok(body[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Escapes a single token for embedding in a pointer (`~` -> `~0`,
/// `/` -> `~1`).
pub fn encode_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn parse_array_index(token: &str, len: usize, pointer: &str) -> Result<usize, SpiralError> {
    let valid = !token.is_empty()
        && token.chars().all(|c| c.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !valid {
        return Err(SpiralError::InvalidPointer {
            pointer: pointer.to_string(),
            reason: format!("'{token}' is not a valid array index"),
        });
    }
    let index: usize = token.parse().map_err(|_| SpiralError::InvalidPointer {
        pointer: pointer.to_string(),
        reason: format!("array index '{token}' out of range"),
    })?;
    if index >= len {
        return Err(SpiralError::InvalidPointer {
            pointer: pointer.to_string(),
            reason: format!("array index {index} out of bounds (length {len})"),
        });
    }
    Ok(index)
}

/// Navigates a pointer within a JSON value.
pub fn navigate<'a>(root: &'a Json, pointer: &str) -> Result<&'a Json, SpiralError> {
    let tokens = parse_pointer(pointer)?;
    let mut current = root;
    for token in &tokens {
        current = match current {
            Json::Object(map) => map.get(token).ok_or_else(|| {
                let mut reason = format!("key '{token}' not found");
                if let Some(hint) = pointer_hint(pointer) {
                    reason = format!("{reason} ({hint})");
                }
                SpiralError::InvalidPointer {
                    pointer: pointer.to_string(),
                    reason,
                }
            })?,
            Json::Array(items) => &items[parse_array_index(token, items.len(), pointer)?],
            _ => {
                return Err(SpiralError::InvalidPointer {
                    pointer: pointer.to_string(),
                    reason: format!("cannot navigate into a primitive at '{token}'"),
                })
            }
        };
    }
    Ok(current)
}

/// Navigates to the parent of the pointer target, returning
/// `(parent, final_key, value)`. The empty pointer has no parent.
pub fn navigate_with_parent<'a>(
    root: &'a Json,
    pointer: &str,
) -> Result<(&'a Json, String, &'a Json), SpiralError> {
    let tokens = parse_pointer(pointer)?;
    let Some(last) = tokens.last() else {
        return Err(SpiralError::InvalidPointer {
            pointer: pointer.to_string(),
            reason: "the root pointer has no parent".into(),
        });
    };
    let body = pointer.strip_prefix('#').unwrap_or(pointer);
    let parent_pointer = match body.rfind('/') {
        Some(idx) => &body[..idx],
        None => "",
    };
    let parent = navigate(root, parent_pointer)?;
    let value = navigate(root, body)?;
    Ok((parent, last.clone(), value))
}

fn split_reference(reference: &str) -> (&str, &str) {
    match reference.split_once('#') {
        Some((uri, fragment)) => (uri, fragment),
        None => (reference, ""),
    }
}

/// Resolver for `$ref` values, with a per-URI cache, a depth bound, and
/// cycle detection over the chain of loaded URIs.
pub struct RefResolver {
    cache: HashMap<String, Json>,
    max_depth: usize,
    stack: Vec<String>,
    stdlib_dir: PathBuf,
}

impl Default for RefResolver {
    fn default() -> Self {
        RefResolver::new()
    }
}

impl RefResolver {
    pub fn new() -> Self {
        RefResolver {
            cache: HashMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            stack: Vec::new(),
            stdlib_dir: PathBuf::from("./stdlib"),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Overrides the directory `stdlib:` names resolve into.
    pub fn with_stdlib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stdlib_dir = dir.into();
        self
    }

    /// Resolves a reference against a document (as JSON), following
    /// external URIs and chained `$ref` aliases.
    pub fn resolve(&mut self, root: &Json, reference: &str) -> Result<Json, SpiralError> {
        let result = self.resolve_inner(root, reference, 0);
        self.stack.clear();
        result
    }

    fn resolve_inner(
        &mut self,
        root: &Json,
        reference: &str,
        depth: usize,
    ) -> Result<Json, SpiralError> {
        if depth >= self.max_depth {
            return Err(SpiralError::MaxDepthExceeded {
                uri: reference.to_string(),
                limit: self.max_depth,
            });
        }

        let (uri, fragment) = split_reference(reference);
        let (context, value) = if uri.is_empty() {
            (root.clone(), navigate(root, fragment)?.clone())
        } else {
            if let Some(pos) = self.stack.iter().position(|u| u == uri) {
                let mut chain = self.stack[pos..].to_vec();
                chain.push(uri.to_string());
                return Err(SpiralError::CircularReference { chain });
            }
            self.stack.push(uri.to_string());
            let loaded = self.load_uri(uri)?.clone();
            let value = navigate(&loaded, fragment)?.clone();
            (loaded, value)
        };

        let out = match value.get("$ref").and_then(Json::as_str) {
            Some(next) => {
                let next = next.to_string();
                self.resolve_inner(&context, &next, depth + 1)
            }
            None => Ok(value),
        };
        if !uri.is_empty() {
            self.stack.pop();
        }
        out
    }

    fn load_uri(&mut self, uri: &str) -> Result<&Json, SpiralError> {
        if !self.cache.contains_key(uri) {
            debug!(uri, "loading external reference");
            let loaded = self.fetch(uri)?;
            self.cache.insert(uri.to_string(), loaded);
        }
        Ok(&self.cache[uri])
    }

    fn fetch(&self, uri: &str) -> Result<Json, SpiralError> {
        let external = |reason: String| SpiralError::ExternalLoad {
            uri: uri.to_string(),
            reason,
        };

        if let Some(path) = uri.strip_prefix("file://") {
            let text = std::fs::read_to_string(path).map_err(|e| external(e.to_string()))?;
            return serde_json::from_str(&text).map_err(|e| external(e.to_string()));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let response = reqwest::blocking::get(uri)
                .and_then(reqwest::blocking::Response::error_for_status)
                .map_err(|e| external(e.to_string()))?;
            return response.json().map_err(|e| external(e.to_string()));
        }
        if let Some(name) = uri.strip_prefix("stdlib:") {
            let path = self.stdlib_dir.join(format!("{name}.cir.json"));
            let text = std::fs::read_to_string(&path).map_err(|e| external(e.to_string()))?;
            return serde_json::from_str(&text).map_err(|e| external(e.to_string()));
        }
        Err(external("unsupported URI scheme".into()))
    }
}

/// Reference cycles among the document's nodes, as strongly connected
/// components of the id-reference graph (self-references included).
pub fn reference_cycles(doc: &Document) -> Vec<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in &doc.nodes {
        graph.add_node(node.id.as_str());
    }
    for node in &doc.nodes {
        if let Some(expr) = node.as_expr() {
            walk_expr(expr, &mut |e| {
                let mut targets: Vec<&str> = e.direct_node_refs();
                for arg in e.child_args() {
                    if let Arg::Node(id) = arg {
                        targets.push(id.as_str());
                    }
                }
                for target in targets {
                    if doc.node(target).is_some() {
                        graph.add_edge(node.id.as_str(), target, ());
                    }
                }
            });
        }
    }

    let mut cycles = Vec::new();
    for scc in tarjan_scc(&graph) {
        let is_cycle = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        if is_cycle {
            cycles.push(scc.iter().map(|id| id.to_string()).collect());
        }
    }
    cycles
}

/// The AIR recursion ban: AIR documents may contain neither local `$ref`
/// nodes nor reference cycles among their nodes.
pub fn check_air_references(doc: &Document) -> Result<(), SpiralError> {
    for node in &doc.nodes {
        if let NodeBody::Ref { pointer } = &node.body {
            if pointer.starts_with('#') {
                return Err(SpiralError::RecursiveRefInAir {
                    node: node.id.clone(),
                });
            }
        }
    }
    if let Some(cycle) = reference_cycles(doc).into_iter().next() {
        return Err(SpiralError::RecursiveRefInAir {
            node: cycle[0].clone(),
        });
    }
    Ok(())
}
