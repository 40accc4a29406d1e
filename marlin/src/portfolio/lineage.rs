use marlin_execution::market::MarketId;

/// Index of a state node in a [`Lineage`] arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StateId(usize);

#[derive(Debug, Clone)]
struct Node {
    slug: &'static str,
    /// Root repr, eg/ "#42 ETH-USD". Only set on origin nodes.
    label: Option<String>,
    /// What caused the transition from the parent state.
    change: Option<String>,
    parent: Option<StateId>,
}

/// Append-only arena of position state nodes.
///
/// Every non-root node points at exactly one predecessor that was pushed earlier, so chains
/// are acyclic by construction and always terminate at an origin.
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    nodes: Vec<Node>,
}

impl Lineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin of a position created from a buy signal.
    pub fn root(&mut self, number: u64, market: &MarketId) -> StateId {
        self.push(Node {
            slug: "root",
            label: Some(format!("#{number} {market}")),
            change: None,
            parent: None,
        })
    }

    /// Origin of a position reconstructed from an account balance at startup.
    pub fn downloaded(&mut self, number: u64, market: &MarketId) -> StateId {
        self.push(Node {
            slug: "downloaded",
            label: Some(format!("download #{number} {market}")),
            change: None,
            parent: None,
        })
    }

    /// Append a new state node following `parent`.
    pub fn advance(
        &mut self,
        parent: StateId,
        slug: &'static str,
        change: impl Into<String>,
    ) -> StateId {
        assert!(parent.0 < self.nodes.len(), "unknown parent state");
        self.push(Node {
            slug,
            label: None,
            change: Some(change.into()),
            parent: Some(parent),
        })
    }

    /// Render the full provenance chain,
    /// eg/ `#1 ETH-USD -> (order placed) -> pending_limit_buy`.
    pub fn describe(&self, id: StateId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(StateId(index)) = cursor {
            let node = &self.nodes[index];
            match &node.label {
                Some(label) => parts.push(label.clone()),
                None => {
                    parts.push(node.slug.to_string());
                    if let Some(change) = &node.change {
                        parts.push(format!("({change})"));
                    }
                }
            }
            cursor = node.parent;
        }
        parts.reverse();
        parts.join(" -> ")
    }

    /// Number of edges between `id` and its origin.
    pub fn depth(&self, id: StateId) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes[id.0].parent;
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.nodes[parent.0].parent;
        }
        depth
    }

    /// Whether the chain from `id` reaches an origin node.
    pub fn is_rooted(&self, id: StateId) -> bool {
        let mut cursor = Some(id);
        let mut steps = 0;
        while let Some(StateId(index)) = cursor {
            let node = &self.nodes[index];
            if node.parent.is_none() {
                return node.label.is_some();
            }
            cursor = node.parent;
            steps += 1;
            if steps > self.nodes.len() {
                return false;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: Node) -> StateId {
        let id = StateId(self.nodes.len());
        self.nodes.push(node);
        id
    }
}
