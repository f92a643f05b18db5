use serde_json::{Number, Value};

/// Handle to a node inside a [`RawDocument`]. Identity of a container is its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// One node of an untyped response tree.
///
/// Containers hold child ids rather than children, so a document can share
/// subtrees or even refer back to an ancestor. Traversals that walk the whole
/// document must track visited ids.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
}

/// An untyped JSON-like response document stored as an arena of [`Node`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    nodes: Vec<Node>,
}

impl RawDocument {
    /// Start a document whose root is `root`. The root always has id 0.
    pub fn with_root(root: Node) -> Self {
        Self { nodes: vec![root] }
    }

    pub fn from_value(value: &Value) -> Self {
        let mut doc = Self::with_root(Node::Null);
        let root = doc.root();
        doc.fill(root, value);
        doc
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_value(&value))
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a detached node and return its id.
    pub fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Append `child` to the array `array`. Returns false if `array` is not an array.
    pub fn push_item(&mut self, array: NodeId, child: NodeId) -> bool {
        match self.nodes.get_mut(array.0) {
            Some(Node::Array(items)) => {
                items.push(child);
                true
            }
            _ => false,
        }
    }

    /// Add `key -> child` to the object `object`. Returns false if `object` is not an object.
    pub fn push_field(&mut self, object: NodeId, key: &str, child: NodeId) -> bool {
        match self.nodes.get_mut(object.0) {
            Some(Node::Object(fields)) => {
                fields.push((key.to_string(), child));
                true
            }
            _ => false,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// First value stored under `key` in the object `id`.
    pub fn field(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.node(id)? {
            Node::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v),
            _ => None,
        }
    }

    pub fn item(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.as_array(id)?.get(index).copied()
    }

    /// Follow a chain of object keys starting at `id`.
    pub fn lookup(&self, id: NodeId, path: &[&str]) -> Option<NodeId> {
        path.iter().try_fold(id, |cur, key| self.field(cur, key))
    }

    pub fn as_str(&self, id: NodeId) -> Option<&str> {
        match self.node(id)? {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.node(id)? {
            Node::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_f64(&self, id: NodeId) -> Option<f64> {
        match self.node(id)? {
            Node::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn is_object(&self, id: NodeId) -> bool {
        matches!(self.node(id), Some(Node::Object(_)))
    }

    /// `choices[0]` of a chat-completion shaped document.
    pub fn first_choice(&self) -> Option<NodeId> {
        let choices = self.field(self.root(), "choices")?;
        self.item(choices, 0)
    }

    fn fill(&mut self, slot: NodeId, value: &Value) {
        let node = match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Number(n.clone()),
            Value::String(s) => Node::String(s.clone()),
            Value::Array(items) => {
                let ids = items
                    .iter()
                    .map(|item| {
                        let id = self.add(Node::Null);
                        self.fill(id, item);
                        id
                    })
                    .collect();
                Node::Array(ids)
            }
            Value::Object(map) => {
                let fields = map
                    .iter()
                    .map(|(key, item)| {
                        let id = self.add(Node::Null);
                        self.fill(id, item);
                        (key.clone(), id)
                    })
                    .collect();
                Node::Object(fields)
            }
        };
        self.nodes[slot.0] = node;
    }
}
