//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument:
//!
//! ```kdl
//! certificates {
//!     check-interval-secs 3600
//! }
//! ```

use kdl::{KdlNode, KdlValue};

/// First positional argument of a node
pub fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument of a node, as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// Child node with the given name
pub fn get_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// String argument of a named child node
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_child(node, name).and_then(get_first_arg_string)
}

/// Integer argument of a named child node
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    get_child(node, name)
        .and_then(get_first_arg)
        .and_then(|v| v.as_integer())
}

/// Names of all child nodes, for unknown-key warnings
pub fn child_names(node: &KdlNode) -> Vec<&str> {
    node.children()
        .map(|doc| doc.nodes().iter().map(|n| n.name().value()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;

    fn first_node(text: &str) -> KdlNode {
        let doc: KdlDocument = text.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_get_entries() {
        let node = first_node("block {\n    name \"alpha\"\n    count 42\n}\n");
        assert_eq!(get_string_entry(&node, "name").as_deref(), Some("alpha"));
        assert_eq!(get_int_entry(&node, "count"), Some(42));
        assert_eq!(get_int_entry(&node, "missing"), None);
        assert_eq!(child_names(&node), vec!["name", "count"]);
    }

    #[test]
    fn test_get_first_arg_string() {
        let node = first_node("listener \"https\"\n");
        assert_eq!(get_first_arg_string(&node).as_deref(), Some("https"));
    }
}
