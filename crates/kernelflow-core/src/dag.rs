//! Recorded execution DAG with Graphviz export.

use std::fmt::Write as _;

use crate::argument::ArgumentDescriptor;
use crate::computation::ComputationKind;
use crate::element::ElementId;

/// One scheduled element.
#[derive(Debug, Clone)]
pub struct DagVertex {
    /// Element id.
    pub element: ElementId,
    /// Computation name.
    pub name: String,
    /// Computation kind.
    pub kind: ComputationKind,
    /// Where the element ran.
    pub stream: String,
}

/// Ordering edge between two elements.
#[derive(Debug, Clone)]
pub struct DagEdge {
    /// Older element.
    pub parent: ElementId,
    /// Newer element.
    pub child: ElementId,
    /// Operands that created the edge.
    pub arguments: Vec<ArgumentDescriptor>,
}

/// History of every vertex and edge scheduled by a context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionDag {
    vertices: Vec<DagVertex>,
    edges: Vec<DagEdge>,
}

impl ExecutionDag {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_vertex(&mut self, vertex: DagVertex) {
        self.vertices.push(vertex);
    }

    pub(crate) fn add_edge(&mut self, edge: DagEdge) {
        self.edges.push(edge);
    }

    /// Recorded vertices in scheduling order.
    #[must_use]
    pub fn vertices(&self) -> &[DagVertex] {
        &self.vertices
    }

    /// Recorded edges.
    #[must_use]
    pub fn edges(&self) -> &[DagEdge] {
        &self.edges
    }

    /// Parents of `element`.
    pub fn parents_of(&self, element: ElementId) -> impl Iterator<Item = ElementId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.child == element)
            .map(|e| e.parent)
    }

    /// Render the DAG in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph execution {\n");
        for v in &self.vertices {
            let _ = writeln!(
                out,
                "  e{} [label=\"{} #{}\\n{}\\n{}\"];",
                v.element,
                escape(&v.name),
                v.element,
                v.kind,
                escape(&v.stream)
            );
        }
        for e in &self.edges {
            let label: Vec<String> = e.arguments.iter().map(|a| a.to_string()).collect();
            let _ = writeln!(
                out,
                "  e{} -> e{} [label=\"{}\"];",
                e.parent,
                e.child,
                escape(&label.join(", "))
            );
        }
        out.push_str("}\n");
        out
    }
}

/// Escape a string for use inside a quoted DOT label.
fn escape(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
