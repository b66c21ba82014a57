//! Text rendering of graphs for debugging.

use std::fmt::Write;

use rustc_hash::FxHashSet;

use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::infer_shapes::ShapeMap;

/// Render a graph as a tree for each of its outputs.
///
/// Each line shows a value together with its type and shape. Values
/// produced by operators show the operator name and ID, followed by the
/// operator's inputs, indented one level deeper. An operator whose outputs
/// are used more than once is expanded the first time it is printed only.
/// Later references are marked with `*`.
///
/// ```text
/// Output 0
/// ReduceSum [id 9] 'ReduceSum_out' f32 [batch]
///  |FusedElementwise [id 12] 'Add_out' f32 [batch, 3]
///  | |'x' [id 0] f32 [batch, 3]
///  | |'y' [id 1] f32 [batch, 3]
/// ```
///
/// Shapes come from `shapes` where available and the graph's declared
/// shapes otherwise.
pub fn debug_print(graph: &Graph, shapes: &ShapeMap) -> String {
    let mut printer = Printer {
        graph,
        shapes,
        expanded: FxHashSet::default(),
        out: String::new(),
    };
    for (i, &output) in graph.output_ids().iter().enumerate() {
        printer.line(0, format_args!("Output {}", i));
        printer.print_value(output, 0);
    }
    printer.out
}

struct Printer<'a> {
    graph: &'a Graph,
    shapes: &'a ShapeMap,

    /// Operators whose inputs have already been printed.
    expanded: FxHashSet<NodeId>,

    out: String,
}

impl Printer<'_> {
    fn line(&mut self, depth: usize, text: std::fmt::Arguments) {
        for _ in 0..depth {
            self.out.push_str(" |");
        }
        // Writing to a `String` does not fail.
        let _ = writeln!(self.out, "{}", text);
    }

    fn print_value(&mut self, id: NodeId, depth: usize) {
        let graph = self.graph;
        let info = self.value_info(id);
        let name = graph.node_name(id);

        if let Some((op_id, op_node)) = graph.get_source_node(id) {
            let mut label = format!("{} [id {}]", op_node.operator().name(), op_id);
            if op_node.output_ids().len() > 1 {
                if let Some(index) = op_node.output_ids().iter().position(|o| *o == id) {
                    let _ = write!(label, ".{}", index);
                }
            }

            if !self.expanded.insert(op_id) {
                self.line(depth, format_args!("{} '{}' {} *", label, name, info));
                return;
            }
            self.line(depth, format_args!("{} '{}' {}", label, name, info));
            for &input in op_node.input_ids() {
                self.print_value(input, depth + 1);
            }
            return;
        }

        match graph.get_node(id) {
            Some(Node::Constant(constant)) => match constant.as_scalar() {
                Some(scalar) => self.line(
                    depth,
                    format_args!("Constant [id {}] {} = {}", id, info, scalar),
                ),
                None => self.line(depth, format_args!("Constant [id {}] {}", id, info)),
            },
            Some(_) => self.line(depth, format_args!("'{}' [id {}] {}", name, id, info)),
            None => self.line(depth, format_args!("<missing> [id {}]", id)),
        }
    }

    /// Format the type and shape of a value, eg. `f32 [batch, 3]`.
    fn value_info(&self, id: NodeId) -> String {
        let node = self.graph.get_node(id);
        let dtype = self
            .shapes
            .dtype(id)
            .or_else(|| node.and_then(|n| n.dtype()));
        let dims = self.shapes.dims(id).or_else(|| node.and_then(|n| n.shape()));

        let dtype = dtype.map(|dt| dt.to_string()).unwrap_or("?".to_string());
        let shape = match dims {
            Some(dims) => format_dims(&dims),
            None => "[?]".to_string(),
        };
        format!("{} {}", dtype, shape)
    }
}

fn format_dims(dims: &[Dimension]) -> String {
    let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}
