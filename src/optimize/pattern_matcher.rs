use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::graph::{ConstantNode, Graph, Node, NodeId, OperatorNode};

/// Node IDs bound to the named symbols and operators of a pattern.
///
/// Bindings are only added and truncated, so backtracking restores an
/// earlier length.
struct Bindings {
    bound: Vec<(&'static str, NodeId)>,
    checkpoints: Vec<usize>,
}

impl Bindings {
    fn new() -> Bindings {
        Bindings {
            bound: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    fn checkpoint(&mut self) {
        self.checkpoints.push(self.bound.len());
    }

    /// Discard bindings added since the last checkpoint.
    fn revert(&mut self) {
        if let Some(len) = self.checkpoints.pop() {
            self.bound.truncate(len);
        }
    }

    /// Drop the last checkpoint, keeping bindings added since.
    fn commit(&mut self) {
        self.checkpoints.pop();
    }

    fn add(&mut self, name: &'static str, node_id: NodeId) {
        self.bound.push((name, node_id));
    }

    fn find(&self, name: &str) -> Option<NodeId> {
        self.bound
            .iter()
            .find(|(bound_name, _)| *bound_name == name)
            .map(|(_, id)| *id)
    }
}

/// The result of matching a [`Pattern`] against a graph node.
pub struct Match {
    bindings: Bindings,
}

impl Match {
    /// Return the node ID that a symbol or named operator was resolved to.
    ///
    /// Named operators resolve to the operator node, not its output.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.bindings.find(name)
    }
}

/// Absolute tolerance for matching constants against constant patterns.
const CONST_TOLERANCE: f32 = 1e-4;

#[derive(Clone, Debug, PartialEq)]
pub struct ConstantPattern {
    value: f32,
}

impl ConstantPattern {
    fn matches(&self, node: &ConstantNode) -> bool {
        node.as_scalar()
            .is_some_and(|x| (x - self.value).abs() <= CONST_TOLERANCE)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpPattern {
    /// Operator name, eg. "MatMul".
    name: &'static str,
    inputs: Vec<Pattern>,

    /// Name under which the operator node ID is recorded in a [`Match`].
    key: Option<&'static str>,
}

impl OpPattern {
    fn matches(&self, node: &OperatorNode, graph: &Graph, bindings: &mut Bindings) -> bool {
        if node.operator().name() != self.name || self.inputs.len() != node.input_ids().len() {
            return false;
        }

        // Operands of commutative binary operators may match either way
        // around.
        if let (true, [pat_a, pat_b], [input_a, input_b]) = (
            node.operator().is_commutative(),
            &self.inputs[..],
            node.input_ids(),
        ) {
            bindings.checkpoint();
            if pat_a.test_impl(*input_a, graph, bindings) && pat_b.test_impl(*input_b, graph, bindings)
            {
                bindings.commit();
                return true;
            }
            bindings.revert();

            bindings.checkpoint();
            if pat_b.test_impl(*input_a, graph, bindings) && pat_a.test_impl(*input_b, graph, bindings)
            {
                bindings.commit();
                return true;
            }
            bindings.revert();
            false
        } else {
            self.inputs
                .iter()
                .zip(node.input_ids())
                .all(|(pattern, input_id)| pattern.test_impl(*input_id, graph, bindings))
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SymbolPattern {
    name: &'static str,

    /// True if this symbol only matches constants.
    constant: bool,
}

/// A pattern for a subgraph within a [`Graph`].
///
/// Patterns are built from matchers for operators, constants and symbols and
/// are tested against a value node. The value matches if it is the output of
/// a subgraph with the structure of the pattern. For example
/// `Pattern::constant(1.0) + Pattern::symbol("x")` matches the output of an
/// `Add` of the constant `1.0` and any value.
///
/// Patterns only compare operator names and structure. Rules check operator
/// attributes after a match, using [`Pattern::with_name`] to find the nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    Operator(OpPattern),
    Constant(ConstantPattern),
    Symbol(SymbolPattern),
}

impl Pattern {
    /// Create a pattern that matches an operator.
    pub fn operator<I: Into<Vec<Pattern>>>(name: &'static str, inputs: I) -> Pattern {
        Pattern::Operator(OpPattern {
            name,
            inputs: inputs.into(),
            key: None,
        })
    }

    pub fn binary_op<A: Into<Pattern>, B: Into<Pattern>>(
        name: &'static str,
        input_a: A,
        input_b: B,
    ) -> Pattern {
        Pattern::operator(name, [input_a.into(), input_b.into()])
    }

    pub fn unary_op<I: Into<Pattern>>(name: &'static str, input: I) -> Pattern {
        Pattern::operator(name, [input.into()])
    }

    /// Set the name used to look up the matched node with [`Match::node_id`].
    ///
    /// Constants can't be named.
    pub fn with_name(self, name: &'static str) -> Pattern {
        match self {
            Pattern::Operator(mut op) => {
                op.key = Some(name);
                Pattern::Operator(op)
            }
            Pattern::Symbol(mut symbol) => {
                symbol.name = name;
                Pattern::Symbol(symbol)
            }
            Pattern::Constant(constant) => Pattern::Constant(constant),
        }
    }

    /// Create a pattern that matches a one-element constant with a given
    /// value.
    pub fn constant(value: f32) -> Pattern {
        Pattern::Constant(ConstantPattern { value })
    }

    /// Create a pattern that matches any value.
    ///
    /// All symbols with the same name must resolve to the same node.
    pub fn symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: false,
        })
    }

    /// Create a pattern that matches any constant.
    pub fn const_symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: true,
        })
    }

    /// Test whether `node_id` is the output of a subgraph matching this
    /// pattern.
    pub fn test(&self, node_id: NodeId, graph: &Graph) -> Option<Match> {
        let mut bindings = Bindings::new();
        if self.test_impl(node_id, graph, &mut bindings) {
            Some(Match { bindings })
        } else {
            None
        }
    }

    fn test_impl(&self, node_id: NodeId, graph: &Graph, bindings: &mut Bindings) -> bool {
        let Some(node) = graph.get_node(node_id) else {
            return false;
        };

        match (self, node) {
            // Operator patterns match either an operator node or its output.
            (Pattern::Operator(op_pat), Node::Operator(op_node)) => {
                let matched = op_pat.matches(op_node, graph, bindings);
                if let (true, Some(key)) = (matched, op_pat.key) {
                    bindings.add(key, node_id);
                }
                matched
            }
            (Pattern::Operator(op_pat), Node::Value(_)) => {
                let Some((op_id, op_node)) = graph.get_source_node(node_id) else {
                    return false;
                };
                let matched = op_pat.matches(op_node, graph, bindings);
                if let (true, Some(key)) = (matched, op_pat.key) {
                    bindings.add(key, op_id);
                }
                matched
            }
            (Pattern::Constant(const_pat), Node::Constant(const_node)) => {
                const_pat.matches(const_node)
            }
            (Pattern::Symbol(sym_pat), Node::Constant(_) | Node::Value(_)) => {
                if sym_pat.constant && !matches!(node, Node::Constant(_)) {
                    return false;
                }
                match bindings.find(sym_pat.name) {
                    Some(bound_id) => bound_id == node_id,
                    None => {
                        bindings.add(sym_pat.name, node_id);
                        true
                    }
                }
            }
            _ => false,
        }
    }
}

impl From<f32> for Pattern {
    fn from(val: f32) -> Pattern {
        Pattern::constant(val)
    }
}

macro_rules! impl_binop_for_pattern {
    ($trait:ident, $method:ident, $op_name:expr) => {
        impl<I: Into<Pattern>> $trait<I> for Pattern {
            type Output = Pattern;

            fn $method(self, rhs: I) -> Pattern {
                Pattern::binary_op($op_name, self, rhs.into())
            }
        }

        impl $trait<Pattern> for f32 {
            type Output = Pattern;

            fn $method(self, rhs: Pattern) -> Pattern {
                Pattern::binary_op($op_name, Pattern::constant(self), rhs)
            }
        }
    };
}
impl_binop_for_pattern!(Add, add, "Add");
impl_binop_for_pattern!(Mul, mul, "Mul");
impl_binop_for_pattern!(Div, div, "Div");
impl_binop_for_pattern!(Sub, sub, "Sub");

impl Neg for Pattern {
    type Output = Pattern;

    fn neg(self) -> Pattern {
        Pattern::unary_op("Neg", self)
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::Pattern;
    use crate::graph::builder::Expr;
    use crate::graph::{Graph, Node};
    use crate::ops::{Elementwise, ScalarOp};

    /// Create a graph that computes softsign, `x / (1 + |x|)`.
    fn softsign_graph() -> Graph {
        let x = Expr::value("x");
        let expr = x.clone() / (Expr::constant(1.0f32) + x.unary(Elementwise::new(ScalarOp::Abs)));
        expr.build_graph(["x"])
    }

    #[test]
    fn test_pattern_match() {
        #[derive(Debug)]
        struct Case {
            pattern: Pattern,
            expect_match: bool,
        }

        let x = Pattern::symbol("x");
        let c = Pattern::const_symbol("c");
        let abs = |x: Pattern| Pattern::unary_op("Abs", x);

        let cases = [
            Case {
                pattern: x.clone() / (1f32 + abs(x.clone())),
                expect_match: true,
            },
            Case {
                pattern: x.clone() / (c.clone() + abs(x.clone())),
                expect_match: true,
            },
            // Div is not commutative.
            Case {
                pattern: (1f32 + abs(x.clone())) / x.clone(),
                expect_match: false,
            },
            // Add is.
            Case {
                pattern: x.clone() / (abs(x.clone()) + 1f32),
                expect_match: true,
            },
            Case {
                pattern: x.clone() / (1f32 - abs(x.clone())),
                expect_match: false,
            },
            Case {
                pattern: x.clone() / (1.1f32 + abs(x.clone())),
                expect_match: false,
            },
            // Within tolerance.
            Case {
                pattern: x.clone() / (1.00001f32 + abs(x.clone())),
                expect_match: true,
            },
            // "x" must resolve to the same node everywhere.
            Case {
                pattern: x.clone() / (x.clone() + abs(x.clone())),
                expect_match: false,
            },
            // Dynamic input matched against a constant symbol.
            Case {
                pattern: c.clone() / (1f32 + abs(x.clone())),
                expect_match: false,
            },
        ];

        cases.test_each(|case| {
            let graph = softsign_graph();
            let input = graph.input_ids()[0];
            let output = graph.output_ids()[0];
            let pat_match = case.pattern.test(output, &graph);
            assert_eq!(pat_match.is_some(), case.expect_match);
            if let Some(pat_match) = pat_match {
                assert_eq!(pat_match.node_id("x"), Some(input));
            }
        });
    }

    #[test]
    fn test_operator_with_key() {
        let graph = softsign_graph();
        let output = graph.output_ids()[0];
        let x = Pattern::symbol("x");
        let pat = x.clone() / (1f32 + Pattern::unary_op("Abs", x.clone()).with_name("abs_op"));
        let pat_match = pat.test(output, &graph).unwrap();
        let abs_id = pat_match.node_id("abs_op").unwrap();
        assert!(matches!(
            graph.get_node(abs_id),
            Some(Node::Operator(op)) if op.operator().name() == "Abs"
        ));
    }

    #[test]
    fn test_backtracking_restores_bindings() {
        // `y * x` where the first attempt binds "a" to `y`, then fails on the
        // second operand.
        let x = Expr::value("x");
        let y = Expr::value("y");
        let graph = Expr::make_graph([x.clone(), y.clone()], [y * x.unary(Elementwise::new(ScalarOp::Exp))]);
        let output = graph.output_ids()[0];

        let a = Pattern::symbol("a");
        let pat = Pattern::unary_op("Exp", Pattern::symbol("x")) * a;
        let pat_match = pat.test(output, &graph).unwrap();
        assert_eq!(pat_match.node_id("a"), Some(graph.input_ids()[1]));
        assert_eq!(pat_match.node_id("x"), Some(graph.input_ids()[0]));
    }
}
