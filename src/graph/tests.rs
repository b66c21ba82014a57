use std::sync::Arc;

use sten_testing::TestCases;

use super::{Dimension, Graph, Node, NodeId, RunErrorKind};
use crate::ops::{Elementwise, Identity, ScalarOp};
use crate::tensor::Tensor;
use crate::value::DataType;

fn neg() -> Arc<Elementwise> {
    Arc::new(Elementwise::new(ScalarOp::Neg))
}

fn add() -> Arc<Elementwise> {
    Arc::new(Elementwise::new(ScalarOp::Add))
}

/// Return the names of the operators in a plan.
fn plan_names(g: &Graph, plan: &[NodeId]) -> Vec<String> {
    plan.iter().map(|id| g.node_name(*id)).collect()
}

#[test]
fn test_graph_node_debug_names() {
    let mut g = Graph::new();
    let input_id = g.add_value(Some("input"), None, None);
    let weights_id = g.add_constant(Some("weights"), Tensor::from_vec(vec![0.3230f32]));
    let out_id = g.add_simple_op("add", add(), &[input_id, weights_id]);
    let anon_id = g.add_value(None, None, None);

    assert_eq!(g.node_name(input_id), "input");
    assert_eq!(g.node_name(weights_id), "weights");
    assert_eq!(g.node_name(out_id), "add_out");
    assert_eq!(g.node_name(anon_id), format!("[ID: {}]", anon_id));

    let (op_id, op_node) = g.get_source_node(out_id).unwrap();
    assert_eq!(g.node_name(op_id), "add");
    assert_eq!(op_node.input_ids(), [input_id, weights_id]);
    assert_eq!(op_node.output_ids(), [out_id]);
    assert_eq!(g.get_node_id("add"), Some(op_id));
    assert_eq!(g.get_node_id("missing"), None);
}

#[test]
fn test_graph_node_shapes() {
    let mut g = Graph::new();
    let input_id = g.add_value(
        Some("input"),
        Some([Dimension::Symbolic("batch".to_string()), Dimension::Fixed(3)].to_vec()),
        Some(DataType::Float),
    );
    let const_id = g.add_constant(Some("const"), Tensor::from_data(&[1, 2], vec![1i32, 2]));
    let op_id = g.add_op(Some("neg"), neg(), &[input_id], &[]);

    let input = g.get_node(input_id).unwrap();
    assert_eq!(
        input.shape(),
        Some([Dimension::Symbolic("batch".to_string()), Dimension::Fixed(3)].to_vec())
    );
    assert_eq!(input.dtype(), Some(DataType::Float));

    let constant = g.get_node(const_id).unwrap();
    assert_eq!(
        constant.shape(),
        Some([Dimension::Fixed(1), Dimension::Fixed(2)].to_vec())
    );
    assert_eq!(constant.dtype(), Some(DataType::Int32));

    let op = g.get_node(op_id).unwrap();
    assert_eq!(op.shape(), None);
    assert_eq!(op.dtype(), None);
}

#[test]
fn test_counts_and_iteration() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let y = g.add_simple_op("neg", neg(), &[x]);
    g.add_simple_op("add", add(), &[x, y]);

    assert_eq!(g.node_count(), 5);
    assert_eq!(g.operator_count(), 2);

    let ids: Vec<NodeId> = g.iter().map(|(id, _)| id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let op_names: Vec<&str> = g
        .iter_operators()
        .map(|(_, op)| op.name().unwrap_or(""))
        .collect();
    assert_eq!(op_names, ["neg", "add"]);
}

#[test]
fn test_consumers() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let y = g.add_simple_op("neg", neg(), &[x]);
    let z = g.add_simple_op("add", add(), &[y, y]);
    let (neg_id, _) = g.get_source_node(y).unwrap();
    let (add_id, _) = g.get_source_node(z).unwrap();

    assert_eq!(g.get_consumers(x), [neg_id]);

    // An operator appears once per input slot.
    assert_eq!(g.get_consumers(y), [add_id, add_id]);
    assert!(g.get_consumers(z).is_empty());
}

#[test]
fn test_graph_planning_order() {
    let mut g = Graph::new();
    let input_id = g.add_value(Some("input"), None, None);

    let op_a_out = g.add_simple_op("op_a", neg(), &[input_id]);
    let op_b_out = g.add_simple_op("op_b", neg(), &[op_a_out]);

    // op_c has both op_a and op_b as inputs. Since op_b depends on op_a,
    // the plan must run them in the order a, b, c.
    let op_c_out = g.add_simple_op("op_c", add(), &[op_a_out, op_b_out]);

    // op_d is the same as op_c, but its inputs are in reverse order.
    let op_d_out = g.add_simple_op("op_d", add(), &[op_b_out, op_a_out]);

    let plan = g.execution_plan(&[input_id], &[op_c_out]).unwrap();
    assert_eq!(plan_names(&g, &plan), ["op_a", "op_b", "op_c"]);

    let plan = g.execution_plan(&[input_id], &[op_d_out]).unwrap();
    assert_eq!(plan_names(&g, &plan), ["op_a", "op_b", "op_d"]);
}

#[test]
fn test_plan_skips_unneeded_operators() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let y = g.add_value(Some("y"), None, None);
    let a = g.add_simple_op("neg_x", neg(), &[x]);
    let b = g.add_simple_op("neg_y", neg(), &[y]);
    g.add_simple_op("add", add(), &[a, b]);

    let plan = g.execution_plan(&[x], &[a]).unwrap();
    assert_eq!(plan_names(&g, &plan), ["neg_x"]);

    // Starting from an intermediate value skips the operators that
    // produce it.
    let plan = g.execution_plan(&[a, b], &[g.get_node_id("add_out").unwrap()]).unwrap();
    assert_eq!(plan_names(&g, &plan), ["add"]);
}

#[test]
fn test_plan_for_inputs_and_constants() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let c = g.add_constant(Some("c"), Tensor::from_scalar(2.0f32));

    // Outputs which are inputs or constants need no operators.
    let plan = g.execution_plan(&[x], &[x, c]).unwrap();
    assert!(plan.is_empty());

    let out = g.add_simple_op("add", add(), &[x, c]);
    let plan = g.execution_plan(&[x], &[out, c]).unwrap();
    assert_eq!(plan_names(&g, &plan), ["add"]);
}

#[test]
fn test_planning_errors() {
    #[derive(Debug)]
    enum Case {
        DuplicateInputs,
        DuplicateOutputs,
        NoSourceForOutput,
        MissingOperatorInput,
        OutputIsOperator,
    }

    let cases = [
        (
            Case::DuplicateInputs,
            "planning error: Inputs are not unique. Input \"x\" is duplicated.",
        ),
        (
            Case::DuplicateOutputs,
            "planning error: Outputs are not unique. Output \"neg_out\" is duplicated.",
        ),
        (
            Case::NoSourceForOutput,
            "planning error: Source node not found for output \"y\"",
        ),
        (
            Case::MissingOperatorInput,
            "planning error: Missing input \"x\" for op \"neg\"",
        ),
        (
            Case::OutputIsOperator,
            "planning error: Output 0 (\"neg\") is not a value node in the graph.",
        ),
    ];

    cases.test_each(|(case, expected)| {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"), None, None);
        let y = g.add_value(Some("y"), None, None);
        let neg_out = g.add_simple_op("neg", neg(), &[x]);
        let neg_id = g.get_node_id("neg").unwrap();

        let (inputs, outputs) = match case {
            Case::DuplicateInputs => (vec![x, x], vec![neg_out]),
            Case::DuplicateOutputs => (vec![x], vec![neg_out, neg_out]),
            Case::NoSourceForOutput => (vec![x], vec![y]),
            Case::MissingOperatorInput => (vec![], vec![neg_out]),
            Case::OutputIsOperator => (vec![x], vec![neg_id]),
        };
        let err = g.execution_plan(&inputs, &outputs).err().unwrap();
        assert_eq!(err.kind(), RunErrorKind::PlanningError);
        assert_eq!(err.to_string(), *expected);
    })
}

/// Create a graph where two operators consume each other's outputs.
fn cyclic_graph() -> (Graph, NodeId) {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let a = g.add_value(Some("a"), None, None);
    let b = g.add_value(Some("b"), None, None);
    g.add_op(Some("op_a"), add(), &[x, b], &[a]);
    g.add_op(Some("op_b"), neg(), &[a], &[b]);
    g.set_input_ids(&[x]);
    g.set_output_ids(&[b]);
    (g, x)
}

#[test]
fn test_cyclic_graph() {
    let (g, x) = cyclic_graph();

    let err = g.execution_plan(&[x], g.output_ids()).err().unwrap();
    assert!(err.to_string().contains("Graph contains a cycle"));

    let err = g.topological_order().err().unwrap();
    assert_eq!(err.kind(), RunErrorKind::PlanningError);
    assert!(err.to_string().contains("Graph contains a cycle through \"op_a\""));

    assert!(g.validate().is_err());
}

#[test]
fn test_topological_order() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);

    // Operators are added in an order where consumers precede producers.
    let a = g.add_value(Some("a"), None, None);
    let b = g.add_value(Some("b"), None, None);
    let c = g.add_value(Some("c"), None, None);
    g.add_op(Some("add"), add(), &[b, b], &[c]);
    g.add_op(Some("neg_b"), neg(), &[a], &[b]);
    g.add_op(Some("neg_a"), neg(), &[x], &[a]);

    // An unrelated operator with no producers runs in ID order.
    let y = g.add_value(Some("y"), None, None);
    g.add_simple_op("neg_y", neg(), &[y]);

    let order = g.topological_order().unwrap();
    assert_eq!(plan_names(&g, &order), ["neg_a", "neg_b", "add", "neg_y"]);
}

#[test]
fn test_validate() {
    #[derive(Debug)]
    enum Case {
        Valid,
        InputHasProducer,
        OutputIsOperator,
        OperatorOutputIsConstant,
        TwoProducers,
    }

    let cases = [
        (Case::Valid, None),
        (Case::InputHasProducer, Some("Graph input \"neg_out\"")),
        (Case::OutputIsOperator, Some("Graph output \"neg\"")),
        (Case::OperatorOutputIsConstant, Some("Output \"c\" of operator \"const_op\"")),
        (Case::TwoProducers, Some("Value \"neg_out\" is produced by both")),
    ];

    cases.test_each(|(case, expected)| {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"), None, None);
        let neg_out = g.add_simple_op("neg", neg(), &[x]);
        g.set_input_ids(&[x]);
        g.set_output_ids(&[neg_out]);

        match case {
            Case::Valid => {}
            Case::InputHasProducer => g.set_input_ids(&[neg_out]),
            Case::OutputIsOperator => {
                let neg_id = g.get_node_id("neg").unwrap();
                g.set_output_ids(&[neg_id]);
            }
            Case::OperatorOutputIsConstant => {
                let c = g.add_constant(Some("c"), Tensor::from_scalar(1.0f32));
                g.add_op(Some("const_op"), neg(), &[x], &[c]);
            }
            Case::TwoProducers => {
                g.add_op(Some("neg2"), neg(), &[x], &[neg_out]);
            }
        }

        match (g.validate(), expected) {
            (Ok(()), None) => {}
            (Err(err), Some(expected)) => {
                assert!(err.to_string().contains(expected), "unexpected error {}", err)
            }
            (result, expected) => panic!("expected {:?} but got {:?}", expected, result),
        }
    })
}

#[test]
fn test_remove_nodes() {
    let mut g = Graph::new();
    let val_id = g.add_value(Some("value"), None, None);
    g.set_input_ids(&[val_id]);
    g.set_output_ids(&[val_id]);

    assert!(g.get_node(val_id).is_some());
    assert!(g.get_node_id("value").is_some());

    g.remove_nodes(&[val_id]);

    assert!(g.get_node(val_id).is_none());
    assert!(g.get_node_id("value").is_none());

    // Input and output lists are not modified.
    assert_eq!(g.input_ids(), [val_id]);

    // Removing an operator should remove it as the source node for its
    // outputs and as a consumer of its inputs.
    let val_id = g.add_value(Some("value2"), None, None);
    let out_id = g.add_simple_op("Mul", add(), &[val_id, val_id]);
    let (op_id, _) = g.get_source_node(out_id).unwrap();
    assert_eq!(g.get_consumers(val_id).len(), 2);

    g.remove_nodes(&[op_id]);

    assert!(g.get_source_node(out_id).is_none());
    assert!(g.get_consumers(val_id).is_empty());

    // IDs are not reused.
    let new_id = g.add_value(None, None, None);
    assert!(new_id > out_id);
}

#[test]
fn test_replace_value() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let y = g.add_value(Some("y"), None, None);
    let a = g.add_simple_op("identity", Arc::new(Identity), &[x]);
    let b = g.add_simple_op("add", add(), &[a, a]);
    g.set_input_ids(&[x, y]);
    g.set_output_ids(&[b, a]);
    let (add_id, _) = g.get_source_node(b).unwrap();

    g.replace_value(a, y);

    let Some(Node::Operator(add_op)) = g.get_node(add_id) else {
        panic!("add operator missing");
    };
    assert_eq!(add_op.input_ids(), [y, y]);
    assert_eq!(g.output_ids(), [b, y]);
    assert!(g.get_consumers(a).is_empty());
    assert_eq!(g.get_consumers(y), [add_id, add_id]);
}

#[test]
fn test_replace_operator_and_inputs() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let y = g.add_value(Some("y"), None, None);
    let out = g.add_simple_op("op", neg(), &[x]);
    let (op_id, _) = g.get_source_node(out).unwrap();

    assert!(g.replace_operator(op_id, add()));
    assert!(g.replace_op_inputs(op_id, &[x, y]));

    let (_, op_node) = g.get_source_node(out).unwrap();
    assert_eq!(op_node.operator().name(), "Add");
    assert_eq!(op_node.input_ids(), [x, y]);
    assert_eq!(g.get_consumers(x), [op_id]);
    assert_eq!(g.get_consumers(y), [op_id]);

    assert!(g.replace_op_inputs(op_id, &[y]));
    assert!(g.get_consumers(x).is_empty());

    // Non-operator nodes are rejected.
    assert!(!g.replace_operator(x, neg()));
    assert!(!g.replace_op_inputs(x, &[y]));
}

#[test]
fn test_multiple_outputs() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), None, None);
    let out_a = g.add_value(Some("out_a"), None, None);
    let out_b = g.add_value(Some("out_b"), None, None);
    let op_id = g.add_op(Some("split"), Arc::new(Identity), &[x], &[out_a, out_b]);

    assert_eq!(g.get_source_node(out_a).map(|(id, _)| id), Some(op_id));
    assert_eq!(g.get_source_node(out_b).map(|(id, _)| id), Some(op_id));

    let plan = g.execution_plan(&[x], &[out_b, out_a]).unwrap();
    assert_eq!(plan, [op_id]);
}
