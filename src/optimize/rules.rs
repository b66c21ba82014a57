//! Built-in rewrite rules.

use std::any::Any;
use std::sync::Arc;

use sten_shape_inference::Constant;

use super::pattern_matcher::Pattern;
use super::{Fusion, Phase, Rewrite, RewriteContext, RewriteRule, RuleDb};
use crate::graph::{Graph, NodeId, OperatorNode};
use crate::operator::{InputList, Operator};
use crate::ops::{
    Assert, Cast, Elementwise, FusedElementwise, Identity, Reduce, ReduceOp, Reshape, ScalarExpr,
    ScalarOp, Shape, ShapeI, Softmax, SpecifyShape, Transpose,
};
use crate::tensor::Tensor;
use crate::value::{DataType, Value};

/// Largest constant, in elements, that constant folding will create.
const MAX_FOLDED_LEN: usize = 1 << 20;

/// Maximum number of distinct inputs of a fused elementwise operator.
const MAX_FUSED_INPUTS: usize = 32;

/// Maximum number of scalar functions in a fused elementwise expression.
const MAX_FUSED_OPS: usize = 256;

pub(super) fn register_standard_rules(db: &mut RuleDb) {
    use Phase::*;

    const DEFAULT: &[&str] = &["fast_run", "fast_compile"];
    const FAST_RUN: &[&str] = &["fast_run"];

    let tagged = |base: &[&'static str], extra: &[&'static str]| -> Vec<&'static str> {
        base.iter().chain(extra).copied().collect()
    };

    db.register(
        "constant_folding",
        ConstantFolding {},
        &tagged(DEFAULT, &["canonicalize"]),
        &[Canonicalize, Specialize],
    );
    db.register("merge", Merge {}, DEFAULT, &[Canonicalize, Specialize]);
    db.register(
        "remove_identity",
        RemoveIdentity {},
        &tagged(DEFAULT, &["canonicalize"]),
        &[Canonicalize],
    );
    db.register(
        "useless_elementwise",
        UselessElementwise {},
        &tagged(FAST_RUN, &["canonicalize", "algebraic"]),
        &[Canonicalize],
    );
    db.register(
        "double_negation",
        DoubleNegation {},
        &tagged(FAST_RUN, &["canonicalize", "algebraic"]),
        &[Canonicalize],
    );
    db.register(
        "shape_to_constant",
        ShapeToConstant {},
        &tagged(DEFAULT, &["shape"]),
        &[Canonicalize],
    );
    db.register(
        "shape_lift",
        ShapeLift {},
        &tagged(FAST_RUN, &["shape"]),
        &[Canonicalize],
    );
    db.register(
        "useless_specify_shape",
        UselessSpecifyShape {},
        &tagged(DEFAULT, &["shape"]),
        &[Canonicalize],
    );
    db.register(
        "useless_reshape",
        UselessReshape {},
        &tagged(FAST_RUN, &["shape"]),
        &[Canonicalize],
    );
    db.register(
        "reshape_chain",
        ReshapeChain {},
        &tagged(FAST_RUN, &["canonicalize"]),
        &[Canonicalize],
    );
    db.register(
        "transpose_chain",
        TransposeChain {},
        &tagged(FAST_RUN, &["canonicalize"]),
        &[Canonicalize],
    );
    db.register("useless_assert", UselessAssert {}, DEFAULT, &[Canonicalize]);
    db.register(
        "remove_all_assert",
        RemoveAllAssert {},
        &["unsafe"],
        &[Canonicalize],
    );
    db.register(
        "log_sigmoid",
        LogSigmoid {},
        &tagged(FAST_RUN, &["stabilize"]),
        &[Stabilize],
    );
    db.register("log1p", LogOnePlus {}, &tagged(FAST_RUN, &["stabilize"]), &[Stabilize]);
    db.register(
        "softmax",
        SoftmaxFusion {},
        &tagged(FAST_RUN, &["specialize"]),
        &[Specialize],
    );
    db.register(
        "elementwise_fusion",
        ElementwiseFusion {},
        &tagged(FAST_RUN, &["fusion"]),
        &[Fusion],
    );
    db.register(
        "inplace_elementwise",
        InplaceElementwise {},
        &tagged(FAST_RUN, &["inplace"]),
        &[Inplace],
    );
}

fn single_output(op_node: &OperatorNode) -> Option<NodeId> {
    match op_node.output_ids() {
        [output] => Some(*output),
        _ => None,
    }
}

fn alias(from: NodeId, to: NodeId) -> Option<Rewrite> {
    Some(Rewrite::Alias(vec![(from, to)]))
}

/// Return the operator of the node which produces `value`, if it has type
/// `T`.
fn source_op<'a, T: Any>(
    ctx: &RewriteContext<'a>,
    value: NodeId,
) -> Option<(NodeId, &'a OperatorNode, &'a T)> {
    let (op_id, op_node) = ctx.graph().get_source_node(value)?;
    let op = op_node.operator().downcast_ref::<T>()?;
    Some((op_id, op_node, op))
}

/// Compiled patterns for rules that match fixed expressions.
struct Patterns(Vec<Pattern>);

fn patterns(state: &dyn Any) -> &[Pattern] {
    state
        .downcast_ref::<Patterns>()
        .map(|p| p.0.as_slice())
        .unwrap_or(&[])
}

/// Evaluate operators whose inputs are all constants.
struct ConstantFolding {}

impl RewriteRule for ConstantFolding {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let op = op_node.operator();
        if !op.is_deterministic() || op_node.input_ids().is_empty() {
            return None;
        }
        let output = single_output(op_node)?;
        let inputs: Vec<&Value> = op_node
            .input_ids()
            .iter()
            .map(|id| ctx.constant(*id))
            .collect::<Option<_>>()?;

        match op.run(&InputList::from(inputs.as_slice())) {
            Ok(outputs) => {
                let value = outputs.into_iter().next()?;
                if value.len() > MAX_FOLDED_LEN {
                    return None;
                }
                Some(Rewrite::Constant {
                    value_id: output,
                    value,
                })
            }
            Err(err) => {
                // The error is reported again when the graph is run.
                ctx.diagnostics().warn(
                    ctx.graph(),
                    op_id,
                    format_args!("constant folding failed: {}", err),
                );
                None
            }
        }
    }
}

/// Merge equal constants and operators which compute the same outputs.
struct Merge {}

impl Merge {
    /// Find a constant with a lower ID than `const_id` and the same value.
    fn equal_constant(ctx: &RewriteContext, const_id: NodeId, value: &Value) -> Option<NodeId> {
        ctx.graph()
            .iter()
            .take_while(|(id, _)| *id < const_id)
            .find_map(|(id, node)| {
                let other = node.as_constant()?;
                (other.value() == value).then_some(id)
            })
    }
}

impl RewriteRule for Merge {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        for &input in op_node.input_ids() {
            let Some(value) = ctx.constant(input) else {
                continue;
            };
            if let Some(earlier) = Self::equal_constant(ctx, input, value) {
                return alias(input, earlier);
            }
        }

        let op = op_node.operator();
        if !op.is_deterministic() {
            return None;
        }
        let first_input = *op_node.input_ids().first()?;
        for &other_id in ctx.consumers(first_input) {
            if other_id >= op_id {
                continue;
            }
            let Some(other) = ctx.graph().get_node(other_id).and_then(|n| n.as_operator()) else {
                continue;
            };
            if other.input_ids() == op_node.input_ids()
                && other.output_ids().len() == op_node.output_ids().len()
                && op.same_op(other.operator())
            {
                let pairs = op_node
                    .output_ids()
                    .iter()
                    .copied()
                    .zip(other.output_ids().iter().copied())
                    .collect();
                return Some(Rewrite::Alias(pairs));
            }
        }
        None
    }
}

/// Remove operators which return their input unchanged.
struct RemoveIdentity {}

impl RewriteRule for RemoveIdentity {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        let input = *op_node.input_ids().first()?;
        let op = op_node.operator();

        if op.downcast_ref::<Identity>().is_some() {
            return alias(output, input);
        }
        if let Some(cast) = op.downcast_ref::<Cast>() {
            if ctx.shapes().dtype(input) == Some(cast.to) {
                return alias(output, input);
            }
        }
        if let Some(transpose) = op.downcast_ref::<Transpose>() {
            let is_identity = match &transpose.perm {
                Some(perm) => perm.iter().enumerate().all(|(i, axis)| i == *axis),
                None => ctx
                    .shapes()
                    .get(input)
                    .and_then(|t| t.ndim())
                    .is_some_and(|ndim| ndim <= 1),
            };
            if is_identity {
                return alias(output, input);
            }
        }
        None
    }
}

/// Remove arithmetic with an identity element, eg. `x + 0` or `x * 1`.
struct UselessElementwise {}

impl RewriteRule for UselessElementwise {
    fn prepare(&self, _graph: &Graph) -> Box<dyn Any> {
        let x = || Pattern::symbol("x");
        Box::new(Patterns(vec![
            x() + 0f32,
            x() - 0f32,
            x() * 1f32,
            x() / 1f32,
            Pattern::binary_op("Pow", x(), 1f32),
        ]))
    }

    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        let x = patterns(state)
            .iter()
            .find_map(|pat| pat.test(output, ctx.graph()))?
            .node_id("x")?;

        // Broadcasting with the constant may change the shape.
        if !ctx.shapes().same_shape(output, x) {
            return None;
        }
        alias(output, x)
    }
}

/// Replace `-(-x)` with `x`.
struct DoubleNegation {}

impl RewriteRule for DoubleNegation {
    fn prepare(&self, _graph: &Graph) -> Box<dyn Any> {
        Box::new(Patterns(vec![-(-Pattern::symbol("x"))]))
    }

    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        let x = patterns(state)
            .iter()
            .find_map(|pat| pat.test(output, ctx.graph()))?
            .node_id("x")?;
        alias(output, x)
    }
}

/// Replace integer values whose contents are known from shape inference,
/// such as the shapes of values with static shapes, with constants.
struct ShapeToConstant {}

impl RewriteRule for ShapeToConstant {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        if !op_node.operator().is_deterministic() {
            return None;
        }
        let output = single_output(op_node)?;
        if ctx.shapes().dtype(output) != Some(DataType::Int32) {
            return None;
        }
        let value: Value = match ctx.shapes().get(output)?.to_constant()? {
            Constant::Scalar(x) => Tensor::from_scalar(x).into(),
            Constant::Vector(values) => Tensor::from_vec(values).into(),
        };
        Some(Rewrite::Constant {
            value_id: output,
            value,
        })
    }
}

/// Compute `Shape(f(x))` as `Shape(x)` when `f` preserves the shape of `x`,
/// so that `f` may become unused.
struct ShapeLift {}

impl RewriteRule for ShapeLift {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let op = op_node.operator();
        if op.downcast_ref::<Shape>().is_none() && op.downcast_ref::<ShapeI>().is_none() {
            return None;
        }
        let [input] = op_node.input_ids() else {
            return None;
        };
        let (_, source) = ctx.graph().get_source_node(*input)?;

        // Lifting through an assertion would skip its check.
        if !source.operator().is_deterministic() {
            return None;
        }
        let lifted = source
            .input_ids()
            .iter()
            .copied()
            .find(|id| ctx.shapes().same_shape(*id, *input))?;
        Some(Rewrite::ReplaceInputs {
            op_id,
            op: None,
            input_ids: vec![lifted],
        })
    }
}

/// Remove shape specifications which shape inference already satisfies.
struct UselessSpecifyShape {}

impl RewriteRule for UselessSpecifyShape {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let spec = op_node.operator().downcast_ref::<SpecifyShape>()?;
        let output = single_output(op_node)?;
        let input = *op_node.input_ids().first()?;
        let dims: Vec<_> = ctx.shapes().get(input)?.shape()?.collect();
        if dims.len() != spec.shape.len() {
            return None;
        }
        let satisfied = dims.iter().zip(&spec.shape).all(|(dim, size)| match size {
            Some(size) => dim.as_value() == Some(*size as i32),
            None => true,
        });
        if !satisfied {
            return None;
        }
        alias(output, input)
    }
}

/// Remove reshapes to the input's existing shape.
struct UselessReshape {}

impl RewriteRule for UselessReshape {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        op_node.operator().downcast_ref::<Reshape>()?;
        let output = single_output(op_node)?;
        let input = *op_node.input_ids().first()?;
        if !ctx.shapes().same_shape(output, input) {
            return None;
        }
        alias(output, input)
    }
}

/// Replace `Reshape(Reshape(x, a), b)` with `Reshape(x, b)`.
struct ReshapeChain {}

impl RewriteRule for ReshapeChain {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        op_node.operator().downcast_ref::<Reshape>()?;
        let [input, shape] = op_node.input_ids() else {
            return None;
        };
        let (_, inner, _) = source_op::<Reshape>(ctx, *input)?;
        let inner_input = *inner.input_ids().first()?;
        Some(Rewrite::ReplaceInputs {
            op_id,
            op: None,
            input_ids: vec![inner_input, *shape],
        })
    }
}

/// Combine consecutive transposes into one.
struct TransposeChain {}

fn resolve_perm(perm: &Option<Vec<usize>>, ndim: Option<usize>) -> Option<Vec<usize>> {
    match perm {
        Some(perm) => Some(perm.clone()),
        None => Some((0..ndim?).rev().collect()),
    }
}

impl RewriteRule for TransposeChain {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let outer = op_node.operator().downcast_ref::<Transpose>()?;
        let output = single_output(op_node)?;
        let input = *op_node.input_ids().first()?;
        let (_, inner_node, inner) = source_op::<Transpose>(ctx, input)?;
        let x = *inner_node.input_ids().first()?;

        let ndim = ctx.shapes().get(x).and_then(|t| t.ndim());
        let inner_perm = resolve_perm(&inner.perm, ndim)?;
        let outer_perm = resolve_perm(&outer.perm, Some(inner_perm.len()))?;
        if outer_perm.len() != inner_perm.len() {
            return None;
        }
        let perm: Vec<usize> = outer_perm
            .iter()
            .map(|&axis| inner_perm.get(axis).copied())
            .collect::<Option<_>>()?;

        if perm.iter().enumerate().all(|(i, axis)| i == *axis) {
            return alias(output, x);
        }
        Some(Rewrite::ReplaceInputs {
            op_id,
            op: Some(Arc::new(Transpose { perm: Some(perm) })),
            input_ids: vec![x],
        })
    }
}

/// Return true if a condition is known to hold, either because it is a
/// constant or because its value was inferred.
fn condition_holds(ctx: &RewriteContext, cond: NodeId) -> bool {
    if let Some(value) = ctx.constant(cond) {
        return match value {
            Value::FloatTensor(t) => t.data().iter().all(|x| *x != 0.),
            Value::Int32Tensor(t) => t.data().iter().all(|x| *x != 0),
        };
    }
    ctx.shapes()
        .get(cond)
        .and_then(|t| t.to_constant())
        .is_some_and(|c| c.values().iter().all(|x| *x != 0))
}

/// Remove assertion conditions which are known to hold.
struct UselessAssert {}

impl RewriteRule for UselessAssert {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        op_node.operator().downcast_ref::<Assert>()?;
        let output = single_output(op_node)?;
        let (&input, conditions) = op_node.input_ids().split_first()?;
        let remaining: Vec<NodeId> = conditions
            .iter()
            .copied()
            .filter(|cond| !condition_holds(ctx, *cond))
            .collect();

        if remaining.is_empty() {
            alias(output, input)
        } else if remaining.len() < conditions.len() {
            let input_ids = std::iter::once(input).chain(remaining).collect();
            Some(Rewrite::ReplaceInputs {
                op_id,
                op: None,
                input_ids,
            })
        } else {
            None
        }
    }
}

/// Remove all assertions, assuming their conditions hold.
struct RemoveAllAssert {}

impl RewriteRule for RemoveAllAssert {
    fn rewrite(
        &self,
        _state: &dyn Any,
        _ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        op_node.operator().downcast_ref::<Assert>()?;
        let output = single_output(op_node)?;
        let input = *op_node.input_ids().first()?;
        alias(output, input)
    }
}

/// Replace `log(sigmoid(x))` with `-softplus(-x)`, which does not underflow
/// to `log(0)` for large negative `x`.
struct LogSigmoid {}

impl RewriteRule for LogSigmoid {
    fn prepare(&self, _graph: &Graph) -> Box<dyn Any> {
        Box::new(Patterns(vec![Pattern::unary_op(
            "Log",
            Pattern::unary_op("Sigmoid", Pattern::symbol("x")),
        )]))
    }

    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        if !ctx.is_float(output) {
            return None;
        }
        let x = patterns(state)
            .iter()
            .find_map(|pat| pat.test(output, ctx.graph()))?
            .node_id("x")?;

        let neg_x = ScalarExpr::unary(ScalarOp::Neg, ScalarExpr::Input(0));
        let expr = ScalarExpr::unary(ScalarOp::Neg, ScalarExpr::unary(ScalarOp::Softplus, neg_x));
        Some(Rewrite::Fuse(Fusion::new(
            op_node.name(),
            FusedElementwise::new(expr),
            vec![x],
            vec![output],
        )))
    }
}

/// Replace `log(1 + x)` with `log1p(x)`, which is accurate for small `x`.
struct LogOnePlus {}

impl RewriteRule for LogOnePlus {
    fn prepare(&self, _graph: &Graph) -> Box<dyn Any> {
        Box::new(Patterns(vec![Pattern::unary_op(
            "Log",
            1f32 + Pattern::symbol("x"),
        )]))
    }

    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        let x = patterns(state)
            .iter()
            .find_map(|pat| pat.test(output, ctx.graph()))?
            .node_id("x")?;
        if !ctx.is_float(x) || !ctx.shapes().same_shape(output, x) {
            return None;
        }
        Some(Rewrite::Fuse(Fusion::new(
            op_node.name(),
            Elementwise::new(ScalarOp::Log1p),
            vec![x],
            vec![output],
        )))
    }
}

/// Replace `exp(x) / sum(exp(x))` and `exp(x - max(x)) / sum(exp(x - max(x)))`
/// over one axis with [`Softmax`].
struct SoftmaxFusion {}

impl SoftmaxFusion {
    /// Return the single axis of a reduction which keeps reduced dimensions.
    fn reduced_axis(ctx: &RewriteContext, reduce_id: NodeId, op: ReduceOp) -> Option<i32> {
        let reduce = ctx
            .graph()
            .get_node(reduce_id)?
            .as_operator()?
            .operator()
            .downcast_ref::<Reduce>()?;
        if reduce.op != op || !reduce.keep_dims {
            return None;
        }
        match reduce.axes.as_deref() {
            Some([axis]) => Some(*axis),
            _ => None,
        }
    }
}

impl RewriteRule for SoftmaxFusion {
    fn prepare(&self, _graph: &Graph) -> Box<dyn Any> {
        let x = || Pattern::symbol("x");
        let stable = || {
            let max = Pattern::unary_op("ReduceMax", x()).with_name("max");
            Pattern::unary_op("Exp", x() - max)
        };
        let unstable = || Pattern::unary_op("Exp", x());
        let softmax = |exp: &dyn Fn() -> Pattern| {
            Pattern::binary_op(
                "Div",
                exp().with_name("numerator"),
                Pattern::unary_op("ReduceSum", exp().with_name("denominator")).with_name("sum"),
            )
        };
        Box::new(Patterns(vec![softmax(&stable), softmax(&unstable)]))
    }

    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        _op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let output = single_output(op_node)?;
        if !ctx.is_float(output) {
            return None;
        }
        let pat_match = patterns(state)
            .iter()
            .find_map(|pat| pat.test(output, ctx.graph()))?;
        let x = pat_match.node_id("x")?;

        // Both sides of the division must use the same exponential.
        if pat_match.node_id("numerator")? != pat_match.node_id("denominator")? {
            return None;
        }

        let axis = Self::reduced_axis(ctx, pat_match.node_id("sum")?, ReduceOp::Sum)?;
        if let Some(max_id) = pat_match.node_id("max") {
            let max_axis = Self::reduced_axis(ctx, max_id, ReduceOp::Max)?;
            let ndim = ctx.shapes().get(x).and_then(|t| t.ndim())? as i32;
            let normalize = |axis: i32| if axis < 0 { axis + ndim } else { axis };
            if normalize(axis) != normalize(max_axis) {
                return None;
            }
        }

        Some(Rewrite::Fuse(Fusion::new(
            op_node.name(),
            Softmax { axis },
            vec![x],
            vec![output],
        )))
    }
}

/// An operator that can be absorbed into a fused elementwise expression.
enum Fusable<'a> {
    Elementwise(ScalarOp),
    Fused(&'a ScalarExpr),
}

fn fusable(op: &(dyn Operator + Send + Sync)) -> Option<Fusable<'_>> {
    if let Some(ew) = op.downcast_ref::<Elementwise>() {
        return (!ew.in_place).then_some(Fusable::Elementwise(ew.op));
    }
    if let Some(fused) = op.downcast_ref::<FusedElementwise>() {
        return (!fused.in_place).then_some(Fusable::Fused(&fused.expr));
    }
    None
}

/// Builds a [`ScalarExpr`] by walking backwards from an elementwise
/// operator through the elementwise operators that produce its inputs.
struct FusionBuilder<'a> {
    ctx: &'a RewriteContext<'a>,

    /// Values read by the fused expression. `ScalarExpr::Input(i)` refers
    /// to `inputs[i]`.
    inputs: Vec<NodeId>,

    /// Number of operators absorbed, excluding the root.
    absorbed: usize,
}

impl<'a> FusionBuilder<'a> {
    fn new(ctx: &'a RewriteContext<'a>) -> Self {
        FusionBuilder {
            ctx,
            inputs: Vec::new(),
            absorbed: 0,
        }
    }

    fn input(&mut self, value: NodeId) -> ScalarExpr {
        let index = match self.inputs.iter().position(|id| *id == value) {
            Some(index) => index,
            None => {
                self.inputs.push(value);
                self.inputs.len() - 1
            }
        };
        ScalarExpr::Input(index)
    }

    /// Build the expression for `op` applied to `input_ids`. `op_id` is the
    /// node which applies it.
    fn op_expr(&mut self, op: Fusable, op_id: NodeId, input_ids: &[NodeId]) -> Option<ScalarExpr> {
        // An input that a fused expression reads more than once is not
        // expanded, since its subtree would be copied into each use.
        let args: Vec<ScalarExpr> = input_ids
            .iter()
            .enumerate()
            .map(|(i, id)| match &op {
                Fusable::Fused(expr) if expr.input_uses(i) > 1 => self.input(*id),
                _ => self.value_expr(*id, op_id),
            })
            .collect();
        match op {
            Fusable::Elementwise(op) => match args.as_slice() {
                [x] if op.arity() == 1 => Some(ScalarExpr::unary(op, x.clone())),
                [a, b] if op.arity() == 2 => Some(ScalarExpr::binary(op, a.clone(), b.clone())),
                _ => None,
            },
            Fusable::Fused(expr) => {
                if expr.num_inputs() > args.len() {
                    return None;
                }
                Some(expr.map_inputs(&|i| args[i].clone()))
            }
        }
    }

    /// Build the expression for a value consumed by `consumer`.
    fn value_expr(&mut self, value: NodeId, consumer: NodeId) -> ScalarExpr {
        let ctx = self.ctx;
        if let Some(Value::FloatTensor(t)) = ctx.constant(value) {
            if let (0, Some(x)) = (t.ndim(), t.item()) {
                return ScalarExpr::Constant(*x);
            }
        }
        if let Some((src_id, src)) = ctx.graph().get_source_node(value) {
            let absorb = src.output_ids().len() == 1
                && ctx.is_float(value)
                && ctx.has_single_use(value, consumer)
                && src.input_ids().iter().all(|id| ctx.is_float(*id));
            if let Some(op) = fusable(src.operator()).filter(|_| absorb) {
                if let Some(expr) = self.op_expr(op, src_id, src.input_ids()) {
                    self.absorbed += 1;
                    return expr;
                }
            }
        }
        self.input(value)
    }
}

/// Fuse chains of elementwise operators into [`FusedElementwise`]
/// operators.
struct ElementwiseFusion {}

impl RewriteRule for ElementwiseFusion {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let root = fusable(op_node.operator())?;
        let output = single_output(op_node)?;
        if !ctx.is_float(output) || !op_node.input_ids().iter().all(|id| ctx.is_float(*id)) {
            return None;
        }

        // Fusion starts from the last operator in a chain. Operators whose
        // consumer will absorb them are skipped.
        if let [consumer_id] = ctx.consumers(output) {
            let absorbed_by_consumer = ctx
                .graph()
                .get_node(*consumer_id)
                .and_then(|n| n.as_operator())
                .is_some_and(|consumer| {
                    fusable(consumer.operator()).is_some()
                        && consumer.output_ids().iter().all(|id| ctx.is_float(*id))
                        && consumer.input_ids().iter().all(|id| ctx.is_float(*id))
                });
            if absorbed_by_consumer && !ctx.is_graph_output(output) {
                return None;
            }
        }

        let mut builder = FusionBuilder::new(ctx);
        let expr = builder.op_expr(root, op_id, op_node.input_ids())?;
        if builder.absorbed == 0
            || builder.inputs.len() > MAX_FUSED_INPUTS
            || expr.op_count() > MAX_FUSED_OPS
        {
            return None;
        }
        Some(Rewrite::Fuse(Fusion::new(
            op_node.name(),
            FusedElementwise::new(expr),
            builder.inputs,
            vec![output],
        )))
    }
}

/// Let elementwise operators overwrite an input which has no other uses.
struct InplaceElementwise {}

impl InplaceElementwise {
    fn can_destroy(ctx: &RewriteContext, value: NodeId, op_id: NodeId, output: NodeId) -> bool {
        !ctx.is_graph_input(value)
            && ctx.constant(value).is_none()
            && ctx.has_single_use(value, op_id)
            && ctx.shapes().same_shape(value, output)
            && ctx.shapes().dtype(value) == ctx.shapes().dtype(output)
    }
}

impl RewriteRule for InplaceElementwise {
    fn rewrite(
        &self,
        _state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite> {
        let op = op_node.operator();
        let output = single_output(op_node)?;
        let replacement: Arc<dyn Operator + Send + Sync> =
            if let Some(ew) = op.downcast_ref::<Elementwise>() {
                if ew.in_place {
                    return None;
                }
                Arc::new(Elementwise {
                    op: ew.op,
                    in_place: true,
                })
            } else if let Some(fused) = op.downcast_ref::<FusedElementwise>() {
                if fused.in_place {
                    return None;
                }
                Arc::new(FusedElementwise {
                    in_place: true,
                    ..fused.clone()
                })
            } else {
                return None;
            };

        let inputs = op_node.input_ids();
        let candidates = if op.is_commutative() {
            inputs
        } else {
            &inputs[..inputs.len().min(1)]
        };
        if !candidates
            .iter()
            .any(|id| Self::can_destroy(ctx, *id, op_id, output))
        {
            return None;
        }
        Some(Rewrite::ReplaceOperator {
            op_id,
            op: replacement,
        })
    }
}
