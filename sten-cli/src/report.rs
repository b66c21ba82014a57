//! Machine-readable summary of a compiled expression, printed by `--json`.

use std::collections::BTreeMap;

use serde::Serialize;
use sten::graph::{Dimension, NodeId};
use sten::{Function, RunTiming, SymbolMap, TimingSort, Value};

#[derive(Debug, Serialize)]
pub struct ValueReport {
    pub name: String,
    pub dtype: Option<String>,

    /// Dimensions as sizes or symbol names. `None` if the rank is unknown.
    pub shape: Option<Vec<String>>,

    /// Shape after substituting the sizes of symbolic dimensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_shape: Option<Vec<usize>>,
}

#[derive(Debug, Serialize)]
pub struct OptimizerReport {
    pub rewrites: BTreeMap<String, usize>,
    pub rejected: usize,
    pub pruned: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub operators_before: usize,
    pub operators_after: usize,
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub id: u32,
    pub op: String,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct OutputValue {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub data: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outputs: Vec<OutputValue>,

    pub total_ms: f64,

    /// Total time per operator, slowest first.
    pub op_times_ms: Vec<(String, f64)>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub expr: String,
    pub mode: String,
    pub inputs: Vec<ValueReport>,
    pub outputs: Vec<ValueReport>,
    pub optimizer: OptimizerReport,
    pub steps: Vec<StepReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
}

fn format_shape(dims: Vec<Dimension>) -> Vec<String> {
    dims.into_iter().map(|dim| dim.to_string()).collect()
}

fn value_report(func: &Function, id: NodeId, resolved_shape: Option<Vec<usize>>) -> ValueReport {
    let graph = func.graph();
    let node = graph.get_node(id);
    let dtype = func
        .shapes()
        .dtype(id)
        .or_else(|| node.and_then(|n| n.dtype()));
    let shape = func
        .shapes()
        .dims(id)
        .or_else(|| node.and_then(|n| n.shape()));
    ValueReport {
        name: graph.node_name(id),
        dtype: dtype.map(|dt| dt.to_string()),
        shape: shape.map(format_shape),
        resolved_shape,
    }
}

impl Report {
    /// Summarize a compiled function.
    ///
    /// If `symbols` is given, output shapes are also reported with symbolic
    /// dimensions resolved.
    pub fn new(expr: &str, func: &Function, symbols: Option<&SymbolMap>) -> Report {
        // If any output shape fails to evaluate, none are resolved.
        let resolved = symbols
            .and_then(|symbols| func.resolve_output_shapes(symbols).ok())
            .unwrap_or_else(|| vec![None; func.output_ids().len()]);

        let stats = func.stats();
        let graph = func.graph();

        Report {
            expr: expr.to_string(),
            mode: func.mode_name().to_string(),
            inputs: func
                .input_ids()
                .iter()
                .map(|&id| value_report(func, id, None))
                .collect(),
            outputs: func
                .output_ids()
                .iter()
                .zip(resolved)
                .map(|(&id, resolved)| value_report(func, id, resolved))
                .collect(),
            optimizer: OptimizerReport {
                rewrites: stats
                    .sorted_rewrites()
                    .into_iter()
                    .map(|(rule, count)| (rule.to_string(), count))
                    .collect(),
                rejected: stats.rejected,
                pruned: stats.pruned,
                nodes_before: stats.nodes_before,
                nodes_after: stats.nodes_after,
                operators_before: stats.operators_before,
                operators_after: stats.operators_after,
            },
            steps: func
                .strategies()
                .into_iter()
                .map(|(id, strategy)| StepReport {
                    id: id.as_u32(),
                    op: graph
                        .get_node(id)
                        .and_then(|node| node.as_operator())
                        .map(|op| op.operator().name().to_string())
                        .unwrap_or_default(),
                    strategy: strategy.to_string(),
                })
                .collect(),
            run: None,
        }
    }

    pub fn set_run(&mut self, outputs: &[Value], timing: &RunTiming) {
        let outputs = outputs
            .iter()
            .map(|value| OutputValue {
                shape: value.shape().to_vec(),
                dtype: value.dtype().to_string(),
                data: match value {
                    Value::FloatTensor(t) => t.data().to_vec(),
                    Value::Int32Tensor(t) => t.data().iter().map(|&x| x as f32).collect(),
                },
            })
            .collect();
        self.run = Some(RunReport {
            outputs,
            total_ms: timing.total_time.as_secs_f64() * 1000.,
            op_times_ms: timing
                .by_operator(TimingSort::ByTime)
                .into_iter()
                .map(|(name, time)| (name, time.as_secs_f64() * 1000.))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use sten::graph::builder::Expr;
    use sten::graph::Dimension;
    use sten::{compile, DataType, Mode, SymbolMap};

    use super::Report;

    #[test]
    fn test_report() {
        let x = Expr::value_with_info(
            "x",
            DataType::Float,
            &[Dimension::Symbolic("batch".into()), Dimension::Fixed(3)],
        );
        let y = x.clone() * 2f32;
        let graph = Expr::make_graph([x], [y]);
        let func = compile(graph, &Mode::fast_compile()).unwrap();

        let mut symbols = SymbolMap::new();
        symbols.insert("batch", 2);
        let report = Report::new("x * 2", &func, Some(&symbols));

        assert_eq!(report.mode, "FAST_COMPILE");
        assert_eq!(report.inputs.len(), 1);
        assert_eq!(report.inputs[0].name, "x");
        assert_eq!(
            report.inputs[0].shape.as_deref(),
            Some(["batch".to_string(), "3".to_string()].as_slice())
        );
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].resolved_shape, Some(vec![2, 3]));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].op, "Mul");
        assert_eq!(report.steps[0].strategy, "interpreted");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["expr"], "x * 2");
        assert!(json.get("run").is_none());
        assert_eq!(json["outputs"][0]["resolved_shape"], serde_json::json!([2, 3]));
    }
}
