use std::collections::VecDeque;
use std::error::Error;
use std::time::Instant;

use sten::graph::builder::Expr;
use sten::graph::Dimension;
use sten::{compile, DataType, Function, Mode, RunOptions, Tensor, TimingSort};

mod input_spec;
mod lower;
mod parser;
mod report;

use input_spec::{DimSize, InputSpec};
use lower::Lowering;
use report::Report;

struct Args {
    /// Expression to compile.
    expr: String,

    inputs: Vec<InputSpec>,

    /// Name of the compilation mode. Defaults to the mode configured by
    /// `STEN_MODE`.
    mode: Option<String>,

    including: Vec<String>,
    excluding: Vec<String>,

    /// Sizes of symbolic dimensions, used for random inputs.
    dim_sizes: Vec<DimSize>,

    /// Print the optimized graph.
    print: bool,

    /// Run the expression with random inputs.
    run: bool,

    /// Show operator timing stats.
    timing: bool,

    /// Enable verbose logging of each step.
    verbose: bool,

    /// Print a JSON report instead of text.
    json: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut inputs = Vec::new();
    let mut mode = None;
    let mut including = Vec::new();
    let mut excluding = Vec::new();
    let mut dim_sizes = Vec::new();
    let mut print = false;
    let mut run = false;
    let mut timing = false;
    let mut verbose = false;
    let mut json = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('i') | Long("input") => {
                let input = parser.value()?.parse_with(InputSpec::parse)?;
                inputs.push(input);
            }
            Short('m') | Long("mode") => mode = Some(parser.value()?.string()?),
            Long("including") => including.push(parser.value()?.string()?),
            Long("excluding") => excluding.push(parser.value()?.string()?),
            Short('d') | Long("dim") => {
                let size = parser.value()?.parse_with(DimSize::parse)?;
                dim_sizes.push(size);
            }
            Short('p') | Long("print") => print = true,
            Short('r') | Long("run") => run = true,
            Short('t') | Long("timing") => timing = true,
            Short('v') | Long("verbose") => verbose = true,
            Long("json") => json = true,
            Short('h') | Long("help") => {
                println!(
                    "Compile and run tensor expressions.

Usage: {bin_name} [OPTIONS] <expr>

Options:
  -i, --input <name[:dtype][dims]>
                    Declare an input, eg. \"x:f32[batch, 3]\". May be repeated.
  -m, --mode <mode> Compilation mode. One of FAST_COMPILE, FAST_RUN,
                    DebugMode or NONE.
  --including <tag> Also apply optimizations with this tag
  --excluding <tag> Skip optimizations with this tag
  -d, --dim <name=size>
                    Size of a symbolic dimension for random inputs
  -p, --print       Print the optimized graph
  -r, --run         Run with random inputs
  -t, --timing      Output timing info
  -v, --verbose     Enable verbose logging
  --json            Print a JSON report
  -h, --help        Print help

Functions:
{functions}
",
                    bin_name = parser.bin_name().unwrap_or("sten"),
                    functions = lower::FUNCTIONS,
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let expr = values.pop_front().ok_or("missing `<expr>` arg")?;
    DimSize::sort_dedup(&mut dim_sizes);

    Ok(Args {
        expr,
        inputs,
        mode,
        including,
        excluding,
        dim_sizes,
        print,
        run,
        timing,
        verbose,
        json,
    })
}

/// Default size for symbolic dimensions without a `--dim` size.
const DEFAULT_DIM_SIZE: usize = 4;

/// Generate random values for the declared inputs.
fn random_inputs(
    specs: &[InputSpec],
    dim_sizes: &[DimSize],
    rng: &mut fastrand::Rng,
) -> Result<Vec<sten::Value>, Box<dyn Error>> {
    specs
        .iter()
        .map(|spec| {
            let Some(dims) = &spec.shape else {
                return Err(format!(
                    "input \"{}\" has no shape. Declare one with eg. --input {}[4]",
                    spec.name, spec.name
                )
                .into());
            };
            let shape: Vec<usize> = dims
                .iter()
                .map(|dim| match dim {
                    Dimension::Fixed(size) => *size,
                    Dimension::Symbolic(name) => dim_sizes
                        .iter()
                        .find(|ds| ds.dim_name == *name)
                        .map(|ds| ds.size)
                        .unwrap_or(DEFAULT_DIM_SIZE),
                })
                .collect();
            let len = shape.iter().product();

            // Floats are in [0, 1) and ints in [0, 10).
            let value: sten::Value = match spec.dtype {
                DataType::Float => {
                    Tensor::from_data(&shape, (0..len).map(|_| rng.f32()).collect()).into()
                }
                DataType::Int32 => {
                    Tensor::from_data(&shape, (0..len).map(|_| rng.i32(0..10)).collect()).into()
                }
            };
            Ok(value)
        })
        .collect()
}

fn format_dims(dims: Option<&[Dimension]>) -> String {
    match dims {
        Some(dims) => {
            let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("[{}]", dims.join(", "))
        }
        None => "[?]".to_string(),
    }
}

/// Print up to `limit` elements of a value.
fn format_data(value: &sten::Value, limit: usize) -> String {
    let items: Vec<String> = match value {
        sten::Value::FloatTensor(t) => t.data().iter().take(limit).map(|x| format!("{:.4}", x)).collect(),
        sten::Value::Int32Tensor(t) => t.data().iter().take(limit).map(|x| x.to_string()).collect(),
    };
    let ellipsis = if value.len() > limit { ", ..." } else { "" };
    format!("[{}{}]", items.join(", "), ellipsis)
}

fn print_summary(args: &Args, func: &Function) {
    println!("Mode: {}", func.mode_name());

    let stats = func.stats();
    println!(
        "Optimized {} operators to {} with {} rewrites",
        stats.operators_before,
        stats.operators_after,
        stats.total_rewrites()
    );
    for (rule, count) in stats.sorted_rewrites() {
        println!("  {}: {}", rule, count);
    }

    if args.print {
        println!();
        print!("{}", func.debug_print());
        println!();
    }

    for (i, (id, shape)) in func
        .output_ids()
        .iter()
        .zip(func.output_shapes())
        .enumerate()
    {
        println!(
            "Output {} \"{}\" shape {}",
            i,
            func.graph().node_name(*id),
            format_dims(shape.as_deref())
        );
    }
}

/// Compile an expression over declared inputs, print the optimized graph
/// and its output shapes, and optionally run it with random inputs.
///
/// ```text
/// sten "sum(exp(x) * 2, axes=[-1])" --input "x[batch, 3]" --print --run
/// ```
///
/// To get detailed timing information set the `STEN_TIMING` env var or
/// pass `--timing`.
fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    let input_exprs: Vec<Expr> = args
        .inputs
        .iter()
        .map(|spec| match &spec.shape {
            Some(shape) => Expr::value_with_info(&spec.name, spec.dtype, shape),
            None => Expr::value(&spec.name),
        })
        .collect();
    let lowering = Lowering::new(
        args.inputs
            .iter()
            .zip(&input_exprs)
            .map(|(spec, expr)| (spec.name.as_str(), expr.clone())),
    );

    let ast = parser::parse(&args.expr)?;
    let output = lowering.lower(&ast)?;
    let graph = Expr::make_graph(&input_exprs, [output]);

    let mut mode = match &args.mode {
        Some(name) => Mode::from_name(name).ok_or_else(|| format!("unknown mode \"{}\"", name))?,
        None => Mode::default_mode(),
    };
    if !args.including.is_empty() {
        mode = mode.including(args.including.iter().cloned());
    }
    if !args.excluding.is_empty() {
        mode = mode.excluding(args.excluding.iter().cloned());
    }

    let mut func = compile(graph, &mode)?;
    func.set_run_options(RunOptions {
        verbose: args.verbose,
        ..RunOptions::from_env()
    });

    if !args.json {
        print_summary(&args, &func);
    }

    if !args.run {
        if args.json {
            let report = Report::new(&args.expr, &func, None);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    let mut rng = fastrand::Rng::new();
    let inputs = random_inputs(&args.inputs, &args.dim_sizes, &mut rng)?;
    let symbols = func.bind_inputs(&inputs)?;

    if !args.json {
        for (spec, input) in args.inputs.iter().zip(&inputs) {
            println!("Input \"{}\" resolved shape {:?}", spec.name, input.shape());
        }
    }

    let start = Instant::now();
    let (outputs, timing) = func.run_with_timing(inputs)?;
    let elapsed = start.elapsed().as_secs_f64() * 1000.;

    if args.json {
        let mut report = Report::new(&args.expr, &func, Some(&symbols));
        report.set_run(&outputs, &timing);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Returned {} outputs in {:.2}ms", outputs.len(), elapsed);
    for (i, output) in outputs.iter().enumerate() {
        println!(
            "Output {} data type {} shape {:?} = {}",
            i,
            output.dtype(),
            output.shape(),
            format_data(output, 8)
        );
    }
    if args.timing {
        println!();
        print!("{}", timing.display(TimingSort::ByTime, false));
    }

    Ok(())
}
