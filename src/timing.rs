//! Per-operator timing reports for program runs.

use std::fmt;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::link::Strategy;
use crate::value::ValueMeta;

/// Source of rows for a plain text table.
trait Table {
    fn rows(&self) -> usize;

    /// Column headings. This also determines the number of columns.
    fn headings(&self) -> &[&str];

    fn cell(&self, row: usize, col: usize) -> String;

    fn display(&self, indent: usize) -> DisplayTable<'_, Self>
    where
        Self: Sized,
    {
        DisplayTable {
            table: self,
            indent,
        }
    }
}

struct DisplayTable<'a, T: Table> {
    table: &'a T,
    indent: usize,
}

impl<T: Table> fmt::Display for DisplayTable<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headings = self.table.headings();
        let cells: Vec<Vec<String>> = (0..self.table.rows())
            .map(|row| (0..headings.len()).map(|col| self.table.cell(row, col)).collect())
            .collect();
        let widths: Vec<usize> = headings
            .iter()
            .enumerate()
            .map(|(col, heading)| {
                cells
                    .iter()
                    .map(|row| row[col].len())
                    .fold(heading.len(), usize::max)
            })
            .collect();
        let pad = 2;
        let indent = " ".repeat(self.indent);

        write!(f, "{}", indent)?;
        for (heading, width) in headings.iter().zip(&widths) {
            write!(f, "{:<w$}", heading, w = width + pad)?;
        }
        writeln!(f)?;
        write!(f, "{}", indent)?;
        for width in &widths {
            write!(f, "{}{:p$}", "-".repeat(*width), "", p = pad)?;
        }
        writeln!(f)?;

        for row in cells {
            write!(f, "{}", indent)?;
            for (cell, width) in row.iter().zip(&widths) {
                write!(f, "{:<w$}", cell, w = width + pad)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Timing record for one step of a program run.
#[derive(Clone, Debug)]
pub struct TimingRecord {
    /// Operator name (eg. `MatMul`).
    pub name: String,

    /// Name of the operator node.
    pub node_name: String,

    /// How the step was executed.
    pub strategy: Strategy,

    /// Shapes and types of the step's inputs. `None` for missing inputs.
    pub input_meta: Vec<Option<ValueMeta>>,

    pub elapsed: Duration,
}

impl TimingRecord {
    fn input_elements(&self) -> usize {
        self.input_meta
            .iter()
            .flatten()
            .map(|meta| meta.shape.iter().product::<usize>())
            .sum()
    }

    fn input_shapes(&self) -> String {
        let shapes: Vec<String> = self
            .input_meta
            .iter()
            .map(|meta| match meta {
                Some(meta) => format!("{:?}", meta.shape),
                None => "_".to_string(),
            })
            .collect();
        shapes.join(", ")
    }
}

/// Sort order for timing reports.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum TimingSort {
    ByName,

    /// Descending total time.
    #[default]
    ByTime,
}

/// Selects which records are included in a report.
#[derive(Clone, Debug, PartialEq)]
pub enum TimingFilter {
    /// Records for operators with a given name.
    Operator(String),

    /// Records for steps executed with a given strategy.
    Strategy(Strategy),
}

impl TimingFilter {
    fn matches(&self, record: &TimingRecord) -> bool {
        match self {
            Self::Operator(name) => record.name == *name,
            Self::Strategy(strategy) => record.strategy == *strategy,
        }
    }
}

/// Timing statistics gathered from a program run.
#[derive(Clone, Debug, Default)]
pub struct RunTiming {
    pub records: Vec<TimingRecord>,

    /// Wall time of the whole run.
    pub total_time: Duration,
}

impl RunTiming {
    /// Return a copy of these timings including only records that match any
    /// of `filters`.
    pub fn filter(&self, filters: &[TimingFilter]) -> RunTiming {
        RunTiming {
            records: self
                .records
                .iter()
                .filter(|r| filters.iter().any(|f| f.matches(r)))
                .cloned()
                .collect(),
            total_time: self.total_time,
        }
    }

    /// Total time of each operator, in report order.
    pub fn by_operator(&self, sort: TimingSort) -> Vec<(String, Duration)> {
        let mut totals: FxHashMap<&str, Duration> = FxHashMap::default();
        for record in &self.records {
            *totals.entry(record.name.as_str()).or_default() += record.elapsed;
        }
        let mut totals: Vec<(String, Duration)> = totals
            .into_iter()
            .map(|(name, time)| (name.to_string(), time))
            .collect();
        match sort {
            TimingSort::ByName => totals.sort_by(|a, b| a.0.cmp(&b.0)),
            TimingSort::ByTime => totals.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0))),
        }
        totals
    }

    /// Return a formatter for these timings.
    ///
    /// If `include_shapes` is true, each operator is followed by a breakdown
    /// of its time by input shape.
    pub fn display(&self, sort: TimingSort, include_shapes: bool) -> impl fmt::Display + '_ {
        FormattedRunTiming {
            timing: self,
            sort,
            include_shapes,
        }
    }
}

impl fmt::Display for RunTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display(TimingSort::ByTime, false).fmt(f)
    }
}

/// Time spent by one operator on inputs of one shape.
struct ShapeRow {
    shape: String,
    total: Duration,
    count: usize,
    input_elements: usize,
    example_node: String,
}

struct ShapeTable {
    rows: Vec<ShapeRow>,
}

impl Table for ShapeTable {
    fn rows(&self) -> usize {
        self.rows.len()
    }

    fn headings(&self) -> &[&str] {
        &["Shape", "Count", "Mean (ms)", "Total (ms)", "ns/input elem", "Example node"]
    }

    fn cell(&self, row: usize, col: usize) -> String {
        let Some(row) = self.rows.get(row) else {
            return String::new();
        };
        let total_ms = row.total.as_secs_f64() * 1000.0;
        match col {
            0 => row.shape.clone(),
            1 => row.count.to_string(),
            2 => format!("{:.3}", total_ms / row.count.max(1) as f64),
            3 => format!("{:.3}", total_ms),
            4 => {
                let elems = (row.input_elements * row.count).max(1);
                format!("{:.3}", total_ms * 1e6 / elems as f64)
            }
            5 => row.example_node.clone(),
            _ => String::new(),
        }
    }
}

struct FormattedRunTiming<'a> {
    timing: &'a RunTiming,
    sort: TimingSort,
    include_shapes: bool,
}

impl FormattedRunTiming<'_> {
    fn shape_table(&self, op_name: &str) -> ShapeTable {
        let mut rows: Vec<ShapeRow> = Vec::new();
        for record in self.timing.records.iter().filter(|r| r.name == op_name) {
            let shape = record.input_shapes();
            match rows.iter_mut().find(|row| row.shape == shape) {
                Some(row) => {
                    row.total += record.elapsed;
                    row.count += 1;
                }
                None => rows.push(ShapeRow {
                    shape,
                    total: record.elapsed,
                    count: 1,
                    input_elements: record.input_elements(),
                    example_node: record.node_name.clone(),
                }),
            }
        }
        rows.sort_by(|a, b| b.total.cmp(&a.total));
        ShapeTable { rows }
    }
}

impl fmt::Display for FormattedRunTiming<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ms = self.timing.total_time.as_secs_f64() * 1000.0;
        let rows: Vec<[String; 3]> = self
            .timing
            .by_operator(self.sort)
            .into_iter()
            .map(|(name, time)| {
                let ms = time.as_secs_f64() * 1000.0;
                let percent = if total_ms > 0. { ms / total_ms * 100. } else { 0. };
                [name, format!("{:.2}ms", ms), format!("({:.2}%)", percent)]
            })
            .collect();
        let widths: Vec<usize> = (0..3)
            .map(|col| rows.iter().map(|row| row[col].len()).max().unwrap_or(0))
            .collect();

        for row in &rows {
            writeln!(
                f,
                "{:w0$} {:w1$} {:w2$}",
                row[0],
                row[1],
                row[2],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2]
            )?;
            if self.include_shapes {
                writeln!(f)?;
                self.shape_table(&row[0]).display(4).fmt(f)?;
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RunTiming, TimingFilter, TimingRecord, TimingSort};
    use crate::link::Strategy;
    use crate::value::{DataType, ValueMeta};

    fn record(name: &str, strategy: Strategy, shape: &[usize], ms: u64) -> TimingRecord {
        TimingRecord {
            name: name.to_string(),
            node_name: format!("{}_node", name),
            strategy,
            input_meta: vec![Some(ValueMeta {
                dtype: DataType::Float,
                shape: shape.to_vec(),
            })],
            elapsed: Duration::from_millis(ms),
        }
    }

    fn timing() -> RunTiming {
        RunTiming {
            records: vec![
                record("MatMul", Strategy::Native, &[4, 4], 6),
                record("Add", Strategy::Interpreted, &[4], 1),
                record("MatMul", Strategy::Native, &[8, 8], 3),
            ],
            total_time: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_by_operator() {
        let timing = timing();
        let by_time = timing.by_operator(TimingSort::ByTime);
        assert_eq!(by_time[0], ("MatMul".to_string(), Duration::from_millis(9)));
        assert_eq!(by_time[1].0, "Add");

        let by_name = timing.by_operator(TimingSort::ByName);
        assert_eq!(by_name[0].0, "Add");
    }

    #[test]
    fn test_filter() {
        let timing = timing();
        let native = timing.filter(&[TimingFilter::Strategy(Strategy::Native)]);
        assert_eq!(native.records.len(), 2);
        let add = timing.filter(&[TimingFilter::Operator("Add".into())]);
        assert_eq!(add.records.len(), 1);
    }

    #[test]
    fn test_display() {
        let timing = timing();
        let text = timing.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("MatMul 9.00ms"));
        assert!(lines[0].ends_with("(90.00%)"));

        let text = timing.display(TimingSort::ByTime, true).to_string();
        assert!(text.contains("[4, 4]"));
        assert!(text.contains("Example node"));
        assert!(text.contains("MatMul_node"));
    }
}
