use std::cell::RefCell;
use std::fmt;

use rustc_hash::FxHashSet;

use crate::env::env_str;
use crate::graph::{Graph, NodeId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    #[default]
    Off,
    /// Report only rewrites that were rejected or failed.
    Warn,
    /// Report all rewrites.
    Info,
}

impl DiagnosticLevel {
    /// Parse a level from a string such as `info`, `warn` or `0`.
    pub fn from_name(name: &str) -> Option<DiagnosticLevel> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "off" | "false" => Some(DiagnosticLevel::Off),
            "warn" => Some(DiagnosticLevel::Warn),
            "1" | "info" | "true" => Some(DiagnosticLevel::Info),
            _ => None,
        }
    }
}

/// Diagnostic reporter for graph rewrites.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Nodes against which diagnostics have been reported at the `Warn` level.
    warned_nodes: RefCell<FxHashSet<NodeId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new(level: DiagnosticLevel) -> Self {
        Self {
            warned_nodes: RefCell::new(FxHashSet::default()),
            level,
        }
    }

    /// Create a reporter with the level set by `STEN_OPT_VERBOSE`.
    pub fn from_env() -> Self {
        let level = env_str("STEN_OPT_VERBOSE")
            .and_then(|name| DiagnosticLevel::from_name(&name))
            .unwrap_or_default();
        Self::new(level)
    }

    pub fn level(&self) -> DiagnosticLevel {
        self.level
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a diagnostic message for a given node at the [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Info {
            return;
        }
        self.log('I', graph, node, message);
    }

    /// Log a diagnostic message for a given node at the [`Warn`](DiagnosticLevel::Warn) level.
    ///
    /// Only the first warning for each node is reported.
    pub fn warn(&self, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Warn || !self.warned_nodes.borrow_mut().insert(node) {
            return;
        }
        self.log('W', graph, node, message);
    }

    fn log(&self, level_char: char, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        println!("{}| {}: {}", level_char, graph.node_name(node), message);
    }
}
