//! Compilation modes.
//!
//! A [`Mode`] pairs an optimizer configuration with a [`Linker`]. It
//! determines which rewrite rules are applied to a graph when it is
//! compiled, and how the operators of the optimized graph are executed.

use std::fmt;
use std::sync::Arc;

use crate::env::{env_list, env_str};
use crate::link::{linker_from_name, DebugLinker, HybridLinker, InterpretedLinker, Linker};
use crate::optimize::{GraphOptimizer, Query, DEFAULT_MAX_ITERATIONS};

/// Name of the mode that applies cheap optimizations and interprets.
pub const FAST_COMPILE: &str = "FAST_COMPILE";

/// Name of the mode that applies all runtime optimizations and uses native
/// kernels where available.
pub const FAST_RUN: &str = "FAST_RUN";

/// Name of the mode that optimizes like [`FAST_RUN`] and cross-checks every
/// operator.
pub const DEBUG_MODE: &str = "DebugMode";

/// Name of the mode that runs graphs as written.
pub const NONE: &str = "NONE";

/// Names of the predefined modes.
pub const MODE_NAMES: [&str; 4] = [FAST_COMPILE, FAST_RUN, DEBUG_MODE, NONE];

/// Optimizer and linker configuration used to compile graphs.
#[derive(Clone)]
pub struct Mode {
    name: String,

    /// Rules applied when compiling, or `None` to skip optimization.
    optimizer: Option<Query>,

    linker: Arc<dyn Linker>,

    max_iterations: usize,
}

impl Mode {
    /// Create a mode with a custom optimizer query and linker.
    pub fn new(name: &str, optimizer: Option<Query>, linker: Arc<dyn Linker>) -> Mode {
        Mode {
            name: name.to_string(),
            optimizer,
            linker,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Rules tagged `fast_compile`, run by the interpreted linker.
    pub fn fast_compile() -> Mode {
        Self::new(
            FAST_COMPILE,
            Some(Query::new().including(["fast_compile"])),
            Arc::new(InterpretedLinker {}),
        )
    }

    /// Rules tagged `fast_run`, run by the hybrid linker.
    pub fn fast_run() -> Mode {
        Self::new(
            FAST_RUN,
            Some(Query::new().including(["fast_run"])),
            Arc::new(HybridLinker::default()),
        )
    }

    /// Rules tagged `fast_run`, run by the debug linker.
    pub fn debug_mode() -> Mode {
        Self::new(
            DEBUG_MODE,
            Some(Query::new().including(["fast_run"])),
            Arc::new(DebugLinker {}),
        )
    }

    /// No optimization, run by the interpreted linker.
    pub fn none() -> Mode {
        Self::new(NONE, None, Arc::new(InterpretedLinker {}))
    }

    /// Look up a predefined mode by name.
    ///
    /// Names are matched case-insensitively, so `fast_run` selects
    /// [`FAST_RUN`].
    pub fn from_name(name: &str) -> Option<Mode> {
        let mode = match name.trim().to_ascii_uppercase().as_str() {
            "FAST_COMPILE" => Self::fast_compile(),
            "FAST_RUN" => Self::fast_run(),
            "DEBUGMODE" => Self::debug_mode(),
            "NONE" => Self::none(),
            _ => return None,
        };
        Some(mode)
    }

    /// Return the mode configured by environment variables.
    ///
    /// `STEN_MODE` selects a predefined mode (default [`FAST_RUN`]).
    /// `STEN_LINKER` replaces its linker and `STEN_OPTIMIZER_INCLUDING` /
    /// `STEN_OPTIMIZER_EXCLUDING` add comma separated tags to its query.
    /// Unrecognized names are reported and ignored.
    pub fn default_mode() -> Mode {
        ModeConfig {
            mode: env_str("STEN_MODE"),
            linker: env_str("STEN_LINKER"),
            including: env_list("STEN_OPTIMIZER_INCLUDING"),
            excluding: env_list("STEN_OPTIMIZER_EXCLUDING"),
        }
        .into_mode()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the optimizer query, or `None` if optimization is disabled.
    pub fn optimizer(&self) -> Option<&Query> {
        self.optimizer.as_ref()
    }

    pub fn linker(&self) -> &Arc<dyn Linker> {
        &self.linker
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Add tags to the optimizer query.
    ///
    /// If optimization is disabled, this enables it with a query selecting
    /// only `tags`.
    pub fn including<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Mode {
        self.optimizer = Some(self.optimizer.unwrap_or_default().including(tags));
        self
    }

    /// Exclude rules with any of `tags`.
    pub fn excluding<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Mode {
        self.optimizer = self.optimizer.map(|query| query.excluding(tags));
        self
    }

    /// Restrict the optimizer to rules with all of `tags`.
    pub fn requiring<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Mode {
        self.optimizer = self.optimizer.map(|query| query.requiring(tags));
        self
    }

    pub fn with_linker(mut self, linker: Arc<dyn Linker>) -> Mode {
        self.linker = linker;
        self
    }

    /// Replace the optimizer query. `None` disables optimization.
    pub fn with_optimizer(mut self, optimizer: Option<Query>) -> Mode {
        self.optimizer = optimizer;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Mode {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Create the optimizer for this mode, if optimization is enabled.
    pub(crate) fn graph_optimizer(&self) -> Option<GraphOptimizer> {
        let query = self.optimizer.clone()?;
        Some(GraphOptimizer::new(query).with_max_iterations(self.max_iterations))
    }
}

impl Default for Mode {
    fn default() -> Mode {
        Mode::fast_run()
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mode")
            .field("name", &self.name)
            .field("optimizer", &self.optimizer)
            .field("linker", &self.linker.name())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (linker {}, ", self.name, self.linker.name())?;
        match &self.optimizer {
            Some(query) => write!(f, "optimizer {})", query),
            None => write!(f, "no optimizer)"),
        }
    }
}

/// Mode settings read from the environment.
#[derive(Clone, Debug, Default)]
struct ModeConfig {
    mode: Option<String>,
    linker: Option<String>,
    including: Vec<String>,
    excluding: Vec<String>,
}

impl ModeConfig {
    fn into_mode(self) -> Mode {
        let mut mode = match self.mode.as_deref() {
            Some(name) => Mode::from_name(name).unwrap_or_else(|| {
                eprintln!("Unrecognized mode \"{}\", using {}", name, FAST_RUN);
                Mode::fast_run()
            }),
            None => Mode::fast_run(),
        };

        if let Some(name) = self.linker.as_deref() {
            match linker_from_name(name) {
                Some(linker) => mode = mode.with_linker(linker),
                None => eprintln!("Unrecognized linker \"{}\"", name),
            }
        }
        if !self.including.is_empty() {
            mode = mode.including(self.including);
        }
        if !self.excluding.is_empty() {
            mode = mode.excluding(self.excluding);
        }
        mode
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sten_testing::TestCases;

    use super::{Mode, ModeConfig, DEBUG_MODE, FAST_COMPILE, FAST_RUN, MODE_NAMES, NONE};
    use crate::link::InterpretedLinker;
    use crate::optimize::Query;

    #[test]
    fn test_predefined_modes() {
        #[derive(Debug)]
        struct Case {
            name: &'static str,
            linker: &'static str,
            include: Option<&'static [&'static str]>,
        }

        let cases = [
            Case {
                name: FAST_COMPILE,
                linker: "interpreted",
                include: Some(&["fast_compile"]),
            },
            Case {
                name: FAST_RUN,
                linker: "hybrid",
                include: Some(&["fast_run"]),
            },
            Case {
                name: DEBUG_MODE,
                linker: "debug",
                include: Some(&["fast_run"]),
            },
            Case {
                name: NONE,
                linker: "interpreted",
                include: None,
            },
        ];

        cases.test_each(|case| {
            let mode = Mode::from_name(case.name).unwrap();
            assert_eq!(mode.name(), case.name);
            assert_eq!(mode.linker().name(), case.linker);
            let include: Option<Vec<&str>> = mode
                .optimizer()
                .map(|q| q.include().iter().map(|t| t.as_str()).collect());
            assert_eq!(include.as_deref(), case.include);
        });
    }

    #[test]
    fn test_from_name() {
        for name in MODE_NAMES {
            assert!(Mode::from_name(name).is_some());
        }
        assert_eq!(Mode::from_name("fast_run").unwrap().name(), FAST_RUN);
        assert_eq!(Mode::from_name("debugmode").unwrap().name(), DEBUG_MODE);
        assert!(Mode::from_name("PROFILE_MODE").is_none());
    }

    #[test]
    fn test_modify_query() {
        let mode = Mode::fast_run()
            .including(["inplace"])
            .excluding(["fusion"])
            .requiring(["canonicalize"]);
        let query = mode.optimizer().unwrap();
        assert_eq!(query.include(), ["fast_run", "inplace"]);
        assert_eq!(query.exclude(), ["fusion"]);
        assert_eq!(query.require(), ["canonicalize"]);

        // Including tags in a mode without an optimizer enables one.
        let mode = Mode::none().including(["constant_folding"]);
        assert_eq!(mode.optimizer().unwrap().include(), ["constant_folding"]);

        // Excluding tags does not.
        let mode = Mode::none().excluding(["fusion"]);
        assert!(mode.optimizer().is_none());

        let mode = Mode::fast_run().with_optimizer(None);
        assert!(mode.graph_optimizer().is_none());

        let mode = Mode::fast_compile().with_optimizer(Some(Query::new().including(["merge"])));
        let optimizer = mode.graph_optimizer().unwrap();
        assert_eq!(optimizer.selected_rules(), ["merge"]);
    }

    #[test]
    fn test_with_linker() {
        let mode = Mode::fast_run().with_linker(Arc::new(InterpretedLinker {}));
        assert_eq!(mode.name(), FAST_RUN);
        assert_eq!(mode.linker().name(), "interpreted");
        assert_eq!(
            mode.to_string(),
            "FAST_RUN (linker interpreted, optimizer include [fast_run])"
        );
    }

    #[test]
    fn test_mode_config() {
        let mode = ModeConfig::default().into_mode();
        assert_eq!(mode.name(), FAST_RUN);

        let mode = ModeConfig {
            mode: Some("FAST_COMPILE".into()),
            linker: Some("hybrid_nogc".into()),
            including: vec!["inplace".into()],
            excluding: vec!["merge".into()],
        }
        .into_mode();
        assert_eq!(mode.name(), FAST_COMPILE);
        assert_eq!(mode.linker().name(), "hybrid_nogc");
        let query = mode.optimizer().unwrap();
        assert_eq!(query.include(), ["fast_compile", "inplace"]);
        assert_eq!(query.exclude(), ["merge"]);

        // Unknown names fall back to defaults.
        let mode = ModeConfig {
            mode: Some("TURBO".into()),
            linker: Some("jit".into()),
            ..Default::default()
        }
        .into_mode();
        assert_eq!(mode.name(), FAST_RUN);
        assert_eq!(mode.linker().name(), "hybrid");
    }
}
