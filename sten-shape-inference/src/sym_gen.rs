//! Fresh symbol generation.

use crate::sym_expr::SymExpr;

/// Generates unique symbols for sizes that cannot be expressed in terms of
/// existing symbols, such as the output length of a data-dependent operator.
pub struct SymbolGen {
    prefix: String,
    count: u32,
}

impl Default for SymbolGen {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolGen {
    /// Create a generator producing `unknown_1`, `unknown_2` ...
    pub fn new() -> Self {
        Self::with_prefix("unknown")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        SymbolGen {
            prefix: prefix.to_string(),
            count: 0,
        }
    }

    /// Return a new symbol which is assumed to be `>= 0`.
    pub fn gen_positive(&mut self) -> SymExpr {
        self.count += 1;
        SymExpr::pos_var(&format!("{}_{}", self.prefix, self.count))
    }

    /// Number of symbols generated so far.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::SymbolGen;
    use crate::sym_expr::SymExpr;

    #[test]
    fn test_symbol_gen() {
        let mut sym_gen = SymbolGen::new();
        assert_eq!(sym_gen.gen_positive(), SymExpr::pos_var("unknown_1"));
        assert_eq!(sym_gen.gen_positive(), SymExpr::pos_var("unknown_2"));
        assert_eq!(sym_gen.count(), 2);

        let mut sym_gen = SymbolGen::with_prefix("dim");
        assert_eq!(sym_gen.gen_positive(), SymExpr::pos_var("dim_1"));
        assert!(sym_gen.gen_positive().is_positive());
    }
}
