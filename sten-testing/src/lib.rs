//! Internal testing utilities for the sten crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Table-driven test runner.
///
/// Define a `Debug` struct, conventionally named `Case`, holding the data for
/// one test, build a collection of cases and call `cases.test_each(...)`.
/// Every case is run even if an earlier one panics. When any case fails, the
/// runner panics afterwards with the number of failures and the debug
/// representation of each failing case.
///
/// ```
/// use sten_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     dims: Vec<usize>,
///     len: usize,
/// }
///
/// let cases = [
///     Case { dims: vec![2, 3], len: 6 },
///     Case { dims: vec![], len: 1 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.dims.iter().product::<usize>(), case.len);
/// });
/// ```
///
/// Cases and the captured state of the test closure must be unwind safe.
/// Fields which are not can usually be replaced by a description from which
/// the value is constructed inside the closure, or wrapped in
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe).
pub trait TestCases {
    type Case;

    /// Run `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with a clone of each case.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;

    /// Run `test` with each case by value.
    ///
    /// The case is formatted before it is moved into the test, so that it
    /// can still be reported on failure.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn check_failures<F: Debug>(failures: Vec<F>) {
    if !failures.is_empty() {
        panic!("{} test cases failed: {:?}", failures.len(), failures);
    }
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        check_failures(failures);
    }

    fn test_each_clone(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Clone + Debug + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| {
                let value = case.clone();
                std::panic::catch_unwind(move || test(value)).is_err()
            })
            .collect();
        check_failures(failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<String> = self
            .into_iter()
            .filter_map(|case| {
                let desc = format!("{:?}", case);
                std::panic::catch_unwind(move || test(case))
                    .is_err()
                    .then_some(desc)
            })
            .collect();
        check_failures(failures);
    }
}

/// Check that two float slices have the same length and that each pair of
/// elements satisfies `|a - b| <= atol + rtol * |b|`.
///
/// NaN values compare equal to each other.
pub fn expect_all_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "length mismatch: {} vs {}",
            actual.len(),
            expected.len()
        ));
    }
    let mismatches: Vec<_> = actual
        .iter()
        .zip(expected)
        .enumerate()
        .filter(|(_, (&a, &b))| {
            let both_nan = a.is_nan() && b.is_nan();
            !both_nan && !((a - b).abs() <= atol + rtol * b.abs())
        })
        .map(|(i, (a, b))| format!("[{}] {} != {}", i, a, b))
        .collect();
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "{} of {} values differ: {}",
            mismatches.len(),
            actual.len(),
            mismatches.join(", ")
        ))
    }
}
