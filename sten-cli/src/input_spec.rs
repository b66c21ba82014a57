use sten::graph::Dimension;
use sten::DataType;

/// Declares a graph input, parsed from `name[:dtype][dims]`.
///
/// Examples are `x`, `x:i32`, `x[batch, 3]` and `x:f32[]` (a scalar). The
/// dtype defaults to f32. If no dims are given, the shape is unknown.
#[derive(Clone, Debug, PartialEq)]
pub struct InputSpec {
    pub name: String,
    pub dtype: DataType,
    pub shape: Option<Vec<Dimension>>,
}

impl InputSpec {
    pub fn parse(spec: &str) -> Result<InputSpec, ParseError> {
        let (head, shape) = match spec.find('[') {
            Some(start) => {
                let Some(dims) = spec[start + 1..].strip_suffix(']') else {
                    return Err(ParseError::new(spec, ParseErrorKind::UnclosedShape));
                };
                (&spec[..start], Some(parse_dims(spec, dims)?))
            }
            None => (spec, None),
        };

        let (name, dtype) = match head.split_once(':') {
            Some((name, dtype)) => {
                let dtype = DataType::from_name(dtype.trim()).ok_or_else(|| {
                    ParseError::new(spec, ParseErrorKind::InvalidDataType(dtype.trim().into()))
                })?;
                (name.trim(), dtype)
            }
            None => (head.trim(), DataType::Float),
        };
        if !is_identifier(name) {
            return Err(ParseError::new(spec, ParseErrorKind::InvalidName));
        }

        Ok(InputSpec {
            name: name.to_string(),
            dtype,
            shape,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|ch| ch.is_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_alphanumeric() || ch == '_')
}

fn parse_dims(spec: &str, dims: &str) -> Result<Vec<Dimension>, ParseError> {
    if dims.trim().is_empty() {
        return Ok(Vec::new());
    }
    dims.split(',')
        .map(|dim| {
            let dim = dim.trim();
            if let Ok(size) = dim.parse::<usize>() {
                Ok(Dimension::Fixed(size))
            } else if is_identifier(dim) {
                Ok(Dimension::Symbolic(dim.to_string()))
            } else {
                Err(ParseError::new(spec, ParseErrorKind::InvalidDim(dim.into())))
            }
        })
        .collect()
}

/// Specifies the size of a symbolic dimension, parsed from `name=size`.
#[derive(Clone, Debug, PartialEq)]
pub struct DimSize {
    pub dim_name: String,
    pub size: usize,
}

impl DimSize {
    pub fn parse(spec: &str) -> Result<DimSize, ParseError> {
        let Some((name, size)) = spec.split_once('=') else {
            return Err(ParseError::new(spec, ParseErrorKind::MissingEquals));
        };
        let name = name.trim();
        if !is_identifier(name) {
            return Err(ParseError::new(spec, ParseErrorKind::InvalidName));
        }
        let size: usize = size
            .trim()
            .parse()
            .map_err(|_| ParseError::new(spec, ParseErrorKind::InvalidSize))?;
        Ok(DimSize {
            dim_name: name.to_string(),
            size,
        })
    }

    /// Sort entries by name and remove duplicates, keeping the last entry
    /// for each name.
    pub fn sort_dedup(sizes: &mut Vec<DimSize>) {
        // `sort_by` is stable and `dedup_by` keeps the first entry, hence
        // the reversals.
        sizes.reverse();
        sizes.sort_by(|a, b| a.dim_name.cmp(&b.dim_name));
        sizes.dedup_by(|a, b| a.dim_name == b.dim_name);
    }
}

#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::enum_variant_names)]
enum ParseErrorKind {
    InvalidName,
    InvalidDataType(String),
    InvalidDim(String),
    UnclosedShape,
    MissingEquals,
    InvalidSize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    spec: String,
    kind: ParseErrorKind,
}

impl ParseError {
    fn new(spec: &str, kind: ParseErrorKind) -> ParseError {
        ParseError {
            spec: spec.to_string(),
            kind,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ParseErrorKind::InvalidName => write!(fmt, "invalid name in \"{}\"", self.spec),
            ParseErrorKind::InvalidDataType(dtype) => write!(
                fmt,
                "unknown data type \"{}\" in \"{}\". Expected f32 or i32.",
                dtype, self.spec
            ),
            ParseErrorKind::InvalidDim(dim) => write!(
                fmt,
                "invalid dimension \"{}\" in \"{}\". Must be a size or name.",
                dim, self.spec
            ),
            ParseErrorKind::UnclosedShape => {
                write!(fmt, "shape in \"{}\" must end with ']'", self.spec)
            }
            ParseErrorKind::MissingEquals => write!(
                fmt,
                "invalid dimension size spec \"{}\": expected <name>=<size>",
                self.spec
            ),
            ParseErrorKind::InvalidSize => write!(
                fmt,
                "invalid dimension size in \"{}\". Must be a non-negative integer.",
                self.spec
            ),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use sten::graph::Dimension;
    use sten::DataType;
    use sten_testing::TestCases;

    use super::{DimSize, InputSpec, ParseError, ParseErrorKind};

    #[test]
    fn test_parse_input_spec() {
        #[derive(Debug)]
        struct Case<'a> {
            spec: &'a str,
            expected: Result<InputSpec, ParseError>,
        }

        let input = |name: &str, dtype, shape: Option<Vec<Dimension>>| InputSpec {
            name: name.to_string(),
            dtype,
            shape,
        };

        let cases = [
            Case {
                spec: "x",
                expected: Ok(input("x", DataType::Float, None)),
            },
            Case {
                spec: "idx:i32",
                expected: Ok(input("idx", DataType::Int32, None)),
            },
            Case {
                spec: "x[batch, 3]",
                expected: Ok(input(
                    "x",
                    DataType::Float,
                    Some(vec![Dimension::Symbolic("batch".into()), Dimension::Fixed(3)]),
                )),
            },
            Case {
                spec: "scale:f32[]",
                expected: Ok(input("scale", DataType::Float, Some(vec![]))),
            },
            Case {
                spec: "x:f64",
                expected: Err(ParseError::new(
                    "x:f64",
                    ParseErrorKind::InvalidDataType("f64".into()),
                )),
            },
            Case {
                spec: "x[2, -1]",
                expected: Err(ParseError::new(
                    "x[2, -1]",
                    ParseErrorKind::InvalidDim("-1".into()),
                )),
            },
            Case {
                spec: "x[2",
                expected: Err(ParseError::new("x[2", ParseErrorKind::UnclosedShape)),
            },
            Case {
                spec: "2x",
                expected: Err(ParseError::new("2x", ParseErrorKind::InvalidName)),
            },
        ];

        cases.test_each(|Case { spec, expected }| {
            assert_eq!(InputSpec::parse(spec), *expected);
        })
    }

    #[test]
    fn test_parse_dim_size() {
        assert_eq!(
            DimSize::parse("batch=4"),
            Ok(DimSize {
                dim_name: "batch".into(),
                size: 4
            })
        );
        assert_eq!(
            DimSize::parse("batch"),
            Err(ParseError::new("batch", ParseErrorKind::MissingEquals))
        );
        assert_eq!(
            DimSize::parse("batch=-1"),
            Err(ParseError::new("batch=-1", ParseErrorKind::InvalidSize))
        );
        assert_eq!(
            DimSize::parse("batch=-1").err().unwrap().to_string(),
            "invalid dimension size in \"batch=-1\". Must be a non-negative integer."
        );
    }

    #[test]
    fn test_sort_dedup() {
        let mut sizes: Vec<DimSize> = ["seq=8", "batch=1", "batch=2"]
            .into_iter()
            .map(|spec| DimSize::parse(spec).unwrap())
            .collect();

        DimSize::sort_dedup(&mut sizes);

        assert_eq!(
            sizes,
            [
                DimSize::parse("batch=2").unwrap(),
                DimSize::parse("seq=8").unwrap(),
            ]
        );
    }
}
