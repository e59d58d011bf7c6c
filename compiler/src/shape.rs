// shape.rs - Result shapes of instructions
//
// Only as much of the type system as the pass needs: array shapes with an
// element type, dimensions and an optional layout, and tuples. Shapes are
// carried through rewrites verbatim; no inference happens here.

use std::fmt;
use std::str::FromStr;

/// Element type of an array shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    Token,
}

impl PrimitiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S8 => "s8",
            PrimitiveType::S16 => "s16",
            PrimitiveType::S32 => "s32",
            PrimitiveType::S64 => "s64",
            PrimitiveType::U8 => "u8",
            PrimitiveType::U16 => "u16",
            PrimitiveType::U32 => "u32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::F16 => "f16",
            PrimitiveType::Bf16 => "bf16",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
            PrimitiveType::Token => "token",
        }
    }
}

impl FromStr for PrimitiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pred" => PrimitiveType::Pred,
            "s8" => PrimitiveType::S8,
            "s16" => PrimitiveType::S16,
            "s32" => PrimitiveType::S32,
            "s64" => PrimitiveType::S64,
            "u8" => PrimitiveType::U8,
            "u16" => PrimitiveType::U16,
            "u32" => PrimitiveType::U32,
            "u64" => PrimitiveType::U64,
            "f16" => PrimitiveType::F16,
            "bf16" => PrimitiveType::Bf16,
            "f32" => PrimitiveType::F32,
            "f64" => PrimitiveType::F64,
            "token" => PrimitiveType::Token,
            other => return Err(format!("unknown element type '{other}'")),
        })
    }
}

/// The shape of an instruction's result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array {
        element: PrimitiveType,
        dims: Vec<i64>,
        /// Minor-to-major layout, when written explicitly (`f32[1]{0}`).
        layout: Option<Vec<i64>>,
    },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn scalar(element: PrimitiveType) -> Self {
        Shape::Array {
            element,
            dims: Vec::new(),
            layout: None,
        }
    }

    pub fn array(element: PrimitiveType, dims: Vec<i64>) -> Self {
        Shape::Array {
            element,
            dims,
            layout: None,
        }
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    /// Shape of the `index`-th tuple element, if this is a tuple that long.
    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        match self {
            Shape::Tuple(elements) => elements.get(index),
            Shape::Array { .. } => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array {
                element,
                dims,
                layout,
            } => {
                write!(f, "{}[{}]", element.as_str(), join_i64(dims))?;
                if let Some(layout) = layout {
                    write!(f, "{{{}}}", join_i64(layout))?;
                }
                Ok(())
            }
            Shape::Tuple(elements) => {
                write!(f, "(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn join_i64(values: &[i64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
