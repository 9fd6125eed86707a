use std::fmt::Display;

use crate::compile::LowerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    Int(u32),
    /// Payload-free control token.
    None,
    Tuple(Vec<Ty>),
    Stream(Box<Ty>),
}

impl Ty {
    pub fn i1() -> Self {
        Ty::Int(1)
    }

    pub fn i64() -> Self {
        Ty::Int(64)
    }

    pub fn stream(elem: Ty) -> Self {
        Ty::Stream(Box::new(elem))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Ty::Stream(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Ty::None)
    }

    pub fn stream_element(&self) -> Option<&Ty> {
        match self {
            Ty::Stream(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn tuple_fields(&self) -> Option<&[Ty]> {
        match self {
            Ty::Tuple(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn contains_stream(&self) -> bool {
        match self {
            Ty::Stream(_) => true,
            Ty::Tuple(fields) => fields.iter().any(Ty::contains_stream),
            Ty::Int(_) | Ty::None => false,
        }
    }

    /// Parses the textual form used by module documents:
    /// `i64`, `i1`, `none`, `tuple<i64,i1>`, `stream<i64>`.
    pub fn parse_named(name: &str) -> Option<Self> {
        let name = name.trim();
        if name == "none" {
            return Some(Ty::None);
        }
        if let Some(width) = name.strip_prefix('i') {
            let width: u32 = width.parse().ok()?;
            if width == 0 {
                return None;
            }
            return Some(Ty::Int(width));
        }
        if let Some(inner) = strip_generic(name, "stream") {
            return Some(Ty::stream(Ty::parse_named(inner)?));
        }
        if let Some(inner) = strip_generic(name, "tuple") {
            if inner.trim().is_empty() {
                return Some(Ty::Tuple(Vec::new()));
            }
            let fields = split_top_level(inner)
                .into_iter()
                .map(Ty::parse_named)
                .collect::<Option<Vec<_>>>()?;
            return Some(Ty::Tuple(fields));
        }
        None
    }
}

fn strip_generic<'a>(name: &'a str, head: &str) -> Option<&'a str> {
    name.strip_prefix(head)?
        .trim_start()
        .strip_prefix('<')?
        .strip_suffix('>')
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

impl Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Int(width) => write!(f, "i{width}"),
            Ty::None => write!(f, "none"),
            Ty::Tuple(fields) => {
                write!(f, "tuple<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ">")
            }
            Ty::Stream(elem) => write!(f, "stream<{elem}>"),
        }
    }
}

/// Translates one type into its dataflow representation.
///
/// `stream<T>` becomes the pair `[tuple<T, i1>, none]` (EOS-tagged payload channel
/// plus control channel); every other type passes through unchanged.
pub fn lower_type(ty: &Ty) -> Result<Vec<Ty>, LowerError> {
    match ty {
        Ty::Stream(elem) => {
            if !is_payload_ty(elem) {
                return Err(LowerError::type_conversion(format!(
                    "stream element type cannot be carried on a payload channel: {ty}"
                )));
            }
            Ok(vec![Ty::Tuple(vec![(**elem).clone(), Ty::i1()]), Ty::None])
        }
        Ty::Tuple(fields) if fields.iter().any(Ty::contains_stream) => {
            Err(LowerError::type_conversion(format!(
                "streams nested in tuples are not supported: {ty}"
            )))
        }
        _ => Ok(vec![ty.clone()]),
    }
}

pub fn lower_types<'a>(tys: impl IntoIterator<Item = &'a Ty>) -> Result<Vec<Ty>, LowerError> {
    let mut out = Vec::new();
    for ty in tys {
        out.extend(lower_type(ty)?);
    }
    Ok(out)
}

fn is_payload_ty(ty: &Ty) -> bool {
    match ty {
        Ty::Int(_) => true,
        Ty::Tuple(fields) => !fields.is_empty() && fields.iter().all(is_payload_ty),
        Ty::None | Ty::Stream(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::LowerErrorKind;

    #[test]
    fn parse_and_display_agree() {
        for s in ["i64", "i1", "none", "tuple<i64,i1>", "stream<tuple<i32,i32>>"] {
            let ty = Ty::parse_named(s).expect("parse");
            assert_eq!(ty.to_string(), s);
        }
        assert_eq!(Ty::parse_named("i0"), None);
        assert_eq!(Ty::parse_named("stream<"), None);
        assert_eq!(Ty::parse_named("f32"), None);
    }

    #[test]
    fn stream_lowers_to_payload_and_control() {
        let lowered = lower_type(&Ty::stream(Ty::i64())).expect("lower");
        assert_eq!(
            lowered,
            vec![Ty::Tuple(vec![Ty::i64(), Ty::i1()]), Ty::None]
        );
        assert_eq!(lower_type(&Ty::Int(32)).expect("lower"), vec![Ty::Int(32)]);
    }

    #[test]
    fn malformed_stream_element_is_rejected() {
        let nested = Ty::stream(Ty::stream(Ty::i64()));
        let err = lower_type(&nested).expect_err("nested stream");
        assert_eq!(err.kind, LowerErrorKind::TypeConversion);
        let err = lower_type(&Ty::stream(Ty::None)).expect_err("control element");
        assert_eq!(err.kind, LowerErrorKind::TypeConversion);
    }
}
