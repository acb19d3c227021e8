use serde::Deserialize;

use crate::error::FrameError;

/// Name of the payload field in the implicit single-field schemas.
pub const DEFAULT_FIELD: &str = "data";

/// How a schema field's length is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLen {
    /// Constant number of bytes.
    Literal(usize),
    /// The decoded value of an earlier 4-byte field, read as u32 LE.
    /// Only a direct reference is supported, no arithmetic.
    Ref(String),
}

/// One field of a schema-driven frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub len: FieldLen,
    /// Optional type hint carried from the notation; not interpreted.
    pub ty: Option<String>,
}

impl FieldSpec {
    pub fn literal(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len: FieldLen::Literal(len),
            ty: None,
        }
    }

    pub fn reference(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            len: FieldLen::Ref(reference.into()),
            ty: None,
        }
    }
}

/// On-wire convention delimiting one message from the next.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FrameSchema {
    /// `[u32 LE payload length][payload]`.
    #[default]
    LengthPrefixed,
    /// Constant-size frames: zero-padded on send, oversized payloads
    /// rejected. The receiver cannot tell padding from payload.
    Fixed(usize),
    /// Ordered field list; each length is a literal or a reference to an
    /// earlier field's decoded value.
    Fields(Vec<FieldSpec>),
}

#[derive(Deserialize)]
struct FieldNotation {
    name: String,
    length: LenNotation,
    #[serde(rename = "type", default)]
    ty: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenNotation {
    Literal(u64),
    Ref(String),
}

impl FrameSchema {
    /// Build a validated schema-driven framing.
    pub fn fields(specs: Vec<FieldSpec>) -> Result<Self, FrameError> {
        let schema = FrameSchema::Fields(specs);
        schema.validate()?;
        Ok(schema)
    }

    /// Parse the JSON notation, e.g.
    /// `[{"name":"len","length":4},{"name":"data","length":"len"}]`.
    ///
    /// A single literal-length field is the fixed-frame configuration and
    /// normalizes to [`FrameSchema::Fixed`].
    pub fn from_json(notation: &str) -> Result<Self, FrameError> {
        let fields: Vec<FieldNotation> = serde_json::from_str(notation)?;
        let specs: Vec<FieldSpec> = fields
            .into_iter()
            .map(|f| FieldSpec {
                name: f.name,
                len: match f.length {
                    LenNotation::Literal(n) => FieldLen::Literal(n as usize),
                    LenNotation::Ref(r) => FieldLen::Ref(r),
                },
                ty: f.ty,
            })
            .collect();

        if specs.is_empty() {
            return Err(FrameError::EmptySchema);
        }
        if specs.len() == 1 {
            if let FieldLen::Literal(n) = &specs[0].len {
                return Ok(FrameSchema::Fixed(*n));
            }
        }
        Self::fields(specs)
    }

    /// Check the schema invariants: fields exist, names are unique, and
    /// every length reference points at an *earlier* field declared with
    /// literal length 4 (so its u32 reinterpretation is well-formed).
    pub fn validate(&self) -> Result<(), FrameError> {
        let FrameSchema::Fields(specs) = self else {
            return Ok(());
        };
        if specs.is_empty() {
            return Err(FrameError::EmptySchema);
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(FrameError::DuplicateField(spec.name.clone()));
            }
            if let FieldLen::Ref(reference) = &spec.len {
                let Some(pos) = specs.iter().position(|s| s.name == *reference) else {
                    return Err(FrameError::UnknownLengthRef {
                        field: spec.name.clone(),
                        reference: reference.clone(),
                    });
                };
                if pos >= i {
                    return Err(FrameError::ForwardLengthRef {
                        field: spec.name.clone(),
                        reference: reference.clone(),
                    });
                }
                if specs[pos].len != FieldLen::Literal(4) {
                    return Err(FrameError::BadLengthRef {
                        reference: reference.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldLen, FieldSpec, FrameSchema};
    use crate::error::FrameError;

    #[test]
    fn notation_parses_length_reference() {
        let schema =
            FrameSchema::from_json(r#"[{"name":"len","length":4},{"name":"data","length":"len"}]"#)
                .unwrap();
        let FrameSchema::Fields(specs) = schema else {
            panic!("expected schema-driven framing");
        };
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].len, FieldLen::Literal(4));
        assert_eq!(specs[1].len, FieldLen::Ref("len".into()));
    }

    #[test]
    fn single_literal_field_normalizes_to_fixed() {
        let schema = FrameSchema::from_json(r#"[{"name": "data", "length": 1024}]"#).unwrap();
        assert_eq!(schema, FrameSchema::Fixed(1024));
    }

    #[test]
    fn type_hint_is_carried() {
        let schema = FrameSchema::from_json(
            r#"[{"name":"len","length":4,"type":"u32"},{"name":"data","length":"len"}]"#,
        )
        .unwrap();
        let FrameSchema::Fields(specs) = schema else {
            panic!("expected schema-driven framing");
        };
        assert_eq!(specs[0].ty.as_deref(), Some("u32"));
    }

    #[test]
    fn forward_reference_is_rejected() {
        let err = FrameSchema::fields(vec![
            FieldSpec::reference("data", "len"),
            FieldSpec::literal("len", 4),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::ForwardLengthRef { .. }));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = FrameSchema::fields(vec![
            FieldSpec::literal("len", 4),
            FieldSpec::reference("data", "size"),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::UnknownLengthRef { .. }));
    }

    #[test]
    fn non_u32_reference_target_is_rejected() {
        let err = FrameSchema::fields(vec![
            FieldSpec::literal("len", 2),
            FieldSpec::reference("data", "len"),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::BadLengthRef { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = FrameSchema::fields(vec![
            FieldSpec::literal("data", 4),
            FieldSpec::literal("data", 8),
        ])
        .unwrap_err();
        assert!(matches!(err, FrameError::DuplicateField(_)));
    }

    #[test]
    fn empty_notation_is_rejected() {
        assert!(matches!(
            FrameSchema::from_json("[]"),
            Err(FrameError::EmptySchema)
        ));
    }
}
