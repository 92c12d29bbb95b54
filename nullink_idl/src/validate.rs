//! Recursive validation of JSON values against a [`TypeSpec`].

use serde_json::Value;

use crate::{Interface, InvalidParameter, TypeKind, TypeSpec};

impl Interface {
    /// Check `data` against `spec` within this interface.
    ///
    /// Named type references resolve against this interface only. On
    /// mismatch the returned [`InvalidParameter`] names the most specific
    /// offending field, falling back to the offending value itself when no
    /// field context exists.
    pub fn validate(&self, data: &Value, spec: &TypeSpec) -> Result<(), InvalidParameter> {
        self.validate_in(data, spec, None)
    }

    fn validate_in(
        &self,
        data: &Value,
        spec: &TypeSpec,
        field: Option<&str>,
    ) -> Result<(), InvalidParameter> {
        if spec.maybe && data.is_null() {
            return Ok(());
        }

        if spec.array {
            return match data.as_array() {
                Some(elems) => {
                    let elem_spec = TypeSpec {
                        array: false,
                        ..spec.clone()
                    };
                    for elem in elems {
                        self.validate_in(elem, &elem_spec, field)?;
                    }
                    Ok(())
                }
                None => Err(invalid(field, data)),
            };
        }

        if spec.dict {
            return match data.as_object() {
                Some(entries) => {
                    let value_spec = TypeSpec {
                        dict: false,
                        ..spec.clone()
                    };
                    for value in entries.values() {
                        self.validate_in(value, &value_spec, field)?;
                    }
                    Ok(())
                }
                None => Err(invalid(field, data)),
            };
        }

        match &spec.kind {
            TypeKind::Bool if data.is_boolean() => Ok(()),
            TypeKind::Int if data.is_i64() || data.is_u64() => Ok(()),
            TypeKind::Float if data.is_number() => Ok(()),
            TypeKind::String if data.is_string() => Ok(()),
            TypeKind::Object if !data.is_null() => Ok(()),
            TypeKind::Custom(name) => match self.type_def(name) {
                Some(def) => self.validate_in(data, def, field),
                None => Err(invalid(field, data)),
            },
            TypeKind::Enum(elts) => match data.as_str() {
                Some(s) if elts.iter().any(|e| e == s) => Ok(()),
                _ => Err(invalid(field, data)),
            },
            TypeKind::Struct(fields) => match data.as_object() {
                Some(obj) => {
                    for (name, field_spec) in fields {
                        match obj.get(name) {
                            None | Some(Value::Null) => {
                                if !field_spec.maybe {
                                    return Err(InvalidParameter {
                                        parameter: name.clone(),
                                    });
                                }
                            }
                            Some(value) => self.validate_in(value, field_spec, Some(name))?,
                        }
                    }
                    Ok(())
                }
                None => Err(invalid(field, data)),
            },
            _ => Err(invalid(field, data)),
        }
    }
}

fn invalid(field: Option<&str>, data: &Value) -> InvalidParameter {
    InvalidParameter {
        parameter: field
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
    }
}
