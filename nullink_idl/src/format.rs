//! Rendering of the parsed model back to interface definition text.
//!
//! Structs go multi-line when they have more than two fields or contain a
//! non-leaf field type (an array or a nested struct). Method parameter lists
//! and error parameter lists always stay on one line.

use std::fmt;

use crate::{Interface, Member, TypeKind, TypeSpec};

const INDENT: usize = 4;

pub(crate) fn interface(iface: &Interface, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !iface.doc.is_empty() {
        writeln!(f, "{}", iface.doc)?;
    }
    writeln!(f, "interface {}", iface.name)?;
    for m in iface.members() {
        writeln!(f)?;
        member(m, f)?;
    }
    Ok(())
}

pub(crate) fn member(m: &Member, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match m {
        Member::Type { name, doc, data } => {
            doc_lines(doc, f)?;
            writeln!(f, "type {} {}", name, spec_to_string(data, Some(INDENT), 0))
        }
        Member::Error { name, doc, data } => {
            doc_lines(doc, f)?;
            writeln!(f, "error {} {}", name, spec_to_string(data, None, 0))
        }
        Member::Method {
            name,
            doc,
            parameters,
            return_value,
        } => {
            doc_lines(doc, f)?;
            writeln!(
                f,
                "method {}{} -> {}",
                name,
                spec_to_string(parameters, None, 0),
                spec_to_string(return_value, Some(INDENT), 0)
            )
        }
    }
}

fn doc_lines(doc: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !doc.is_empty() {
        writeln!(f, "{}", doc)?;
    }
    Ok(())
}

/// Render a type with its modifier prefix. `indent` of `None` forces
/// single-line layout for the whole subtree.
pub(crate) fn spec_to_string(spec: &TypeSpec, indent: Option<usize>, depth: usize) -> String {
    let mut s = String::new();
    if spec.maybe {
        s.push('?');
    }
    if spec.array {
        s.push_str("[]");
    }
    if spec.dict {
        s.push_str("[string]");
    }
    s + &kind_to_string(&spec.kind, indent, depth)
}

fn kind_to_string(kind: &TypeKind, indent: Option<usize>, depth: usize) -> String {
    match kind {
        TypeKind::Bool => "bool".into(),
        TypeKind::Int => "int".into(),
        TypeKind::Float => "float".into(),
        TypeKind::String => "string".into(),
        TypeKind::Object => "object".into(),
        TypeKind::Custom(name) => name.clone(),
        TypeKind::Enum(elts) => format!("({})", elts.join(", ")),
        TypeKind::Struct(fields) => {
            if fields.is_empty() {
                return "()".into();
            }
            let multiline = indent.is_some()
                && (fields.len() > 2
                    || fields
                        .iter()
                        .any(|(_, t)| t.array || matches!(t.kind, TypeKind::Struct(_))));
            let step = indent.unwrap_or(0);
            let pad = if multiline {
                " ".repeat(step * (depth + 1))
            } else {
                String::new()
            };
            let sep = if multiline { ",\n" } else { ", " };

            let mut s = String::from(if multiline { "(\n" } else { "(" });
            let mut first = true;
            for (name, t) in fields {
                if first {
                    first = false;
                } else {
                    s += sep;
                }
                s += &pad;
                s += name;
                s += ": ";
                s += &spec_to_string(t, indent, depth + 1);
            }
            if multiline {
                s += "\n";
                s += &" ".repeat(step * depth);
            }
            s + ")"
        }
    }
}
