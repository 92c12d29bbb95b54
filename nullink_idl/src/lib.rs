/*!
Parsing and runtime validation of [varlink](https://varlink.org) interface
definitions.

An interface definition names a set of types, errors and methods. Parsing one
yields an [`Interface`]: an ordered list of members, each carrying a
[`TypeSpec`] tree. The model can be rendered back to text with `Display` and
arbitrary `serde_json` values can be checked against it at runtime.

# Examples

```rust
use nullink_idl::Interface;

let iface = Interface::from_description(
    "
# Ping service
interface org.example.ping

# Returns the same string
method Ping(ping: string) -> (pong: string)
",
)
.unwrap();
assert_eq!(iface.name, "org.example.ping");
assert!(iface.method("Ping").is_some());
```
!*/

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

mod format;
mod grammar;
mod validate;


/// The base shape of a varlink type, without modifiers.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeKind {
    Bool,
    Int,
    Float,
    String,
    /// Any non-null JSON value.
    Object,
    /// Reference to a named type of the same interface.
    Custom(String),
    /// Ordered set of allowed identifiers.
    Enum(Vec<String>),
    /// Ordered fields; `()` is the empty struct.
    Struct(Vec<(String, TypeSpec)>),
}

/// A varlink type: a [`TypeKind`] plus its `?`, `[string]` and `[]` modifiers.
///
/// The modifiers are independent of each other. `?[]T` is a nullable array of
/// `T`, and `[]?T` is an array whose elements may each be null; both carry
/// `maybe` and `array`, which the validator accepts in either reading.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeSpec {
    pub kind: TypeKind,
    pub maybe: bool,
    pub dict: bool,
    pub array: bool,
}

impl TypeSpec {
    pub fn plain(kind: TypeKind) -> Self {
        TypeSpec {
            kind,
            maybe: false,
            dict: false,
            array: false,
        }
    }
}

/// One named member of an interface.
#[derive(Clone, Debug, PartialEq)]
pub enum Member {
    Type {
        name: String,
        doc: String,
        data: TypeSpec,
    },
    Error {
        name: String,
        doc: String,
        data: TypeSpec,
    },
    Method {
        name: String,
        doc: String,
        parameters: TypeSpec,
        return_value: TypeSpec,
    },
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Type { name, .. } => name,
            Member::Error { name, .. } => name,
            Member::Method { name, .. } => name,
        }
    }

    pub fn doc(&self) -> &str {
        match self {
            Member::Type { doc, .. } => doc,
            Member::Error { doc, .. } => doc,
            Member::Method { doc, .. } => doc,
        }
    }
}

/// A parsed varlink interface: its reverse-domain name, its docstring and its
/// members in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    pub name: String,
    pub doc: String,
    members: Vec<Member>,
    index: HashMap<String, usize>,
}

/// Failure to turn an interface description into an [`Interface`].
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ParseError {
    #[error("parse error at line {line}, column {column} near `{snippet}`")]
    Syntax {
        line: usize,
        column: usize,
        snippet: String,
    },
    #[error("interface `{interface}`: duplicate member `{member}`")]
    DuplicateMember { interface: String, member: String },
    #[error("interface `{interface}`: at least one member is required")]
    NoMembers { interface: String },
}

/// A value did not conform to the type it was checked against.
///
/// `parameter` names the offending field where one is known, and otherwise
/// holds the compact rendering of the offending value.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("invalid parameter: {parameter}")]
pub struct InvalidParameter {
    pub parameter: String,
}

impl Interface {
    /// Parse an interface definition.
    pub fn from_description(description: &str) -> Result<Interface, ParseError> {
        let (name, doc, members) =
            grammar::interface(description).map_err(|e| ParseError::Syntax {
                line: e.location.line,
                column: e.location.column,
                snippet: description[e.location.offset..].chars().take(24).collect(),
            })?;

        if members.is_empty() {
            return Err(ParseError::NoMembers { interface: name });
        }

        let mut index = HashMap::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            if index.insert(member.name().to_string(), i).is_some() {
                return Err(ParseError::DuplicateMember {
                    interface: name,
                    member: member.name().to_string(),
                });
            }
        }

        Ok(Interface {
            name,
            doc,
            members,
            index,
        })
    }

    /// All members, in declaration order.
    pub fn members(&self) -> std::slice::Iter<'_, Member> {
        self.members.iter()
    }

    /// Look up a member of any kind by name.
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.index.get(name).map(|&i| &self.members[i])
    }

    /// Look up a method member by name.
    pub fn method(&self, name: &str) -> Option<&Member> {
        match self.member(name) {
            Some(m @ Member::Method { .. }) => Some(m),
            _ => None,
        }
    }

    /// Look up the definition of a named type. Only `type` members resolve;
    /// errors and methods are not types.
    pub fn type_def(&self, name: &str) -> Option<&TypeSpec> {
        match self.member(name) {
            Some(Member::Type { data, .. }) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format::interface(self, f)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format::member(self, f)
    }
}

/// Extract the docstring out of a run of whitespace and comments preceding a
/// token: the contiguous `#` lines immediately before it. A blank line or any
/// non-comment content clears the accumulator.
fn trailing_doc(run: &str) -> String {
    let mut doc: Vec<&str> = Vec::new();
    for line in run.lines().rev() {
        let line = line.trim();
        if line.starts_with('#') {
            doc.push(line);
        } else {
            break;
        }
    }
    doc.reverse();
    doc.join("\n")
}
