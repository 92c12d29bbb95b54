pub use self::grammar::*;

peg::parser! {
    grammar grammar() for str {
        rule whitespace()
            = quiet!{[' ' | '\t' | '\r' | '\n']}
            / expected!("whitespace")

        rule comment()
            = quiet!{ "#" [^ '\n']* ("\n" / ![_]) }
            / expected!("<comment>")

        rule wce()
            = quiet!{ whitespace() / comment() }
            / expected!("<whitespace> or <comment>")

        rule field_name() -> &'input str
            = $( ['a'..='z' | 'A'..='Z'] ( "_"? ['a'..='z' | 'A'..='Z' | '0'..='9'] )* )

        rule member_name() -> &'input str
            = $( ['A'..='Z'] ['a'..='z' | 'A'..='Z' | '0'..='9']* )

        /* Labels never start or end with a hyphen; the first label never
         * starts with a digit. */
        rule interface_name() -> &'input str
            = quiet!{ $( ['a'..='z'] ( "-"* ['a'..='z' | '0'..='9'] )*
                ( "." ['a'..='z' | '0'..='9'] ( "-"* ['a'..='z' | '0'..='9'] )* )+ ) }
            / expected!("<reverse domain name>")

        use crate::trailing_doc;
        use crate::Member;
        use crate::TypeKind;
        use crate::TypeSpec;

        rule element() -> TypeKind
            = "bool"   { TypeKind::Bool }
            / "int"    { TypeKind::Int }
            / "float"  { TypeKind::Float }
            / "string" { TypeKind::String }
            / "object" { TypeKind::Object }
            / n:member_name() { TypeKind::Custom(n.into()) }
            / v:vstruct() { TypeKind::Struct(v) }
            / v:venum()   { TypeKind::Enum(v) }

        rule maybe_element() -> TypeSpec
            = "?" e:element() { TypeSpec { maybe: true, ..TypeSpec::plain(e) } }
            / e:element() { TypeSpec::plain(e) }

        rule collected() -> TypeSpec
            = "[string]" t:maybe_element() { TypeSpec { dict: true, ..t } }
            / "[]" t:maybe_element() { TypeSpec { array: true, ..t } }
            / maybe_element()

        rule vtype() -> TypeSpec
            = "?" t:collected() {?
                if t.maybe { Err("single `?`") } else { Ok(TypeSpec { maybe: true, ..t }) }
            }
            / collected()

        rule object_field() -> (String, TypeSpec)
            = wce()* n:field_name() wce()* ":" wce()* v:vtype() wce()* { (n.into(), v) }

        rule vstruct() -> Vec<(String, TypeSpec)>
            = "(" e:(object_field() ** ",") wce()* ")" { e }

        rule enum_field() -> String
            = wce()* n:field_name() wce()* { n.into() }

        rule venum() -> Vec<String>
            = "(" v:(enum_field() ** ",") wce()* ")" { v }

        rule member() -> Member
            = d:$(wce()*) "type" wce()+ n:member_name() wce()* t:vtype() {
                Member::Type { name: n.into(), doc: trailing_doc(d), data: t }
            }
            / d:$(wce()*) "error" wce()+ n:member_name() wce()* t:vtype() {
                Member::Error { name: n.into(), doc: trailing_doc(d), data: t }
            }
            / d:$(wce()*) "method" wce()+ n:member_name() wce()*
              p:vstruct() wce()* "->" wce()* r:vstruct() {
                Member::Method {
                    name: n.into(),
                    doc: trailing_doc(d),
                    parameters: TypeSpec::plain(TypeKind::Struct(p)),
                    return_value: TypeSpec::plain(TypeKind::Struct(r)),
                }
            }

        pub rule interface() -> (String, String, Vec<Member>)
            = d:$(wce()*) "interface" wce()+ n:$(interface_name()) m:(member()*) wce()* {
                (n.into(), trailing_doc(d), m)
            }
    }
}
