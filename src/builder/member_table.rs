//! Members of a structured projection: which sub-expression computes each
//! constructed member.

use crate::expression::{Expr, ExprRef, Member};
use crate::mapping_schema::MappingSchema;

/// True when `a` and `b` name the same member. Same-named members declared on
/// different types match when both declaring types are ancestors of
/// `component_type`.
pub fn members_equivalent(
    schema: &MappingSchema,
    a: &Member,
    b: &Member,
    component_type: Option<&str>,
) -> bool {
    if a.name != b.name {
        return false;
    }
    if a.declaring_type == b.declaring_type {
        return true;
    }
    component_type.is_some_and(|component| {
        schema.is_same_or_parent_of(&a.declaring_type, component)
            && schema.is_same_or_parent_of(&b.declaring_type, component)
    })
}

#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    entries: Vec<(Member, ExprRef)>,
}

impl MemberTable {
    /// Destructure a projection body. `None` when the body cannot be split into
    /// named members, which makes the projection scalar.
    pub fn from_projection(body: &ExprRef) -> Option<Self> {
        let entries = match body.as_ref() {
            Expr::New { members, args, .. } if !members.is_empty() => members
                .iter()
                .cloned()
                .zip(args.iter().cloned())
                .collect(),
            Expr::MemberInit { bindings, .. } => bindings.clone(),
            _ => return None,
        };
        Some(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact lookup: same name and declaring type.
    pub fn get(&self, member: &Member) -> Option<ExprRef> {
        self.entries
            .iter()
            .find(|(m, _)| m.name == member.name && m.declaring_type == member.declaring_type)
            .map(|(_, e)| e.clone())
    }

    /// Second phase of member lookup: an entry with the same name whose
    /// declaring type is compatible within `component_type`.
    pub fn find_equivalent(
        &self,
        schema: &MappingSchema,
        member: &Member,
        component_type: Option<&str>,
    ) -> Option<ExprRef> {
        self.entries
            .iter()
            .find(|(m, _)| members_equivalent(schema, m, member, component_type))
            .map(|(_, e)| e.clone())
    }

    /// Match an interface member against the entry of the same name, either
    /// because the entry's type implements the interface or because both
    /// names are defined by a common type in `body_type`'s hierarchy.
    pub fn find_interface_match(
        &self,
        schema: &MappingSchema,
        member: &Member,
        body_type: Option<&str>,
    ) -> Option<ExprRef> {
        let (candidate, expr) = self.entries.iter().find(|(m, _)| m.name == member.name)?;
        if !schema.is_interface(&member.declaring_type) {
            return None;
        }
        if schema.is_same_or_parent_of(&member.declaring_type, &candidate.declaring_type) {
            return Some(expr.clone());
        }

        let interface_defs = schema.defining_types(&member.declaring_type, &member.name);
        let body_defs = body_type
            .map(|t| schema.defining_types(t, &candidate.name))
            .unwrap_or_default();
        interface_defs
            .iter()
            .any(|t| body_defs.contains(t))
            .then(|| expr.clone())
    }

    pub fn insert(&mut self, member: Member, expr: ExprRef) {
        if self.get(&member).is_none() {
            self.entries.push((member, expr));
        }
    }

    pub fn values(&self) -> Vec<ExprRef> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Entries that project to columns, in declaration order. Method-valued
    /// pseudo-members are skipped.
    pub fn columns(&self) -> Vec<(Member, ExprRef)> {
        self.entries
            .iter()
            .filter(|(m, _)| !m.is_method())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Parameter, ScalarType, ShapeType};
    use crate::mapping_schema::TypeDescriptor;

    fn schema() -> MappingSchema {
        MappingSchema::from_descriptors(vec![
            TypeDescriptor::interface("IHasName").member("Name", ShapeType::Scalar(ScalarType::String)),
            TypeDescriptor::class("NamedBase")
                .implements("IHasName")
                .member("Name", ShapeType::Scalar(ScalarType::String)),
            TypeDescriptor::class("Person")
                .extends("NamedBase")
                .member("Age", ShapeType::Scalar(ScalarType::Int32)),
        ])
        .unwrap()
    }

    fn table() -> MemberTable {
        let x = Parameter::new(1, "x", ShapeType::named("Row")).to_expr();
        let name = Member::property("NamedBase", "Name", ShapeType::Scalar(ScalarType::String));
        let age = Member::property("Person", "Age", ShapeType::Scalar(ScalarType::Int32));
        let describe = Member::method("Person", "Describe", ShapeType::Scalar(ScalarType::String));
        let body = Expr::member_init(
            ShapeType::named("Person"),
            vec![
                (name.clone(), Expr::member(&x, name.clone())),
                (age.clone(), Expr::member(&x, age)),
                (describe.clone(), Expr::member(&x, describe)),
            ],
        );
        MemberTable::from_projection(&body).unwrap()
    }

    #[test]
    fn test_positional_construction_is_scalar() {
        let x = Parameter::new(1, "x", ShapeType::named("Row")).to_expr();
        let body = Expr::construct(ShapeType::named("Pair"), vec![x.clone(), x.clone()]);
        assert!(MemberTable::from_projection(&body).is_none());
        assert!(MemberTable::from_projection(&x).is_none());
    }

    #[test]
    fn test_columns_skip_method_members() {
        let names: Vec<String> = table().columns().into_iter().map(|(m, _)| m.name).collect();
        assert_eq!(names, vec!["Name", "Age"]);
        assert_eq!(table().len(), 3);
    }

    #[test]
    fn test_equivalent_member_through_component_type() {
        let schema = schema();
        let declared_on_person =
            Member::property("Person", "Name", ShapeType::Scalar(ScalarType::String));
        let table = table();
        assert!(table.get(&declared_on_person).is_none());
        assert!(table
            .find_equivalent(&schema, &declared_on_person, Some("Person"))
            .is_some());
        assert!(table.find_equivalent(&schema, &declared_on_person, None).is_none());
    }

    #[test]
    fn test_interface_member_matches_implementer() {
        let schema = schema();
        let interface_name =
            Member::property("IHasName", "Name", ShapeType::Scalar(ScalarType::String));
        assert!(table()
            .find_interface_match(&schema, &interface_name, Some("Person"))
            .is_some());

        let not_interface = Member::property("Other", "Name", ShapeType::Scalar(ScalarType::String));
        assert!(table()
            .find_interface_match(&schema, &not_interface, Some("Person"))
            .is_none());
    }
}
