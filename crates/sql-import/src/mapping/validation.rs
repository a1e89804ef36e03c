//! Mapping descriptor validation.

use super::MappingDescriptor;
use crate::error::{ImportError, Result};
use crate::target::StoredField;
use crate::verify::RowKeyStrategy;
use std::collections::HashSet;

/// Validate a descriptor against the fields stored on its target entity.
///
/// Never patches an invalid descriptor; the first problem found is returned.
pub fn validate(mapping: &MappingDescriptor, stored_fields: &[StoredField]) -> Result<()> {
    if mapping.source.table.trim().is_empty() {
        return Err(ImportError::InvalidMapping("source table is required".into()));
    }
    if mapping.target_entity.trim().is_empty() {
        return Err(ImportError::InvalidMapping("target entity is required".into()));
    }
    if mapping.batch_size == 0 {
        return Err(ImportError::InvalidMapping(
            "batch_size must be at least 1".into(),
        ));
    }
    if mapping.fields.is_empty() {
        return Err(ImportError::InvalidMapping(
            "no field mappings configured".into(),
        ));
    }

    let known: HashSet<&str> = stored_fields.iter().map(|f| f.name.as_str()).collect();
    let mut seen_targets = HashSet::new();

    for (i, field) in mapping.fields.iter().enumerate() {
        let position = i + 1;
        if field.source_field.trim().is_empty() {
            return Err(ImportError::InvalidMapping(format!(
                "missing source_field in mapping {}",
                position
            )));
        }
        if field.target_field.trim().is_empty() {
            return Err(ImportError::InvalidMapping(format!(
                "missing target_field in mapping {}",
                position
            )));
        }
        if !known.contains(field.target_field.as_str()) {
            return Err(ImportError::InvalidMapping(format!(
                "target field {} does not exist in {}",
                field.target_field, mapping.target_entity
            )));
        }
        if !seen_targets.insert(field.target_field.as_str()) {
            return Err(ImportError::InvalidMapping(format!(
                "target field {} is mapped more than once",
                field.target_field
            )));
        }
    }

    if let Some(key) = &mapping.key_field {
        if !known.contains(key.as_str()) {
            return Err(ImportError::InvalidMapping(format!(
                "key field {} does not exist in {}",
                key, mapping.target_entity
            )));
        }
    }

    if let RowKeyStrategy::Field { source_field, .. } = &mapping.verification.row_key {
        if mapping.source_index(source_field).is_none() {
            return Err(ImportError::InvalidMapping(format!(
                "verification key {} is not a mapped source field",
                source_field
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, SourceLocation, Transform};

    fn stored() -> Vec<StoredField> {
        vec![
            StoredField::new("name", "varchar", true),
            StoredField::new("age", "integer", false),
            StoredField::new("legacy_id", "bigint", false),
        ]
    }

    fn mapping(fields: Vec<FieldMapping>) -> MappingDescriptor {
        MappingDescriptor::new("people", SourceLocation::new("dbo", "People"), "person", fields)
    }

    #[test]
    fn test_valid_mapping() {
        let m = mapping(vec![
            FieldMapping::new("Name", "name", Transform::Str),
            FieldMapping::new("Age", "age", Transform::Int),
        ]);
        assert!(validate(&m, &stored()).is_ok());
    }

    #[test]
    fn test_empty_fields_rejected() {
        let m = mapping(vec![]);
        assert!(matches!(
            validate(&m, &stored()),
            Err(ImportError::InvalidMapping(_))
        ));
    }

    #[test]
    fn test_unknown_target_field_rejected() {
        let m = mapping(vec![FieldMapping::new("Email", "email", Transform::Str)]);
        let err = validate(&m, &stored()).unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_missing_source_field_rejected() {
        let m = mapping(vec![FieldMapping::new("", "name", Transform::Str)]);
        assert!(validate(&m, &stored()).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut m = mapping(vec![FieldMapping::new("Name", "name", Transform::Str)]);
        m.batch_size = 0;
        assert!(validate(&m, &stored()).is_err());
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let m = mapping(vec![
            FieldMapping::new("First", "name", Transform::Str),
            FieldMapping::new("Last", "name", Transform::Str),
        ]);
        assert!(validate(&m, &stored()).is_err());
    }

    #[test]
    fn test_unknown_key_field_rejected() {
        let mut m = mapping(vec![FieldMapping::new("Name", "name", Transform::Str)]);
        m.key_field = Some("external_ref".to_string());
        assert!(validate(&m, &stored()).is_err());
    }

    #[test]
    fn test_verification_key_must_be_mapped() {
        let mut m = mapping(vec![FieldMapping::new("Name", "name", Transform::Str)]);
        m.verification.row_key = RowKeyStrategy::Field {
            source_field: "Id".into(),
            target_field: "legacy_id".into(),
        };
        assert!(validate(&m, &stored()).is_err());
    }
}
