//! Row Transformer: positional source row to target-shaped record.

use super::FieldMapping;
use crate::core::{Record, Row};
use crate::error::{ImportError, Result};

/// Apply every field's transform to `row`.
///
/// Values are taken positionally; the row must have one value per mapping.
/// The first field that fails to coerce aborts the row with an error naming
/// its target field.
pub fn transform_row(row: &Row, fields: &[FieldMapping]) -> Result<Record> {
    if row.len() != fields.len() {
        return Err(ImportError::transform(
            "*",
            format!("row has {} values, mapping has {} fields", row.len(), fields.len()),
        ));
    }

    let mut record = Record::with_capacity(fields.len());
    for (field, raw) in fields.iter().zip(row.iter()) {
        let value = field
            .transform
            .apply(raw)
            .map_err(|cause| ImportError::transform(&field.target_field, cause))?;
        record.insert(field.target_field.clone(), value);
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::mapping::Transform;

    fn fields() -> Vec<FieldMapping> {
        vec![
            FieldMapping::new("Name", "name", Transform::Str),
            FieldMapping::new("Qty", "quantity", Transform::Int),
            FieldMapping::new("Note", "note", Transform::Direct),
        ]
    }

    #[test]
    fn test_positional_transform() {
        let row = vec![Value::from("  Widget "), Value::from("12"), Value::Null];
        let record = transform_row(&row, &fields()).unwrap();

        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["name", "quantity", "note"]);
        assert_eq!(record.get("name"), Some(&Value::from("Widget")));
        assert_eq!(record.get("quantity"), Some(&Value::Int(12)));
        assert_eq!(record.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_failure_names_target_field() {
        let row = vec![Value::from("Widget"), Value::from("twelve"), Value::Null];
        match transform_row(&row, &fields()) {
            Err(ImportError::Transform { field, message }) => {
                assert_eq!(field, "quantity");
                assert!(message.contains("twelve"));
            }
            other => panic!("expected transform error, got {:?}", other),
        }
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let row = vec![Value::from("Widget")];
        assert!(transform_row(&row, &fields()).is_err());
    }
}
