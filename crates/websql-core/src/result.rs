//! Uniform statement results.

use crate::codec;
use crate::engine::NativeResult;
use crate::row::Row;
use serde::Serialize;

/// The engine-independent shape of one statement's result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UniformResult {
    /// Decoded rows in cursor order. Empty when the statement had no cursor.
    pub rows: Vec<Row>,
    /// Rows changed by the statement.
    #[serde(rename = "affectedRows", skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Row id of the inserted row.
    #[serde(rename = "insertId", skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
}

impl UniformResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// JSON view: the row objects, plus the counters when present.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "rows".to_string(),
            serde_json::Value::Array(self.rows.iter().map(Row::to_json).collect()),
        );
        if let Some(n) = self.affected_rows {
            map.insert("affectedRows".to_string(), n.into());
        }
        if let Some(id) = self.insert_id {
            map.insert("insertId".to_string(), id.into());
        }
        serde_json::Value::Object(map)
    }
}

impl<'a> IntoIterator for &'a UniformResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Normalize an engine result.
///
/// `None` stays `None`. Fields the engine does not report are left absent;
/// a failing insert id read only leaves `insert_id` unset.
pub fn normalize_result<R: NativeResult + ?Sized>(native: Option<&R>) -> Option<UniformResult> {
    let native = native?;

    let affected_rows = native.rows_affected();
    let insert_id = match native.insert_id() {
        Ok(id) => id,
        Err(err) => {
            tracing::trace!(error = %err, "insert id unavailable");
            None
        }
    };
    let rows = native
        .rows()
        .map(|rows| rows.iter().map(codec::decode_row).collect())
        .unwrap_or_default();

    Some(UniformResult {
        rows,
        affected_rows,
        insert_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqlResultSet;
    use crate::value::Value;

    #[test]
    fn absent_result_stays_absent() {
        assert_eq!(normalize_result::<SqlResultSet>(None), None);
    }

    #[test]
    fn result_without_cursor_has_no_rows() {
        let native = SqlResultSet::new().with_rows_affected(3);
        let result = normalize_result(Some(&native)).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.affected_rows, Some(3));
        assert_eq!(result.insert_id, None);
        assert_eq!(result.to_json(), serde_json::json!({"rows": [], "affectedRows": 3}));
    }

    #[test]
    fn insert_id_is_copied_when_readable() {
        let native = SqlResultSet::new().with_rows_affected(1).with_insert_id(42);
        let result = normalize_result(Some(&native)).unwrap();
        assert_eq!(result.insert_id, Some(42));
    }

    #[test]
    fn rows_are_decoded_in_order() {
        let native = SqlResultSet::new().with_rows(vec![
            Row::new(vec!["v".into()], vec![Value::Text("bin!ff00".into())]),
            Row::new(vec!["v".into()], vec![Value::Text("two".into())]),
        ]);
        let result = normalize_result(Some(&native)).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows[0].get(0), Some(&Value::Bytes(vec![0xff, 0x00])));
        assert_eq!(result.rows[1].get(0), Some(&Value::Text("two".into())));
        assert_eq!(result.affected_rows, None);
    }

    #[test]
    fn serializes_with_wire_names() {
        let result = UniformResult {
            rows: vec![Row::new(vec!["solution".into()], vec![Value::BigInt(5)])],
            affected_rows: Some(0),
            insert_id: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["affectedRows"], serde_json::json!(0));
        assert!(json.get("insertId").is_none());
        assert_eq!(json["rows"][0]["solution"], serde_json::json!(5));
        assert_eq!(json, result.to_json());
    }
}
