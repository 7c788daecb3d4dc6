//! Closed value type crossing the database boundary.
//!
//! Rows read back from storage and values carried in changeset tuples are
//! decoded into `SqlValue`. Conversions fail loudly when a value does not
//! have the shape the caller expects.

use serde::{Deserialize, Serialize};

use crate::errors::DatabaseError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    Bytes(Vec<u8>),
    Bool(bool),
    Text(String),
}

impl SqlValue {
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Int(_) => "integer",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Bool(_) => "bool",
            SqlValue::Text(_) => "text",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Result<i64, DatabaseError> {
        match self {
            SqlValue::Int(v) => Ok(*v),
            other => Err(other.unexpected("integer")),
        }
    }

    /// Non-negative integer, e.g. a height or a chunk count
    pub fn as_u64(&self) -> Result<u64, DatabaseError> {
        let v = self.as_i64()?;
        u64::try_from(v).map_err(|_| DatabaseError::UnexpectedValue {
            expected: "non-negative integer".to_string(),
            found: v.to_string(),
        })
    }

    /// Nullable non-negative integer
    pub fn as_opt_u64(&self) -> Result<Option<u64>, DatabaseError> {
        match self {
            SqlValue::Null => Ok(None),
            other => other.as_u64().map(Some),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], DatabaseError> {
        match self {
            SqlValue::Bytes(v) => Ok(v),
            other => Err(other.unexpected("bytes")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, DatabaseError> {
        match self {
            SqlValue::Bool(v) => Ok(*v),
            // SQLite stores booleans as integers
            SqlValue::Int(0) => Ok(false),
            SqlValue::Int(1) => Ok(true),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn as_text(&self) -> Result<&str, DatabaseError> {
        match self {
            SqlValue::Text(v) => Ok(v),
            other => Err(other.unexpected("text")),
        }
    }

    fn unexpected(&self, expected: &str) -> DatabaseError {
        DatabaseError::UnexpectedValue {
            expected: expected.to_string(),
            found: self.kind().to_string(),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        // Heights and counts never approach i64::MAX
        SqlValue::Int(v as i64)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_reject_wrong_shape() {
        let err = SqlValue::Text("5".into()).as_i64().unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::UnexpectedValue { ref expected, ref found }
                if expected == "integer" && found == "text"
        ));
        assert!(SqlValue::Int(-1).as_u64().is_err());
        assert!(SqlValue::Bytes(vec![1]).as_bool().is_err());
    }

    #[test]
    fn sqlite_integers_read_as_bools() {
        assert!(SqlValue::Int(1).as_bool().unwrap());
        assert!(!SqlValue::Int(0).as_bool().unwrap());
        assert!(SqlValue::Int(2).as_bool().is_err());
    }

    #[test]
    fn optional_values_map_to_null() {
        assert_eq!(SqlValue::from(None::<u64>), SqlValue::Null);
        assert_eq!(SqlValue::Null.as_opt_u64().unwrap(), None);
        assert_eq!(SqlValue::from(Some(7u64)).as_opt_u64().unwrap(), Some(7));
    }
}
