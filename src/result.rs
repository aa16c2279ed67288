//! Result Objects produced by declarative I/O operations

use crate::types::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of an operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Type,
    Validation,
    TargetResolution,
    Io,
    Http,
    Database,
    Model,
    Timeout,
    Import,
    Execution,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Type => "type",
            ErrorKind::Validation => "validation",
            ErrorKind::TargetResolution => "target_resolution",
            ErrorKind::Io => "io",
            ErrorKind::Http => "http",
            ErrorKind::Database => "database",
            ErrorKind::Model => "model",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Import => "import",
            ErrorKind::Execution => "execution",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded inside a Result Object
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind} error: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Wrap a collaborator error, keeping its whole cause chain
    pub fn wrap(kind: ErrorKind, error: &anyhow::Error) -> Self {
        Self::new(kind, format!("{:#}", error))
    }
}

/// Uniform outcome of every I/O operation
#[derive(Debug, Clone, PartialEq)]
pub struct ResultObject {
    pub success: bool,
    pub data: Value,
    pub error: Option<OperationError>,
    pub execution_time: Duration,
    pub record_count: usize,
    pub column_list: Vec<String>,
    pub status_code: Option<u16>,
    pub attempts: u32,
}

impl ResultObject {
    /// Successful result; row count and columns are derived from the data
    pub fn success(data: Value) -> Self {
        let (record_count, column_list) = describe_rows(&data);
        Self {
            success: true,
            data,
            error: None,
            execution_time: Duration::ZERO,
            record_count,
            column_list,
            status_code: None,
            attempts: 1,
        }
    }

    pub fn failure(error: OperationError) -> Self {
        Self {
            success: false,
            data: Value::Undefined,
            status_code: error.status_code,
            error: Some(error),
            execution_time: Duration::ZERO,
            record_count: 0,
            column_list: Vec::new(),
            attempts: 1,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status_code = status;
        self
    }

    /// Replace the data, recomputing row metadata (used after transforms)
    pub fn with_data(mut self, data: Value) -> Self {
        let (record_count, column_list) = describe_rows(&data);
        self.data = data;
        self.record_count = record_count;
        self.column_list = column_list;
        self
    }

    /// The object seen by expressions
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Boolean(self.success));
        map.insert("data".to_string(), self.data.clone());
        if let Some(error) = &self.error {
            let mut err = BTreeMap::new();
            err.insert("kind".to_string(), Value::from(error.kind.as_str()));
            err.insert("message".to_string(), Value::from(error.message.as_str()));
            map.insert("error".to_string(), Value::Object(err));
        }
        let millis = self.execution_time.as_secs_f64() * 1000.0;
        map.insert(
            "executionTime".to_string(),
            Value::Decimal((millis * 1000.0).round() / 1000.0),
        );
        map.insert(
            "recordCount".to_string(),
            Value::Integer(self.record_count as i64),
        );
        map.insert(
            "columnList".to_string(),
            Value::from(self.column_list.join(",")),
        );
        map.insert(
            "statusCode".to_string(),
            self.status_code
                .map(|s| Value::Integer(s as i64))
                .unwrap_or(Value::Null),
        );
        map.insert("attempts".to_string(), Value::Integer(self.attempts as i64));
        Value::Object(map)
    }
}

fn describe_rows(data: &Value) -> (usize, Vec<String>) {
    match data {
        Value::Array(rows) => {
            let columns = rows
                .first()
                .and_then(Value::as_object)
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default();
            (rows.len(), columns)
        }
        Value::Object(row) => (1, row.keys().cloned().collect()),
        Value::Undefined | Value::Null => (0, Vec::new()),
        _ => (1, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_describes_rows() {
        let rows = Value::from_json(serde_json::json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]));
        let result = ResultObject::success(rows);
        assert_eq!(result.record_count, 2);
        assert_eq!(result.column_list, vec!["id".to_string(), "name".to_string()]);

        let value = result.to_value();
        assert_eq!(value.member("recordCount"), Value::Integer(2));
        assert_eq!(value.member("columnList"), Value::from("id,name"));
        assert!(value.member("error").is_undefined());
    }

    #[test]
    fn test_failure_exposes_error() {
        let error = OperationError::new(ErrorKind::Http, "not found").with_status(404);
        let value = ResultObject::failure(error).to_value();
        assert_eq!(value.member("success"), Value::Boolean(false));
        assert_eq!(value.member("statusCode"), Value::Integer(404));
        assert_eq!(value.member("error").member("kind"), Value::from("http"));
        assert_eq!(value.member("error").member("message"), Value::from("not found"));
    }

    #[test]
    fn test_wrap_keeps_context() {
        let error = anyhow::anyhow!("connection refused").context("query failed");
        let wrapped = OperationError::wrap(ErrorKind::Database, &error);
        assert_eq!(wrapped.message, "query failed: connection refused");
        assert_eq!(wrapped.to_string(), "database error: query failed: connection refused");
    }
}
