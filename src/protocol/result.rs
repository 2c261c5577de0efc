//! The outcome of one execution.

use serde::de::DeserializeOwned;

use super::RawResponse;
use crate::classify::{classify, ClassifiedError};
use crate::Result;

/// Output of code run on the device, with the classified error if it raised.
///
/// When `error` is set the output is informational only: it holds whatever
/// the code printed before raising.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Text the code printed, trailing line endings removed.
    pub output: String,
    /// The device-side failure, if any.
    pub error: Option<ClassifiedError>,
}

impl ExecutionResult {
    /// A result with output and no error.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    /// Whether the code ran without raising.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert to a `Result`, discarding partial output on failure.
    pub fn into_result(self) -> std::result::Result<String, ClassifiedError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.output),
        }
    }

    /// Deserialize the output as JSON (for code that prints `json.dumps(..)`).
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.output.trim())?)
    }
}

impl From<RawResponse> for ExecutionResult {
    fn from(response: RawResponse) -> Self {
        Self {
            error: response.error.as_deref().map(classify),
            output: response.output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use crate::Error;

    #[test]
    fn raw_error_is_classified() {
        let result = ExecutionResult::from(RawResponse {
            output: "partial".into(),
            error: Some("Traceback (most recent call last):\r\nZeroDivisionError: divide by zero".into()),
        });
        assert!(!result.is_ok());
        let err = result.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeError);
    }

    #[test]
    fn json_output() {
        #[derive(serde::Deserialize)]
        struct Reading {
            temp: f64,
        }
        let result = ExecutionResult::ok("{\"temp\": 21.5}\r\n");
        let reading: Reading = result.json().unwrap();
        assert_eq!(reading.temp, 21.5);
    }

    #[test]
    fn invalid_json_is_error() {
        let result = ExecutionResult::ok("not json");
        assert!(matches!(result.json::<serde_json::Value>(), Err(Error::Json(_))));
    }

    #[test]
    fn ok_result_keeps_output() {
        assert_eq!(ExecutionResult::ok("4").into_result().unwrap(), "4");
    }
}
