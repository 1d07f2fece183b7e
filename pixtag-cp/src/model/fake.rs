//! Fake model invoker for tests and offline runs
//!
//! Answers every request with one fixed record per image, or with a canned
//! response or error. Requests are recorded for inspection.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Mutex;

use super::{ModelInvoker, ModelRequest};
use crate::error::ModelError;

#[derive(Debug)]
enum Behavior {
    /// The same record for each image in the request
    PerImage(Map<String, Value>),
    Fixed(Value),
    Fail(ModelError),
}

#[derive(Debug)]
pub struct FakeInvoker {
    behavior: Behavior,
    requests: Mutex<Vec<ModelRequest>>,
}

impl FakeInvoker {
    /// Label every image with `record`
    pub fn labeling(record: Value) -> Self {
        let record = match record {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::with_behavior(Behavior::PerImage(record))
    }

    /// Return `response` regardless of the request
    pub fn responding(response: Value) -> Self {
        Self::with_behavior(Behavior::Fixed(response))
    }

    pub fn failing(error: ModelError) -> Self {
        Self::with_behavior(Behavior::Fail(error))
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, oldest first
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelInvoker for FakeInvoker {
    async fn invoke(&self, request: &ModelRequest) -> Result<Value, ModelError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        match &self.behavior {
            Behavior::PerImage(record) => Ok(Value::Array(
                request
                    .images
                    .iter()
                    .map(|_| Value::Object(record.clone()))
                    .collect(),
            )),
            Behavior::Fixed(value) => Ok(value.clone()),
            Behavior::Fail(error) => Err(error.clone()),
        }
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}
