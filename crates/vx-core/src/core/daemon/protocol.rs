//! JSON-line request/response protocol between the engine and its worker
//! processes.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    #[serde(flatten)]
    pub body: WorkerRequestBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequestBody {
    Ping,
    Exec { code: String },
    Command { argv: Vec<String> },
    Cancel { target: u64 },
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_is_flat() {
        let request = WorkerRequest {
            id: 7,
            body: WorkerRequestBody::Exec {
                code: "print('hi')".to_string(),
            },
        };
        let wire = serde_json::to_string(&request).unwrap();
        assert!(wire.starts_with("{\"id\":7"));
        assert!(wire.contains("\"op\":\"exec\""));
        let parsed: WorkerRequest = serde_json::from_str(&wire).unwrap();
        assert!(matches!(parsed.body, WorkerRequestBody::Exec { .. }));
    }

    #[test]
    fn response_defaults_are_lenient() {
        let parsed: WorkerResponse = serde_json::from_str("{\"id\":1,\"ok\":true}").unwrap();
        assert_eq!(parsed.code, 0);
        assert!(parsed.stdout.is_empty());
    }
}
