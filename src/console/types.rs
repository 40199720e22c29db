use serde::{Deserialize, Serialize};

/// Envelope for every console response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn err<T: Serialize>(msg: impl Into<String>) -> ApiResponse<T> {
        ApiResponse {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BlueprintRequest {
    pub blueprint: String,
}

#[derive(Deserialize, Debug)]
pub struct ReloadRequest {
    pub blueprint: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize, Debug)]
pub struct ObjectRequest {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct MoveRequest {
    pub object: String,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ForceRequest {
    pub object: String,
    pub line: String,
}

#[derive(Deserialize, Debug)]
pub struct StatQuery {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct LineRequest {
    pub line: String,
}
