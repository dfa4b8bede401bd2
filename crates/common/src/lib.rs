use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameters of a port request, sent as query parameters of `/getport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRequest {
    pub servername: String,
    pub priority: u8,
    pub geo: String,
    #[serde(default)]
    pub ip_version: u8,
    #[serde(default = "default_rent_time")]
    pub rent_time_seconds: u32,
}

fn default_rent_time() -> u32 {
    600
}

impl PortRequest {
    /// Check the request before it touches the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.servername.trim().is_empty() {
            return Err("servername cannot be empty".to_string());
        }
        if self.geo.trim().is_empty() {
            return Err("geo cannot be empty".to_string());
        }
        if !(1..=10).contains(&self.priority) {
            return Err("priority must be in range 1-10".to_string());
        }
        if !matches!(self.ip_version, 0 | 4 | 6) {
            return Err("ip_version must be 4 or 6, or 0 for both".to_string());
        }
        if self.rent_time_seconds == 0 {
            return Err("rent_time_seconds must be positive".to_string());
        }
        Ok(())
    }
}

/// Connection coordinates of a granted port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortEndpoint {
    pub host: String,
    pub socks_port: Option<u16>,
    pub http_port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
}

/// Successful reply to `/getport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortGranted {
    pub ok: bool,
    pub port_endpoint: PortEndpoint,
    pub lease_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// Failure reply shared by all routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub ok: bool,
    pub reason: String,
}

/// Either outcome of `/getport`, for clients parsing the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortReply {
    Granted(PortGranted),
    Refused(Failure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPortRequest {
    pub lease_id: i64,
}

/// Successful reply to `/endport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    pub message: Option<String>,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeosReply {
    pub geos: Vec<String>,
}
