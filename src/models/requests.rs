//! Request DTOs for the line protocol
//!
//! Each request line is `COMMAND {json}`, or a bare JSON object carrying a
//! `"command"` field. Field names follow the existing clients.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer};

use crate::error::{CacheError, Result};

// == Command ==
/// Line protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Init,
    Get,
    Set,
    Delete,
    Close,
}

impl FromStr for Command {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INIT" => Ok(Command::Init),
            "GET" => Ok(Command::Get),
            "SET" => Ok(Command::Set),
            "DELETE" => Ok(Command::Delete),
            "CLOSE" => Ok(Command::Close),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown command: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Init => "INIT",
            Command::Get => "GET",
            Command::Set => "SET",
            Command::Delete => "DELETE",
            Command::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Request body for INIT
///
/// `max_size` is in megabytes.
#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub base_dir: String,
    pub max_size: i64,
    pub cap: f64,
}

/// Request body for GET
#[derive(Debug, Clone, Deserialize)]
pub struct GetRequest {
    pub table: String,
    pub tenant_id: String,
    #[serde(deserialize_with = "deserialize_freshness")]
    pub freshness: String,
    pub bind: String,
}

/// Request body for SET
///
/// `content` is base64; a missing or null value stores an empty payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub table: String,
    pub tenant_id: String,
    #[serde(deserialize_with = "deserialize_freshness")]
    pub freshness: String,
    pub bind: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl SetRequest {
    /// Decodes the base64 content.
    pub fn decode_content(&self) -> Result<Vec<u8>> {
        match &self.content {
            Some(encoded) => STANDARD.decode(encoded).map_err(|err| {
                CacheError::InvalidArgument(format!("content is not valid base64: {}", err))
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Request body for DELETE
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub table: String,
}

// == Request ==
/// A decoded request line.
#[derive(Debug, Clone)]
pub enum Request {
    Init(InitRequest),
    Get(GetRequest),
    Set(SetRequest),
    Delete(DeleteRequest),
    Close,
}

impl Request {
    /// Parses one request line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CacheError::InvalidArgument("empty request".to_string()));
        }

        let (command, body) = if line.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(line).map_err(invalid_json)?;
            let command = value
                .get("command")
                .and_then(|c| c.as_str())
                .ok_or_else(|| {
                    CacheError::InvalidArgument("request has no command field".to_string())
                })?
                .parse::<Command>()?;
            (command, value)
        } else {
            let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let command = name.parse::<Command>()?;
            let rest = rest.trim();
            let body = if rest.is_empty() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(rest).map_err(invalid_json)?
            };
            (command, body)
        };

        Self::from_body(command, body)
    }

    fn from_body(command: Command, body: serde_json::Value) -> Result<Self> {
        let request = match command {
            Command::Init => Request::Init(serde_json::from_value(body).map_err(invalid_json)?),
            Command::Get => Request::Get(serde_json::from_value(body).map_err(invalid_json)?),
            Command::Set => Request::Set(serde_json::from_value(body).map_err(invalid_json)?),
            Command::Delete => Request::Delete(serde_json::from_value(body).map_err(invalid_json)?),
            Command::Close => Request::Close,
        };
        Ok(request)
    }

    pub fn command(&self) -> Command {
        match self {
            Request::Init(_) => Command::Init,
            Request::Get(_) => Command::Get,
            Request::Set(_) => Command::Set,
            Request::Delete(_) => Command::Delete,
            Request::Close => Command::Close,
        }
    }
}

fn invalid_json(err: serde_json::Error) -> CacheError {
    CacheError::InvalidArgument(format!("invalid request: {}", err))
}

/// Accepts freshness as a string or, as older clients send it, an integer.
fn deserialize_freshness<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Freshness {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Freshness::deserialize(deserializer)? {
        Freshness::Text(s) => s,
        Freshness::Signed(n) => n.to_string(),
        Freshness::Unsigned(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_prefixed_line() {
        let req = Request::parse(
            r#"GET {"table": "users", "tenant_id": "t1", "freshness": "g1", "bind": "42"}"#,
        )
        .unwrap();
        match req {
            Request::Get(get) => {
                assert_eq!(get.table, "users");
                assert_eq!(get.tenant_id, "t1");
                assert_eq!(get.freshness, "g1");
                assert_eq!(get.bind, "42");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_json_with_command_field() {
        let req = Request::parse(r#"{"command": "delete", "table": "users"}"#).unwrap();
        assert_eq!(req.command(), Command::Delete);
    }

    #[test]
    fn test_integer_freshness() {
        let req = Request::parse(
            r#"SET {"table": "t", "tenant_id": "x", "freshness": 1700000000, "bind": "b", "content": "aGVsbG8="}"#,
        )
        .unwrap();
        let Request::Set(set) = req else {
            panic!("expected SET");
        };
        assert_eq!(set.freshness, "1700000000");
        assert_eq!(set.decode_content().unwrap(), b"hello");
    }

    #[test]
    fn test_set_without_content_is_empty() {
        let req =
            Request::parse(r#"SET {"table": "t", "tenant_id": "x", "freshness": "g", "bind": "b"}"#)
                .unwrap();
        let Request::Set(set) = req else {
            panic!("expected SET");
        };
        assert!(set.decode_content().unwrap().is_empty());
    }

    #[test]
    fn test_close_without_body() {
        assert_eq!(Request::parse("CLOSE").unwrap().command(), Command::Close);
        assert_eq!(Request::parse("close {}").unwrap().command(), Command::Close);
    }

    #[test]
    fn test_invalid_requests() {
        for line in [
            "",
            "PING {}",
            "GET not-json",
            r#"GET {"table": "t"}"#,
            r#"{"table": "t"}"#,
            r#"SET {"table": "t", "tenant_id": "x", "freshness": "g", "bind": "b", "content": "@@"}"#,
        ] {
            let result = Request::parse(line).and_then(|req| match req {
                Request::Set(set) => set.decode_content().map(|_| ()),
                _ => Ok(()),
            });
            assert!(
                matches!(result, Err(CacheError::InvalidArgument(_))),
                "line should be rejected: {}",
                line
            );
        }
    }

    #[test]
    fn test_init_request() {
        let req = Request::parse(r#"INIT {"base_dir": "/tmp/c", "max_size": 10, "cap": 0.5}"#).unwrap();
        let Request::Init(init) = req else {
            panic!("expected INIT");
        };
        assert_eq!(init.base_dir, "/tmp/c");
        assert_eq!(init.max_size, 10);
        assert_eq!(init.cap, 0.5);
    }
}
