//! Control-socket command records.
//!
//! One request and one response travel per connection. The socket is
//! `SOCK_SEQPACKET`, so a record is exactly one datagram; the payload
//! is the serde_json encoding of the tagged request enum, whose tag is
//! the command code. Show-style commands are followed by raw text
//! datagrams that the CLI copies to its standard output until the
//! daemon closes the connection.

use serde::{Deserialize, Serialize};

use crate::rule::{RuleKeySpec, RuleSpec};

/// Name of the abstract-namespace command socket for a process name.
///
/// The leading NUL byte puts the path in the abstract namespace; no
/// filesystem entry is created.
pub fn socket_name(process_name: &str) -> Vec<u8> {
    let mut name = vec![0u8];
    name.extend_from_slice(format!("/mx6e/{process_name}/command").as_bytes());
    name
}

/// A control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    AddM46e(RuleSpec),
    AddMe6e(RuleSpec),
    DelM46e(RuleKeySpec),
    DelMe6e(RuleKeySpec),
    DelAllM46e,
    DelAllMe6e,
    EnableM46e(RuleKeySpec),
    EnableMe6e(RuleKeySpec),
    DisableM46e(RuleKeySpec),
    DisableMe6e(RuleKeySpec),
    ShowM46e,
    ShowMe6e,
    ShowConfig,
    ShowStatistics,
    SetDebugLog(bool),
    Shutdown,
    Restart,
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::AddM46e(_) => "add m46e",
            Request::AddMe6e(_) => "add me6e",
            Request::DelM46e(_) => "del m46e",
            Request::DelMe6e(_) => "del me6e",
            Request::DelAllM46e => "delall m46e",
            Request::DelAllMe6e => "delall me6e",
            Request::EnableM46e(_) => "enable m46e",
            Request::EnableMe6e(_) => "enable me6e",
            Request::DisableM46e(_) => "disable m46e",
            Request::DisableMe6e(_) => "disable me6e",
            Request::ShowM46e => "show m46e",
            Request::ShowMe6e => "show me6e",
            Request::ShowConfig => "show conf",
            Request::ShowStatistics => "show stat",
            Request::SetDebugLog(_) => "set debug",
            Request::Shutdown => "shutdown",
            Request::Restart => "restart",
        }
    }
}

/// The daemon's reply. `result` is 0 on success, an errno-style code
/// otherwise; `message` carries the failure text for the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub result: i32,
    pub message: String,
}

impl Response {
    pub fn ok() -> Self {
        Response {
            result: 0,
            message: String::new(),
        }
    }

    pub fn error(result: i32, message: impl Into<String>) -> Self {
        Response {
            result,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == 0
    }
}
