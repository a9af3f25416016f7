//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseKind};
use crate::network::Network;

/// Scripted answer for one URL.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(Response),
    Fail,
}

/// A [`Network`] that answers from a script and records every request.
///
/// URLs without a script entry fail like an unreachable host.
#[derive(Debug, Default)]
pub struct ScriptedNetwork {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a same-origin 200 response.
    pub fn ok(self, url: &str, body: &str) -> Self {
        self.respond(url, Response::new(200, body.to_string()))
    }

    /// Scripts a cross-origin 200 response.
    pub fn ok_cors(self, url: &str, body: &str) -> Self {
        self.respond(
            url,
            Response::new(200, body.to_string()).with_kind(ResponseKind::Cors),
        )
    }

    pub fn respond(self, url: &str, response: Response) -> Self {
        self.set(url, Reply::Respond(response));
        self
    }

    pub fn fail(self, url: &str) -> Self {
        self.set(url, Reply::Fail);
        self
    }

    /// Replaces the script for `url` after construction.
    pub fn set(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    /// Makes every scripted URL fail, simulating going offline.
    pub fn go_offline(&self) {
        for reply in self.replies.lock().unwrap().values_mut() {
            *reply = Reply::Fail;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());
        let reply = self.replies.lock().unwrap().get(&url).cloned();
        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail) | None => Err(Error::Network {
                url,
                reason: "connection refused".to_string(),
            }),
        }
    }
}
