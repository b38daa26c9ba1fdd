//! Delay policy for etcd peer traffic.
//!
//! Each event describes one intercepted peer message in its `option`
//! parameter: `src_entity` and `dst_entity` as `host:port`, and the raw
//! message as base64. Responses (sent from the peer port) are accepted
//! straight away. Requests are parsed, then held for a random delay in
//! `[minBound, maxBound]` before the fault decision resolves them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use faultline_signal::Event;
use serde_json::Value;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::params::PolicyParams;
use crate::policy::{release_delayed, ExplorePolicy, PolicyContext, PolicyError};
use crate::queue::{QueueHandle, TimeBoundedItem, TimeBoundedQueue};
use crate::rng::{policy_rng, DECISION_STREAM, DELAY_STREAM};

/// The parts of an etcd peer request the policy looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdRequest {
    /// First line of the request, e.g. `POST /raft HTTP/1.1`.
    pub method: String,
    /// Value of the `Path:` header, when present.
    pub path: Option<String>,
    /// Everything after the blank line ending the headers.
    pub body: Vec<u8>,
}

impl EtcdRequest {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let method = text.lines().next().unwrap_or_default().trim_end().to_string();
        let path = text.lines().find_map(|line| {
            line.find("Path: ")
                .map(|at| line[at + "Path: ".len()..].trim_end().to_string())
        });
        let body = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|at| raw[at + 4..].to_vec())
            .unwrap_or_default();
        Self { method, path, body }
    }
}

fn parse_endpoint(raw: &str) -> Option<(&str, u16)> {
    let (host, port) = raw.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

fn malformed(event: &Event, reason: impl Into<String>) -> PolicyError {
    PolicyError::MalformedEvent {
        event_id: event.id.clone(),
        reason: reason.into(),
    }
}

pub struct EtcdPolicy {
    params: PolicyParams,
    dispatcher: Option<Dispatcher>,
    delayed: Option<QueueHandle<Event>>,
}

impl EtcdPolicy {
    pub fn new(params: PolicyParams) -> Self {
        Self {
            params,
            dispatcher: None,
            delayed: None,
        }
    }
}

impl ExplorePolicy for EtcdPolicy {
    fn name(&self) -> &'static str {
        "etcd"
    }

    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError> {
        if self.dispatcher.is_some() {
            return Err(PolicyError::AlreadyInitialized(self.name()));
        }
        self.dispatcher = Some(Dispatcher::from_params(
            &self.params,
            ctx.sink.clone(),
            ctx.cancel.clone(),
        ));
        let queue = TimeBoundedQueue::with_cancel(
            policy_rng(ctx.seed, DELAY_STREAM),
            ctx.cancel.child_token(),
        );
        self.delayed = Some(queue.handle());
        tokio::spawn(release_delayed(
            queue,
            self.params.fault_rates(),
            policy_rng(ctx.seed, DECISION_STREAM),
            ctx.sink,
            ctx.cancel,
        ));
        info!(
            min_bound_ms = self.params.min_bound,
            max_bound_ms = self.params.max_bound,
            peer_port = self.params.peer_port,
            "etcd policy started"
        );
        Ok(())
    }

    fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        let (Some(dispatcher), Some(delayed)) = (&self.dispatcher, &self.delayed) else {
            return Err(PolicyError::NotInitialized("etcd"));
        };

        let option = event
            .param("option")
            .and_then(Value::as_object)
            .ok_or_else(|| malformed(&event, "missing option"))?;
        let field = |key: &str| {
            option
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(&event, format!("missing option.{key}")))
        };
        let src = field("src_entity")?;
        let dst = field("dst_entity")?;
        let message = field("message")?;

        let (src_addr, src_port) =
            parse_endpoint(src).ok_or_else(|| malformed(&event, format!("bad source {src}")))?;
        let (dst_addr, dst_port) =
            parse_endpoint(dst).ok_or_else(|| malformed(&event, format!("bad destination {dst}")))?;
        debug!(src_addr, src_port, dst_addr, dst_port, "etcd peer message");

        if src_port == self.params.peer_port {
            return dispatcher.submit(event);
        }

        let raw = STANDARD
            .decode(message)
            .map_err(|err| malformed(&event, format!("message is not base64: {err}")))?;
        let request = EtcdRequest::parse(&raw);
        debug!(
            method = %request.method,
            path = ?request.path,
            body_len = request.body.len(),
            "delaying etcd request"
        );

        let item = TimeBoundedItem::new(event, self.params.min_bound(), self.params.max_bound())?;
        delayed.enqueue(item)?;
        Ok(())
    }
}
