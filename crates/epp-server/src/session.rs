//! One processing session per proxied request: buffer what the proxy sends
//! until a routing decision can be made, answer with a header mutation or an
//! immediate rejection, then pass the response phase through.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use epp_common::{EndpointId, EndpointRole};
use epp_scheduler::{Pick, Rationale, ScheduleError, ScheduledRoute};

use crate::state::AppState;

pub const DESTINATION_ENDPOINT_HEADER: &str = "x-gateway-destination-endpoint";
pub const DESTINATION_ROLE_HEADER: &str = "x-gateway-destination-role";
pub const RETRYABLE_HEADER: &str = "x-epp-retryable";
pub const SERVED_BY_HEADER: &str = "x-epp-served-by";
const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_body_bytes: usize,
    /// Longest wait for the next response-phase message once routed.
    pub response_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 4 * 1024 * 1024,
            response_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Messages the proxy sends, decoupled from the wire types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    RequestHeaders {
        headers: Vec<(String, String)>,
        end_of_stream: bool,
    },
    RequestBody {
        chunk: Bytes,
        end_of_stream: bool,
    },
    RequestTrailers,
    ResponseHeaders {
        end_of_stream: bool,
    },
    ResponseBody {
        end_of_stream: bool,
    },
    ResponseTrailers,
}

impl Inbound {
    fn kind(&self) -> &'static str {
        match self {
            Inbound::RequestHeaders { .. } => "request_headers",
            Inbound::RequestBody { .. } => "request_body",
            Inbound::RequestTrailers => "request_trailers",
            Inbound::ResponseHeaders { .. } => "response_headers",
            Inbound::ResponseBody { .. } => "response_body",
            Inbound::ResponseTrailers => "response_trailers",
        }
    }
}

/// Header changes attached to a CONTINUE answer. The default is a plain
/// CONTINUE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    pub set_headers: Vec<(String, String)>,
    pub clear_route_cache: bool,
}

impl Mutation {
    fn route(pick: &Pick) -> Self {
        Self {
            set_headers: vec![
                (
                    DESTINATION_ENDPOINT_HEADER.to_string(),
                    pick.endpoint.to_string(),
                ),
                (DESTINATION_ROLE_HEADER.to_string(), pick.role.to_string()),
            ],
            clear_route_cache: true,
        }
    }

    fn served_by(endpoint: &EndpointId) -> Self {
        Self {
            set_headers: vec![(SERVED_BY_HEADER.to_string(), endpoint.to_string())],
            clear_route_cache: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    RequestHeaders(Mutation),
    RequestBody(Mutation),
    RequestTrailers(Mutation),
    ResponseHeaders(Mutation),
    ResponseBody,
    ResponseTrailers,
    Immediate(Rejection),
}

/// Immediate response sent instead of forwarding the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub retryable: bool,
    pub reason: &'static str,
    pub message: String,
}

impl Rejection {
    fn no_capacity(message: String) -> Self {
        Self {
            status: 503,
            retryable: true,
            reason: "no_capacity",
            message,
        }
    }

    fn unknown_pool(message: String) -> Self {
        Self {
            status: 500,
            retryable: false,
            reason: "unknown_pool",
            message,
        }
    }

    fn body_too_large(limit: usize) -> Self {
        Self {
            status: 413,
            retryable: false,
            reason: "body_too_large",
            message: format!("request body exceeds {limit} bytes"),
        }
    }

    fn timed_out(phase: Phase) -> Self {
        Self {
            status: 504,
            retryable: true,
            reason: "decision_timeout",
            message: format!("no routing decision within budget ({})", phase.as_str()),
        }
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            (RETRYABLE_HEADER.to_string(), self.retryable.to_string()),
        ];
        if self.retryable {
            headers.push(("retry-after".to_string(), RETRY_AFTER_SECS.to_string()));
        }
        headers
    }

    pub fn body(&self) -> String {
        serde_json::json!({
            "error": {
                "type": self.reason,
                "message": self.message,
                "retryable": self.retryable,
            }
        })
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Routed { endpoint: EndpointId },
    NoCapacity,
    UnknownPool,
    BodyTooLarge,
    Cancelled,
    TimedOut,
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHeaders,
    ClassifyingRequest,
    AwaitingBody,
    Deciding,
    EmittingResponse,
    Closed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::AwaitingHeaders => "awaiting_headers",
            Phase::ClassifyingRequest => "classifying_request",
            Phase::AwaitingBody => "awaiting_body",
            Phase::Deciding => "deciding",
            Phase::EmittingResponse => "emitting_response",
            Phase::Closed => "closed",
        }
    }
}

/// Which inbound message the routing decision answers.
#[derive(Debug, Clone, Copy)]
enum DecisionSlot {
    Headers,
    Body,
    Trailers,
}

impl DecisionSlot {
    fn answer(self, mutation: Mutation) -> Outbound {
        match self {
            DecisionSlot::Headers => Outbound::RequestHeaders(mutation),
            DecisionSlot::Body => Outbound::RequestBody(mutation),
            DecisionSlot::Trailers => Outbound::RequestTrailers(mutation),
        }
    }
}

enum Interrupt {
    /// Inbound stream ended.
    Ended,
    /// Outbound side dropped by the proxy.
    Cancelled,
    TimedOut,
    Failed(SessionError),
}

pub type OutboundSender = mpsc::Sender<Result<Outbound, SessionError>>;

struct Session<'a, S> {
    st: &'a AppState,
    inbound: &'a mut S,
    tx: &'a OutboundSender,
    started: Instant,
    deadline: tokio::time::Instant,
    phase: Phase,
    request_id: String,
}

/// Drive one session to completion. Every answer (or the stream error that
/// closes the session) goes to `tx`. Dropping the returned future releases
/// any reservation it holds.
pub async fn run<S>(st: AppState, mut inbound: S, tx: OutboundSender) -> SessionOutcome
where
    S: Stream<Item = Result<Inbound, SessionError>> + Unpin + Send,
{
    let _inflight = st.metrics.session_started();
    let started = Instant::now();
    let deadline = tokio::time::Instant::from_std(started + st.classifier.config().request_budget);
    let mut session = Session {
        st: &st,
        inbound: &mut inbound,
        tx: &tx,
        started,
        deadline,
        phase: Phase::AwaitingHeaders,
        request_id: String::new(),
    };
    let outcome = session.drive().await;
    session.enter(Phase::Closed);
    st.metrics.session_finished(&outcome);
    outcome
}

impl<S> Session<'_, S>
where
    S: Stream<Item = Result<Inbound, SessionError>> + Unpin + Send,
{
    fn enter(&mut self, next: Phase) {
        tracing::trace!(
            request_id = %self.request_id,
            from = self.phase.as_str(),
            to = next.as_str(),
            "session phase"
        );
        self.phase = next;
    }

    async fn recv(&mut self, deadline: tokio::time::Instant) -> Result<Inbound, Interrupt> {
        tokio::select! {
            _ = self.tx.closed() => Err(Interrupt::Cancelled),
            next = tokio::time::timeout_at(deadline, self.inbound.next()) => match next {
                Err(_) => Err(Interrupt::TimedOut),
                Ok(None) => Err(Interrupt::Ended),
                Ok(Some(Ok(msg))) => Ok(msg),
                Ok(Some(Err(e))) => Err(Interrupt::Failed(e)),
            },
        }
    }

    /// Queue an answer, waiting for channel capacity no later than `deadline`.
    async fn send(
        &mut self,
        msg: Result<Outbound, SessionError>,
        deadline: tokio::time::Instant,
    ) -> Result<(), Interrupt> {
        match tokio::time::timeout_at(deadline, self.tx.send(msg)).await {
            Err(_) => Err(Interrupt::TimedOut),
            Ok(Err(_)) => Err(Interrupt::Cancelled),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn drive(&mut self) -> SessionOutcome {
        let (headers, headers_eos) = match self.recv(self.deadline).await {
            Ok(Inbound::RequestHeaders {
                headers,
                end_of_stream,
            }) => (headers, end_of_stream),
            Ok(other) => {
                return self
                    .protocol_error(format!("expected request_headers, got {}", other.kind()))
                    .await
            }
            Err(interrupt) => return self.interrupted(interrupt),
        };

        self.enter(Phase::ClassifyingRequest);
        let features = self.st.classifier.inspect_headers(&headers);
        self.request_id = features.request_id.clone();

        let (body, slot) = if headers_eos {
            (Bytes::new(), DecisionSlot::Headers)
        } else {
            let continued = Outbound::RequestHeaders(Mutation::default());
            if let Err(interrupt) = self.send(Ok(continued), self.deadline).await {
                return self.interrupted(interrupt);
            }
            self.enter(Phase::AwaitingBody);
            match self.buffer_body().await {
                Ok(buffered) => buffered,
                Err(outcome) => return outcome,
            }
        };

        self.enter(Phase::Deciding);
        let ctx = self.st.classifier.classify(features, &body, self.started);
        if ctx.approximate {
            self.st
                .metrics
                .approximate_classifications_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let ScheduledRoute { pick, reservation } =
            match self.st.scheduler.schedule(&self.st.pool_name, &ctx) {
                Ok(route) => route,
                Err(e) => return self.rejected(e).await,
            };

        self.enter(Phase::EmittingResponse);
        let deadline = tokio::time::Instant::now() + ctx.remaining(Instant::now());
        let decision = slot.answer(Mutation::route(&pick));
        if let Err(interrupt) = self.send(Ok(decision), deadline).await {
            // `reservation` drops here and gives the load back.
            return self.interrupted(interrupt);
        }
        reservation.commit();

        let latency = self.started.elapsed();
        self.st.metrics.record_routed(
            &pick.endpoint,
            pick.role == EndpointRole::Prefill,
            pick.rationale == Rationale::Fallback,
            pick.saturated,
            latency,
        );
        tracing::info!(
            request_id = %self.request_id,
            model = %ctx.model,
            endpoint = %pick.endpoint,
            role = %pick.role,
            load = pick.load,
            rationale = pick.rationale.as_str(),
            prompt_tokens = ctx.prompt_tokens,
            approximate = ctx.approximate,
            saturated = pick.saturated,
            latency_us = latency.as_micros() as u64,
            "request routed"
        );

        self.pass_response(pick.endpoint).await
    }

    async fn buffer_body(&mut self) -> Result<(Bytes, DecisionSlot), SessionOutcome> {
        let limit = self.st.session.max_body_bytes;
        let mut body = BytesMut::new();
        loop {
            match self.recv(self.deadline).await {
                Ok(Inbound::RequestBody {
                    chunk,
                    end_of_stream,
                }) => {
                    if body.len() + chunk.len() > limit {
                        tracing::warn!(request_id = %self.request_id, limit, "request body too large");
                        return Err(self
                            .reject(Rejection::body_too_large(limit), SessionOutcome::BodyTooLarge)
                            .await);
                    }
                    body.extend_from_slice(&chunk);
                    if end_of_stream {
                        return Ok((body.freeze(), DecisionSlot::Body));
                    }
                    let continued = Outbound::RequestBody(Mutation::default());
                    if let Err(interrupt) = self.send(Ok(continued), self.deadline).await {
                        return Err(self.interrupted(interrupt));
                    }
                }
                Ok(Inbound::RequestTrailers) => return Ok((body.freeze(), DecisionSlot::Trailers)),
                Ok(Inbound::RequestHeaders { .. }) => {
                    return Err(self.protocol_error("duplicate request_headers".to_string()).await)
                }
                Ok(other) => {
                    let detail = format!("unexpected {} before routing decision", other.kind());
                    return Err(self.protocol_error(detail).await);
                }
                Err(interrupt) => return Err(self.interrupted(interrupt)),
            }
        }
    }

    /// Answer response-phase messages with CONTINUE until the proxy closes
    /// the stream or goes idle.
    async fn pass_response(&mut self, endpoint: EndpointId) -> SessionOutcome {
        let idle = self.st.session.response_idle_timeout;
        loop {
            let reply = match self.recv(tokio::time::Instant::now() + idle).await {
                Ok(Inbound::ResponseHeaders { .. }) => {
                    Outbound::ResponseHeaders(Mutation::served_by(&endpoint))
                }
                Ok(Inbound::ResponseBody { .. }) => Outbound::ResponseBody,
                Ok(Inbound::ResponseTrailers) => Outbound::ResponseTrailers,
                Ok(Inbound::RequestTrailers) => Outbound::RequestTrailers(Mutation::default()),
                Ok(other @ (Inbound::RequestHeaders { .. } | Inbound::RequestBody { .. })) => {
                    let detail = format!("unexpected {} after routing decision", other.kind());
                    return self.protocol_error(detail).await;
                }
                Err(Interrupt::TimedOut) => {
                    tracing::debug!(request_id = %self.request_id, "response phase idle, closing session");
                    break;
                }
                Err(Interrupt::Failed(e)) => {
                    tracing::debug!(request_id = %self.request_id, error = %e, "stream failed after routing decision");
                    break;
                }
                Err(Interrupt::Ended | Interrupt::Cancelled) => break,
            };
            let deadline = tokio::time::Instant::now() + idle;
            if let Err(interrupt) = self.send(Ok(reply), deadline).await {
                if matches!(interrupt, Interrupt::TimedOut) {
                    tracing::debug!(request_id = %self.request_id, "proxy stopped reading, closing session");
                }
                break;
            }
        }
        SessionOutcome::Routed { endpoint }
    }

    async fn rejected(&mut self, err: ScheduleError) -> SessionOutcome {
        tracing::warn!(
            request_id = %self.request_id,
            pool = %self.st.pool_name,
            error = %err,
            retryable = err.retryable(),
            "request rejected"
        );
        match err {
            ScheduleError::PoolNotFound(_) => {
                self.reject(Rejection::unknown_pool(err.to_string()), SessionOutcome::UnknownPool)
                    .await
            }
            ScheduleError::NoCapacity { .. } => {
                self.reject(Rejection::no_capacity(err.to_string()), SessionOutcome::NoCapacity)
                    .await
            }
        }
    }

    async fn reject(&mut self, rejection: Rejection, outcome: SessionOutcome) -> SessionOutcome {
        let status = rejection.status;
        if self.send(Ok(Outbound::Immediate(rejection)), self.deadline).await.is_err() {
            tracing::debug!(request_id = %self.request_id, status, "rejection not delivered");
        }
        outcome
    }

    async fn protocol_error(&mut self, detail: String) -> SessionOutcome {
        tracing::warn!(
            request_id = %self.request_id,
            phase = self.phase.as_str(),
            detail = %detail,
            "protocol error"
        );
        let deadline = match self.phase {
            Phase::EmittingResponse => {
                tokio::time::Instant::now() + self.st.session.response_idle_timeout
            }
            _ => self.deadline,
        };
        let _ = self.send(Err(SessionError::Protocol(detail)), deadline).await;
        SessionOutcome::ProtocolError
    }

    fn interrupted(&self, interrupt: Interrupt) -> SessionOutcome {
        match interrupt {
            Interrupt::TimedOut => {
                tracing::warn!(
                    request_id = %self.request_id,
                    phase = self.phase.as_str(),
                    "request budget exhausted"
                );
                // Best effort: the proxy may have stopped reading.
                let _ = self
                    .tx
                    .try_send(Ok(Outbound::Immediate(Rejection::timed_out(self.phase))));
                SessionOutcome::TimedOut
            }
            Interrupt::Failed(e) => {
                tracing::debug!(request_id = %self.request_id, phase = self.phase.as_str(), error = %e, "inbound stream failed");
                SessionOutcome::Cancelled
            }
            Interrupt::Ended | Interrupt::Cancelled => {
                tracing::debug!(request_id = %self.request_id, phase = self.phase.as_str(), "session cancelled by proxy");
                SessionOutcome::Cancelled
            }
        }
    }
}
