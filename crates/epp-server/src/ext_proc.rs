use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::ExternalProcessor, processing_request, processing_response,
    BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpHeaders, ImmediateResponse,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};

use crate::session::{self, Inbound, Mutation, Outbound, Rejection, SessionError};
use crate::state::AppState;

/// Answers buffered per session before the session task waits on the proxy.
const OUTBOUND_BUFFER: usize = 16;

pub const SERVICE_NAME: &str = "envoy.service.ext_proc.v3.ExternalProcessor";

type AnswerStream =
    Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

#[derive(Clone)]
pub struct ExtProcService {
    st: AppState,
}

impl ExtProcService {
    pub fn new(st: AppState) -> Self {
        Self { st }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = AnswerStream;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        Ok(Response::new(open_session(self.st.clone(), request.into_inner())))
    }
}

/// Spawn the session task for one proxied request and return the stream of
/// answers sent back to the proxy.
fn open_session<S>(st: AppState, requests: S) -> AnswerStream
where
    S: Stream<Item = Result<ProcessingRequest, Status>> + Send + 'static,
{
    let inbound = Box::pin(requests.map(|item| match item {
        Ok(req) => to_inbound(req),
        Err(status) => Err(SessionError::Stream(status.message().to_string())),
    }));

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    tokio::spawn(async move {
        let outcome = session::run(st, inbound, tx).await;
        tracing::debug!(?outcome, "session finished");
    });

    Box::pin(ReceiverStream::new(rx).map(|item| match item {
        Ok(msg) => Ok(to_response(msg)),
        Err(e) => Err(to_status(e)),
    }))
}

fn to_status(err: SessionError) -> Status {
    match err {
        SessionError::Protocol(detail) => Status::invalid_argument(detail),
        SessionError::Stream(detail) => Status::aborted(detail),
    }
}

fn header_pairs(headers: Option<HttpHeaders>) -> (Vec<(String, String)>, bool) {
    let Some(h) = headers else {
        return (Vec::new(), false);
    };
    let pairs = h
        .headers
        .map(|map| {
            map.headers
                .into_iter()
                .map(|hv| {
                    let value = if hv.raw_value.is_empty() {
                        hv.value
                    } else {
                        String::from_utf8_lossy(&hv.raw_value).into_owned()
                    };
                    (hv.key.to_ascii_lowercase(), value)
                })
                .collect()
        })
        .unwrap_or_default();
    (pairs, h.end_of_stream)
}

pub fn to_inbound(req: ProcessingRequest) -> Result<Inbound, SessionError> {
    use processing_request::Request as R;

    match req.request {
        Some(R::RequestHeaders(h)) => {
            let (headers, end_of_stream) = header_pairs(Some(h));
            Ok(Inbound::RequestHeaders {
                headers,
                end_of_stream,
            })
        }
        Some(R::RequestBody(b)) => Ok(Inbound::RequestBody {
            chunk: Bytes::from(b.body),
            end_of_stream: b.end_of_stream,
        }),
        Some(R::RequestTrailers(_)) => Ok(Inbound::RequestTrailers),
        Some(R::ResponseHeaders(h)) => Ok(Inbound::ResponseHeaders {
            end_of_stream: h.end_of_stream,
        }),
        Some(R::ResponseBody(b)) => Ok(Inbound::ResponseBody {
            end_of_stream: b.end_of_stream,
        }),
        Some(R::ResponseTrailers(_)) => Ok(Inbound::ResponseTrailers),
        None => Err(SessionError::Protocol(
            "processing request without a payload".to_string(),
        )),
    }
}

fn header_mutation(set_headers: Vec<(String, String)>) -> Option<HeaderMutation> {
    if set_headers.is_empty() {
        return None;
    }
    Some(HeaderMutation {
        set_headers: set_headers
            .into_iter()
            .map(|(key, value)| HeaderValueOption {
                header: Some(HeaderValue {
                    key,
                    raw_value: value.into(),
                    ..Default::default()
                }),
                append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    })
}

fn common(m: Mutation) -> Option<CommonResponse> {
    Some(CommonResponse {
        clear_route_cache: m.clear_route_cache,
        header_mutation: header_mutation(m.set_headers),
        ..Default::default()
    })
}

fn immediate(r: Rejection) -> ImmediateResponse {
    ImmediateResponse {
        status: Some(HttpStatus {
            code: i32::from(r.status),
        }),
        headers: header_mutation(r.headers()),
        body: r.body().into(),
        details: format!("epp_{}", r.reason),
        ..Default::default()
    }
}

pub fn to_response(msg: Outbound) -> ProcessingResponse {
    use processing_response::Response as R;

    let response = match msg {
        Outbound::RequestHeaders(m) => R::RequestHeaders(HeadersResponse { response: common(m) }),
        Outbound::RequestBody(m) => R::RequestBody(BodyResponse { response: common(m) }),
        Outbound::RequestTrailers(m) => R::RequestTrailers(TrailersResponse {
            header_mutation: header_mutation(m.set_headers),
        }),
        Outbound::ResponseHeaders(m) => R::ResponseHeaders(HeadersResponse { response: common(m) }),
        Outbound::ResponseBody => R::ResponseBody(BodyResponse::default()),
        Outbound::ResponseTrailers => R::ResponseTrailers(TrailersResponse::default()),
        Outbound::Immediate(r) => R::ImmediateResponse(immediate(r)),
    };
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;

    use envoy_types::pb::envoy::config::core::v3::HeaderMap;
    use envoy_types::pb::envoy::service::ext_proc::v3::HttpBody;

    use epp_common::{EndpointId, EndpointRole};
    use epp_scheduler::{
        ClassifierConfig, EndpointUpdate, PickerConfig, PoolRegistry, RequestClassifier, Scheduler,
    };

    use super::*;
    use crate::health::Readiness;
    use crate::metrics::Metrics;
    use crate::session::{SessionConfig, DESTINATION_ENDPOINT_HEADER, RETRYABLE_HEADER};

    fn state_with(addr: &str, load: u64) -> AppState {
        let registry = PoolRegistry::new();
        let id = EndpointId::from(addr);
        registry.register("pool", id.clone(), EndpointRole::Unified).unwrap();
        registry.update(&id, EndpointUpdate::Load(load)).unwrap();
        AppState {
            pool_name: "pool".to_string(),
            scheduler: Scheduler::new(registry, PickerConfig::default()),
            classifier: Arc::new(RequestClassifier::new(ClassifierConfig::default(), None)),
            session: SessionConfig::default(),
            metrics: Arc::new(Metrics::default()),
            readiness: Arc::new(Readiness::default()),
        }
    }

    fn set_headers(m: &Option<HeaderMutation>) -> Vec<(String, String)> {
        m.as_ref()
            .map(|m| {
                m.set_headers
                    .iter()
                    .filter_map(|o| o.header.as_ref())
                    .map(|h| {
                        (
                            h.key.clone(),
                            String::from_utf8_lossy(&h.raw_value).into_owned(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_request_headers_prefer_raw_value() {
        let req = ProcessingRequest {
            request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
                headers: Some(HeaderMap {
                    headers: vec![
                        HeaderValue {
                            key: "X-Request-Id".to_string(),
                            raw_value: "abc".to_string().into(),
                            ..Default::default()
                        },
                        HeaderValue {
                            key: "x-gateway-model-name".to_string(),
                            value: "llama".to_string(),
                            ..Default::default()
                        },
                    ],
                }),
                end_of_stream: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(
            to_inbound(req).unwrap(),
            Inbound::RequestHeaders {
                headers: vec![
                    ("x-request-id".to_string(), "abc".to_string()),
                    ("x-gateway-model-name".to_string(), "llama".to_string()),
                ],
                end_of_stream: true,
            }
        );
    }

    #[test]
    fn test_request_body_and_empty_request() {
        let req = ProcessingRequest {
            request: Some(processing_request::Request::RequestBody(HttpBody {
                body: b"{}".to_vec().into(),
                end_of_stream: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(
            to_inbound(req).unwrap(),
            Inbound::RequestBody {
                chunk: Bytes::from_static(b"{}"),
                end_of_stream: true,
            }
        );
        assert!(matches!(
            to_inbound(ProcessingRequest::default()),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_route_mutation_clears_route_cache() {
        let resp = to_response(Outbound::RequestHeaders(Mutation {
            set_headers: vec![(
                DESTINATION_ENDPOINT_HEADER.to_string(),
                "10.0.0.1:8000".to_string(),
            )],
            clear_route_cache: true,
        }));
        let Some(processing_response::Response::RequestHeaders(h)) = resp.response else {
            panic!("expected headers response");
        };
        let common = h.response.unwrap();
        assert!(common.clear_route_cache);
        assert_eq!(
            set_headers(&common.header_mutation),
            vec![(DESTINATION_ENDPOINT_HEADER.to_string(), "10.0.0.1:8000".to_string())]
        );
        let opt = &common.header_mutation.unwrap().set_headers[0];
        assert_eq!(
            opt.append_action,
            HeaderAppendAction::OverwriteIfExistsOrAdd as i32
        );
    }

    #[test]
    fn test_plain_continue_has_no_mutation() {
        let resp = to_response(Outbound::RequestBody(Mutation::default()));
        let Some(processing_response::Response::RequestBody(b)) = resp.response else {
            panic!("expected body response");
        };
        let common = b.response.unwrap();
        assert!(common.header_mutation.is_none());
        assert!(!common.clear_route_cache);
    }

    #[test]
    fn test_rejection_becomes_immediate_response() {
        let resp = to_response(Outbound::Immediate(Rejection {
            status: 503,
            retryable: true,
            reason: "no_capacity",
            message: "pool empty".to_string(),
        }));
        let Some(processing_response::Response::ImmediateResponse(r)) = resp.response else {
            panic!("expected immediate response");
        };
        assert_eq!(r.status.unwrap().code, 503);
        assert_eq!(r.details, "epp_no_capacity");
        let headers = set_headers(&r.headers);
        assert!(headers.contains(&(RETRYABLE_HEADER.to_string(), "true".to_string())));
        assert!(headers.contains(&("retry-after".to_string(), "1".to_string())));
    }

    #[test]
    fn test_session_errors_map_to_status() {
        assert_eq!(
            to_status(SessionError::Protocol("dup".to_string())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            to_status(SessionError::Stream("reset".to_string())).code(),
            tonic::Code::Aborted
        );
    }

    #[tokio::test]
    async fn test_session_answers_over_send_only_request_stream() {
        let st = state_with("10.0.0.1:8000", 2);
        let (req_tx, req_rx) = mpsc::channel::<Result<ProcessingRequest, Status>>(4);
        // `Cell` makes the stream `Send` but not `Sync`, as tonic's `Streaming` is.
        let received = Cell::new(0usize);
        let requests = ReceiverStream::new(req_rx).map(move |req| {
            received.set(received.get() + 1);
            req
        });
        let mut answers = open_session(st.clone(), requests);

        req_tx
            .send(Ok(ProcessingRequest {
                request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
                    headers: Some(HeaderMap::default()),
                    end_of_stream: true,
                    ..Default::default()
                })),
                ..Default::default()
            }))
            .await
            .unwrap();
        let resp = answers.next().await.unwrap().unwrap();
        let Some(processing_response::Response::RequestHeaders(h)) = resp.response else {
            panic!("expected headers response");
        };
        let common = h.response.unwrap();
        assert!(common.clear_route_cache);
        assert!(set_headers(&common.header_mutation).contains(&(
            DESTINATION_ENDPOINT_HEADER.to_string(),
            "10.0.0.1:8000".to_string()
        )));

        drop(req_tx);
        assert!(answers.next().await.is_none());
        let snap = st.scheduler.registry().snapshot("pool").unwrap();
        assert_eq!(snap.endpoints[0].load(), 3);
    }

    #[tokio::test]
    async fn test_stream_error_before_decision_closes_answers() {
        let st = state_with("10.0.0.1:8000", 0);
        let (req_tx, req_rx) = mpsc::channel::<Result<ProcessingRequest, Status>>(4);
        let mut answers = open_session(st.clone(), ReceiverStream::new(req_rx));

        req_tx.send(Err(Status::cancelled("client reset"))).await.unwrap();
        assert!(answers.next().await.is_none());
        assert_eq!(st.metrics.cancelled_total.load(std::sync::atomic::Ordering::Relaxed), 1);
        drop(req_tx);
    }
}
