use crate::{
    core::{
        pipeline::Handler,
        patch::PatchOperation,
        request::{Operation, RequestDescriptor, UserInfo},
        Decision,
    },
    metrics::DecisionMetrics,
};
use anyhow::{bail, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission, DynamicObject, GroupVersionKind, TypeMeta};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Serves every policy at `POST /<policy-name>`.
#[derive(Clone)]
pub struct Admission {
    handlers: Arc<BTreeMap<&'static str, Arc<dyn Handler>>>,
    metrics: DecisionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

const INTERNAL_ERROR: &str = "internal error";

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let handler = match self.route(req.method(), req.uri().path()) {
            Some(handler) => handler,
            None => {
                return Box::pin(future::ok(
                    Response::builder()
                        .status(http::StatusCode::NOT_FOUND)
                        .body(Body::default())
                        .expect("not found response must be valid"),
                ))
            }
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => admission.admit(&*handler, req).await,
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
        metrics: DecisionMetrics,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.name(), h)).collect();
        Self {
            handlers: Arc::new(handlers),
            metrics,
        }
    }

    pub fn policies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    fn route(&self, method: &http::Method, path: &str) -> Option<Arc<dyn Handler>> {
        if method != http::Method::POST {
            return None;
        }
        let name = path.strip_prefix('/')?;
        self.handlers.get(name).cloned()
    }

    async fn admit(&self, handler: &dyn Handler, req: AdmissionRequest) -> AdmissionResponse {
        let decision = match descriptor(&req) {
            Ok(desc) => handler.handle(&desc).await,
            Err(error) => Decision::bad_request(error),
        };
        self.metrics.record(handler.name(), &decision);
        respond(&req, decision)
    }
}

fn descriptor(req: &AdmissionRequest) -> Result<RequestDescriptor> {
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => bail!("CONNECT requests are not supported"),
    };

    let namespace = match &req.namespace {
        Some(ns) => ns.clone(),
        None if req.kind.kind == "Namespace" => req.name.clone(),
        None => String::new(),
    };

    let user = UserInfo::new(
        req.user_info.username.clone().unwrap_or_default(),
        req.user_info.groups.iter().flatten().cloned(),
    );

    Ok(RequestDescriptor {
        user,
        namespace,
        name: req.name.clone(),
        kind: req.kind.kind.clone(),
        operation,
        old_object: req
            .old_object
            .as_ref()
            .map(|o| to_value(o, &req.kind))
            .transpose()?,
        object: req
            .object
            .as_ref()
            .map(|o| to_value(o, &req.kind))
            .transpose()?,
    })
}

fn to_value(obj: &DynamicObject, gvk: &GroupVersionKind) -> Result<Value> {
    let mut obj = obj.clone();
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
        });
    }
    Ok(serde_json::to_value(obj)?)
}

fn respond(req: &AdmissionRequest, decision: Decision) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(req);
    match decision {
        Decision::Allow { warnings, .. } => {
            let mut rsp = rsp;
            if !warnings.is_empty() {
                rsp.warnings = Some(warnings);
            }
            rsp
        }
        Decision::Deny { reason } => rsp.deny(reason),
        Decision::Patch { ops, .. } => {
            let patch = match json_patch(&ops) {
                Ok(patch) => patch,
                Err(error) => return error_response(rsp, 500, &error),
            };
            match rsp.with_patch(patch) {
                Ok(rsp) => rsp,
                Err(error) => error_response(AdmissionResponse::from(req), 500, &error),
            }
        }
        Decision::Error { code, cause } => error_response(rsp, code, &cause),
    }
}

/// Converts patch operations into the patch type admission responses carry.
fn json_patch(ops: &[PatchOperation]) -> Result<json_patch::Patch, serde_json::Error> {
    ops.iter()
        .map(|op| {
            serde_json::to_value(op).and_then(serde_json::from_value::<json_patch::PatchOperation>)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(json_patch::Patch)
}

fn error_response(
    rsp: AdmissionResponse,
    code: u16,
    cause: &dyn std::fmt::Display,
) -> AdmissionResponse {
    let message = if code >= 500 {
        INTERNAL_ERROR.to_string()
    } else {
        cause.to_string()
    };
    let mut rsp = rsp.deny(message);
    rsp.result.code = code;
    rsp
}

fn json_response(rsp: admission::AdmissionReview<DynamicObject>) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;
    use std::sync::Mutex;

    /// Returns a fixed decision and remembers the last request it saw.
    struct Fixed {
        decision: fn() -> Decision,
        seen: Mutex<Option<RequestDescriptor>>,
    }

    #[async_trait::async_trait]
    impl Handler for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn handle(&self, req: &RequestDescriptor) -> Decision {
            *self.seen.lock().unwrap() = Some(req.clone());
            (self.decision)()
        }
    }

    fn fixed(decision: fn() -> Decision) -> Arc<Fixed> {
        Arc::new(Fixed {
            decision,
            seen: Mutex::new(None),
        })
    }

    fn review(operation: &str, kind: &str, namespace: Option<&str>) -> AdmissionRequest {
        let mut request = serde_json::json!({
            "uid": "b7a1c2d3",
            "kind": {"group": "", "version": "v1", "kind": kind},
            "resource": {"group": "", "version": "v1", "resource": "things"},
            "name": "acme-dev",
            "operation": operation,
            "userInfo": {"username": "alice", "groups": ["acme", "system:authenticated"]},
            "object": {
                "apiVersion": "v1",
                "kind": kind,
                "metadata": {"name": "acme-dev"},
            },
            "oldObject": null,
            "dryRun": false,
        });
        if let Some(ns) = namespace {
            request["namespace"] = ns.into();
        }
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": request,
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn service(handler: Arc<Fixed>) -> (Admission, Registry) {
        let mut prom = Registry::default();
        let metrics = DecisionMetrics::register(&mut prom);
        (Admission::new([handler as Arc<dyn Handler>], metrics), prom)
    }

    async fn admit(decision: fn() -> Decision, req: AdmissionRequest) -> Value {
        let handler = fixed(decision);
        let (admission, _) = service(handler.clone());
        let rsp = admission.admit(&*handler, req).await;
        serde_json::to_value(rsp.into_review()).unwrap()["response"].clone()
    }

    #[tokio::test]
    async fn builds_descriptor_for_namespaces() {
        let handler = fixed(Decision::skipped);
        let (admission, _) = service(handler.clone());
        admission
            .admit(&*handler, review("CREATE", "Namespace", None))
            .await;

        let seen = handler.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.namespace, "acme-dev");
        assert_eq!(seen.kind, "Namespace");
        assert_eq!(seen.operation, Operation::Create);
        assert!(seen.user.is_member_of("acme"));
        assert_eq!(seen.user.username, "alice");
        assert_eq!(seen.object.unwrap()["kind"], "Namespace");
    }

    #[tokio::test]
    async fn allow_carries_warnings() {
        let rsp = admit(
            || Decision::Allow {
                reason: "ratio".to_string(),
                warnings: vec!["ratio is low".to_string()],
            },
            review("CREATE", "Pod", Some("acme-dev")),
        )
        .await;
        assert_eq!(rsp["uid"], "b7a1c2d3");
        assert_eq!(rsp["allowed"], true);
        assert_eq!(rsp["warnings"], serde_json::json!(["ratio is low"]));
    }

    #[tokio::test]
    async fn deny_carries_reason() {
        let rsp = admit(
            || Decision::Deny {
                reason: "quota exceeded".to_string(),
            },
            review("CREATE", "Namespace", None),
        )
        .await;
        assert_eq!(rsp["allowed"], false);
        assert_eq!(rsp["status"]["message"], "quota exceeded");
    }

    #[tokio::test]
    async fn patch_is_json_patch() {
        let rsp = admit(
            || Decision::Patch {
                reason: "defaulted".to_string(),
                ops: vec![PatchOperation::add(&["metadata", "labels"], serde_json::json!({}))],
            },
            review("CREATE", "Namespace", None),
        )
        .await;
        assert_eq!(rsp["allowed"], true);
        assert_eq!(rsp["patchType"], "JSONPatch");
        assert!(!rsp["patch"].is_null(), "{rsp}");
    }

    #[tokio::test]
    async fn internal_errors_are_generic() {
        let rsp = admit(
            || Decision::internal(anyhow::anyhow!("api server timed out")),
            review("CREATE", "Pod", Some("acme-dev")),
        )
        .await;
        assert_eq!(rsp["allowed"], false);
        assert_eq!(rsp["status"]["code"], 500);
        assert_eq!(rsp["status"]["message"], INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn bad_requests_explain_themselves() {
        let rsp = admit(
            || Decision::bad_request(anyhow::anyhow!("failed to decode object")),
            review("UPDATE", "Pod", Some("acme-dev")),
        )
        .await;
        assert_eq!(rsp["status"]["code"], 400);
        assert_eq!(rsp["status"]["message"], "failed to decode object");
    }

    #[tokio::test]
    async fn connect_is_rejected_before_evaluation() {
        let handler = fixed(Decision::skipped);
        let (admission, _) = service(handler.clone());
        let rsp = admission
            .admit(&*handler, review("CONNECT", "Pod", Some("acme-dev")))
            .await;
        assert!(!rsp.allowed);
        assert!(handler.seen.lock().unwrap().is_none());
    }

    #[test]
    fn patches_keep_escaped_pointers() {
        let patch = json_patch(&[
            PatchOperation::add(&["metadata", "labels"], serde_json::json!({})),
            PatchOperation::add(&["metadata", "labels", "appuio.io/organization"], "acme"),
        ])
        .unwrap();
        assert_eq!(patch.0.len(), 2);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([
                {"op": "add", "path": "/metadata/labels", "value": {}},
                {"op": "add", "path": "/metadata/labels/appuio.io~1organization", "value": "acme"},
            ])
        );
    }

    #[test]
    fn admission_is_served_directly() {
        fn assert_service<S>(_: &S)
        where
            S: tower::Service<
                    Request<hyper::body::Incoming>,
                    Response = Response<Body>,
                    Error = Error,
                > + Clone
                + Send
                + 'static,
            S::Future: Send + 'static,
        {
        }

        let (admission, _) = service(fixed(Decision::skipped));
        assert_service(&admission);
    }

    #[test]
    fn routes_by_path() {
        let (admission, _) = service(fixed(Decision::skipped));
        assert!(admission.route(&http::Method::POST, "/fixed").is_some());
        assert!(admission.route(&http::Method::GET, "/fixed").is_none());
        assert!(admission.route(&http::Method::POST, "/").is_none());
        assert!(admission.route(&http::Method::POST, "/other").is_none());
        assert_eq!(admission.policies().collect::<Vec<_>>(), ["fixed"]);
    }
}
