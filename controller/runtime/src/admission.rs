//! Mutating admission for SudoRequest/ClusterSudoRequest.
//!
//! Stamps the authenticated caller onto the incoming object as the
//! `tarbac.io/requester` annotations. These annotations are the only
//! identity the reconcilers trust; an annotation that already exists and
//! disagrees with the caller is a replay of someone else's request and is
//! rejected outright.

use crate::k8s::{
    request::{ClusterSudoRequest, SudoRequest},
    REQUESTER_ANNOTATION, REQUESTER_METADATA_ANNOTATION,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::{core::DynamicObject, Resource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

const MUTATE_PATH: &str = "/mutate-v1-sudorequest";

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admit(req)
                }
                Err(error) => {
                    warn!(%error, "invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn admit(req: AdmissionRequest) -> AdmissionResponse {
    if is_kind::<SudoRequest>(&req) {
        return mutate::<SudoRequest>(req);
    }

    if is_kind::<ClusterSudoRequest>(&req) {
        return mutate::<ClusterSudoRequest>(req);
    }

    let kind = req.kind.kind.clone();
    info!(%kind, "denied");
    AdmissionResponse::from(&req).deny(format!("unsupported resource kind: {kind}"))
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    *req.kind.group == *T::group(&dt) && *req.kind.kind == *T::kind(&dt)
}

fn mutate<T: DeserializeOwned>(req: AdmissionRequest) -> AdmissionResponse {
    let kind = req.kind.kind.clone();
    let rsp = AdmissionResponse::from(&req);

    let Some(obj) = req.object else {
        return AdmissionResponse::invalid("admission request missing 'object'");
    };
    let original = match serde_json::to_value(&obj) {
        Ok(value) => value,
        Err(error) => return AdmissionResponse::invalid(error),
    };
    // A full typed decode so that a malformed spec is refused here rather
    // than surfacing as a reconciler error later.
    if let Err(error) = serde_json::from_value::<T>(original.clone()) {
        warn!(%error, %kind, "decode failed");
        return AdmissionResponse::invalid(format!("failed to decode {kind}: {error}"));
    }

    let mut mutated = obj;
    let mut annotations = mutated.metadata.annotations.take().unwrap_or_default();
    match annotate(&mut annotations, &req.user_info) {
        Ok(false) => return rsp,
        Ok(true) => {}
        Err(error) => {
            let user = req.user_info.username.as_deref().unwrap_or_default();
            info!(%kind, %user, "denied: {error}");
            return rsp.deny(error.to_string());
        }
    }
    mutated.metadata.annotations = Some(annotations);

    let patch = match serde_json::to_value(&mutated) {
        Ok(value) => json_patch::diff(&original, &value),
        Err(error) => return AdmissionResponse::invalid(error),
    };
    match rsp.with_patch(patch) {
        Ok(rsp) => rsp,
        Err(error) => AdmissionResponse::invalid(error),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("requesting user does not match the original requester")]
pub(crate) struct Tamper;

/// Stamps the requester annotations, refusing to overwrite an existing value
/// that names someone else. Returns whether anything changed.
pub(crate) fn annotate(
    annotations: &mut BTreeMap<String, String>,
    user: &UserInfo,
) -> Result<bool, Tamper> {
    let username = user.username.clone().unwrap_or_default();
    let metadata = requester_metadata(user);
    let mut changed = false;

    match annotations.get(REQUESTER_ANNOTATION) {
        Some(existing) if !existing.is_empty() => {
            if *existing != username {
                return Err(Tamper);
            }
        }
        _ => {
            annotations.insert(REQUESTER_ANNOTATION.to_string(), username);
            changed = true;
        }
    }

    match annotations.get(REQUESTER_METADATA_ANNOTATION) {
        Some(existing) if !existing.is_empty() => {
            if *existing != metadata {
                return Err(Tamper);
            }
        }
        _ => {
            annotations.insert(REQUESTER_METADATA_ANNOTATION.to_string(), metadata);
            changed = true;
        }
    }

    Ok(changed)
}

fn requester_metadata(user: &UserInfo) -> String {
    format!(
        "UID={}, Groups=[{}]",
        user.uid.as_deref().unwrap_or_default(),
        user.groups.as_deref().unwrap_or_default().join(" "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(username: &str, uid: &str, groups: &[&str]) -> UserInfo {
        UserInfo {
            username: Some(username.to_string()),
            uid: Some(uid.to_string()),
            groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn stamps_fresh_annotations() {
        let mut annotations = BTreeMap::new();
        let changed = annotate(&mut annotations, &caller("alice", "u-1", &["dev", "oncall"])).unwrap();
        assert!(changed);
        assert_eq!(annotations.get(REQUESTER_ANNOTATION).unwrap(), "alice");
        assert_eq!(
            annotations.get(REQUESTER_METADATA_ANNOTATION).unwrap(),
            "UID=u-1, Groups=[dev oncall]"
        );
    }

    #[test]
    fn resubmit_by_the_same_user_is_idempotent() {
        let mut annotations = BTreeMap::new();
        let user = caller("alice", "u-1", &["dev"]);
        assert!(annotate(&mut annotations, &user).unwrap());
        let before = annotations.clone();
        assert!(!annotate(&mut annotations, &user).unwrap());
        assert_eq!(annotations, before);
    }

    #[test]
    fn update_by_another_user_is_a_tamper() {
        let mut annotations = BTreeMap::new();
        annotate(&mut annotations, &caller("alice", "u-1", &["dev"])).unwrap();
        let before = annotations.clone();
        assert_eq!(
            annotate(&mut annotations, &caller("mallory", "u-666", &["dev"])),
            Err(Tamper)
        );
        // The original annotation survives.
        assert_eq!(annotations, before);
    }

    fn review_for(kind: &str, object: serde_json::Value, user: &str) -> AdmissionRequest {
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "rev-1",
                "kind": {"group": "tarbac.io", "version": "v1", "kind": kind},
                "resource": {"group": "tarbac.io", "version": "v1", "resource": "sudorequests"},
                "operation": "CREATE",
                "userInfo": {"username": user, "uid": "u-1", "groups": ["dev"]},
                "object": object,
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn mutates_a_sudorequest_with_a_patch() {
        let req = review_for(
            "SudoRequest",
            serde_json::json!({
                "apiVersion": "tarbac.io/v1",
                "kind": "SudoRequest",
                "metadata": {"name": "r1", "namespace": "ns1"},
                "spec": {"duration": "5m", "policy": "p1"},
            }),
            "alice",
        );
        let rsp = admit(req);
        assert!(rsp.allowed);
        let patch = rsp.patch.expect("a patch must be produced");
        let patch: serde_json::Value = serde_json::from_slice(&patch).unwrap();
        assert!(
            patch.to_string().contains("requester"),
            "patch should add requester annotations: {patch}"
        );
    }

    #[test]
    fn denies_tampered_resubmission() {
        let req = review_for(
            "SudoRequest",
            serde_json::json!({
                "apiVersion": "tarbac.io/v1",
                "kind": "SudoRequest",
                "metadata": {
                    "name": "r1",
                    "namespace": "ns1",
                    "annotations": {"tarbac.io/requester": "alice"},
                },
                "spec": {"duration": "5m", "policy": "p1"},
            }),
            "mallory",
        );
        let rsp = admit(req);
        assert!(!rsp.allowed);
    }

    #[test]
    fn denies_unknown_kinds() {
        let req = review_for(
            "SudoPolicy",
            serde_json::json!({
                "apiVersion": "tarbac.io/v1",
                "kind": "SudoPolicy",
                "metadata": {"name": "p1", "namespace": "ns1"},
                "spec": {},
            }),
            "alice",
        );
        let rsp = admit(req);
        assert!(!rsp.allowed);
    }

    #[test]
    fn rejects_undecodable_specs() {
        let req = review_for(
            "SudoRequest",
            serde_json::json!({
                "apiVersion": "tarbac.io/v1",
                "kind": "SudoRequest",
                "metadata": {"name": "r1", "namespace": "ns1"},
                "spec": {"duration": 5, "policy": ["not", "a", "string"]},
            }),
            "alice",
        );
        let rsp = admit(req);
        assert!(!rsp.allowed);
    }
}
