/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/token_issuer.rs
*
* The token-request collaborator interface (spec §6: "Token request.
* createToken(serviceAccount, boundObject, audiences?, expirationSeconds?) ->
* (jwt, expiry)"). Drawing a trait boundary around this external call is the
* same seam the teacher's `secret_manager` module draws around its
* `SecretProvider` backends (Vault, SOPS): one real implementation backed by
* the Kubernetes TokenRequest subresource, one in-memory fake for tests.
*
* SPDX-License-Identifier: Apache-2.0
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{
    BoundObjectReference, TokenRequest, TokenRequestSpec, TokenRequestStatus,
};
use kube::api::{Api, PostParams};
use thiserror::Error;

/// Identifies the object a requested token should be bound to (spec §4.4
/// "Refresh": `BoundObject = (Kind: Secret, Name: <secret>, UID: <secret.uid>)`).
#[derive(Debug, Clone)]
pub struct BoundObjectRef {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A freshly issued, opaque JWT and its expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub jwt: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TokenIssuerError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("token request returned no token in its status")]
    MissingToken,
    #[error("token request returned an unparsable expiration timestamp")]
    InvalidExpiry,
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Requests a bound (or unbound, when `bound_object` is `None`) token
    /// for `service_account`. `expiration_seconds` is `None` for the normal
    /// refresh path (spec §4.4: "no explicit expiration") and `Some(short)`
    /// for C2's fallback throwaway-token path (spec §4.2).
    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        bound_object: Option<BoundObjectRef>,
        expiration_seconds: Option<i64>,
    ) -> Result<IssuedToken, TokenIssuerError>;
}

/// Issues tokens via the real `authentication.k8s.io` TokenRequest subresource.
pub struct KubeTokenIssuer {
    client: kube::Client,
}

impl KubeTokenIssuer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenIssuer for KubeTokenIssuer {
    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        bound_object: Option<BoundObjectRef>,
        expiration_seconds: Option<i64>,
    ) -> Result<IssuedToken, TokenIssuerError> {
        let api: Api<k8s_openapi::api::core::v1::ServiceAccount> =
            Api::namespaced(self.client.clone(), namespace);

        let request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                bound_object_ref: bound_object.map(|b| BoundObjectReference {
                    kind: Some(b.kind),
                    name: Some(b.name),
                    uid: Some(b.uid),
                    api_version: Some("v1".to_string()),
                    ..Default::default()
                }),
                expiration_seconds,
            },
            status: None,
        };

        let body = serde_json::to_vec(&request).map_err(|_| TokenIssuerError::MissingToken)?;
        let response: TokenRequest = api
            .create_subresource("token", service_account, &PostParams::default(), body)
            .await?;

        let status: TokenRequestStatus = response.status.ok_or(TokenIssuerError::MissingToken)?;
        let expiry = status
            .expiration_timestamp
            .0
            .with_timezone(&Utc);

        Ok(IssuedToken {
            jwt: status.token,
            expiry,
        })
    }
}

/// An in-memory fake used by controller unit tests, returning a
/// deterministic JWT built from the caller's chosen `nbf`/`exp`/`kid`.
#[cfg(test)]
pub struct FakeTokenIssuer {
    pub kid: String,
    pub nbf: DateTime<Utc>,
    pub exp: DateTime<Utc>,
}

#[cfg(test)]
#[async_trait]
impl TokenIssuer for FakeTokenIssuer {
    async fn create_token(
        &self,
        _namespace: &str,
        _service_account: &str,
        _bound_object: Option<BoundObjectRef>,
        _expiration_seconds: Option<i64>,
    ) -> Result<IssuedToken, TokenIssuerError> {
        use base64::Engine;
        let e = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = format!(r#"{{"alg":"RS256","kid":"{}"}}"#, self.kid);
        let claims = format!(r#"{{"nbf":{},"exp":{}}}"#, self.nbf.timestamp(), self.exp.timestamp());
        let jwt = format!("{}.{}.{}", e.encode(header), e.encode(claims), e.encode("sig"));
        Ok(IssuedToken { jwt, expiry: self.exp })
    }
}
