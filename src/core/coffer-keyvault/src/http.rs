//! REST client for a remote key vault.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::client::{
    KeyVaultClient, KeyVaultKey, KeyWrapAlgorithm, SignResult, UnwrapResult, WrapResult,
};
use crate::error::KeyVaultError;
use crate::uri::KeyUri;
use crate::wire::{
    self, ErrorResponse, KeyOperationRequest, KeyOperationResponse, VerifyRequest, VerifyResponse,
    SIGN_ALGORITHM,
};

/// Key vault client speaking the REST protocol served by [`crate::server::router`].
pub struct HttpKeyVaultClient {
    client: Client,
    token: Option<String>,
}

impl HttpKeyVaultClient {
    /// Creates a client with a 30 second request timeout.
    pub fn new() -> Result<Self, KeyVaultError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KeyVaultError::ServiceUnavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            token: None,
        })
    }

    /// Sends `Authorization: Bearer {token}` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        uri: &KeyUri,
        operation: &str,
        body: &B,
    ) -> Result<T, KeyVaultError> {
        let url = format!("{uri}/{operation}");
        debug!(url = %url, "Key vault request");
        let req = self.authorized(self.client.post(&url)).json(body);
        self.send(req, uri).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        uri: &KeyUri,
    ) -> Result<T, KeyVaultError> {
        let resp = req
            .send()
            .await
            .map_err(|e| KeyVaultError::ServiceUnavailable(format!("{uri}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| KeyVaultError::NullResult(format!("{uri}: {e}")));
        }

        let detail = resp.json::<ErrorResponse>().await.ok().map(|e| e.error);
        Err(error_from_status(status.as_u16(), detail, uri))
    }
}

fn error_from_status(
    status: u16,
    detail: Option<wire::ErrorDetail>,
    uri: &KeyUri,
) -> KeyVaultError {
    let (code, message) = match detail {
        Some(d) => (d.code, d.message),
        None => (String::new(), format!("{uri}: http status {status}")),
    };

    match (status, code.as_str()) {
        (_, "KeyDisabled") => KeyVaultError::KeyDisabled(message),
        (404, _) => KeyVaultError::KeyNotFound(message),
        (401 | 403, _) => KeyVaultError::AuthenticationFailure(message),
        (400, _) => KeyVaultError::WrapUnwrapFailure(message),
        (503, _) => KeyVaultError::ServiceUnavailable(message),
        (status, _) => KeyVaultError::RequestFailed { status, message },
    }
}

#[async_trait]
impl KeyVaultClient for HttpKeyVaultClient {
    async fn get_key(&self, uri: &KeyUri) -> Result<KeyVaultKey, KeyVaultError> {
        let req = self.authorized(self.client.get(uri.to_string()));
        self.send(req, uri).await
    }

    async fn wrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<WrapResult, KeyVaultError> {
        let body = KeyOperationRequest {
            alg: algorithm.to_string(),
            value: wire::encode(key),
        };
        let resp: KeyOperationResponse = self.post(uri, "wrapkey", &body).await?;

        Ok(WrapResult {
            kid: resp.kid,
            wrapped_key: wire::decode(&resp.value)?,
        })
    }

    async fn unwrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<UnwrapResult, KeyVaultError> {
        let body = KeyOperationRequest {
            alg: algorithm.to_string(),
            value: wire::encode(wrapped_key),
        };
        let resp: KeyOperationResponse = self.post(uri, "unwrapkey", &body).await?;

        Ok(UnwrapResult {
            kid: resp.kid,
            key: Zeroizing::new(wire::decode(&resp.value)?),
        })
    }

    async fn sign(&self, uri: &KeyUri, data: &[u8]) -> Result<SignResult, KeyVaultError> {
        let body = KeyOperationRequest {
            alg: SIGN_ALGORITHM.to_string(),
            value: wire::encode(data),
        };
        let resp: KeyOperationResponse = self.post(uri, "sign", &body).await?;

        Ok(SignResult {
            kid: resp.kid,
            signature: wire::decode(&resp.value)?,
        })
    }

    async fn verify(
        &self,
        uri: &KeyUri,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyVaultError> {
        let body = VerifyRequest {
            alg: SIGN_ALGORITHM.to_string(),
            digest: wire::encode(data),
            value: wire::encode(signature),
        };
        let resp: VerifyResponse = self.post(uri, "verify", &body).await?;
        Ok(resp.value)
    }
}
