//! Typed client over the `/sync` wire protocol. A thin layer: every method
//! is one endpoint, binary payloads are Z85 text inside JSON, and every
//! non-2xx answer is normalized into an `ApiErrorKind`.

use std::sync::RwLock;
use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{multipart, Method, RequestBuilder, Response, StatusCode};

use crate::delta::{Delta, Signature};
use crate::errors::{ApiErrorKind, ErrorBody, SyncError};
use crate::metadata::FileMetadata;
use crate::protocol::{self, *};
use crate::sync_path::SyncPath;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    /// Interior mutability so an expired token can be swapped without
    /// tearing down the client.
    token: RwLock<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, email: &str, token: String, timeout: Duration) -> Result<ApiClient, SyncError> {
        let mut headers = HeaderMap::new();
        let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        set(&mut headers, HEADER_VERSION, protocol::VERSION);
        set(&mut headers, HEADER_OS_NAME, std::env::consts::OS);
        set(&mut headers, HEADER_OS_ARCH, std::env::consts::ARCH);
        set(&mut headers, HEADER_USER, email);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
        })
    }

    pub fn set_token(&self, token: String) {
        *self.token.write().unwrap() = token;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let token = self.token.read().unwrap().clone();
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token)
    }

    /// Folds a non-2xx response into the error envelope, falling back to a
    /// status-derived kind when no envelope could be parsed (e.g. a proxy
    /// answered instead of the server).
    async fn check(response: Response) -> Result<Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if let Ok(envelope) = serde_json::from_str::<ErrorBody>(&body) {
            return Err(SyncError::Api { kind: envelope.error_kind, message: envelope.message });
        }
        if status.is_server_error() {
            return Err(SyncError::Transport(format!("server error {status}")));
        }
        let kind = match status {
            StatusCode::UNAUTHORIZED => ApiErrorKind::Unauthorized,
            StatusCode::FORBIDDEN => ApiErrorKind::PermissionDenied,
            StatusCode::NOT_FOUND => ApiErrorKind::NotFound,
            StatusCode::CONFLICT => ApiErrorKind::AlreadyExists,
            StatusCode::BAD_REQUEST => ApiErrorKind::BadRequest,
            _ => ApiErrorKind::Internal,
        };
        Err(SyncError::Api { kind, message: body })
    }

    async fn post_json<B: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, SyncError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // ---- sync endpoints ----

    pub async fn datasite_states(&self) -> Result<DatasiteStates, SyncError> {
        let response = self.request(Method::POST, "/sync/datasite_states").send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn dir_state(&self, dir: &str) -> Result<Vec<FileMetadata>, SyncError> {
        let response = self
            .request(Method::POST, "/sync/dir_state")
            .query(&[("dir", dir)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Returns None (rather than an error) when the file doesn't exist,
    /// since "absent on the remote" is an ordinary state for the consumer.
    pub async fn get_metadata(&self, path: &SyncPath) -> Result<Option<FileMetadata>, SyncError> {
        let result: Result<FileMetadata, _> =
            self.post_json("/sync/get_metadata", &PathRequest { path: path.clone() }).await;
        match result {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_diff(&self, path: &SyncPath, signature: &Signature) -> Result<DiffResponse, SyncError> {
        self.post_json(
            "/sync/get_diff",
            &DiffRequest { path: path.clone(), signature: protocol::encode_blob(signature)? },
        )
        .await
    }

    pub async fn apply_diff(
        &self,
        path: &SyncPath,
        delta: &Delta,
        expected_hash: &str,
    ) -> Result<ApplyDiffResponse, SyncError> {
        self.post_json(
            "/sync/apply_diff",
            &ApplyDiffRequest {
                path: path.clone(),
                diff: protocol::encode_blob(delta)?,
                expected_hash: expected_hash.to_string(),
            },
        )
        .await
    }

    pub async fn create(&self, path: &SyncPath, data: Vec<u8>) -> Result<(), SyncError> {
        let part = multipart::Part::bytes(data)
            .file_name(path.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);
        let response = self.request(Method::POST, "/sync/create").multipart(form).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &SyncPath) -> Result<(), SyncError> {
        let response = self
            .request(Method::POST, "/sync/delete")
            .json(&PathRequest { path: path.clone() })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn download(&self, path: &SyncPath) -> Result<Vec<u8>, SyncError> {
        let response = self
            .request(Method::POST, "/sync/download")
            .json(&PathRequest { path: path.clone() })
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    /// Returns a zip archive of every requested path the caller may read.
    pub async fn download_bulk(&self, paths: &[SyncPath]) -> Result<Vec<u8>, SyncError> {
        let response = self
            .request(Method::POST, "/sync/download_bulk")
            .json(&BulkRequest { paths: paths.to_vec() })
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    // ---- auth and registration ----

    pub async fn register(&self, email: &str) -> Result<(), SyncError> {
        let response = self
            .request(Method::POST, "/register")
            .json(&RegisterRequest { email: email.to_string() })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn request_email_token(&self, email: &str) -> Result<String, SyncError> {
        let r: EmailTokenResponse =
            self.post_json("/auth/request_email_token", &EmailTokenRequest { email: email.to_string() }).await?;
        Ok(r.email_token)
    }

    /// Exchanges an email token for a long-lived access token and installs
    /// it on this client.
    pub async fn validate_email_token(&self, email_token: &str) -> Result<String, SyncError> {
        let r: AccessTokenResponse = self
            .post_json("/auth/validate_email_token", &ValidateTokenRequest { email_token: email_token.to_string() })
            .await?;
        debug!("Obtained new access token");
        self.set_token(r.access_token.clone());
        Ok(r.access_token)
    }

    pub async fn whoami(&self) -> Result<String, SyncError> {
        let response = self.request(Method::POST, "/auth/whoami").send().await?;
        let r: WhoamiResponse = Self::check(response).await?.json().await?;
        Ok(r.email)
    }

    pub async fn info(&self) -> Result<InfoResponse, SyncError> {
        let response = self.request(Method::GET, "/info").send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
