use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{AuthToken, BlockSource, BoxedSource, Connector, SourceError, SourceResult};
use crate::id::ShardId;
use crate::locator::Locator;

const ACCESS_HASH_HEADER: &str = "x-access-hash";
const FILE_REFERENCE_HEADER: &str = "x-file-reference";

/// Creates [`HttpSource`] connections to a block gateway.
///
/// Credentials are verified against `GET {endpoint}/shards/{home}/self` before a connection is
/// handed out.
#[derive(Debug)]
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint: Arc<str>,
    home_shard: ShardId,
}

impl HttpConnector {
    /// Creates a connector for the gateway at `endpoint`.
    pub fn new(endpoint: &str, home_shard: ShardId) -> SourceResult<Self> {
        Ok(Self {
            client: super::reqwest_client()?,
            endpoint: endpoint.trim_end_matches('/').into(),
            home_shard,
        })
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    fn home_shard(&self) -> ShardId {
        self.home_shard
    }

    #[tracing::instrument(level = "debug", skip_all, fields(shard = %self.home_shard))]
    async fn connect(&self, credential: &str) -> SourceResult<BoxedSource> {
        let source = HttpSource {
            client: self.client.clone(),
            endpoint: Arc::clone(&self.endpoint),
            shard: self.home_shard,
            credential: credential.into(),
            session: RwLock::new(Some(credential.into())),
        };

        let response = source
            .request(Method::GET, "self")?
            .send()
            .await
            .map_err(|cause| SourceError::Reqwest {
                context: "failed to verify credential".to_owned(),
                cause,
            })?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(SourceError::CredentialRejected(self.home_shard));
        }
        check_status(response, "failed to verify credential")?;

        Ok(Arc::new(source))
    }
}

/// A shard connection to an HTTP block gateway.
///
/// Requests carry the worker credential as bearer token until an imported authorization replaces
/// it with a shard session token.
pub struct HttpSource {
    client: reqwest::Client,
    endpoint: Arc<str>,
    shard: ShardId,
    credential: Arc<str>,
    session: RwLock<Option<Arc<str>>>,
}

impl HttpSource {
    fn request(&self, method: Method, path: &str) -> SourceResult<RequestBuilder> {
        let token = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SourceError::Unauthorized(self.shard))?;

        let url = format!("{}/shards/{}/{path}", self.endpoint, self.shard);
        Ok(self.client.request(method, url).bearer_auth(token))
    }
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("endpoint", &self.endpoint)
            .field("shard", &self.shard)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ExportRequest {
    shard: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    id: u64,
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct ImportResponse {
    session: String,
}

#[async_trait::async_trait]
impl BlockSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn shard(&self) -> ShardId {
        self.shard
    }

    #[tracing::instrument(level = "trace", skip_all, fields(offset = offset))]
    async fn fetch_block(&self, locator: &Locator, offset: u64, limit: u32) -> SourceResult<Bytes> {
        let path = format!("objects/{}/blocks", locator.object_id);
        let mut request = self
            .request(Method::GET, &path)?
            .query(&[("offset", offset), ("limit", u64::from(limit))])
            .header(ACCESS_HASH_HEADER, locator.access_hash.to_string());
        if !locator.reference.is_empty() {
            request = request.header(FILE_REFERENCE_HEADER, STANDARD.encode(&locator.reference));
        }

        let response = request.send().await.map_err(|cause| SourceError::Reqwest {
            context: "failed to send block request".to_owned(),
            cause,
        })?;

        // The gateway answers out-of-range offsets with 416, which marks the end of the object.
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Bytes::new());
        }
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SourceError::Unauthorized(self.shard));
        }

        let response = check_status(response, "failed to fetch block")?;
        response.bytes().await.map_err(|cause| SourceError::Reqwest {
            context: "failed to read block".to_owned(),
            cause,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(target = %shard))]
    async fn export_authorization(&self, shard: ShardId) -> SourceResult<AuthToken> {
        let response = self
            .request(Method::POST, "authorization/export")?
            .json(&ExportRequest { shard: shard.0 })
            .send()
            .await
            .map_err(|cause| SourceError::Reqwest {
                context: "failed to export authorization".to_owned(),
                cause,
            })?;

        let payload: TokenPayload = check_status(response, "failed to export authorization")?
            .json()
            .await
            .map_err(|cause| SourceError::Reqwest {
                context: "failed to read exported authorization".to_owned(),
                cause,
            })?;

        let bytes = STANDARD
            .decode(payload.bytes)
            .map_err(|cause| SourceError::Serde {
                context: "invalid authorization bytes".to_owned(),
                cause: serde::de::Error::custom(cause),
            })?;

        Ok(AuthToken {
            id: payload.id,
            bytes: bytes.into(),
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(shard = %self.shard))]
    async fn import_authorization(&self, token: AuthToken) -> SourceResult<()> {
        let url = format!("{}/shards/{}/authorization/import", self.endpoint, self.shard);
        let payload = TokenPayload {
            id: token.id,
            bytes: STANDARD.encode(&token.bytes),
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.credential)
            .json(&payload)
            .send()
            .await
            .map_err(|cause| SourceError::Reqwest {
                context: "failed to import authorization".to_owned(),
                cause,
            })?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(SourceError::InvalidToken(self.shard));
        }

        let imported: ImportResponse = check_status(response, "failed to import authorization")?
            .json()
            .await
            .map_err(|cause| SourceError::Reqwest {
                context: "failed to read session token".to_owned(),
                cause,
            })?;

        *self.session.write().unwrap_or_else(PoisonError::into_inner) =
            Some(imported.session.into());
        Ok(())
    }

    async fn open_session(&self, shard: ShardId) -> SourceResult<BoxedSource> {
        Ok(Arc::new(HttpSource {
            client: self.client.clone(),
            endpoint: Arc::clone(&self.endpoint),
            shard,
            credential: Arc::clone(&self.credential),
            session: RwLock::new(None),
        }))
    }
}

fn check_status(response: Response, context: &str) -> SourceResult<Response> {
    response
        .error_for_status()
        .map_err(|cause| SourceError::Reqwest {
            context: context.to_owned(),
            cause,
        })
}
