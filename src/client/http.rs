// src/client/http.rs

//! `reqwest`-backed client for a GA4GH WES-style execution service.

use std::time::Duration;

use reqwest::multipart::Form;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::ClientError;
use super::wire::{
    ArtifactSet, CancelAck, RemoteStatus, RunId, RunIdResponse, RunLog, RunRequest,
};
use super::{BoxFuture, ClientResult, ExecutionClient};

/// Talks to `{base_url}/runs...` over one pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpExecutionClient {
    http: Client,
    base_url: Url,
}

impl HttpExecutionClient {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidRequest(format!("base url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidRequest(format!(
                "base url {base_url} cannot carry a path"
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                ClientError::InvalidRequest(format!("base url {} cannot carry a path", self.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn get_run_log(&self, run_id: &str) -> ClientResult<RunLog> {
        let url = self.endpoint(&["runs", run_id])?;
        debug!(%url, "GET run log");
        let response = self.http.get(url).send().await?;
        decode(response).await
    }
}

fn submission_form(request: &RunRequest) -> ClientResult<Form> {
    let json = |value: &Value| -> ClientResult<String> {
        serde_json::to_string(value).map_err(|e| ClientError::InvalidRequest(e.to_string()))
    };
    let tags = serde_json::to_string(&request.tags)
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

    let mut form = Form::new()
        .text("workflow_params", json(&request.workflow_params)?)
        .text("workflow_type", request.workflow_type.clone())
        .text("workflow_type_version", request.workflow_type_version.clone())
        .text("workflow_url", request.workflow_url.clone())
        .text("workflow_engine_parameters", json(&request.workflow_engine_parameters)?)
        .text("tags", tags);

    if let Some(engine) = &request.workflow_engine {
        form = form.text("workflow_engine", engine.clone());
    }
    if let Some(version) = &request.workflow_engine_version {
        form = form.text("workflow_engine_version", version.clone());
    }
    Ok(form)
}

/// Turn a non-2xx into [`ClientError::Status`], otherwise decode the JSON body.
async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        warn!(status = status.as_u16(), %body, "execution service returned an error");
        return Err(ClientError::status(status.as_u16(), body));
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

impl ExecutionClient for HttpExecutionClient {
    fn submit(&self, request: RunRequest) -> BoxFuture<'_, ClientResult<RunId>> {
        Box::pin(async move {
            let url = self.endpoint(&["runs"])?;
            let form = submission_form(&request)?;
            debug!(%url, workflow_url = %request.workflow_url, "POST run");

            let response = self.http.post(url).multipart(form).send().await?;
            let body: RunIdResponse = decode(response).await?;
            Ok(body.run_id)
        })
    }

    fn status(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<RemoteStatus>> {
        Box::pin(async move {
            let log = self.get_run_log(&run_id).await?;
            match log.state {
                Some(state) => Ok(RemoteStatus::parse(&state)),
                None => {
                    warn!(%run_id, "run log carries no state; treating it as unknown");
                    Ok(RemoteStatus::Unknown)
                }
            }
        })
    }

    fn cancel(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<CancelAck>> {
        Box::pin(async move {
            let url = self.endpoint(&["runs", run_id.as_str(), "cancel"])?;
            debug!(%url, "POST cancel");
            let response = self.http.post(url).send().await?;
            let body: RunIdResponse = decode(response).await?;
            Ok(CancelAck {
                run_id: body.run_id,
            })
        })
    }

    fn fetch_outputs(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<ArtifactSet>> {
        Box::pin(async move {
            let log = self.get_run_log(&run_id).await?;
            Ok(ArtifactSet::from_outputs(&log.outputs))
        })
    }
}
