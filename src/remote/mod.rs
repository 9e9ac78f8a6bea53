//! Remote project/account API client and project-status reconciliation.
//!
//! The reconciliation helpers are free functions taking the client as an
//! explicit dependency; they hold no orchestrator state.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::RemoteError;

/// A project record as the remote API knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub public: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOrg {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRun {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub build_number: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordKey {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub org_id: Option<String>,
    pub public: bool,
}

/// The remote account API. Every operation may fail with a
/// [`RemoteError`] carrying the HTTP status when one was received.
///
/// Real implementation: [`HttpAccountClient`]. Test double: mock clients
/// in the reconciliation tests.
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn ensure_auth_token(&self) -> Result<String, RemoteError>;
    async fn get_orgs(&self) -> Result<Vec<RemoteOrg>, RemoteError>;
    async fn get_projects(&self) -> Result<Vec<RemoteProject>, RemoteError>;
    async fn get_project(&self, id: &str) -> Result<RemoteProject, RemoteError>;
    async fn get_project_runs(&self, id: &str) -> Result<Vec<RemoteRun>, RemoteError>;
    async fn get_project_record_keys(&self, id: &str) -> Result<Vec<RecordKey>, RemoteError>;
    async fn request_access(&self, project_id: &str) -> Result<(), RemoteError>;
    async fn create_project(
        &self,
        req: CreateProjectRequest,
    ) -> Result<RemoteProject, RemoteError>;
}

/// Reqwest-backed client.
pub struct HttpAccountClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpAccountClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
            client: reqwest::Client::new(),
        }
    }

    async fn check<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: Some(status.as_u16()),
            message,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let token = self.auth_token.as_ref().ok_or(RemoteError::TokenMissing)?;
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;
        Self::check(resp).await
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    async fn ensure_auth_token(&self) -> Result<String, RemoteError> {
        self.auth_token.clone().ok_or(RemoteError::TokenMissing)
    }

    async fn get_orgs(&self) -> Result<Vec<RemoteOrg>, RemoteError> {
        self.get("/orgs").await
    }

    async fn get_projects(&self) -> Result<Vec<RemoteProject>, RemoteError> {
        self.get("/projects").await
    }

    async fn get_project(&self, id: &str) -> Result<RemoteProject, RemoteError> {
        self.get(&format!("/projects/{id}")).await
    }

    async fn get_project_runs(&self, id: &str) -> Result<Vec<RemoteRun>, RemoteError> {
        self.get(&format!("/projects/{id}/runs")).await
    }

    async fn get_project_record_keys(&self, id: &str) -> Result<Vec<RecordKey>, RemoteError> {
        self.get(&format!("/projects/{id}/keys")).await
    }

    async fn request_access(&self, project_id: &str) -> Result<(), RemoteError> {
        let token = self.auth_token.as_ref().ok_or(RemoteError::TokenMissing)?;
        let resp = self
            .client
            .post(format!(
                "{}/projects/{project_id}/membership_requests",
                self.base_url
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Api {
                status: Some(status.as_u16()),
                message: resp.text().await.unwrap_or_default(),
            })
        }
    }

    async fn create_project(
        &self,
        req: CreateProjectRequest,
    ) -> Result<RemoteProject, RemoteError> {
        let token = self.auth_token.as_ref().ok_or(RemoteError::TokenMissing)?;
        let resp = self
            .client
            .post(format!("{}/projects", self.base_url))
            .bearer_auth(token)
            .json(&req)
            .send()
            .await?;
        Self::check(resp).await
    }
}

/// Outcome of reconciling a local project against the remote listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectStatus {
    Valid,
    Invalid,
    Unauthorized,
}

/// A locally known project, optionally tagged with a remote id.
#[derive(Debug, Clone)]
pub struct LocalProject {
    pub path: PathBuf,
    pub id: Option<String>,
}

/// A local project with its reconciled status and any merged remote
/// fields.
#[derive(Debug, Clone)]
pub struct ProjectWithStatus {
    pub path: PathBuf,
    pub id: Option<String>,
    pub status: ProjectStatus,
    pub remote: Option<RemoteProject>,
}

impl ProjectWithStatus {
    fn valid_without_remote(local: LocalProject) -> Self {
        Self {
            path: local.path,
            id: local.id,
            status: ProjectStatus::Valid,
            remote: None,
        }
    }
}

/// Reconcile one project by individual lookup.
///
/// A project with no id is always `Valid` — no network call. 404 maps to
/// `Invalid`, 403 to `Unauthorized`; any other failure propagates
/// unmodified.
pub async fn reconcile_project_status(
    client: &dyn AccountClient,
    local: LocalProject,
) -> Result<ProjectWithStatus, RemoteError> {
    let Some(id) = local.id.clone() else {
        return Ok(ProjectWithStatus::valid_without_remote(local));
    };
    match client.get_project(&id).await {
        Ok(remote) => Ok(ProjectWithStatus {
            path: local.path,
            id: local.id,
            status: ProjectStatus::Valid,
            remote: Some(remote),
        }),
        Err(e) => match e.status() {
            Some(404) => Ok(ProjectWithStatus {
                path: local.path,
                id: local.id,
                status: ProjectStatus::Invalid,
                remote: None,
            }),
            Some(403) => Ok(ProjectWithStatus {
                path: local.path,
                id: local.id,
                status: ProjectStatus::Unauthorized,
                remote: None,
            }),
            _ => Err(e),
        },
    }
}

/// Reconcile a batch against a remote listing indexed by id.
///
/// Projects found in the listing are merged without an extra call;
/// unknown ids are looked up individually, all lookups concurrent.
/// Translated statuses (404/403) never fail the batch; the first
/// unrecognized error aborts it after every lookup has settled.
pub async fn reconcile_project_statuses(
    client: &dyn AccountClient,
    local: Vec<LocalProject>,
    remote: Vec<RemoteProject>,
) -> Result<Vec<ProjectWithStatus>, RemoteError> {
    let by_id: HashMap<&str, &RemoteProject> =
        remote.iter().map(|p| (p.id.as_str(), p)).collect();

    let futures: Vec<_> = local
        .into_iter()
        .map(|project| {
            let known = project
                .id
                .as_deref()
                .and_then(|id| by_id.get(id))
                .map(|p| (*p).clone());
            async move {
                match (known, &project.id) {
                    (_, None) => Ok(ProjectWithStatus::valid_without_remote(project)),
                    (Some(remote), Some(_)) => Ok(ProjectWithStatus {
                        path: project.path,
                        id: project.id,
                        status: ProjectStatus::Valid,
                        remote: Some(remote),
                    }),
                    (None, Some(_)) => reconcile_project_status(client, project).await,
                }
            }
        })
        .collect();

    join_all(futures).await.into_iter().collect()
}
