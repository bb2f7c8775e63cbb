//! GitHub REST client used by the tree cache

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::Result;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "agent-coordination-gittree";

pub struct GitHubClient {
    http: reqwest::Client,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchHead {
    pub commit_sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTree {
    pub sha: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub tree: Vec<RemoteTreeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub sha: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", accept);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream { status, body });
        }
        Ok(response)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.get(url, "application/vnd.github+json").await?;
        Ok(response.json().await?)
    }

    /// Resolve the head commit of a branch.
    pub async fn branch_head(&self, owner: &str, repo: &str, branch: &str) -> Result<BranchHead> {
        let url = format!("{}/repos/{}/{}/branches/{}", API_BASE, owner, repo, branch);
        let body = self.get_json(&url).await?;
        let commit_sha = body["commit"]["sha"]
            .as_str()
            .ok_or_else(|| Error::Internal("Branch response missing commit sha".to_string()))?
            .to_string();
        Ok(BranchHead { commit_sha })
    }

    /// Full recursive tree for a commit or tree sha.
    pub async fn tree(&self, owner: &str, repo: &str, sha: &str) -> Result<RemoteTree> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            API_BASE, owner, repo, sha
        );
        let response = self.get(&url, "application/vnd.github+json").await?;
        Ok(response.json().await?)
    }

    /// Raw file content at a ref.
    pub async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            API_BASE,
            owner,
            repo,
            path,
            urlencoding::encode(git_ref)
        );
        let response = self.get(&url, "application/vnd.github.raw+json").await?;
        Ok(response.text().await?)
    }

    /// Two-dot compare between refs.
    pub async fn compare(&self, owner: &str, repo: &str, base: &str, head: &str) -> Result<Value> {
        let url = format!(
            "{}/repos/{}/{}/compare/{}...{}",
            API_BASE, owner, repo, base, head
        );
        self.get_json(&url).await
    }

    /// Recent commits on a branch, newest first.
    pub async fn commits(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        per_page: usize,
    ) -> Result<Value> {
        let url = format!(
            "{}/repos/{}/{}/commits?sha={}&per_page={}",
            API_BASE,
            owner,
            repo,
            urlencoding::encode(branch),
            per_page
        );
        self.get_json(&url).await
    }
}
