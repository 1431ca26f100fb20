use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{REASON_NOT_CONFIGURED, Slot, classify_reqwest, classify_status};
use crate::evidence::{CommitInfo, GithubEvidence, WorkflowRun};

/* ============================= CLIENT ============================= */

const API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const PAGE_SIZE: usize = 30;

pub struct GithubProvider {
    http: reqwest::Client,
    token: Option<String>,
    repo: String,
}

impl GithubProvider {
    /// `repo` is `owner/name`. The token is optional for public repos but
    /// required to stay inside sane rate limits.
    pub fn new(repo: &str, token: Option<String>) -> GithubProvider {
        GithubProvider {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("tarka/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client builds with static config"),
            token,
            repo: repo.to_string(),
        }
    }

    /// Commits and workflow runs since `since`, combined into one evidence
    /// value; either half failing degrades to the other half.
    pub async fn recent_activity(&self, since: DateTime<Utc>) -> Slot<GithubEvidence> {
        if self.repo.is_empty() {
            return Slot::unavailable(REASON_NOT_CONFIGURED);
        }

        let commits = self.commits_since(since).await;
        let runs = self.workflow_runs_since(since).await;

        match (commits, runs) {
            (Err(reason), Err(_)) => Slot::unavailable(reason),
            (commits, runs) => {
                let commits = commits.unwrap_or_default();
                let workflow_runs = runs.unwrap_or_default();
                if commits.is_empty() && workflow_runs.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(GithubEvidence {
                        repo: self.repo.clone(),
                        commits,
                        workflow_runs,
                    })
                }
            }
        }
    }

    async fn commits_since(&self, since: DateTime<Utc>) -> Result<Vec<CommitInfo>, String> {
        let url = format!("{API_BASE}/repos/{}/commits", self.repo);
        let body: Vec<CommitWire> = self
            .get_json(&url, &[("since", since.to_rfc3339()), ("per_page", PAGE_SIZE.to_string())])
            .await?;
        Ok(body
            .into_iter()
            .map(|c| CommitInfo {
                sha: c.sha,
                message: c.commit.message.lines().next().unwrap_or_default().to_string(),
                author: c.commit.author.as_ref().and_then(|a| a.name.clone()),
                committed_at: c
                    .commit
                    .author
                    .and_then(|a| a.date)
                    .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
                    .map(|d| d.with_timezone(&Utc)),
            })
            .collect())
    }

    async fn workflow_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowRun>, String> {
        let url = format!("{API_BASE}/repos/{}/actions/runs", self.repo);
        let created = format!(">={}", since.format("%Y-%m-%dT%H:%M:%SZ"));
        let body: RunsWire = self
            .get_json(&url, &[("created", created), ("per_page", PAGE_SIZE.to_string())])
            .await?;

        let mut runs: Vec<WorkflowRun> = body
            .workflow_runs
            .into_iter()
            .map(|r| WorkflowRun {
                name: r.name.unwrap_or_else(|| "workflow".to_string()),
                status: r.status.unwrap_or_default(),
                conclusion: r.conclusion,
                head_sha: r.head_sha,
                created_at: r
                    .created_at
                    .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
                    .map(|d| d.with_timezone(&Utc)),
                url: r.html_url,
                run_id: r.id,
                failed_jobs: Vec::new(),
            })
            .collect();

        // For the most recent failed run, pull the failing job names so
        // the report can say which step broke without a link-hop.
        if let Some(failed) = runs
            .iter_mut()
            .find(|r| r.conclusion.as_deref() == Some("failure"))
        {
            if let Some(id) = failed.run_id {
                if let Ok(jobs) = self.failed_job_names(id).await {
                    failed.failed_jobs = jobs;
                }
            }
        }
        Ok(runs)
    }

    /// Names of failed jobs (with their first failed step) for a workflow
    /// run; the closest read-only stand-in for the run's logs.
    pub async fn failed_job_names(&self, run_id: u64) -> Result<Vec<String>, String> {
        let url = format!("{API_BASE}/repos/{}/actions/runs/{run_id}/jobs", self.repo);
        let body: JobsWire = self.get_json(&url, &[]).await?;
        Ok(body
            .jobs
            .into_iter()
            .filter(|j| j.conclusion.as_deref() == Some("failure"))
            .map(|j| {
                let step = j
                    .steps
                    .iter()
                    .find(|s| s.conclusion.as_deref() == Some("failure"))
                    .map(|s| s.name.clone());
                match step {
                    Some(step) => format!("{} / {step}", j.name),
                    None => j.name,
                }
            })
            .collect())
    }

    /// Fetch one file at a ref, as raw text.
    pub async fn file_at(&self, path: &str, git_ref: &str) -> Slot<String> {
        let url = format!("{API_BASE}/repos/{}/contents/{path}", self.repo);
        let mut req = self
            .http
            .get(&url)
            .query(&[("ref", git_ref)])
            .header("accept", "application/vnd.github.raw+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return Slot::unavailable(classify_reqwest(&e)),
        };
        if !resp.status().is_success() {
            return Slot::unavailable(classify_status(resp.status().as_u16()));
        }
        match resp.text().await {
            Ok(text) if text.is_empty() => Slot::empty(),
            Ok(text) => Slot::ok(text),
            Err(e) => Slot::unavailable(classify_reqwest(&e)),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, String> {
        let mut req = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| classify_reqwest(&e))?;
        let status = resp.status();
        if !status.is_success() {
            // Exhausted core rate limit comes back as 403 with a zeroed
            // remaining header; classify it as throttled, not forbidden.
            if status.as_u16() == 403 {
                let remaining = resp
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok());
                if remaining == Some("0") {
                    return Err("throttled".to_string());
                }
            }
            return Err(classify_status(status.as_u16()));
        }
        resp.json().await.map_err(|e| classify_reqwest(&e))
    }
}

/* ============================= WIRE TYPES ============================= */

#[derive(Debug, Deserialize)]
struct CommitWire {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    name: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunsWire {
    #[serde(default)]
    workflow_runs: Vec<RunWire>,
}

#[derive(Debug, Deserialize)]
struct RunWire {
    id: Option<u64>,
    name: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    head_sha: String,
    created_at: Option<String>,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsWire {
    #[serde(default)]
    jobs: Vec<JobWire>,
}

#[derive(Debug, Deserialize)]
struct JobWire {
    name: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<StepWire>,
}

#[derive(Debug, Deserialize)]
struct StepWire {
    name: String,
    conclusion: Option<String>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_wire_parses() {
        let json = r#"[{"sha":"abc123","commit":{"message":"fix: rollout\n\nbody","author":{"name":"dev","date":"2026-07-01T10:00:00Z"}}}]"#;
        let commits: Vec<CommitWire> = serde_json::from_str(json).unwrap();
        assert_eq!(commits[0].sha, "abc123");
        assert_eq!(commits[0].commit.message.lines().next(), Some("fix: rollout"));
    }

    #[test]
    fn test_runs_wire_parses() {
        let json = r#"{"workflow_runs":[{"name":"deploy","status":"completed","conclusion":"failure","head_sha":"abc","created_at":"2026-07-01T10:00:00Z","html_url":"https://github.com/o/r/actions/runs/1"}]}"#;
        let runs: RunsWire = serde_json::from_str(json).unwrap();
        assert_eq!(runs.workflow_runs[0].conclusion.as_deref(), Some("failure"));
    }

    #[test]
    fn test_runs_wire_tolerates_missing_list() {
        let runs: RunsWire = serde_json::from_str("{}").unwrap();
        assert!(runs.workflow_runs.is_empty());
    }
}
