// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! GitHub PR peripheral.
//!
//! Polls pull requests the user authors or reviews, derives a per-PR heat
//! (`hot` on fresh commits/comments, decaying to `warm` and `cold` with
//! age), and writes the result into the store; the hub broadcasts from
//! there. Rate limiting is surfaced as a `rate_limited` event and polling
//! backs off to the advertised reset. 5xx responses retry silently.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::proto::ServerEvent;
use crate::store::{epoch_ms, Heat, PrRecord, PrRole, Store};
use crate::warnings::Warnings;

/// A hot PR cools to warm after an hour without activity.
pub const HOT_TO_WARM_MS: u64 = 60 * 60 * 1000;
/// A warm PR cools to cold after a day.
pub const WARM_TO_COLD_MS: u64 = 24 * 60 * 60 * 1000;

/// Hub-originated requests to the poller.
#[derive(Debug, Clone)]
pub enum GithubAction {
    Refresh,
    Approve { repo: String, number: u64 },
    Merge { repo: String, number: u64 },
}

pub struct GithubConfig {
    pub token: Option<String>,
    pub api_url: String,
    pub interval: Duration,
}

impl GithubConfig {
    pub fn from_env(interval: Duration) -> Self {
        Self {
            token: std::env::var("GITHUB_TOKEN").ok(),
            api_url: std::env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            interval,
        }
    }
}

/// What the poller learned about one PR this cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct PrObservation {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub url: String,
    pub role: PrRole,
    pub state: String,
    pub reason: String,
    pub author: String,
    pub head_sha: String,
    pub comment_count: u64,
}

/// Merge an observation with the previously stored record, deriving heat.
///
/// New commits or comments re-heat to `hot`; otherwise heat decays with the
/// time since `last_heat_activity_at`.
pub fn merge_observation(
    observed: &PrObservation,
    previous: Option<&PrRecord>,
    now_ms: u64,
) -> PrRecord {
    let (heat, last_activity) = match previous {
        Some(prev) => {
            let changed =
                prev.head_sha != observed.head_sha || prev.comment_count != observed.comment_count;
            if changed {
                (Heat::Hot, now_ms)
            } else {
                (decay(prev.last_heat_activity_at_ms, now_ms), prev.last_heat_activity_at_ms)
            }
        }
        None => (Heat::Hot, now_ms),
    };

    PrRecord {
        repo: observed.repo.clone(),
        number: observed.number,
        title: observed.title.clone(),
        url: observed.url.clone(),
        role: observed.role,
        state: observed.state.clone(),
        reason: observed.reason.clone(),
        heat,
        last_heat_activity_at_ms: last_activity,
        muted: previous.is_some_and(|p| p.muted),
        last_visited_ms: previous.and_then(|p| p.last_visited_ms),
        head_sha: observed.head_sha.clone(),
        comment_count: observed.comment_count,
    }
}

fn decay(last_activity_ms: u64, now_ms: u64) -> Heat {
    let age = now_ms.saturating_sub(last_activity_ms);
    if age >= WARM_TO_COLD_MS {
        Heat::Cold
    } else if age >= HOT_TO_WARM_MS {
        Heat::Warm
    } else {
        Heat::Hot
    }
}

/// Drop observations the user muted by repo or author.
pub fn filter_muted(
    observations: Vec<PrObservation>,
    muted_repos: &std::collections::BTreeSet<String>,
    muted_authors: &std::collections::BTreeSet<String>,
) -> Vec<PrObservation> {
    observations
        .into_iter()
        .filter(|o| !muted_repos.contains(&o.repo) && !muted_authors.contains(&o.author))
        .collect()
}

pub struct GithubPoller {
    store: Arc<Store>,
    warnings: Arc<Warnings>,
    broadcast: tokio::sync::broadcast::Sender<ServerEvent>,
    config: GithubConfig,
    client: reqwest::Client,
}

impl GithubPoller {
    /// Spawn the poll loop; returns the action channel the hub writes to.
    /// With no token or a zero interval the loop only serves actions.
    pub fn spawn(
        store: Arc<Store>,
        warnings: Arc<Warnings>,
        broadcast: tokio::sync::broadcast::Sender<ServerEvent>,
        config: GithubConfig,
        cancel: CancellationToken,
    ) -> mpsc::Sender<GithubAction> {
        let (action_tx, mut action_rx) = mpsc::channel(16);
        let poller = Self {
            store,
            warnings,
            broadcast,
            client: reqwest::Client::new(),
            config,
        };
        tokio::spawn(async move {
            let interval = if poller.config.interval.is_zero() {
                Duration::from_secs(3600)
            } else {
                poller.config.interval
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if poller.config.token.is_some() && !poller.config.interval.is_zero() {
                            poller.poll_once().await;
                        }
                    }
                    action = action_rx.recv() => match action {
                        Some(GithubAction::Refresh) => poller.poll_once().await,
                        Some(GithubAction::Approve { repo, number }) => {
                            poller.review(&repo, number, "APPROVE").await;
                        }
                        Some(GithubAction::Merge { repo, number }) => {
                            poller.merge(&repo, number).await;
                        }
                        None => return,
                    },
                }
            }
        });
        action_tx
    }

    async fn poll_once(&self) {
        match self.fetch_involved_prs().await {
            Ok(observations) => {
                let settings = self.store.settings();
                let observations =
                    filter_muted(observations, &settings.muted_repos, &settings.muted_authors);
                let now = epoch_ms();
                let previous: std::collections::HashMap<(String, u64), PrRecord> = self
                    .store
                    .list_prs()
                    .into_iter()
                    .map(|p| ((p.repo.clone(), p.number), p))
                    .collect();
                let merged: Vec<PrRecord> = observations
                    .iter()
                    .map(|o| {
                        merge_observation(o, previous.get(&(o.repo.clone(), o.number)), now)
                    })
                    .collect();
                if let Err(e) = self.store.set_prs(merged) {
                    self.warnings.push(format!("failed to store PR poll results: {e}"));
                }
            }
            Err(PollError::RateLimited { reset_at_ms }) => {
                let _ = self.broadcast.send(ServerEvent::RateLimited { reset_at_ms });
                let wait = reset_at_ms.saturating_sub(epoch_ms());
                debug!(wait_ms = wait, "github rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(wait.min(15 * 60 * 1000))).await;
            }
            Err(PollError::Transient(e)) => {
                // 5xx and network hiccups: retried next tick, not surfaced.
                debug!(error = %e, "github poll failed transiently");
            }
            Err(PollError::Fatal(e)) => {
                self.warnings.push(format!("github polling error: {e}"));
            }
        }
    }

    /// Search PRs the token's user is involved in, split into author /
    /// reviewer roles.
    async fn fetch_involved_prs(&self) -> Result<Vec<PrObservation>, PollError> {
        let login = self.get_login().await?;
        let mut out = Vec::new();
        for (query, role) in [
            (format!("is:open is:pr author:{login} archived:false"), PrRole::Author),
            (
                format!("is:open is:pr review-requested:{login} archived:false"),
                PrRole::Reviewer,
            ),
        ] {
            let url = format!("{}/search/issues", self.config.api_url);
            let response = self
                .request(self.client.get(url).query(&[("q", query.as_str()), ("per_page", "50")]))
                .await?;
            let body: SearchResponse =
                response.json().await.map_err(|e| PollError::Fatal(e.to_string()))?;
            for item in body.items {
                let Some((repo, number)) = parse_issue_url(&item.html_url) else {
                    continue;
                };
                out.push(PrObservation {
                    repo,
                    number,
                    title: item.title,
                    url: item.html_url,
                    role,
                    state: item.state.clone(),
                    reason: String::new(),
                    author: item.user.map(|u| u.login).unwrap_or_default(),
                    // The search API has no head sha; the comment counter
                    // alone drives re-heating for searched PRs.
                    head_sha: String::new(),
                    comment_count: item.comments,
                });
            }
        }
        Ok(out)
    }

    async fn get_login(&self) -> Result<String, PollError> {
        let url = format!("{}/user", self.config.api_url);
        let response = self.request(self.client.get(url)).await?;
        let user: UserResponse =
            response.json().await.map_err(|e| PollError::Fatal(e.to_string()))?;
        Ok(user.login)
    }

    async fn review(&self, repo: &str, number: u64, event: &str) {
        let url = format!("{}/repos/{repo}/pulls/{number}/reviews", self.config.api_url);
        let result = self
            .request(self.client.post(url).json(&serde_json::json!({ "event": event })))
            .await;
        if let Err(e) = result {
            self.warnings.push(format!("approve failed for {repo}#{number}: {e}"));
        }
    }

    async fn merge(&self, repo: &str, number: u64) {
        let url = format!("{}/repos/{repo}/pulls/{number}/merge", self.config.api_url);
        if let Err(e) = self.request(self.client.put(url)).await {
            self.warnings.push(format!("merge failed for {repo}#{number}: {e}"));
        }
    }

    /// Send with auth headers and classify failures.
    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, PollError> {
        let mut builder = builder
            .header("User-Agent", "attn")
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|e| PollError::Transient(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            let reset_at_ms = response
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or_else(|| epoch_ms() + 60_000);
            return Err(PollError::RateLimited { reset_at_ms });
        }
        if status.is_server_error() {
            return Err(PollError::Transient(format!("server error {status}")));
        }
        if !status.is_success() {
            return Err(PollError::Fatal(format!("unexpected status {status}")));
        }
        Ok(response)
    }
}

#[derive(Debug)]
enum PollError {
    RateLimited { reset_at_ms: u64 },
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { reset_at_ms } => write!(f, "rate limited until {reset_at_ms}"),
            Self::Transient(e) | Self::Fatal(e) => f.write_str(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    title: String,
    html_url: String,
    state: String,
    comments: u64,
    user: Option<SearchUser>,
}

#[derive(Debug, Deserialize)]
struct SearchUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

/// `https://github.com/owner/repo/pull/123` → `("owner/repo", 123)`.
fn parse_issue_url(url: &str) -> Option<(String, u64)> {
    let parts: Vec<&str> = url.trim_end_matches('/').rsplitn(4, '/').collect();
    // parts: [number, "pull", repo, rest-with-owner]
    if parts.len() < 4 || parts[1] != "pull" {
        return None;
    }
    let number = parts[0].parse().ok()?;
    let owner = parts[3].rsplit('/').next()?;
    Some((format!("{owner}/{}", parts[2]), number))
}

#[cfg(test)]
#[path = "github_tests.rs"]
mod tests;
