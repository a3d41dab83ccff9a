use crate::{Error, ServiceAccountKey, TokenSource};
use rbac_sync_controller_core::{DirectoryClient, GroupRef, Member, MemberKind};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::time::Duration;
use tracing::{debug, instrument};

const DIRECTORY_API: &str = "https://admin.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESULTS: &str = "200";

/// Lists group members through the Admin SDK Directory API.
#[derive(Debug)]
pub struct AdminDirectory {
    base: Url,
    http: reqwest::Client,
    tokens: TokenSource,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersPage {
    #[serde(default)]
    members: Vec<DirectoryMember>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryMember {
    email: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

// === impl AdminDirectory ===

impl AdminDirectory {
    /// Acts as `subject` using the service account `key`.
    pub fn new(key: ServiceAccountKey, subject: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let tokens = TokenSource::new(key, subject, http.clone());
        Self::with_base_url(DIRECTORY_API, http, tokens)
    }

    pub fn with_base_url(
        base: &str,
        http: reqwest::Client,
        tokens: TokenSource,
    ) -> Result<Self, Error> {
        let base = Url::parse(base).map_err(|_| Error::Url(base.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(Error::Url(base.to_string()));
        }
        Ok(Self { base, http, tokens })
    }

    /// Lists every immediate member of `group`, following pagination.
    ///
    /// A page token the directory already handed out fails the listing.
    #[instrument(skip_all, fields(%group))]
    pub async fn list(&self, group: &GroupRef) -> Result<Vec<Member>, Error> {
        let url = self.members_url(group)?;
        let mut members = Vec::new();
        let mut page_token = None::<String>;
        let mut seen = HashSet::new();
        loop {
            let MembersPage {
                members: page,
                next_page_token,
            } = self.page(group, url.clone(), page_token.as_deref()).await?;
            members.extend(page.into_iter().filter_map(DirectoryMember::into_member));

            match next_page_token {
                Some(token) if !token.is_empty() => {
                    if !seen.insert(token.clone()) {
                        return Err(Error::RepeatedPage {
                            group: group.to_string(),
                            token,
                        });
                    }
                    page_token = Some(token);
                }
                _ => break,
            }
        }
        Ok(members)
    }

    async fn page(
        &self,
        group: &GroupRef,
        url: Url,
        page_token: Option<&str>,
    ) -> Result<MembersPage, Error> {
        let token = self.tokens.token().await?;
        let mut req = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[("maxResults", MAX_RESULTS)]);
        if let Some(page_token) = page_token {
            req = req.query(&[("pageToken", page_token)]);
        }

        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(Error::Status {
                group: group.to_string(),
                status,
                body,
            });
        }
        Ok(rsp.json().await?)
    }

    fn members_url(&self, group: &GroupRef) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(["admin", "directory", "v1", "groups", group.as_str(), "members"]);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl DirectoryClient for AdminDirectory {
    async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>> {
        Ok(self.list(group).await?)
    }
}

// === impl DirectoryMember ===

impl DirectoryMember {
    fn into_member(self) -> Option<Member> {
        let kind = match self.kind.as_deref() {
            Some("USER") => MemberKind::User,
            Some("GROUP") => MemberKind::Group,
            kind => {
                debug!(email = ?self.email, ?kind, "Skipping non-user member");
                return None;
            }
        };
        match self.email {
            Some(email) if !email.is_empty() => Some(Member::new(email, kind)),
            _ => {
                debug!(%kind, "Skipping member without an email");
                None
            }
        }
    }
}
