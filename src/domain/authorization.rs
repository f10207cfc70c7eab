use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashSet;

use crate::config::AuthorizationConfig;
use crate::ocpp::canonical::{AuthorizationStatus, IdTagInfo};

/// Decides whether an id tag may charge.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo>;
}

/// Accepts every tag except a configured block list.
pub struct StaticAuthorizationService {
    blocked: HashSet<String>,
    expiry: Duration,
}

impl StaticAuthorizationService {
    pub fn new(blocked: impl IntoIterator<Item = String>, expiry_hours: i64) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
            expiry: Duration::hours(expiry_hours),
        }
    }

    pub fn from_config(config: &AuthorizationConfig) -> Self {
        Self::new(config.blocked_id_tags.iter().cloned(), config.expiry_hours)
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorizationService {
    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo> {
        if self.blocked.contains(id_tag) {
            return Ok(IdTagInfo::with_status(AuthorizationStatus::Blocked));
        }
        Ok(IdTagInfo {
            status: AuthorizationStatus::Accepted,
            expiry_date: Some(Utc::now() + self.expiry),
            parent_id_tag: None,
        })
    }
}
