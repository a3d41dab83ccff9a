#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Directory clients that list the members of a group.
//!
//! [`AdminDirectory`] talks to the Admin SDK Directory API using delegated
//! service-account credentials. [`FakeDirectory`] answers every lookup with a
//! single synthetic user so the controller can run without credentials.

mod admin;
mod auth;
mod fake;

pub use self::{
    admin::AdminDirectory,
    auth::{ServiceAccountKey, TokenSource, MEMBER_READONLY_SCOPE},
    fake::FakeDirectory,
};
use reqwest::StatusCode;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read service account key {path}")]
    ReadKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid service account key: {0}")]
    InvalidKey(String),

    #[error("failed to sign token assertion")]
    Sign(#[from] openssl::error::ErrorStack),

    #[error("token exchange rejected with {status}: {body}")]
    Unauthorized { status: StatusCode, body: String },

    #[error("token endpoint returned {status}: {body}")]
    TokenStatus { status: StatusCode, body: String },

    #[error("directory returned {status} for group {group}: {body}")]
    Status {
        group: String,
        status: StatusCode,
        body: String,
    },

    #[error("directory repeated page token {token:?} for group {group}")]
    RepeatedPage { group: String, token: String },

    #[error("invalid directory URL {0}")]
    Url(String),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl Error {
    /// Indicates a credential or authorization failure rather than a
    /// transport or data problem.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::ReadKey { .. } | Self::InvalidKey(_) | Self::Sign(_) => true,
            Self::Unauthorized { .. } => true,
            Self::Status { status, .. } => {
                *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
            }
            Self::TokenStatus { .. } | Self::RepeatedPage { .. } => false,
            Self::Url(_) | Self::Request(_) => false,
        }
    }
}
