// SPDX-License-Identifier: Apache-2.0

//! Credential collaborator
//!
//! The federation engine never stores secrets. It asks a
//! [`CredentialProvider`] for the user and password of a backend each time it
//! opens a connection.

pub mod backend;

pub use backend::{CredentialProvider, KeyringProvider, MemoryCredentialProvider};

use crate::observability::Sensitive;

/// Login of one backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Sensitive<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Sensitive::new(password.into()),
        }
    }
}
