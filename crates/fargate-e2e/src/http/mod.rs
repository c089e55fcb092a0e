// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP scenarios for services behind a load balancer.
//!
//! - [`health`]: readiness and unauthenticated health checks
//! - [`jwt`]: client-credentials token exchange and bearer-protected calls
//! - [`login`]: redirect/CSRF/cookie login handshake as a state machine
//! - [`mesh`]: frontend-to-backend distribution check over a service registry

pub mod health;
pub mod jwt;
pub mod login;
pub mod mesh;

use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, redirect};
use url::Url;

use crate::config::HttpSettings;
use crate::error::Result;

/// Two clients sharing one cookie jar: one follows redirects, one does not.
#[derive(Clone)]
pub struct HttpSession {
    jar: Arc<Jar>,
    following: Client,
    manual: Client,
    settings: HttpSettings,
}

impl HttpSession {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let following = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .redirect(redirect::Policy::limited(settings.max_redirects))
            .build()?;
        let manual = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            jar,
            following,
            manual,
            settings: settings.clone(),
        })
    }

    /// Client that follows redirects.
    pub fn client(&self) -> &Client {
        &self.following
    }

    /// Client that returns redirects as responses.
    pub fn manual(&self) -> &Client {
        &self.manual
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// `(name, value)` pairs the jar would send to `url`.
    pub fn cookies(&self, url: &Url) -> Vec<(String, String)> {
        let Some(header) = self.jar.cookies(url) else {
            return Vec::new();
        };
        let Ok(header) = header.to_str() else {
            return Vec::new();
        };
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }
}

/// `base` with `path` appended, keeping any path prefix `base` already has.
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

/// First `max` characters of `s`, for logging long URLs and bodies.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
