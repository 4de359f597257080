// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound notification contract.
//!
//! SMTP delivery lives outside this crate; the reaper only consumes this
//! trait. [`LogMailer`] is what the binary wires in when no delivery
//! backend is configured, and [`MockMailer`] records sends for tests.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

use warden_core::model::User;

use crate::error::Result;

/// Sends subscription lifecycle notifications.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Notify a user that their subscription has expired and their agents
    /// were stopped.
    async fn send_subscription_expired(&self, user: &User) -> Result<()>;

    /// Remind a user that their subscription expires in `days_left` days.
    async fn send_expiry_reminder(&self, user: &User, days_left: i64) -> Result<()>;
}

/// Mailer that only logs. Used when no delivery backend is configured.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_subscription_expired(&self, user: &User) -> Result<()> {
        info!(user_id = %user.id, email = %user.email, "Subscription expired notification");
        Ok(())
    }

    async fn send_expiry_reminder(&self, user: &User, days_left: i64) -> Result<()> {
        info!(
            user_id = %user.id,
            email = %user.email,
            days_left = days_left,
            "Subscription expiry reminder"
        );
        Ok(())
    }
}

/// One recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMail {
    /// Expired notification to an email address.
    Expired(String),
    /// Reminder to an email address with the days left.
    Reminder(String, i64),
}

/// Mailer that records sends for assertions.
#[derive(Debug, Default)]
pub struct MockMailer {
    sent: Mutex<Vec<SentMail>>,
    /// When set, every send fails with this message.
    pub fail_with: Mutex<Option<String>>,
}

impl MockMailer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_subscription_expired(&self, user: &User) -> Result<()> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(crate::error::Error::Other(message));
        }
        self.sent
            .lock()
            .unwrap()
            .push(SentMail::Expired(user.email.clone()));
        Ok(())
    }

    async fn send_expiry_reminder(&self, user: &User, days_left: i64) -> Result<()> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(crate::error::Error::Other(message));
        }
        self.sent
            .lock()
            .unwrap()
            .push(SentMail::Reminder(user.email.clone(), days_left));
        Ok(())
    }
}
