// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Topic announcements for seeded files.
//!
//! Subscribing to a topic costs a fee paid through a [`Payments`] backend;
//! once subscribed, files are published through a [`Discovery`] hook. Failure
//! anywhere here never changes a file's local state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;
use tracing::{event, Level};

use crate::catalog::listing::RemoteFile;
use crate::catalog::FileRecord;
use crate::errors::PaymentError;
use crate::networking::transport::BoxFuture;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, EnumIter)]
pub enum FeeTier {
    Free,
    Low,
    #[default]
    Average,
    High,
}

pub trait Payments: Send + Sync + 'static {
    fn calculate_fee(&self, tier: FeeTier) -> BoxFuture<'_, Result<u64, PaymentError>>;
    fn validate_balance(&self, amount: u64, fee: u64) -> BoxFuture<'_, Result<bool, PaymentError>>;
    /// Returns the transaction hash.
    fn subscribe<'a>(&'a self, topic: &'a str, fee: u64)
        -> BoxFuture<'a, Result<String, PaymentError>>;
    fn unsubscribe<'a>(
        &'a self,
        topic: &'a str,
        fee: u64,
    ) -> BoxFuture<'a, Result<String, PaymentError>>;
}

pub trait Discovery: Send + Sync + 'static {
    fn publish(&self, topic: &str, file: RemoteFile);
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Pending,
    Subscribed,
}

pub struct TopicAnnouncer {
    payments: Arc<dyn Payments>,
    discovery: Arc<dyn Discovery>,
    fee_tier: FeeTier,
    advertise_addr: String,
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    subscribe_lock: tokio::sync::Mutex<()>,
}

impl TopicAnnouncer {
    pub fn new(
        payments: Arc<dyn Payments>,
        discovery: Arc<dyn Discovery>,
        fee_tier: FeeTier,
        advertise_addr: String,
    ) -> Self {
        Self {
            payments,
            discovery,
            fee_tier,
            advertise_addr,
            subscriptions: Mutex::new(HashMap::new()),
            subscribe_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscription_state(&self, topic: &str) -> SubscriptionState {
        let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.get(topic).copied().unwrap_or_default()
    }

    fn set_state(&self, topic: &str, state: SubscriptionState) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.insert(topic.to_string(), state);
    }

    /// Publishes a seeded file on its topic, subscribing first if needed.
    pub async fn announce(&self, record: &FileRecord) -> Result<(), PaymentError> {
        self.ensure_subscribed(&record.topic).await?;

        self.discovery.publish(
            &record.topic,
            RemoteFile {
                file_hash: record.file_hash.clone(),
                file_name: record.file_name.clone(),
                file_size: record.file_size,
                topic: record.topic.clone(),
                seeders: [self.advertise_addr.clone()].into(),
            },
        );
        event!(Level::INFO, file_hash = %record.file_hash, topic = %record.topic, "File announced");
        Ok(())
    }

    async fn ensure_subscribed(&self, topic: &str) -> Result<(), PaymentError> {
        let _serial = self.subscribe_lock.lock().await;
        if self.subscription_state(topic) == SubscriptionState::Subscribed {
            return Ok(());
        }

        let fee = self.payments.calculate_fee(self.fee_tier).await?;
        if !self.payments.validate_balance(0, fee).await? {
            return Err(PaymentError::InsufficientBalance { fee });
        }

        self.set_state(topic, SubscriptionState::Pending);
        match self.payments.subscribe(topic, fee).await {
            Ok(tx_hash) => {
                self.set_state(topic, SubscriptionState::Subscribed);
                event!(Level::INFO, topic, %tx_hash, "Subscribed to topic");
                Ok(())
            }
            Err(e) => {
                self.set_state(topic, SubscriptionState::Unsubscribed);
                Err(e)
            }
        }
    }

    pub async fn leave_topic(&self, topic: &str) -> Result<(), PaymentError> {
        let _serial = self.subscribe_lock.lock().await;
        if self.subscription_state(topic) != SubscriptionState::Subscribed {
            return Ok(());
        }

        let fee = self.payments.calculate_fee(self.fee_tier).await?;
        let tx_hash = self.payments.unsubscribe(topic, fee).await?;
        self.set_state(topic, SubscriptionState::Unsubscribed);
        event!(Level::INFO, topic, %tx_hash, "Unsubscribed from topic");
        Ok(())
    }
}

/// Payments backend for a standalone node: every operation is free and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPayments;

impl LocalPayments {
    fn synthetic_tx_hash() -> String {
        hex::encode(rand::random::<[u8; 32]>())
    }
}

impl Payments for LocalPayments {
    fn calculate_fee(&self, _tier: FeeTier) -> BoxFuture<'_, Result<u64, PaymentError>> {
        Box::pin(async { Ok(0) })
    }

    fn validate_balance(&self, _amount: u64, _fee: u64) -> BoxFuture<'_, Result<bool, PaymentError>> {
        Box::pin(async { Ok(true) })
    }

    fn subscribe<'a>(
        &'a self,
        _topic: &'a str,
        _fee: u64,
    ) -> BoxFuture<'a, Result<String, PaymentError>> {
        Box::pin(async { Ok(Self::synthetic_tx_hash()) })
    }

    fn unsubscribe<'a>(
        &'a self,
        _topic: &'a str,
        _fee: u64,
    ) -> BoxFuture<'a, Result<String, PaymentError>> {
        Box::pin(async { Ok(Self::synthetic_tx_hash()) })
    }
}

/// In-memory record of what has been announced, per topic.
#[derive(Debug, Default)]
pub struct SeedList {
    topics: Mutex<HashMap<String, BTreeMap<String, RemoteFile>>>,
}

impl SeedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self, topic: &str) -> Vec<RemoteFile> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Discovery for SeedList {
    fn publish(&self, topic: &str, file: RemoteFile) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(file.file_hash.clone(), file);
    }
}
