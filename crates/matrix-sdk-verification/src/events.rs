// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use crate::{qrcode::QrVerification, requests::PendingVerificationRequest, sas::SasVerification};

/// A snapshot of a verification transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum VerificationTransaction {
    /// A SAS verification.
    Sas(SasVerification),
    /// A QR code verification.
    Qr(QrVerification),
}

impl VerificationTransaction {
    /// The flow id of the transaction.
    pub fn flow_id(&self) -> &str {
        match self {
            VerificationTransaction::Sas(s) => &s.flow_id,
            VerificationTransaction::Qr(q) => &q.flow_id,
        }
    }
}

/// A change notification published by the
/// [`VerificationEngine`](crate::VerificationEngine).
#[derive(Clone, Debug, PartialEq)]
pub enum VerificationEvent {
    /// A new verification request was created, either by us or by the other
    /// side.
    RequestAdded(PendingVerificationRequest),
    /// A verification request changed.
    RequestUpdated(PendingVerificationRequest),
    /// A verification method was started.
    TransactionAdded(VerificationTransaction),
    /// A verification method advanced.
    TransactionUpdated(VerificationTransaction),
}

/// Fans events out to every subscriber.
///
/// Every subscriber gets its own bounded channel. Publishing waits until every
/// live subscriber has room for the event.
#[derive(Debug)]
pub(crate) struct EventBroadcaster {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<VerificationEvent>>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), subscribers: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> ReceiverStream<VerificationEvent> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(sender);

        ReceiverStream::new(receiver)
    }

    pub async fn publish(&self, event: VerificationEvent) {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let mut closed = false;

        for subscriber in &subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            trace!("Removing closed verification event subscribers");
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| !s.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::qrcode::QrState;

    fn event() -> VerificationEvent {
        VerificationEvent::TransactionUpdated(VerificationTransaction::Qr(QrVerification {
            flow_id: "flow".to_owned(),
            other_user_id: user_id!("@bob:example.org").to_owned(),
            other_device_id: device_id!("BOBDEVICE").to_owned(),
            we_scanned: true,
            is_to_device: true,
            state: QrState::Reciprocated,
        }))
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let broadcaster = EventBroadcaster::new(2);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.publish(event()).await;

        assert_eq!(first.next().await, Some(event()));
        assert_eq!(second.next().await, Some(event()));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let broadcaster = EventBroadcaster::new(1);
        let closed = broadcaster.subscribe();
        let mut open = broadcaster.subscribe();
        drop(closed);

        broadcaster.publish(event()).await;
        assert_eq!(open.next().await, Some(event()));

        let subscribers = broadcaster.subscribers.lock().unwrap().len();
        assert_eq!(subscribers, 1);
    }
}
