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

//! In-memory storage of the requests and transactions the engine knows about.

use std::collections::{btree_map::Entry, BTreeMap};

use as_variant::as_variant;
use ruma::{OwnedUserId, UserId};

use crate::{
    events::VerificationTransaction, qrcode::QrTransaction, requests::VerificationRequest,
    sas::SasTransaction,
};

/// An active verification method.
#[derive(Debug)]
pub(crate) enum Verification {
    Sas(Box<SasTransaction>),
    Qr(QrTransaction),
}

impl Verification {
    pub fn flow_id(&self) -> &str {
        match self {
            Verification::Sas(s) => s.flow_id().as_str(),
            Verification::Qr(q) => q.flow_id().as_str(),
        }
    }

    pub fn to_snapshot(&self) -> VerificationTransaction {
        match self {
            Verification::Sas(s) => VerificationTransaction::Sas(s.to_snapshot()),
            Verification::Qr(q) => VerificationTransaction::Qr(q.to_snapshot()),
        }
    }
}

impl From<SasTransaction> for Verification {
    fn from(sas: SasTransaction) -> Self {
        Self::Sas(Box::new(sas))
    }
}

impl From<QrTransaction> for Verification {
    fn from(qr: QrTransaction) -> Self {
        Self::Qr(qr)
    }
}

type TransactionMap = BTreeMap<OwnedUserId, BTreeMap<String, Verification>>;

#[derive(Debug, Default)]
pub(crate) struct VerificationRegistry {
    requests: BTreeMap<OwnedUserId, Vec<VerificationRequest>>,
    transactions: TransactionMap,
    /// Transactions that completed or got cancelled.
    past_transactions: TransactionMap,
}

impl VerificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&mut self, request: VerificationRequest) {
        self.requests.entry(request.other_user_id.clone()).or_default().push(request);
    }

    pub fn request(&self, user_id: &UserId, flow_id: &str) -> Option<&VerificationRequest> {
        self.requests.get(user_id)?.iter().find(|r| r.flow_id.as_str() == flow_id)
    }

    pub fn request_mut(
        &mut self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<&mut VerificationRequest> {
        self.requests.get_mut(user_id)?.iter_mut().find(|r| r.flow_id.as_str() == flow_id)
    }

    /// Find a request by its flow id, whoever the other user is.
    pub fn find_request(&self, flow_id: &str) -> Option<&VerificationRequest> {
        self.requests.values().flatten().find(|r| r.flow_id.as_str() == flow_id)
    }

    pub fn find_request_mut(&mut self, flow_id: &str) -> Option<&mut VerificationRequest> {
        self.requests.values_mut().flatten().find(|r| r.flow_id.as_str() == flow_id)
    }

    pub fn requests_for_user(&self, user_id: &UserId) -> &[VerificationRequest] {
        self.requests.get(user_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn remove_request(
        &mut self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<VerificationRequest> {
        let requests = self.requests.get_mut(user_id)?;
        let index = requests.iter().position(|r| r.flow_id.as_str() == flow_id)?;

        Some(requests.remove(index))
    }

    /// Store a new transaction.
    ///
    /// Only one transaction may exist per flow, the transaction is handed back
    /// if the slot is already taken.
    pub fn insert_transaction(
        &mut self,
        user_id: &UserId,
        verification: Verification,
    ) -> Result<(), Verification> {
        let transactions = self.transactions.entry(user_id.to_owned()).or_default();

        match transactions.entry(verification.flow_id().to_owned()) {
            Entry::Occupied(_) => Err(verification),
            Entry::Vacant(entry) => {
                entry.insert(verification);
                Ok(())
            }
        }
    }

    pub fn transaction(&self, user_id: &UserId, flow_id: &str) -> Option<&Verification> {
        self.transactions.get(user_id)?.get(flow_id)
    }

    pub fn transaction_mut(
        &mut self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<&mut Verification> {
        self.transactions.get_mut(user_id)?.get_mut(flow_id)
    }

    pub fn sas_mut(&mut self, user_id: &UserId, flow_id: &str) -> Option<&mut SasTransaction> {
        as_variant!(self.transaction_mut(user_id, flow_id)?, Verification::Sas).map(|s| &mut **s)
    }

    pub fn qr_mut(&mut self, user_id: &UserId, flow_id: &str) -> Option<&mut QrTransaction> {
        as_variant!(self.transaction_mut(user_id, flow_id)?, Verification::Qr)
    }

    pub fn has_transaction(&self, user_id: &UserId, flow_id: &str) -> bool {
        self.transaction(user_id, flow_id).is_some()
    }

    pub fn remove_transaction(&mut self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.transactions.get_mut(user_id)?.remove(flow_id)
    }

    /// Move a completed transaction out of the active set.
    pub fn finish_transaction(&mut self, user_id: &UserId, flow_id: &str) {
        if let Some(verification) = self.remove_transaction(user_id, flow_id) {
            self.archive_transaction(user_id, verification);
        }
    }

    /// Keep a transaction that left the active set.
    pub fn archive_transaction(&mut self, user_id: &UserId, verification: Verification) {
        self.past_transactions
            .entry(user_id.to_owned())
            .or_default()
            .insert(verification.flow_id().to_owned(), verification);
    }

    pub fn past_transaction_mut(
        &mut self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<&mut Verification> {
        self.past_transactions.get_mut(user_id)?.get_mut(flow_id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, OwnedTransactionId};

    use super::*;
    use crate::{
        event_enums::RequestInfo,
        qrcode::PendingTrust,
        FlowId,
    };

    fn flow_id(id: &str) -> FlowId {
        FlowId::ToDevice(OwnedTransactionId::from(id))
    }

    fn qr(id: &str) -> Verification {
        QrTransaction::scanned(
            flow_id(id),
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOBDEVICE").to_owned(),
            PendingTrust::default(),
        )
        .into()
    }

    #[test]
    fn one_transaction_per_flow() {
        let bob = user_id!("@bob:example.org");
        let mut registry = VerificationRegistry::new();

        registry.insert_transaction(bob, qr("flow")).unwrap();
        assert_matches!(registry.insert_transaction(bob, qr("flow")), Err(Verification::Qr(_)));
        registry.insert_transaction(bob, qr("other")).unwrap();

        assert!(registry.has_transaction(bob, "flow"));
        assert!(registry.transaction(user_id!("@carol:example.org"), "flow").is_none());
    }

    #[test]
    fn finished_transactions_move_to_the_past() {
        let bob = user_id!("@bob:example.org");
        let mut registry = VerificationRegistry::new();

        registry.insert_transaction(bob, qr("flow")).unwrap();
        registry.finish_transaction(bob, "flow");

        assert!(!registry.has_transaction(bob, "flow"));
        assert!(registry.past_transaction_mut(bob, "flow").is_some());

        // The slot is free again, but the old transaction is retained.
        registry.insert_transaction(bob, qr("flow")).unwrap();
    }

    #[test]
    fn cancelled_transactions_are_archived() {
        let bob = user_id!("@bob:example.org");
        let mut registry = VerificationRegistry::new();

        registry.insert_transaction(bob, qr("flow")).unwrap();
        let verification = registry.remove_transaction(bob, "flow").unwrap();
        registry.archive_transaction(bob, verification);

        assert!(!registry.has_transaction(bob, "flow"));
        assert_matches!(registry.past_transaction_mut(bob, "flow"), Some(Verification::Qr(_)));
    }

    #[test]
    fn requests_are_indexed_by_user() {
        let bob = user_id!("@bob:example.org");
        let mut registry = VerificationRegistry::new();

        let info = RequestInfo {
            from_device: device_id!("BOBDEVICE").to_owned(),
            methods: vec![crate::VerificationMethod::SasV1],
            timestamp: None,
        };
        registry.add_request(VerificationRequest::incoming(flow_id("flow"), bob.to_owned(), info));

        assert!(registry.request(bob, "flow").is_some());
        assert!(registry.find_request("flow").is_some());
        assert!(registry.request(user_id!("@carol:example.org"), "flow").is_none());
        assert_eq!(registry.requests_for_user(bob).len(), 1);

        assert!(registry.remove_request(bob, "flow").is_some());
        assert!(registry.requests_for_user(bob).is_empty());
    }
}
