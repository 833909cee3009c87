//! In-memory fakes for the entity store traits, used by component tests that want to drive
//! the listener engine, dispatcher, or rule engine without a real `SQLite` file.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain_types::{ChatName, DeliveryStatus, ErrorKind, InstanceId, MessageId};
use crate::storage::{
    AttemptOutcome, ConfigStore, DeliveryLedgerStore, Instance, InstanceStore, IngestOutcome,
    ListenerRow, ListenerStore, MessageRow, MessageStore, PlatformRow, PlatformStore, RawMessage,
    RuleRow, RuleStore, StoreResult,
};
use crate::util::{content_hash, dedup_bucket};

/// In-memory [`InstanceStore`] backed by a `Mutex<HashMap>`.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    rows: Mutex<HashMap<InstanceId, Instance>>,
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn upsert(&self, instance: &Instance) -> StoreResult<()> {
        self.rows
            .lock()
            .unwrap()
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Instance>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn list_enabled(&self) -> StoreResult<Vec<Instance>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.enabled)
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: &InstanceId,
        status: crate::domain_types::InstanceStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.status = status;
            row.last_error = last_error.map(str::to_string);
        }
        Ok(())
    }

    async fn touch_last_active(&self, id: &InstanceId, ts: i64) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.last_active_ts = Some(ts);
        }
        Ok(())
    }

    async fn set_enabled(&self, id: &InstanceId, enabled: bool) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.enabled = enabled;
        }
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> StoreResult<()> {
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }
}

/// In-memory [`ListenerStore`] backed by a `Mutex<HashMap>`.
#[derive(Default)]
pub struct InMemoryListenerStore {
    rows: Mutex<HashMap<(InstanceId, ChatName), ListenerRow>>,
}

#[async_trait]
impl ListenerStore for InMemoryListenerStore {
    async fn upsert(&self, listener: &ListenerRow) -> StoreResult<()> {
        self.rows.lock().unwrap().insert(
            (listener.instance_id.clone(), listener.chat_name.clone()),
            listener.clone(),
        );
        Ok(())
    }

    async fn list_for_instance(&self, instance_id: &InstanceId) -> StoreResult<Vec<ListenerRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| &l.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> StoreResult<Vec<ListenerRow>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn touch_last_message(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
        ts: i64,
    ) -> StoreResult<()> {
        if let Some(row) = self
            .rows
            .lock()
            .unwrap()
            .get_mut(&(instance_id.clone(), chat_name.clone()))
        {
            row.last_message_ts = ts;
        }
        Ok(())
    }

    async fn mark_for_removal(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
    ) -> StoreResult<()> {
        if let Some(row) = self
            .rows
            .lock()
            .unwrap()
            .get_mut(&(instance_id.clone(), chat_name.clone()))
        {
            row.marked_for_removal = true;
        }
        Ok(())
    }

    async fn delete(&self, instance_id: &InstanceId, chat_name: &ChatName) -> StoreResult<()> {
        self.rows
            .lock()
            .unwrap()
            .remove(&(instance_id.clone(), chat_name.clone()));
        Ok(())
    }

    async fn count_for_instance(&self, instance_id: &InstanceId) -> StoreResult<u32> {
        Ok(u32::try_from(
            self.rows
                .lock()
                .unwrap()
                .values()
                .filter(|l| &l.instance_id == instance_id && !l.marked_for_removal)
                .count(),
        )
        .unwrap_or(u32::MAX))
    }
}

/// In-memory [`MessageStore`] backed by a `Mutex<HashMap>`, replicating the dedup and lease
/// semantics of the `SQLite` implementation closely enough for component tests.
#[derive(Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<HashMap<MessageId, MessageRow>>,
    dedup: Mutex<HashMap<(InstanceId, ChatName, String, String, i64), MessageId>>,
    delivering_since: Mutex<HashMap<MessageId, i64>>,
}

const DEDUP_BUCKET_SECS: i64 = 60;

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn ingest(&self, msg: &RawMessage) -> StoreResult<IngestOutcome> {
        let hash = content_hash(&msg.sender, &msg.content);
        let bucket = dedup_bucket(msg.received_ts, DEDUP_BUCKET_SECS);
        let key = (
            msg.instance_id.clone(),
            msg.chat_name.clone(),
            msg.sender.clone(),
            hash,
            bucket,
        );
        let mut dedup = self.dedup.lock().unwrap();
        if dedup.contains_key(&key) {
            return Ok(IngestOutcome::Duplicate);
        }
        let message_id = MessageId::generate();
        let status = if msg.is_outbound || matches!(msg.mtype, crate::domain_types::MessageType::System) {
            DeliveryStatus::Skipped
        } else {
            DeliveryStatus::Pending
        };
        let row = MessageRow {
            message_id,
            instance_id: msg.instance_id.clone(),
            chat_name: msg.chat_name.clone(),
            sender: msg.sender.clone(),
            sender_remark: msg.sender_remark.clone(),
            content: msg.content.clone(),
            mtype: msg.mtype,
            local_file_path: msg.local_file_path.clone(),
            received_ts: msg.received_ts,
            delivery_status: status,
            delivery_attempts: 0,
            reply_content: None,
            reply_status: None,
        };
        dedup.insert(key, message_id);
        self.rows.lock().unwrap().insert(message_id, row);
        Ok(IngestOutcome::Inserted(message_id))
    }

    async fn list_pending(
        &self,
        limit: u32,
        now: i64,
        lease_secs: i64,
    ) -> StoreResult<Vec<MessageRow>> {
        let mut rows = self.rows.lock().unwrap();
        let mut delivering_since = self.delivering_since.lock().unwrap();
        let expired: Vec<MessageId> = delivering_since
            .iter()
            .filter(|(_, since)| now - **since > lease_secs)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(row) = rows.get_mut(&id) {
                row.delivery_status = DeliveryStatus::Pending;
            }
            delivering_since.remove(&id);
        }

        let mut pending: Vec<MessageRow> = rows
            .values()
            .filter(|r| r.delivery_status == DeliveryStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.received_ts);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn count_pending(&self) -> StoreResult<u32> {
        Ok(u32::try_from(
            self.rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.delivery_status == DeliveryStatus::Pending)
                .count(),
        )
        .unwrap_or(u32::MAX))
    }

    async fn mark_delivering(&self, id: MessageId, now: i64) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.delivery_status = DeliveryStatus::Delivering;
            row.delivery_attempts += 1;
        }
        self.delivering_since.lock().unwrap().insert(id, now);
        Ok(())
    }

    async fn mark_delivered(&self, id: MessageId, reply: Option<&str>) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.delivery_status = DeliveryStatus::Delivered;
            row.reply_content = reply.map(str::to_string);
            row.reply_status = Some("ok".to_string());
        }
        self.delivering_since.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, retryable: bool) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.delivery_status = if retryable {
                DeliveryStatus::Pending
            } else {
                DeliveryStatus::Failed
            };
            row.reply_status = Some("error".to_string());
        }
        self.delivering_since.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn skip(&self, id: MessageId, reason: &str) -> StoreResult<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.delivery_status = DeliveryStatus::Skipped;
            row.reply_status = Some(reason.to_string());
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> StoreResult<Option<MessageRow>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn query(
        &self,
        instance_id: Option<&InstanceId>,
        chat_name: Option<&ChatName>,
        since_ts: Option<i64>,
        limit: u32,
    ) -> StoreResult<Vec<MessageRow>> {
        let mut rows: Vec<MessageRow> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| instance_id.is_none_or(|id| &r.instance_id == id))
            .filter(|r| chat_name.is_none_or(|c| &r.chat_name == c))
            .filter(|r| since_ts.is_none_or(|ts| r.received_ts >= ts))
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.received_ts));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

/// In-memory [`PlatformStore`] backed by a `Mutex<HashMap>`.
#[derive(Default)]
pub struct InMemoryPlatformStore {
    rows: Mutex<HashMap<crate::domain_types::PlatformId, PlatformRow>>,
}

#[async_trait]
impl PlatformStore for InMemoryPlatformStore {
    async fn upsert(&self, platform: &PlatformRow) -> StoreResult<()> {
        self.rows
            .lock()
            .unwrap()
            .insert(platform.platform_id, platform.clone());
        Ok(())
    }

    async fn get(&self, id: &crate::domain_types::PlatformId) -> StoreResult<Option<PlatformRow>> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<PlatformRow>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn delete(&self, id: &crate::domain_types::PlatformId) -> StoreResult<()> {
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }
}

/// In-memory [`RuleStore`] backed by a `Mutex<HashMap>`.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rows: Mutex<HashMap<crate::domain_types::RuleId, RuleRow>>,
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn upsert(&self, rule: &RuleRow) -> StoreResult<()> {
        self.rows.lock().unwrap().insert(rule.rule_id, rule.clone());
        Ok(())
    }

    async fn get(&self, id: &crate::domain_types::RuleId) -> StoreResult<Option<RuleRow>> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn list_enabled(&self) -> StoreResult<Vec<RuleRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> StoreResult<Vec<RuleRow>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn delete(&self, id: &crate::domain_types::RuleId) -> StoreResult<()> {
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }
}

/// In-memory [`DeliveryLedgerStore`] backed by a `Mutex<Vec>`.
#[derive(Default)]
pub struct InMemoryDeliveryLedgerStore {
    attempts: Mutex<HashMap<crate::domain_types::AttemptId, MessageId>>,
    counts: Mutex<HashMap<MessageId, u32>>,
}

#[async_trait]
impl DeliveryLedgerStore for InMemoryDeliveryLedgerStore {
    async fn record_start(
        &self,
        message_id: MessageId,
        _attempt_no: u32,
        _started_ts: i64,
    ) -> StoreResult<crate::domain_types::AttemptId> {
        let attempt_id = crate::domain_types::AttemptId::generate();
        self.attempts.lock().unwrap().insert(attempt_id, message_id);
        *self.counts.lock().unwrap().entry(message_id).or_insert(0) += 1;
        Ok(attempt_id)
    }

    async fn record_outcome(
        &self,
        _attempt_id: crate::domain_types::AttemptId,
        _finished_ts: i64,
        _outcome: AttemptOutcome,
        _error_kind: Option<ErrorKind>,
        _error_detail: Option<&str>,
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn attempt_count(&self, message_id: MessageId) -> StoreResult<u32> {
        Ok(*self.counts.lock().unwrap().get(&message_id).unwrap_or(&0))
    }
}

/// In-memory [`ConfigStore`] backed by a `Mutex<HashMap>`; values are stored as-is
/// regardless of `encrypted` since tests never assert on ciphertext shape.
#[derive(Default)]
pub struct InMemoryConfigStore {
    rows: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn set(&self, key: &str, value: &str, _encrypted: bool) -> StoreResult<()> {
        self.rows
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<(String, String)>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }
}
