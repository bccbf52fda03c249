// Read receipts: one entry per (message, reader), newest wins, oldest
// dropped once the log is full.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use workshop_sync_common::protocol::push::ReadNotice;
use workshop_sync_common::types::{MessageId, UserId};

pub const DEFAULT_RECEIPT_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub reader_name: String,
    pub read_at: DateTime<Utc>,
}

impl ReadReceipt {
    pub fn from_notice(notice: &ReadNotice, read_at: DateTime<Utc>) -> Self {
        Self {
            message_id: notice.message_id,
            reader_id: notice.sender_id,
            reader_name: notice.sender.clone(),
            read_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadReceiptLog {
    limit: usize,
    // Oldest first.
    entries: VecDeque<ReadReceipt>,
}

impl Default for ReadReceiptLog {
    fn default() -> Self {
        Self::new(DEFAULT_RECEIPT_LIMIT)
    }
}

impl ReadReceiptLog {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), entries: VecDeque::new() }
    }

    pub fn record(&mut self, receipt: ReadReceipt) {
        self.entries.retain(|existing| {
            !(existing.message_id == receipt.message_id && existing.reader_id == receipt.reader_id)
        });
        self.entries.push_back(receipt);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn readers_of(&self, message_id: MessageId) -> Vec<&ReadReceipt> {
        self.entries.iter().filter(|r| r.message_id == message_id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadReceipt> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
