// ABOUTME: Reassembled inbound message handed to the broadcast dispatcher
// ABOUTME: Orders segments by index, drops duplicate copies and keeps every row id for cleanup

use crate::error::RecordError;
use crate::row::RowId;
use crate::segment::{ReassemblyGroupKey, SegmentRecord, Transport};
use bytes::Bytes;
use std::collections::BTreeMap;

/// A complete logical message ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: ReassemblyGroupKey,
    pub transport: Transport,
    pub destination_port: Option<u16>,
    /// PDUs in segment order, one per index
    pub pdus: Vec<Bytes>,
    /// Concatenated text when every segment carried a decoded body
    pub body: Option<String>,
    /// Receipt time of the earliest segment
    pub timestamp: i64,
    /// Every stored row backing this message, duplicates included
    pub row_ids: Vec<RowId>,
}

impl InboundMessage {
    /// Wrap a single-part record
    pub fn single(id: RowId, record: SegmentRecord) -> Self {
        Self {
            key: record.group_key(),
            transport: record.transport,
            destination_port: record.destination_port,
            body: record.message_body,
            timestamp: record.timestamp,
            pdus: vec![record.pdu],
            row_ids: vec![id],
        }
    }

    /// Build the message for `key` from its stored segments
    ///
    /// Segments whose index is out of range or belongs to another group
    /// are ignored. When several rows share an index the first one wins,
    /// but all their ids are kept so the duplicates are cleaned up with
    /// the message.
    pub fn assemble(
        key: &ReassemblyGroupKey,
        segments: Vec<(RowId, SegmentRecord)>,
    ) -> Result<Self, RecordError> {
        let mut ordered: BTreeMap<u32, SegmentRecord> = BTreeMap::new();
        let mut row_ids = Vec::with_capacity(segments.len());

        for (id, record) in segments {
            if record.group_key() != *key {
                continue;
            }
            let Ok(index) = record.index() else {
                continue;
            };
            row_ids.push(id);
            ordered.entry(index).or_insert(record);
        }

        if ordered.len() as u64 != u64::from(key.segment_count) {
            return Err(RecordError::IncompleteGroup {
                received: ordered.len(),
                expected: key.segment_count,
            });
        }

        let mut parts = ordered.into_values();
        let Some(first) = parts.next() else {
            return Err(RecordError::IncompleteGroup {
                received: 0,
                expected: key.segment_count,
            });
        };

        let mut timestamp = first.timestamp;
        let mut body = first.message_body;
        let mut pdus = vec![first.pdu];
        for part in parts {
            timestamp = timestamp.min(part.timestamp);
            body = match (body, part.message_body) {
                (Some(mut text), Some(more)) => {
                    text.push_str(&more);
                    Some(text)
                }
                _ => None,
            };
            pdus.push(part.pdu);
        }
        row_ids.sort_unstable();

        Ok(Self {
            key: key.clone(),
            transport: first.transport,
            destination_port: first.destination_port,
            pdus,
            body,
            timestamp,
            row_ids,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.pdus.len()
    }
}
