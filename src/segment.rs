// ABOUTME: Inbound SMS segment model: one record per received PDU plus its concatenation group key
// ABOUTME: Implements transport-specific sequence offsets and index validation for reassembly

use crate::error::RecordError;
use bytes::Bytes;
use std::fmt;

/// Reference number carried by single-part (non-concatenated) messages
pub const SINGLE_PART_REFERENCE: i32 = -1;

/// Radio transport a segment was received over
///
/// Each transport leg owns its own delivery queue, so the transport also
/// selects which [`DeliveryHandle`](crate::delivery::DeliveryHandle) a
/// reassembled message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// 3GPP (GSM / UMTS / LTE) SMS
    Gsm3gpp,
    /// 3GPP2 (CDMA) SMS
    Cdma3gpp2,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Gsm3gpp => f.write_str("3gpp"),
            Transport::Cdma3gpp2 => f.write_str("3gpp2"),
        }
    }
}

/// Identifies a concatenation group: `(originating address, reference number, segment count)`
///
/// Derived from [`SegmentRecord`] fields each time it is needed and never
/// persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReassemblyGroupKey {
    pub address: Option<String>,
    pub reference_number: i32,
    pub segment_count: u32,
}

impl ReassemblyGroupKey {
    pub fn new(address: Option<String>, reference_number: i32, segment_count: u32) -> Self {
        Self {
            address,
            reference_number,
            segment_count,
        }
    }
}

impl fmt::Display for ReassemblyGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/ref={}/count={}",
            self.address.as_deref().unwrap_or("<none>"),
            self.reference_number,
            self.segment_count
        )
    }
}

/// One received SMS PDU segment
///
/// A logical message spans `segment_count` records sharing the same
/// [`ReassemblyGroupKey`]. Single-part messages use reference
/// [`SINGLE_PART_REFERENCE`] and a count of 1.
///
/// ## Sequence numbering
///
/// CDMA WAP datagrams number their segments from 0; every other format
/// numbers from 1. [`SegmentRecord::index`] removes the offset and checks
/// the result against the segment count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Raw wire-format PDU
    pub pdu: Bytes,
    /// Receipt time in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Application port for data messages, `None` for plain text SMS
    pub destination_port: Option<u16>,
    pub transport: Transport,
    /// CDMA WAP datagram (zero-based sequence numbers)
    pub is_wap_datagram: bool,
    /// Sender address, or e-mail address when relayed by an e-mail gateway
    pub originating_address: Option<String>,
    pub reference_number: i32,
    pub sequence_number: i32,
    pub segment_count: u32,
    /// Decoded text of this segment when available
    pub message_body: Option<String>,
}

impl SegmentRecord {
    /// Start building a record for a PDU received over `transport`
    pub fn builder(transport: Transport, pdu: impl Into<Bytes>) -> SegmentRecordBuilder {
        SegmentRecordBuilder::new(transport, pdu.into())
    }

    /// Offset subtracted from `sequence_number` to obtain a zero-based index
    pub fn index_offset(&self) -> i32 {
        if self.transport == Transport::Cdma3gpp2 && self.is_wap_datagram {
            0
        } else {
            1
        }
    }

    /// Zero-based position of this segment within its group
    ///
    /// Single-part records are always at index 0 whatever their sequence
    /// number. For multi-part groups this fails with
    /// [`RecordError::CorruptIndex`] when the position falls outside
    /// `[0, segment_count)`.
    pub fn index(&self) -> Result<u32, RecordError> {
        if self.is_single_part() {
            return Ok(0);
        }
        let offset = self.index_offset();
        let index = i64::from(self.sequence_number) - i64::from(offset);
        if index < 0 || index >= i64::from(self.segment_count) {
            return Err(RecordError::CorruptIndex {
                sequence: self.sequence_number,
                offset,
                count: self.segment_count,
            });
        }
        Ok(index as u32)
    }

    pub fn is_single_part(&self) -> bool {
        self.segment_count == 1
    }

    /// Concatenation group this record belongs to
    pub fn group_key(&self) -> ReassemblyGroupKey {
        ReassemblyGroupKey::new(
            self.originating_address.clone(),
            self.reference_number,
            self.segment_count,
        )
    }
}

/// Builder for [`SegmentRecord`]
///
/// Defaults describe a single-part message with no port, no sender and a
/// timestamp of zero.
#[derive(Debug, Clone)]
pub struct SegmentRecordBuilder {
    record: SegmentRecord,
}

impl SegmentRecordBuilder {
    fn new(transport: Transport, pdu: Bytes) -> Self {
        Self {
            record: SegmentRecord {
                pdu,
                timestamp: 0,
                destination_port: None,
                transport,
                is_wap_datagram: false,
                originating_address: None,
                reference_number: SINGLE_PART_REFERENCE,
                sequence_number: 1,
                segment_count: 1,
                message_body: None,
            },
        }
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.record.timestamp = millis;
        self
    }

    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.record.originating_address = Some(address.into());
        self
    }

    pub fn destination_port(mut self, port: u16) -> Self {
        self.record.destination_port = Some(port);
        self
    }

    /// Mark the record as a CDMA WAP datagram
    pub fn wap_datagram(mut self) -> Self {
        self.record.is_wap_datagram = true;
        self
    }

    /// Place the record in a concatenation group
    pub fn part(mut self, reference_number: i32, sequence_number: i32, segment_count: u32) -> Self {
        self.record.reference_number = reference_number;
        self.record.sequence_number = sequence_number;
        self.record.segment_count = segment_count;
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.record.message_body = Some(body.into());
        self
    }

    /// Finish the record
    ///
    /// Only the segment count is checked here: it must be positive and fit
    /// the persisted `count` column. Range violations of the sequence number
    /// are reported by the reassembly tracker so corrupt records can still
    /// be represented and rejected there.
    pub fn build(self) -> Result<SegmentRecord, RecordError> {
        let count = self.record.segment_count;
        if count == 0 || i32::try_from(count).is_err() {
            return Err(RecordError::InvalidCount(i64::from(count)));
        }
        Ok(self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(transport: Transport, sequence: i32, count: u32) -> SegmentRecordBuilder {
        SegmentRecord::builder(transport, vec![0x01, 0x02])
            .from("+15551234")
            .part(5, sequence, count)
    }

    #[test]
    fn test_builder_defaults_to_single_part() {
        let record = SegmentRecord::builder(Transport::Gsm3gpp, vec![0xAA])
            .build()
            .unwrap();
        assert!(record.is_single_part());
        assert_eq!(record.reference_number, SINGLE_PART_REFERENCE);
        assert_eq!(record.index().unwrap(), 0);
        assert_eq!(record.originating_address, None);
    }

    #[test]
    fn test_builder_rejects_zero_count() {
        let result = part(Transport::Gsm3gpp, 1, 0).build();
        assert_eq!(result.unwrap_err(), RecordError::InvalidCount(0));
    }

    #[test]
    fn test_builder_rejects_count_beyond_column_range() {
        let too_many = i32::MAX as u32 + 1;
        let result = part(Transport::Gsm3gpp, 1, too_many).build();
        assert_eq!(result.unwrap_err(), RecordError::InvalidCount(i64::from(too_many)));
        assert!(part(Transport::Gsm3gpp, 1, i32::MAX as u32).build().is_ok());
    }

    #[test]
    fn test_single_part_index_ignores_sequence_number() {
        for (transport, sequence) in [(Transport::Gsm3gpp, 0), (Transport::Gsm3gpp, 7), (Transport::Cdma3gpp2, -1)] {
            let record = part(transport, sequence, 1).build().unwrap();
            assert_eq!(record.index().unwrap(), 0);
        }
    }

    #[test]
    fn test_gsm_sequences_are_one_based() {
        let first = part(Transport::Gsm3gpp, 1, 3).build().unwrap();
        let last = part(Transport::Gsm3gpp, 3, 3).build().unwrap();
        assert_eq!(first.index_offset(), 1);
        assert_eq!(first.index().unwrap(), 0);
        assert_eq!(last.index().unwrap(), 2);

        let zero = part(Transport::Gsm3gpp, 0, 3).build().unwrap();
        assert!(matches!(zero.index(), Err(RecordError::CorruptIndex { sequence: 0, .. })));
    }

    #[test]
    fn test_cdma_wap_sequences_are_zero_based() {
        let first = part(Transport::Cdma3gpp2, 0, 2).wap_datagram().build().unwrap();
        let second = part(Transport::Cdma3gpp2, 1, 2).wap_datagram().build().unwrap();
        let beyond = part(Transport::Cdma3gpp2, 2, 2).wap_datagram().build().unwrap();
        assert_eq!(first.index().unwrap(), 0);
        assert_eq!(second.index().unwrap(), 1);
        assert!(beyond.index().is_err());
    }

    #[test]
    fn test_cdma_without_wap_is_one_based() {
        let record = part(Transport::Cdma3gpp2, 1, 2).build().unwrap();
        assert_eq!(record.index_offset(), 1);
        assert_eq!(record.index().unwrap(), 0);
    }

    #[test]
    fn test_wap_flag_has_no_effect_on_gsm() {
        let record = part(Transport::Gsm3gpp, 1, 2).wap_datagram().build().unwrap();
        assert_eq!(record.index_offset(), 1);
    }

    #[test]
    fn test_group_key_and_display() {
        let record = part(Transport::Gsm3gpp, 2, 4).build().unwrap();
        let key = record.group_key();
        assert_eq!(key, ReassemblyGroupKey::new(Some("+15551234".into()), 5, 4));
        assert_eq!(key.to_string(), "+15551234/ref=5/count=4");

        let anonymous = ReassemblyGroupKey::new(None, 9, 2);
        assert_eq!(anonymous.to_string(), "<none>/ref=9/count=2");
    }
}
