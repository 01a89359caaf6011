// ABOUTME: Persisted column layout of a segment row, including the packed destination_port field
// ABOUTME: Converts between SegmentRecord and its on-disk form with hex PDUs and format flag bits

use crate::error::RecordError;
use crate::segment::{ReassemblyGroupKey, SegmentRecord, Transport};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

/// Row identifier assigned by the store on insert
pub type RowId = i64;

/// Set in `destination_port` when the message has no application port
pub const DEST_PORT_FLAG_NO_PORT: u32 = 1 << 16;

/// Set in `destination_port` for CDMA WAP datagrams (together with the 3GPP2 flag)
pub const DEST_PORT_FLAG_3GPP2_WAP_PDU: u32 = 1 << 19;

/// Low 16 bits of `destination_port` hold the port itself
pub const DEST_PORT_MASK: u32 = 0xffff;

const TRANSPORT_FLAG_MASK: u32 = TransportFlag::Gsm3gpp as u32 | TransportFlag::Cdma3gpp2 as u32;

/// Transport format bit of the packed `destination_port` column
///
/// Exactly one of these bits must be set in every stored row; a row with
/// neither or both is rejected on load.
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportFlag {
    /// Bit 17 - 3GPP format
    Gsm3gpp = 1 << 17,
    /// Bit 18 - 3GPP2 format
    Cdma3gpp2 = 1 << 18,
}

impl From<Transport> for TransportFlag {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Gsm3gpp => TransportFlag::Gsm3gpp,
            Transport::Cdma3gpp2 => TransportFlag::Cdma3gpp2,
        }
    }
}

impl From<TransportFlag> for Transport {
    fn from(flag: TransportFlag) -> Self {
        match flag {
            TransportFlag::Gsm3gpp => Transport::Gsm3gpp,
            TransportFlag::Cdma3gpp2 => Transport::Cdma3gpp2,
        }
    }
}

/// Pack port, transport and WAP flag into the `destination_port` column value
pub fn pack_destination_port(port: Option<u16>, transport: Transport, is_wap_datagram: bool) -> u32 {
    let mut packed = match port {
        Some(port) => u32::from(port) & DEST_PORT_MASK,
        None => DEST_PORT_FLAG_NO_PORT,
    };
    packed |= u32::from(TransportFlag::from(transport));
    if is_wap_datagram && transport == Transport::Cdma3gpp2 {
        packed |= DEST_PORT_FLAG_3GPP2_WAP_PDU;
    }
    packed
}

/// Split a packed `destination_port` value back into port, transport and WAP flag
pub fn unpack_destination_port(packed: u32) -> Result<(Option<u16>, Transport, bool), RecordError> {
    let transport = TransportFlag::try_from(packed & TRANSPORT_FLAG_MASK)
        .map_err(|_| RecordError::UnknownFormat(packed))?;
    let port = if packed & DEST_PORT_FLAG_NO_PORT != 0 {
        None
    } else {
        Some((packed & DEST_PORT_MASK) as u16)
    };
    let is_wap_datagram = packed & DEST_PORT_FLAG_3GPP2_WAP_PDU != 0;
    Ok((port, transport.into(), is_wap_datagram))
}

/// A segment as laid out in durable storage
///
/// Column names and encodings match the raw inbound table:
///
/// | column             | encoding                                  |
/// |--------------------|-------------------------------------------|
/// | `pdu`              | upper-case hex string                     |
/// | `date`             | milliseconds since epoch                  |
/// | `destination_port` | port in bits 0-15, format flags in 16-19  |
/// | `address`          | sender, nullable                          |
/// | `reference_number` | concatenation reference, -1 single-part   |
/// | `sequence`         | transport-specific sequence number        |
/// | `count`            | segments in the group                     |
/// | `message_body`     | decoded text, nullable                    |
/// | `deleted`          | soft-delete flag                          |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: RowId,
    pub pdu: String,
    pub date: i64,
    pub destination_port: u32,
    pub address: Option<String>,
    pub reference_number: i32,
    pub sequence: i32,
    pub count: i32,
    pub message_body: Option<String>,
    pub deleted: bool,
}

impl StoredRow {
    /// Lay out `record` as a row with the given id
    ///
    /// Fails with [`RecordError::InvalidCount`] when the segment count does
    /// not fit the `count` column.
    pub fn from_record(id: RowId, record: &SegmentRecord) -> Result<Self, RecordError> {
        let count = i32::try_from(record.segment_count)
            .map_err(|_| RecordError::InvalidCount(i64::from(record.segment_count)))?;
        Ok(Self {
            id,
            pdu: hex::encode_upper(&record.pdu),
            date: record.timestamp,
            destination_port: pack_destination_port(
                record.destination_port,
                record.transport,
                record.is_wap_datagram,
            ),
            address: record.originating_address.clone(),
            reference_number: record.reference_number,
            sequence: record.sequence_number,
            count,
            message_body: record.message_body.clone(),
            deleted: false,
        })
    }

    /// Decode the row back into a [`SegmentRecord`]
    pub fn to_record(&self) -> Result<SegmentRecord, RecordError> {
        let pdu = hex::decode(&self.pdu).map_err(|e| RecordError::InvalidHex(e.to_string()))?;
        let (destination_port, transport, is_wap_datagram) =
            unpack_destination_port(self.destination_port)?;
        let segment_count =
            u32::try_from(self.count).map_err(|_| RecordError::InvalidCount(self.count.into()))?;
        if segment_count == 0 {
            return Err(RecordError::InvalidCount(0));
        }

        Ok(SegmentRecord {
            pdu: Bytes::from(pdu),
            timestamp: self.date,
            destination_port,
            transport,
            is_wap_datagram,
            originating_address: self.address.clone(),
            reference_number: self.reference_number,
            sequence_number: self.sequence,
            segment_count,
            message_body: self.message_body.clone(),
        })
    }

    /// Whether this row belongs to the group identified by `key`
    pub fn matches_key(&self, key: &ReassemblyGroupKey) -> bool {
        self.address == key.address
            && self.reference_number == key.reference_number
            && i64::from(self.count) == i64::from(key.segment_count)
    }
}

/// Decode every row, dropping (and logging) the ones that no longer decode
pub fn decode_rows(rows: Vec<StoredRow>) -> Vec<(RowId, SegmentRecord)> {
    rows.into_iter()
        .filter_map(|row| match row.to_record() {
            Ok(record) => Some((row.id, record)),
            Err(e) => {
                warn!(id = row.id, error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}
