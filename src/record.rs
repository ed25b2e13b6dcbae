use arrayvec::ArrayVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io;
use std::io::{Error, ErrorKind};

/// On-wire size of a record: op(4) key(4) value(8) send_ts(8) latency(8) seq(8).
pub const RECORD_SIZE: usize = 40;

/// Value a router puts in a GET response when the key is not stored.
pub const ABSENT_VALUE: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Get = 0,
    Put = 1,
}

impl TryFrom<u32> for Operation {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, u32> {
        match code {
            0 => Ok(Operation::Get),
            1 => Ok(Operation::Put),
            other => Err(other),
        }
    }
}

/// The fixed-width record exchanged in both directions.
///
/// The router only ever rewrites `value`; `send_timestamp_ns` and `seq`
/// come back exactly as the client sent them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub op: Operation,
    pub key: u32,
    pub value: u64,
    pub send_timestamp_ns: u64,
    pub latency_ns: u64,
    pub seq: u64,
}

pub type RecordBuf = ArrayVec<u8, RECORD_SIZE>;

impl RequestRecord {
    pub fn serialize_into<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.op as u32)?;
        writer.write_u32::<BigEndian>(self.key)?;
        writer.write_u64::<BigEndian>(self.value)?;
        writer.write_u64::<BigEndian>(self.send_timestamp_ns)?;
        writer.write_u64::<BigEndian>(self.latency_ns)?;
        writer.write_u64::<BigEndian>(self.seq)?;
        Ok(())
    }

    pub fn encode(&self) -> RecordBuf {
        let mut buf = RecordBuf::new();
        // RecordBuf holds exactly RECORD_SIZE bytes, so this cannot run short.
        let _ = self.serialize_into(&mut buf);
        buf
    }

    pub fn deserialize<R: io::Read>(reader: &mut R) -> io::Result<RequestRecord> {
        let code = reader.read_u32::<BigEndian>()?;
        let op = Operation::try_from(code).map_err(|c| {
            Error::new(ErrorKind::InvalidData, format!("Unknown operation code: {}", c))
        })?;
        Ok(RequestRecord {
            op,
            key: reader.read_u32::<BigEndian>()?,
            value: reader.read_u64::<BigEndian>()?,
            send_timestamp_ns: reader.read_u64::<BigEndian>()?,
            latency_ns: reader.read_u64::<BigEndian>()?,
            seq: reader.read_u64::<BigEndian>()?,
        })
    }

    /// Decodes one datagram. Anything but exactly `RECORD_SIZE` bytes is
    /// rejected.
    pub fn decode(datagram: &[u8]) -> io::Result<RequestRecord> {
        if datagram.len() != RECORD_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Bad record length: {} bytes (expected {})",
                    datagram.len(),
                    RECORD_SIZE
                ),
            ));
        }
        RequestRecord::deserialize(&mut &datagram[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RequestRecord {
        RequestRecord {
            op: Operation::Put,
            key: 99_999,
            value: 1111,
            send_timestamp_ns: 1_700_000_000_123_456_789,
            latency_ns: 0,
            seq: 42,
        }
    }

    #[test]
    fn decode_reproduces_every_field() {
        let rec = sample();
        let buf = rec.encode();
        assert_eq!(buf.len(), RECORD_SIZE);
        assert_eq!(RequestRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn layout_is_network_byte_order() {
        let buf = sample().encode();
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..8], &99_999u32.to_be_bytes());
        assert_eq!(&buf[32..40], &42u64.to_be_bytes());
    }

    #[test]
    fn rejects_unknown_operation() {
        let mut buf = sample().encode();
        buf[3] = 7;
        let err = RequestRecord::decode(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_wrong_length() {
        let buf = sample().encode();
        assert!(RequestRecord::decode(&buf[..RECORD_SIZE - 1]).is_err());
        let mut long = buf.to_vec();
        long.push(0);
        assert!(RequestRecord::decode(&long).is_err());
    }
}
