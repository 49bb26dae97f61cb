//! Voice packet codec
//!
//! Every voice datagram starts with a fixed 27-byte header followed by an
//! opaque payload. All multi-byte integers are big-endian.
//!
//! ```text
//! 0..3   magic "VCS"
//! 3      version (high nibble) | packet type (low nibble)
//! 4      flags (bit 0 PTT, bit 1 intercom, bits 2..7 reserved)
//! 5..8   sequence, 24-bit
//! 8..11  frequency in kHz, 24-bit
//! 11..27 sender id, 16 raw UUID bytes
//! 27..   payload
//! ```

use thiserror::Error;
use uuid::Uuid;

/// Total header size in bytes.
pub const HEADER_SIZE: usize = 27;

/// Protocol magic, first three bytes of every packet.
pub const MAGIC: &[u8; 3] = b"VCS";

/// Protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum datagram size the relay reads or writes.
pub const BUFFER_SIZE: usize = 1024;

const FLAG_PTT: u8 = 0x01;
const FLAG_INTERCOM: u8 = 0x02;

/// Packet types carried in the low nibble of byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Voice,
    Hello,
    HelloAck,
    Keepalive,
    Bye,
    /// Any type nibble this version does not know. Kept so the relay can
    /// log the raw value before dropping the packet.
    Unknown(u8),
}

impl PacketType {
    pub fn from_nibble(value: u8) -> Self {
        match value {
            0 => PacketType::Voice,
            1 => PacketType::Hello,
            2 => PacketType::HelloAck,
            3 => PacketType::Keepalive,
            4 => PacketType::Bye,
            other => PacketType::Unknown(other),
        }
    }

    pub fn as_nibble(self) -> u8 {
        match self {
            PacketType::Voice => 0,
            PacketType::Hello => 1,
            PacketType::HelloAck => 2,
            PacketType::Keepalive => 3,
            PacketType::Bye => 4,
            PacketType::Unknown(other) => other & 0x0F,
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Voice => write!(f, "VOICE"),
            PacketType::Hello => write!(f, "HELLO"),
            PacketType::HelloAck => write!(f, "HELLO_ACK"),
            PacketType::Keepalive => write!(f, "KEEPALIVE"),
            PacketType::Bye => write!(f, "BYE"),
            PacketType::Unknown(v) => write!(f, "UNKNOWN({v})"),
        }
    }
}

/// Decode failures for inbound datagrams.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short: {0} bytes, need at least {HEADER_SIZE}")]
    TooShort(usize),

    #[error("invalid magic: {0:02x?}")]
    BadMagic([u8; 3]),

    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),

    #[error("invalid sender id")]
    BadSenderId,
}

/// A parsed voice-protocol packet.
///
/// `flags` keeps the raw byte so reserved bits survive a re-emit unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: u8,
    /// 24-bit sequence number.
    pub sequence: u32,
    /// 24-bit frequency in kHz.
    pub frequency_khz: u32,
    pub sender_id: Uuid,
    pub payload: Vec<u8>,
}

impl VoicePacket {
    /// HELLO_ACK sent back to a client that announced itself.
    pub fn hello_ack(client_id: Uuid) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::HelloAck,
            flags: 0,
            sequence: 0,
            frequency_khz: 0,
            sender_id: client_id,
            payload: Vec::new(),
        }
    }

    /// KEEPALIVE echo for a client whose binding was refreshed.
    pub fn keepalive(client_id: Uuid) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Keepalive,
            flags: 0,
            sequence: 0,
            frequency_khz: 0,
            sender_id: client_id,
            payload: Vec::new(),
        }
    }

    /// A VOICE packet carrying `payload` on `frequency_khz`.
    pub fn voice(client_id: Uuid, sequence: u32, frequency_khz: u32, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Voice,
            flags: 0,
            sequence: sequence & 0x00FF_FFFF,
            frequency_khz: frequency_khz & 0x00FF_FFFF,
            sender_id: client_id,
            payload,
        }
    }

    pub fn is_ptt_active(&self) -> bool {
        self.flags & FLAG_PTT != 0
    }

    pub fn set_ptt(&mut self, active: bool) {
        if active {
            self.flags |= FLAG_PTT;
        } else {
            self.flags &= !FLAG_PTT;
        }
    }

    pub fn is_intercom(&self) -> bool {
        self.flags & FLAG_INTERCOM != 0
    }

    pub fn set_intercom(&mut self, active: bool) {
        if active {
            self.flags |= FLAG_INTERCOM;
        } else {
            self.flags &= !FLAG_INTERCOM;
        }
    }

    /// Frequency in MHz, for display.
    pub fn frequency_mhz(&self) -> f64 {
        f64::from(self.frequency_khz) / 1000.0
    }

    /// Parse a raw datagram.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::TooShort(data.len()));
        }

        let mut magic = [0u8; 3];
        magic.copy_from_slice(&data[0..3]);
        if &magic != MAGIC {
            return Err(ParseError::BadMagic(magic));
        }

        let version = (data[3] >> 4) & 0x0F;
        if version != PROTOCOL_VERSION {
            return Err(ParseError::BadVersion(version));
        }
        let packet_type = PacketType::from_nibble(data[3] & 0x0F);

        let flags = data[4];

        let sequence =
            (u32::from(data[5]) << 16) | (u32::from(data[6]) << 8) | u32::from(data[7]);
        let frequency_khz =
            (u32::from(data[8]) << 16) | (u32::from(data[9]) << 8) | u32::from(data[10]);

        let sender_id =
            Uuid::from_slice(&data[11..27]).map_err(|_| ParseError::BadSenderId)?;

        Ok(Self {
            version,
            packet_type,
            flags,
            sequence,
            frequency_khz,
            sender_id,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize back to raw bytes. Total function; the inverse of
    /// [`VoicePacket::parse`] on well-formed packets.
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_SIZE + self.payload.len());

        data.extend_from_slice(MAGIC);
        data.push((self.version << 4) | self.packet_type.as_nibble());
        data.push(self.flags);

        data.push((self.sequence >> 16) as u8);
        data.push((self.sequence >> 8) as u8);
        data.push(self.sequence as u8);

        data.push((self.frequency_khz >> 16) as u8);
        data.push((self.frequency_khz >> 8) as u8);
        data.push(self.frequency_khz as u8);

        data.extend_from_slice(self.sender_id.as_bytes());
        data.extend_from_slice(&self.payload);

        data
    }
}

impl std::fmt::Display for VoicePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VoicePacket{{type: {}, ptt: {}, seq: {}, freq: {:.3} MHz, sender: {}, payload: {}B}}",
            self.packet_type,
            self.is_ptt_active(),
            self.sequence,
            self.frequency_mhz(),
            self.sender_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_voice() -> VoicePacket {
        VoicePacket::voice(Uuid::new_v4(), 42, 251_000, vec![1, 2, 3, 4, 5, 6])
    }

    #[test]
    fn test_roundtrip_voice() {
        let packet = sample_voice();
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE + 6);

        let parsed = VoicePacket::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_roundtrip_preserves_reserved_flags() {
        let mut packet = sample_voice();
        packet.flags = 0b1111_0101; // PTT + reserved bits

        let parsed = VoicePacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.flags, 0b1111_0101);
        assert!(parsed.is_ptt_active());
        assert!(!parsed.is_intercom());
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let packet = VoicePacket::hello_ack(Uuid::new_v4());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let parsed = VoicePacket::parse(&bytes).unwrap();
        assert_eq!(parsed.packet_type, PacketType::HelloAck);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_too_short() {
        let err = VoicePacket::parse(&[0u8; 10]).unwrap_err();
        assert_eq!(err, ParseError::TooShort(10));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_voice().serialize();
        bytes[0] = b'X';
        assert!(matches!(
            VoicePacket::parse(&bytes).unwrap_err(),
            ParseError::BadMagic(_)
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = sample_voice().serialize();
        bytes[3] = (2 << 4) | bytes[3] & 0x0F;
        assert_eq!(
            VoicePacket::parse(&bytes).unwrap_err(),
            ParseError::BadVersion(2)
        );
    }

    #[test]
    fn test_unknown_type_still_parses() {
        let mut bytes = sample_voice().serialize();
        bytes[3] = (PROTOCOL_VERSION << 4) | 0x0D;
        let parsed = VoicePacket::parse(&bytes).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Unknown(0x0D));
    }

    #[test]
    fn test_24_bit_fields() {
        let packet = VoicePacket::voice(Uuid::new_v4(), 0x0102_0304, 0x00AB_CDEF, Vec::new());
        // The top byte of the sequence does not fit and is masked off.
        assert_eq!(packet.sequence, 0x0002_0304);

        let parsed = VoicePacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.sequence, 0x0002_0304);
        assert_eq!(parsed.frequency_khz, 0x00AB_CDEF);
    }

    #[test]
    fn test_frequency_mhz() {
        let packet = VoicePacket::voice(Uuid::new_v4(), 0, 121_500, Vec::new());
        assert!((packet.frequency_mhz() - 121.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ptt_intercom_flags() {
        let mut packet = sample_voice();
        packet.set_ptt(true);
        packet.set_intercom(true);
        assert_eq!(packet.flags, 0x03);
        packet.set_ptt(false);
        assert!(!packet.is_ptt_active());
        assert!(packet.is_intercom());
    }
}
