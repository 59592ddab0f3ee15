// ring-node/src/wire.rs
//! Message catalog and its binary encoding.
//!
//! Every payload starts with a one-byte tag. Integers are big-endian; strings
//! are UTF-8 behind a length prefix. Framing is the transport's concern.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::id::{Identifier, PeerIdentity, DIGITS};
use crate::routing::table::COLUMNS;
use crate::routing::{LeafSet, RoutingTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated: {needed} more bytes expected")]
    Truncated { needed: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unknown seek operation {0}")]
    UnknownOperation(u8),
    #[error("port {0} out of range")]
    InvalidPort(u32),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("{field} too long to encode ({len})")]
    TooLong { field: &'static str, len: usize },
    #[error("{0} is missing")]
    MissingField(&'static str),
    #[error("{0} unexpected bytes after message")]
    TrailingBytes(usize),
}

/// One-byte message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Register = 0,
    Deregister = 1,
    IdCollision = 2,
    SelectRequest = 3,
    SelectResponse = 4,
    SpecialJoin = 5,
    NoPeers = 6,
    PeerBroadcast = 7,
    Leave = 8,
    Seek = 9,
    AcceptStorage = 10,
    DenyStorage = 11,
    RelayFile = 12,
    WriteSuccess = 13,
    WriteFail = 14,
    ServeFile = 15,
}

impl TryFrom<u8> for Tag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Tag::*;
        const ALL: [Tag; 16] = [
            Register,
            Deregister,
            IdCollision,
            SelectRequest,
            SelectResponse,
            SpecialJoin,
            NoPeers,
            PeerBroadcast,
            Leave,
            Seek,
            AcceptStorage,
            DenyStorage,
            RelayFile,
            WriteSuccess,
            WriteFail,
            ServeFile,
        ];
        ALL.get(value as usize).copied().ok_or(WireError::UnknownTag(value))
    }
}

/// What a seek asks the key's owner to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    Store,
    Retrieve,
    Delete,
}

impl SeekOp {
    fn to_byte(self) -> u8 {
        match self {
            SeekOp::Store => 0,
            SeekOp::Retrieve => 1,
            SeekOp::Delete => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(SeekOp::Store),
            1 => Ok(SeekOp::Retrieve),
            2 => Ok(SeekOp::Delete),
            other => Err(WireError::UnknownOperation(other)),
        }
    }
}

/// A join request travelling toward its destination's own identifier,
/// collecting routing knowledge from every hop.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub destination: PeerIdentity,
    pub hops: Vec<PeerIdentity>,
    leaves: LeafSet,
    table: RoutingTable,
}

impl JoinRequest {
    pub fn new(destination: PeerIdentity) -> Self {
        Self {
            leaves: LeafSet::new(destination.clone()),
            table: RoutingTable::new(destination.clone()),
            destination,
            hops: Vec::new(),
        }
    }

    /// Fold peers into the accumulated table and leaf set as the destination
    /// would, keeping leaf-set evictions in the table.
    pub fn add_relevant_entries(&mut self, peers: impl IntoIterator<Item = PeerIdentity>) {
        for peer in peers {
            if peer == self.destination {
                continue;
            }
            self.table.add(peer.clone());
            if let Some(evicted) = self.leaves.add(peer) {
                self.table.add(evicted);
            }
        }
    }

    pub fn leaf_set(&self) -> &LeafSet {
        &self.leaves
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn into_routing(self) -> (LeafSet, RoutingTable) {
        (self.leaves, self.table)
    }

    /// Hop identifiers joined by arrows, for logs.
    pub fn trace(&self) -> String {
        self.hops
            .iter()
            .map(|hop| hop.id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// A store, retrieve or delete routed toward the owner of `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeekRequest {
    pub op: SeekOp,
    pub key: String,
    pub path: String,
    /// Where the owner answers.
    pub address: String,
    pub hops: Vec<PeerIdentity>,
}

impl SeekRequest {
    pub fn trace(&self) -> String {
        self.hops
            .iter()
            .map(|hop| hop.id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register(PeerIdentity),
    Deregister(PeerIdentity),
    Leave(PeerIdentity),
    SelectResponse(PeerIdentity),
    SelectRequest(String),
    NoPeers(String),
    IdCollision(String),
    AcceptStorage(String),
    DenyStorage(String),
    WriteSuccess(String),
    WriteFail(String),
    Join(JoinRequest),
    PeerBroadcast {
        origin: PeerIdentity,
        peers: Vec<PeerIdentity>,
    },
    Seek(SeekRequest),
    RelayFile {
        key: String,
        filename: String,
        content: Bytes,
        address: String,
        hops: u32,
    },
    ServeFile {
        filename: String,
        content: Option<Bytes>,
    },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Register(_) => Tag::Register,
            Message::Deregister(_) => Tag::Deregister,
            Message::Leave(_) => Tag::Leave,
            Message::SelectResponse(_) => Tag::SelectResponse,
            Message::SelectRequest(_) => Tag::SelectRequest,
            Message::NoPeers(_) => Tag::NoPeers,
            Message::IdCollision(_) => Tag::IdCollision,
            Message::AcceptStorage(_) => Tag::AcceptStorage,
            Message::DenyStorage(_) => Tag::DenyStorage,
            Message::WriteSuccess(_) => Tag::WriteSuccess,
            Message::WriteFail(_) => Tag::WriteFail,
            Message::Join(_) => Tag::SpecialJoin,
            Message::PeerBroadcast { .. } => Tag::PeerBroadcast,
            Message::Seek(_) => Tag::Seek,
            Message::RelayFile { .. } => Tag::RelayFile,
            Message::ServeFile { .. } => Tag::ServeFile,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag() as u8);
        match self {
            Message::Register(peer)
            | Message::Deregister(peer)
            | Message::Leave(peer)
            | Message::SelectResponse(peer) => put_peer(&mut buf, peer)?,
            Message::SelectRequest(text)
            | Message::NoPeers(text)
            | Message::IdCollision(text)
            | Message::AcceptStorage(text)
            | Message::DenyStorage(text)
            | Message::WriteSuccess(text)
            | Message::WriteFail(text) => put_short_str(&mut buf, "message text", text)?,
            Message::Join(join) => {
                put_peer(&mut buf, &join.destination)?;
                let hops = u16::try_from(join.hops.len()).map_err(|_| WireError::TooLong {
                    field: "join hops",
                    len: join.hops.len(),
                })?;
                buf.put_u16(hops);
                for hop in &join.hops {
                    put_peer(&mut buf, hop)?;
                }
                put_leaf_set(&mut buf, &join.leaves)?;
                put_table(&mut buf, &join.table)?;
            }
            Message::PeerBroadcast { origin, peers } => {
                put_peer(&mut buf, origin)?;
                put_peer_list(&mut buf, peers)?;
            }
            Message::Seek(seek) => {
                buf.put_u8(seek.op.to_byte());
                put_long_str(&mut buf, &seek.key);
                put_long_str(&mut buf, &seek.path);
                put_long_str(&mut buf, &seek.address);
                put_peer_list(&mut buf, &seek.hops)?;
            }
            Message::RelayFile {
                key,
                filename,
                content,
                address,
                hops,
            } => {
                put_long_str(&mut buf, key);
                put_long_str(&mut buf, filename);
                put_long_bytes(&mut buf, content);
                put_long_str(&mut buf, address);
                buf.put_u32(*hops);
            }
            Message::ServeFile { filename, content } => {
                put_long_str(&mut buf, filename);
                put_long_bytes(&mut buf, content.as_deref().unwrap_or_default());
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Message, WireError> {
        need(&buf, 1)?;
        let tag = Tag::try_from(buf.get_u8())?;
        let message = match tag {
            Tag::Register => Message::Register(get_peer(&mut buf)?),
            Tag::Deregister => Message::Deregister(get_peer(&mut buf)?),
            Tag::Leave => Message::Leave(get_peer(&mut buf)?),
            Tag::SelectResponse => Message::SelectResponse(get_peer(&mut buf)?),
            Tag::SelectRequest => Message::SelectRequest(get_short_str(&mut buf)?),
            Tag::NoPeers => Message::NoPeers(get_short_str(&mut buf)?),
            Tag::IdCollision => Message::IdCollision(get_short_str(&mut buf)?),
            Tag::AcceptStorage => Message::AcceptStorage(get_short_str(&mut buf)?),
            Tag::DenyStorage => Message::DenyStorage(get_short_str(&mut buf)?),
            Tag::WriteSuccess => Message::WriteSuccess(get_short_str(&mut buf)?),
            Tag::WriteFail => Message::WriteFail(get_short_str(&mut buf)?),
            Tag::SpecialJoin => {
                let destination = get_peer(&mut buf)?;
                need(&buf, 2)?;
                let count = buf.get_u16();
                let mut hops = Vec::with_capacity(count.into());
                for _ in 0..count {
                    hops.push(get_peer(&mut buf)?);
                }
                let leaves = get_leaf_set(&mut buf)?;
                let table = get_table(&mut buf)?;
                Message::Join(JoinRequest {
                    destination,
                    hops,
                    leaves,
                    table,
                })
            }
            Tag::PeerBroadcast => Message::PeerBroadcast {
                origin: get_peer(&mut buf)?,
                peers: get_peer_list(&mut buf)?,
            },
            Tag::Seek => {
                need(&buf, 1)?;
                let op = SeekOp::from_byte(buf.get_u8())?;
                Message::Seek(SeekRequest {
                    op,
                    key: get_long_str(&mut buf)?,
                    path: get_long_str(&mut buf)?,
                    address: get_long_str(&mut buf)?,
                    hops: get_peer_list(&mut buf)?,
                })
            }
            Tag::RelayFile => {
                let key = get_long_str(&mut buf)?;
                let filename = get_long_str(&mut buf)?;
                let content = get_long_bytes(&mut buf)?;
                let address = get_long_str(&mut buf)?;
                need(&buf, 4)?;
                Message::RelayFile {
                    key,
                    filename,
                    content,
                    address,
                    hops: buf.get_u32(),
                }
            }
            Tag::ServeFile => {
                let filename = get_long_str(&mut buf)?;
                let content = get_long_bytes(&mut buf)?;
                Message::ServeFile {
                    filename,
                    content: (!content.is_empty()).then_some(content),
                }
            }
        };
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self.tag() {
            Tag::Register => "REGISTER",
            Tag::Deregister => "DEREGISTER",
            Tag::IdCollision => "ID_COLLISION",
            Tag::SelectRequest => "SELECT_REQUEST",
            Tag::SelectResponse => "SELECT_RESPONSE",
            Tag::SpecialJoin => "SPECIAL_JOIN",
            Tag::NoPeers => "NO_PEERS",
            Tag::PeerBroadcast => "PEER_BROADCAST",
            Tag::Leave => "LEAVE",
            Tag::Seek => "SEEK",
            Tag::AcceptStorage => "ACCEPT_STORAGE",
            Tag::DenyStorage => "DENY_STORAGE",
            Tag::RelayFile => "RELAY_FILE",
            Tag::WriteSuccess => "WRITE_SUCCESS",
            Tag::WriteFail => "WRITE_FAIL",
            Tag::ServeFile => "SERVE_FILE",
        }
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), WireError> {
    match len.checked_sub(buf.remaining()) {
        Some(missing) if missing > 0 => Err(WireError::Truncated { needed: missing }),
        _ => Ok(()),
    }
}

fn put_short_str(buf: &mut BytesMut, field: &'static str, text: &str) -> Result<(), WireError> {
    let len = u16::try_from(text.len()).map_err(|_| WireError::TooLong {
        field,
        len: text.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(text.as_bytes());
    Ok(())
}

fn put_long_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    // Configured frame limits never exceed u32::MAX, so the length fits.
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_long_str(buf: &mut BytesMut, text: &str) {
    put_long_bytes(buf, text.as_bytes());
}

fn get_bytes(buf: &mut &[u8], len: usize) -> Result<Bytes, WireError> {
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn to_string(bytes: Bytes) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn get_short_str(buf: &mut &[u8]) -> Result<String, WireError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    to_string(get_bytes(buf, len)?)
}

fn get_long_bytes(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    get_bytes(buf, len)
}

fn get_long_str(buf: &mut &[u8]) -> Result<String, WireError> {
    to_string(get_long_bytes(buf)?)
}

fn put_peer(buf: &mut BytesMut, peer: &PeerIdentity) -> Result<(), WireError> {
    buf.put_slice(&peer.id.to_bytes());
    put_short_str(buf, "peer host", &peer.host)?;
    buf.put_u32(peer.port.into());
    Ok(())
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerIdentity, WireError> {
    need(buf, 2)?;
    let id = Identifier::from_bytes([buf.get_u8(), buf.get_u8()]);
    let host = get_short_str(buf)?;
    need(buf, 4)?;
    let raw_port = buf.get_u32();
    let port = u16::try_from(raw_port).map_err(|_| WireError::InvalidPort(raw_port))?;
    Ok(PeerIdentity::new(id, host, port))
}

fn put_optional_peer(buf: &mut BytesMut, peer: Option<&PeerIdentity>) -> Result<(), WireError> {
    match peer {
        Some(peer) => {
            buf.put_u8(1);
            put_peer(buf, peer)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn get_optional_peer(buf: &mut &[u8]) -> Result<Option<PeerIdentity>, WireError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => get_peer(buf).map(Some),
    }
}

fn put_peer_list(buf: &mut BytesMut, peers: &[PeerIdentity]) -> Result<(), WireError> {
    buf.put_u32(peers.len() as u32);
    for peer in peers {
        put_peer(buf, peer)?;
    }
    Ok(())
}

fn get_peer_list(buf: &mut &[u8]) -> Result<Vec<PeerIdentity>, WireError> {
    need(buf, 4)?;
    let count = buf.get_u32() as usize;
    // Each peer takes at least 8 bytes; refuse counts the frame cannot hold.
    need(buf, count.saturating_mul(8))?;
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        peers.push(get_peer(buf)?);
    }
    Ok(peers)
}

fn put_leaf_set(buf: &mut BytesMut, leaves: &LeafSet) -> Result<(), WireError> {
    put_optional_peer(buf, leaves.left())?;
    put_optional_peer(buf, Some(leaves.owner()))?;
    put_optional_peer(buf, leaves.right())
}

fn get_leaf_set(buf: &mut &[u8]) -> Result<LeafSet, WireError> {
    let left = get_optional_peer(buf)?;
    let owner = get_optional_peer(buf)?.ok_or(WireError::MissingField("leaf set owner"))?;
    let right = get_optional_peer(buf)?;
    Ok(LeafSet::from_parts(left, owner, right))
}

fn put_table(buf: &mut BytesMut, table: &RoutingTable) -> Result<(), WireError> {
    put_peer(buf, table.owner())?;
    for row in table.slots() {
        for slot in row {
            put_optional_peer(buf, slot.as_ref())?;
        }
    }
    Ok(())
}

fn get_table(buf: &mut &[u8]) -> Result<RoutingTable, WireError> {
    let owner = get_peer(buf)?;
    let mut slots: [[Option<PeerIdentity>; COLUMNS]; DIGITS] = Default::default();
    for row in slots.iter_mut() {
        for slot in row.iter_mut() {
            *slot = get_optional_peer(buf)?;
        }
    }
    Ok(RoutingTable::from_slots(owner, slots))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, host: &str, port: u16) -> PeerIdentity {
        PeerIdentity::new(id.parse().unwrap(), host, port)
    }

    fn round_trip(message: &Message) -> Message {
        Message::decode(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(Tag::try_from(0), Ok(Tag::Register));
        assert_eq!(Tag::try_from(5), Ok(Tag::SpecialJoin));
        assert_eq!(Tag::try_from(15), Ok(Tag::ServeFile));
        assert_eq!(Tag::try_from(16), Err(WireError::UnknownTag(16)));
        let bytes = Message::Leave(peer("0001", "h", 1)).encode().unwrap();
        assert_eq!(bytes[0], 8);
    }

    #[test]
    fn test_peer_identity_layout() {
        let bytes = Message::Register(peer("abcd", "host", 4096)).encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0xab, 0xcd, 0, 4, b'h', b'o', b's', b't', 0, 0, 0x10, 0][..]
        );
        match round_trip(&Message::Register(peer("abcd", "host", 4096))) {
            Message::Register(back) => {
                assert_eq!(back.id.to_string(), "abcd");
                assert_eq!(back.host, "host");
                assert_eq!(back.port, 4096);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_general_messages_keep_empty_text() {
        for message in [
            Message::NoPeers(String::new()),
            Message::SelectRequest("beef".into()),
            Message::AcceptStorage("docs/a.txt|1000,8000".into()),
            Message::WriteFail(String::new()),
        ] {
            assert_eq!(round_trip(&message), message);
        }
    }

    #[test]
    fn test_join_round_trip_keeps_routing_snapshot() {
        let mut join = JoinRequest::new(peer("8000", "10.0.0.8", 9000));
        join.add_relevant_entries([peer("1000", "10.0.0.1", 9001), peer("f000", "10.0.0.15", 9002)]);
        join.hops.push(peer("1000", "10.0.0.1", 9001));

        let back = match round_trip(&Message::Join(join.clone())) {
            Message::Join(back) => back,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(back, join);
        assert_eq!(back.leaf_set().to_string(), "1000 <- 8000 -> f000");
        assert_eq!(back.table().get(0, 0xf).unwrap().host, "10.0.0.15");
        assert_eq!(back.trace(), "1000");
    }

    #[test]
    fn test_join_round_trip_empty_hops() {
        let join = JoinRequest::new(peer("0042", "", 0));
        assert_eq!(round_trip(&Message::Join(join.clone())), Message::Join(join));
    }

    #[test]
    fn test_seek_and_relay_round_trip() {
        let seek = Message::Seek(SeekRequest {
            op: SeekOp::Delete,
            key: "abcd".into(),
            path: String::new(),
            address: "127.0.0.1:4000".into(),
            hops: vec![],
        });
        assert_eq!(round_trip(&seek), seek);

        let relay = Message::RelayFile {
            key: "abcd".into(),
            filename: "notes.txt".into(),
            content: Bytes::from_static(b"hello"),
            address: String::new(),
            hops: 3,
        };
        assert_eq!(round_trip(&relay), relay);

        let broadcast = Message::PeerBroadcast {
            origin: peer("1234", "a", 1),
            peers: vec![],
        };
        assert_eq!(round_trip(&broadcast), broadcast);
    }

    #[test]
    fn test_every_message_kind_round_trips() {
        let mut join = JoinRequest::new(peer("8000", "10.0.0.8", 9000));
        join.add_relevant_entries([peer("1000", "10.0.0.1", 9001)]);
        join.hops.push(peer("1000", "10.0.0.1", 9001));

        let messages = vec![
            Message::Register(peer("0001", "a", 1)),
            Message::Deregister(peer("0002", "b", 2)),
            Message::IdCollision("taken".into()),
            Message::SelectRequest(String::new()),
            Message::SelectResponse(peer("0003", "c", 3)),
            Message::Join(join),
            Message::NoPeers(String::new()),
            Message::PeerBroadcast {
                origin: peer("0004", "d", 4),
                peers: vec![peer("0005", "e", 5), peer("0006", "f", 6)],
            },
            Message::Leave(peer("0007", "g", 7)),
            Message::Seek(SeekRequest {
                op: SeekOp::Retrieve,
                key: "0bad".into(),
                path: "docs/x.txt".into(),
                address: "127.0.0.1:5000".into(),
                hops: vec![peer("0008", "h", 8)],
            }),
            Message::AcceptStorage("x.txt|0008".into()),
            Message::DenyStorage("x.txt|0008,0009".into()),
            Message::RelayFile {
                key: "0bad".into(),
                filename: "x.txt".into(),
                content: Bytes::from_static(b"contents"),
                address: "127.0.0.1:5000".into(),
                hops: 1,
            },
            Message::WriteSuccess("x.txt".into()),
            Message::WriteFail("x.txt".into()),
            Message::ServeFile {
                filename: "x.txt".into(),
                content: Some(Bytes::from_static(b"contents")),
            },
        ];

        let mut tags: Vec<u8> = Vec::new();
        for message in &messages {
            assert_eq!(&round_trip(message), message, "{}", message.kind());
            tags.push(message.tag() as u8);
        }
        tags.sort_unstable();
        assert_eq!(tags, (0..16).collect::<Vec<u8>>());

        // Peer identities compare by id alone, so check the address survives too.
        match round_trip(&messages[4]) {
            Message::SelectResponse(back) => assert_eq!(back.address(), "c:3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_serve_file_absent_content() {
        let missing = Message::ServeFile {
            filename: "gone.txt".into(),
            content: None,
        };
        assert_eq!(round_trip(&missing), missing);
    }

    #[test]
    fn test_truncated_and_trailing_input_rejected() {
        let bytes = Message::Register(peer("abcd", "host", 1)).encode().unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated { .. })
        ));
        let mut padded = bytes.to_vec();
        padded.push(0);
        assert_eq!(Message::decode(&padded), Err(WireError::TrailingBytes(1)));
        assert!(matches!(Message::decode(&[]), Err(WireError::Truncated { .. })));
        assert_eq!(Message::decode(&[9, 7]), Err(WireError::UnknownOperation(7)));
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let bytes = [0u8, 0, 1, 0, 0, 0, 1, 0, 0];
        assert_eq!(Message::decode(&bytes), Err(WireError::InvalidPort(65536)));
    }
}
