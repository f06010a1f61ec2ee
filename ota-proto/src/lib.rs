//! OTA provider wire protocol - command types and framing

use std::io;

mod status;

pub use status::{ApplyUpdateAction, CommandStatus, OtaQueryStatus};

pub type FabricIndex = u8;
pub type NodeId = u64;

// Requestor commands
pub const MSG_QUERY_IMAGE: u16 = 0x0001;
pub const MSG_QUERY_IMAGE_RESPONSE: u16 = 0x0002;
pub const MSG_APPLY_UPDATE_REQUEST: u16 = 0x0003;
pub const MSG_APPLY_UPDATE_RESPONSE: u16 = 0x0004;
pub const MSG_NOTIFY_UPDATE_APPLIED: u16 = 0x0005;
pub const MSG_STATUS_RESPONSE: u16 = 0x0006;
pub const MSG_STANDALONE_ACK: u16 = 0x0007;

// Local administration
pub const MSG_ENABLE_OTA: u16 = 0x0101;
pub const MSG_DISABLE_OTA: u16 = 0x0102;
pub const MSG_REMOVE_REQUESTOR: u16 = 0x0103;

/// Largest frame payload accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Bounds-checked reader over a message body
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.data.len() < self.pos + n {
            return Err(invalid(format!("{} truncated", self.what)));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    /// u8 length prefix followed by raw bytes
    fn short_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// u16 length prefix followed by UTF-8
    fn string(&mut self) -> io::Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| invalid(format!("{} string is not utf-8", self.what)))
    }
}

fn put_short_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len: u8 = bytes
        .len()
        .try_into()
        .map_err(|_| invalid("byte field longer than 255"))?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let len: u16 = s
        .len()
        .try_into()
        .map_err(|_| invalid("string field longer than 65535"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Identity of the node issuing a requestor command.
///
/// Prefixes every requestor command payload; the transport has already
/// resolved the secure session to this fabric-scoped identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestorHeader {
    pub fabric_index: FabricIndex,
    pub node_id: NodeId,
}

impl RequestorHeader {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.fabric_index;
        buf[1..].copy_from_slice(&self.node_id.to_be_bytes());
        buf
    }

    /// Split a command payload into its header and body
    pub fn split(payload: &[u8]) -> io::Result<(Self, &[u8])> {
        let mut cur = Cursor::new(payload, "requestor header");
        let fabric_index = cur.u8()?;
        let node_id = cur.u64()?;
        Ok((Self { fabric_index, node_id }, &payload[Self::LEN..]))
    }
}

/// QueryImage - requestor asks whether a newer image exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryImage {
    pub vendor_id: u16,
    pub product_id: u16,
    pub software_version: u32,
}

impl QueryImage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.vendor_id.to_be_bytes());
        buf.extend_from_slice(&self.product_id.to_be_bytes());
        buf.extend_from_slice(&self.software_version.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "QUERY_IMAGE");
        Ok(Self {
            vendor_id: cur.u16()?,
            product_id: cur.u16()?,
            software_version: cur.u32()?,
        })
    }
}

const QIR_DELAY: u8 = 1 << 0;
const QIR_URI: u8 = 1 << 1;
const QIR_VERSION: u8 = 1 << 2;
const QIR_VERSION_STRING: u8 = 1 << 3;
const QIR_TOKEN: u8 = 1 << 4;

/// QueryImageResponse - provider's answer to QueryImage
///
/// Optional fields are announced by a presence byte following the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryImageResponse {
    pub status: OtaQueryStatus,
    pub delayed_action_time: Option<u32>,
    pub image_uri: Option<String>,
    pub software_version: Option<u32>,
    pub software_version_string: Option<String>,
    pub update_token: Option<Vec<u8>>,
}

impl QueryImageResponse {
    pub fn with_status(status: OtaQueryStatus) -> Self {
        Self {
            status,
            delayed_action_time: None,
            image_uri: None,
            software_version: None,
            software_version_string: None,
            update_token: None,
        }
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut flags = 0u8;
        if self.delayed_action_time.is_some() {
            flags |= QIR_DELAY;
        }
        if self.image_uri.is_some() {
            flags |= QIR_URI;
        }
        if self.software_version.is_some() {
            flags |= QIR_VERSION;
        }
        if self.software_version_string.is_some() {
            flags |= QIR_VERSION_STRING;
        }
        if self.update_token.is_some() {
            flags |= QIR_TOKEN;
        }

        let mut buf = Vec::with_capacity(64);
        buf.push(self.status as u8);
        buf.push(flags);
        if let Some(delay) = self.delayed_action_time {
            buf.extend_from_slice(&delay.to_be_bytes());
        }
        if let Some(uri) = &self.image_uri {
            put_string(&mut buf, uri)?;
        }
        if let Some(version) = self.software_version {
            buf.extend_from_slice(&version.to_be_bytes());
        }
        if let Some(version_string) = &self.software_version_string {
            put_string(&mut buf, version_string)?;
        }
        if let Some(token) = &self.update_token {
            put_short_bytes(&mut buf, token)?;
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "QUERY_IMAGE_RESPONSE");
        let status = OtaQueryStatus::from_u8(cur.u8()?)
            .ok_or_else(|| invalid("unknown OTA query status"))?;
        let flags = cur.u8()?;

        let delayed_action_time = if flags & QIR_DELAY != 0 { Some(cur.u32()?) } else { None };
        let image_uri = if flags & QIR_URI != 0 { Some(cur.string()?) } else { None };
        let software_version = if flags & QIR_VERSION != 0 { Some(cur.u32()?) } else { None };
        let software_version_string = if flags & QIR_VERSION_STRING != 0 {
            Some(cur.string()?)
        } else {
            None
        };
        let update_token = if flags & QIR_TOKEN != 0 { Some(cur.short_bytes()?) } else { None };

        Ok(Self {
            status,
            delayed_action_time,
            image_uri,
            software_version,
            software_version_string,
            update_token,
        })
    }
}

/// ApplyUpdateRequest - requestor has the image and asks whether to apply it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyUpdateRequest {
    pub update_token: Vec<u8>,
    pub new_version: u32,
}

impl ApplyUpdateRequest {
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.update_token.len() + 4);
        put_short_bytes(&mut buf, &self.update_token)?;
        buf.extend_from_slice(&self.new_version.to_be_bytes());
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "APPLY_UPDATE_REQUEST");
        Ok(Self {
            update_token: cur.short_bytes()?,
            new_version: cur.u32()?,
        })
    }
}

/// ApplyUpdateResponse - provider's disposition for an ApplyUpdateRequest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyUpdateResponse {
    pub action: ApplyUpdateAction,
    pub delayed_action_time: u32,
}

impl ApplyUpdateResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(self.action as u8);
        buf.extend_from_slice(&self.delayed_action_time.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "APPLY_UPDATE_RESPONSE");
        let action = ApplyUpdateAction::from_u8(cur.u8()?)
            .ok_or_else(|| invalid("unknown apply update action"))?;
        Ok(Self {
            action,
            delayed_action_time: cur.u32()?,
        })
    }
}

/// NotifyUpdateApplied - requestor now runs the new image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyUpdateApplied {
    pub update_token: Vec<u8>,
    pub software_version: u32,
}

impl NotifyUpdateApplied {
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.update_token.len() + 4);
        put_short_bytes(&mut buf, &self.update_token)?;
        buf.extend_from_slice(&self.software_version.to_be_bytes());
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "NOTIFY_UPDATE_APPLIED");
        Ok(Self {
            update_token: cur.short_bytes()?,
            software_version: cur.u32()?,
        })
    }
}

/// STATUS_RESPONSE - protocol-level status in place of a response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: CommandStatus,
}

impl StatusResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.status as u8]
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "STATUS_RESPONSE");
        let status = CommandStatus::from_u8(cur.u8()?)
            .ok_or_else(|| invalid("unknown command status"))?;
        Ok(Self { status })
    }
}

const TARGET_FABRIC: u8 = 1 << 0;
const TARGET_NODE: u8 = 1 << 1;
const TARGET_ONCE: u8 = 1 << 2;

/// ENABLE_OTA / DISABLE_OTA body - `None` fields are wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminTarget {
    pub fabric_index: Option<FabricIndex>,
    pub node_id: Option<NodeId>,
    /// Only meaningful for ENABLE_OTA
    pub once: bool,
}

impl AdminTarget {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.fabric_index.is_some() {
            flags |= TARGET_FABRIC;
        }
        if self.node_id.is_some() {
            flags |= TARGET_NODE;
        }
        if self.once {
            flags |= TARGET_ONCE;
        }

        let mut buf = Vec::with_capacity(10);
        buf.push(flags);
        if let Some(fabric_index) = self.fabric_index {
            buf.push(fabric_index);
        }
        if let Some(node_id) = self.node_id {
            buf.extend_from_slice(&node_id.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(data, "ADMIN_TARGET");
        let flags = cur.u8()?;
        let fabric_index = if flags & TARGET_FABRIC != 0 { Some(cur.u8()?) } else { None };
        let node_id = if flags & TARGET_NODE != 0 { Some(cur.u64()?) } else { None };
        Ok(Self {
            fabric_index,
            node_id,
            once: flags & TARGET_ONCE != 0,
        })
    }
}

/// Frame: wraps any message with type and length
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Requestor command: identity header followed by the command body
    pub fn command(msg_type: u16, header: &RequestorHeader, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(RequestorHeader::LEN + body.len());
        payload.extend_from_slice(&header.to_bytes());
        payload.extend_from_slice(body);
        Self::new(msg_type, payload)
    }

    pub fn query_image(header: &RequestorHeader, query: &QueryImage) -> Self {
        Self::command(MSG_QUERY_IMAGE, header, &query.to_bytes())
    }

    pub fn apply_update_request(header: &RequestorHeader, req: &ApplyUpdateRequest) -> io::Result<Self> {
        Ok(Self::command(MSG_APPLY_UPDATE_REQUEST, header, &req.to_bytes()?))
    }

    pub fn notify_update_applied(header: &RequestorHeader, req: &NotifyUpdateApplied) -> io::Result<Self> {
        Ok(Self::command(MSG_NOTIFY_UPDATE_APPLIED, header, &req.to_bytes()?))
    }

    pub fn query_image_response(resp: &QueryImageResponse) -> io::Result<Self> {
        Ok(Self::new(MSG_QUERY_IMAGE_RESPONSE, resp.to_bytes()?))
    }

    pub fn apply_update_response(resp: &ApplyUpdateResponse) -> Self {
        Self::new(MSG_APPLY_UPDATE_RESPONSE, resp.to_bytes())
    }

    pub fn status(status: CommandStatus) -> Self {
        Self::new(MSG_STATUS_RESPONSE, StatusResponse { status }.to_bytes())
    }

    pub fn standalone_ack() -> Self {
        Self::new(MSG_STANDALONE_ACK, Vec::new())
    }

    pub fn enable_ota(target: &AdminTarget) -> Self {
        Self::new(MSG_ENABLE_OTA, target.to_bytes())
    }

    pub fn disable_ota(target: &AdminTarget) -> Self {
        Self::new(MSG_DISABLE_OTA, target.to_bytes())
    }

    pub fn remove_requestor(header: &RequestorHeader) -> Self {
        Self::new(MSG_REMOVE_REQUESTOR, header.to_bytes().to_vec())
    }
}

/// Async frame operations for tokio
#[cfg(feature = "async")]
pub mod async_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
        let len = frame.payload.len() as u32;
        writer.write_all(&frame.msg_type.to_be_bytes()).await?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&frame.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header).await?;

        let msg_type = u16::from_be_bytes([header[0], header[1]]);
        let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(invalid("frame too large"));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Frame { msg_type, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_image_response_omits_absent_fields() {
        let busy = QueryImageResponse {
            delayed_action_time: Some(120),
            ..QueryImageResponse::with_status(OtaQueryStatus::Busy)
        };
        let bytes = busy.to_bytes().unwrap();
        // status, presence byte, u32 delay
        assert_eq!(bytes, vec![1, QIR_DELAY, 0, 0, 0, 120]);
        assert_eq!(QueryImageResponse::from_bytes(&bytes).unwrap(), busy);
    }

    #[test]
    fn query_image_response_with_offer() {
        let offer = QueryImageResponse {
            status: OtaQueryStatus::UpdateAvailable,
            delayed_action_time: None,
            image_uri: Some("bdx://00000000000000AA/fw.bin".to_string()),
            software_version: Some(6),
            software_version_string: Some("1.0.6".to_string()),
            update_token: Some(vec![7u8; 16]),
        };
        let bytes = offer.to_bytes().unwrap();
        assert_eq!(QueryImageResponse::from_bytes(&bytes).unwrap(), offer);
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        assert!(QueryImage::from_bytes(&[0, 1, 0, 2, 0]).is_err());

        let req = ApplyUpdateRequest { update_token: vec![1; 16], new_version: 6 };
        let bytes = req.to_bytes().unwrap();
        assert!(ApplyUpdateRequest::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        // presence byte promises a URI that is not there
        assert!(QueryImageResponse::from_bytes(&[0, QIR_URI]).is_err());
    }

    #[test]
    fn oversized_token_is_refused() {
        let req = NotifyUpdateApplied { update_token: vec![0; 300], software_version: 1 };
        assert!(req.to_bytes().is_err());
    }

    #[test]
    fn requestor_header_prefixes_commands() {
        let header = RequestorHeader { fabric_index: 1, node_id: 0xAAAA };
        let query = QueryImage { vendor_id: 1, product_id: 2, software_version: 5 };
        let frame = Frame::query_image(&header, &query);
        assert_eq!(frame.msg_type, MSG_QUERY_IMAGE);

        let (parsed, body) = RequestorHeader::split(&frame.payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(QueryImage::from_bytes(body).unwrap(), query);
    }

    #[test]
    fn admin_target_wildcards() {
        let all = AdminTarget { fabric_index: None, node_id: None, once: false };
        assert_eq!(all.to_bytes(), vec![0]);
        assert_eq!(AdminTarget::from_bytes(&[0]).unwrap(), all);

        let fabric = AdminTarget { fabric_index: Some(2), node_id: None, once: true };
        assert_eq!(AdminTarget::from_bytes(&fabric.to_bytes()).unwrap(), fabric);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn frame_layout() {
        let frame = Frame::status(CommandStatus::InvalidCommand);
        let mut buf = Vec::new();
        async_io::write_frame(&mut buf, &frame).await.unwrap();
        assert_eq!(buf, vec![0x00, 0x06, 0, 0, 0, 1, 0x85]);

        let read = async_io::read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(read.msg_type, MSG_STATUS_RESPONSE);
        assert_eq!(StatusResponse::from_bytes(&read.payload).unwrap().status, CommandStatus::InvalidCommand);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn frame_too_large() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MSG_QUERY_IMAGE.to_be_bytes());
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let err = async_io::read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        async_io::write_frame(&mut a, &Frame::standalone_ack()).await.unwrap();
        let frame = async_io::read_frame(&mut b).await.unwrap();
        assert_eq!(frame.msg_type, MSG_STANDALONE_ACK);
        assert!(frame.payload.is_empty());
    }
}
