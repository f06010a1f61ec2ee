//! Session: one connection, commands handled in arrival order

use std::io;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use ota_proto::async_io::{read_frame, write_frame};
use ota_proto::{
    AdminTarget, ApplyUpdateRequest, CommandStatus, Frame, NotifyUpdateApplied, QueryImage, QueryImageResponse,
    RequestorHeader, MSG_APPLY_UPDATE_REQUEST, MSG_DISABLE_OTA, MSG_ENABLE_OTA, MSG_NOTIFY_UPDATE_APPLIED, MSG_QUERY_IMAGE,
    MSG_REMOVE_REQUESTOR,
};
use ota_provider::{ProviderHandle, RequestorId, RequestorMatcher};
use tokio::io::{AsyncRead, AsyncWrite};

pub struct Session<S> {
    stream: S,
    provider: ProviderHandle,
    peer: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, provider: ProviderHandle, peer: SocketAddr) -> Self {
        Self { stream, provider, peer }
    }

    pub async fn run(mut self) -> io::Result<()> {
        loop {
            let frame = match read_frame(&mut self.stream).await {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            match self.handle_frame(frame).await {
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("malformed command from {}: {e}", self.peer);
                    self.send(Frame::status(CommandStatus::InvalidCommand)).await?;
                }
                other => other?,
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        write_frame(&mut self.stream, &frame).await
    }

    async fn handle_frame(&mut self, frame: Frame) -> io::Result<()> {
        match frame.msg_type {
            MSG_QUERY_IMAGE => {
                let (header, body) = RequestorHeader::split(&frame.payload)?;
                let query = QueryImage::from_bytes(body)?;
                self.handle_query_image(header.into(), query).await
            }
            MSG_APPLY_UPDATE_REQUEST => {
                let (header, body) = RequestorHeader::split(&frame.payload)?;
                let request = ApplyUpdateRequest::from_bytes(body)?;
                let reply = match self.provider.apply_update(header.into(), request).await {
                    Ok(Ok(response)) => Frame::apply_update_response(&response),
                    Ok(Err(status)) => Frame::status(status),
                    Err(e) => Frame::status(e.status()),
                };
                self.send(reply).await
            }
            MSG_NOTIFY_UPDATE_APPLIED => {
                let (header, body) = RequestorHeader::split(&frame.payload)?;
                let request = NotifyUpdateApplied::from_bytes(body)?;
                let status = match self.provider.notify_update_applied(header.into(), request).await {
                    Ok(Ok(())) => CommandStatus::Success,
                    Ok(Err(status)) => status,
                    Err(e) => e.status(),
                };
                self.send(Frame::status(status)).await
            }
            MSG_ENABLE_OTA | MSG_DISABLE_OTA | MSG_REMOVE_REQUESTOR => self.handle_admin(frame).await,
            other => {
                debug!("unknown message type 0x{other:04x} from {}", self.peer);
                self.send(Frame::status(CommandStatus::InvalidCommand)).await
            }
        }
    }

    async fn handle_query_image(&mut self, requestor: RequestorId, query: QueryImage) -> io::Result<()> {
        let mut exchange = match self.provider.query_image(requestor, query).await {
            Ok(exchange) => exchange,
            Err(e) => return self.send(Frame::status(e.status())).await,
        };

        // Lookup pending: let the requestor know its command arrived
        if exchange.acknowledged().await {
            self.send(Frame::standalone_ack()).await?;
        }

        let reply = match exchange.reply().await {
            Ok(Ok(response)) => encode_query_image_response(&response),
            Ok(Err(status)) => Frame::status(status),
            Err(e) => Frame::status(e.status()),
        };
        self.send(reply).await
    }

    async fn handle_admin(&mut self, frame: Frame) -> io::Result<()> {
        if !self.peer.ip().is_loopback() {
            warn!("admin command 0x{:04x} refused from {}", frame.msg_type, self.peer);
            return self.send(Frame::status(CommandStatus::InvalidCommand)).await;
        }

        let result = match frame.msg_type {
            MSG_ENABLE_OTA => {
                let target = AdminTarget::from_bytes(&frame.payload)?;
                self.provider
                    .enable_ota(RequestorMatcher::from(target), target.once)
                    .await
                    .map(|_| ())
            }
            MSG_DISABLE_OTA => {
                let target = AdminTarget::from_bytes(&frame.payload)?;
                self.provider.disable_ota(RequestorMatcher::from(target)).await.map(|_| ())
            }
            _ => {
                let (header, _) = RequestorHeader::split(&frame.payload)?;
                self.provider.remove_requestor(header.into()).await
            }
        };

        let status = match result {
            Ok(()) => CommandStatus::Success,
            Err(e) => {
                info!("admin command 0x{:04x} from {}: {e}", frame.msg_type, self.peer);
                e.status()
            }
        };
        self.send(Frame::status(status)).await
    }
}

/// Encode failures go back to the requestor as `Failure`
fn encode_query_image_response(response: &QueryImageResponse) -> Frame {
    Frame::query_image_response(response).unwrap_or_else(|e| {
        error!("cannot encode QueryImageResponse: {e}");
        Frame::status(CommandStatus::Failure)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ota_proto::{
        ApplyUpdateAction, ApplyUpdateResponse, OtaQueryStatus, StatusResponse,
        MSG_APPLY_UPDATE_RESPONSE, MSG_QUERY_IMAGE_RESPONSE, MSG_STANDALONE_ACK, MSG_STATUS_RESPONSE,
    };
    use ota_provider::ProviderConfig;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::bdx::TransferSlot;
    use crate::catalog::{CatalogImage, CatalogLookup};

    const REQUESTOR: RequestorHeader = RequestorHeader { fabric_index: 1, node_id: 0xAAAA };

    fn catalog() -> Vec<CatalogImage> {
        vec![CatalogImage {
            vendor_id: 0xFFF1,
            product_id: 0x8000,
            software_version: 2,
            software_version_string: "2.0".to_string(),
            url: "https://images.local/fw-2.bin".to_string(),
            size: 4096,
            min_applicable_version: None,
            max_applicable_version: None,
        }]
    }

    fn start(default_allow: bool, peer: &str) -> DuplexStream {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ProviderConfig { default_allow, ..ProviderConfig::default() };
        let provider = ota_provider::service::spawn(
            &config,
            |sink| CatalogLookup::new(catalog(), sink),
            TransferSlot::new(),
            BTreeMap::from([(1, 0x1u64)]),
        );

        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(server, provider, peer.parse().unwrap());
        tokio::spawn(session.run());
        client
    }

    async fn roundtrip(client: &mut DuplexStream, frame: Frame) -> Frame {
        write_frame(client, &frame).await.unwrap();
        read_frame(client).await.unwrap()
    }

    fn status_of(frame: &Frame) -> CommandStatus {
        assert_eq!(frame.msg_type, MSG_STATUS_RESPONSE);
        StatusResponse::from_bytes(&frame.payload).unwrap().status
    }

    fn query(software_version: u32) -> Frame {
        Frame::query_image(&REQUESTOR, &QueryImage { vendor_id: 0xFFF1, product_id: 0x8000, software_version })
    }

    /// QueryImage that goes through a lookup: ack first, then the response
    async fn query_after_ack(client: &mut DuplexStream, software_version: u32) -> QueryImageResponse {
        let ack = roundtrip(client, query(software_version)).await;
        assert_eq!(ack.msg_type, MSG_STANDALONE_ACK);
        let frame = read_frame(client).await.unwrap();
        assert_eq!(frame.msg_type, MSG_QUERY_IMAGE_RESPONSE);
        QueryImageResponse::from_bytes(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn full_update_cycle() {
        let mut client = start(true, "127.0.0.1:40000");

        let offer = query_after_ack(&mut client, 1).await;
        assert_eq!(offer.status, OtaQueryStatus::UpdateAvailable);
        assert_eq!(offer.image_uri.as_deref(), Some("bdx://0000000000000001/fw-2.bin"));
        assert_eq!(offer.software_version_string.as_deref(), Some("2.0"));
        let token = offer.update_token.unwrap();

        let apply = ApplyUpdateRequest { update_token: token.clone(), new_version: 2 };
        let frame = roundtrip(&mut client, Frame::apply_update_request(&REQUESTOR, &apply).unwrap()).await;
        assert_eq!(frame.msg_type, MSG_APPLY_UPDATE_RESPONSE);
        assert_eq!(
            ApplyUpdateResponse::from_bytes(&frame.payload).unwrap(),
            ApplyUpdateResponse { action: ApplyUpdateAction::Proceed, delayed_action_time: 0 }
        );

        let notify = NotifyUpdateApplied { update_token: token, software_version: 2 };
        let frame = roundtrip(&mut client, Frame::notify_update_applied(&REQUESTOR, &notify).unwrap()).await;
        assert_eq!(status_of(&frame), CommandStatus::Success);
    }

    #[tokio::test]
    async fn up_to_date_requestor() {
        let mut client = start(true, "127.0.0.1:40000");
        let response = query_after_ack(&mut client, 2).await;
        assert_eq!(response, QueryImageResponse::with_status(OtaQueryStatus::NotAvailable));
    }

    #[tokio::test]
    async fn wrong_token_is_invalid_command() {
        let mut client = start(true, "127.0.0.1:40000");
        query_after_ack(&mut client, 1).await;

        let apply = ApplyUpdateRequest { update_token: vec![0; 16], new_version: 2 };
        let frame = roundtrip(&mut client, Frame::apply_update_request(&REQUESTOR, &apply).unwrap()).await;
        assert_eq!(status_of(&frame), CommandStatus::InvalidCommand);
    }

    #[tokio::test]
    async fn enable_from_loopback_admits_requestor() {
        let mut client = start(false, "127.0.0.1:40000");
        let denied = query_after_ack(&mut client, 1).await;
        assert_eq!(denied.status, OtaQueryStatus::NotAvailable);

        let target = AdminTarget { fabric_index: None, node_id: None, once: false };
        let frame = roundtrip(&mut client, Frame::enable_ota(&target)).await;
        assert_eq!(status_of(&frame), CommandStatus::Success);

        let offer = query_after_ack(&mut client, 1).await;
        assert_eq!(offer.status, OtaQueryStatus::UpdateAvailable);
    }

    #[tokio::test]
    async fn admin_from_remote_peer_is_refused() {
        let mut client = start(false, "192.168.1.20:40000");
        query_after_ack(&mut client, 1).await;

        let target = AdminTarget { fabric_index: Some(1), node_id: None, once: true };
        let frame = roundtrip(&mut client, Frame::enable_ota(&target)).await;
        assert_eq!(status_of(&frame), CommandStatus::InvalidCommand);

        let frame = roundtrip(&mut client, Frame::remove_requestor(&REQUESTOR)).await;
        assert_eq!(status_of(&frame), CommandStatus::InvalidCommand);
    }

    #[tokio::test]
    async fn admin_on_unknown_requestor_is_not_found() {
        let mut client = start(false, "[::1]:40000");

        let target = AdminTarget { fabric_index: Some(3), node_id: None, once: false };
        let frame = roundtrip(&mut client, Frame::disable_ota(&target)).await;
        assert_eq!(status_of(&frame), CommandStatus::NotFound);

        let frame = roundtrip(&mut client, Frame::remove_requestor(&REQUESTOR)).await;
        assert_eq!(status_of(&frame), CommandStatus::NotFound);
    }

    #[tokio::test]
    async fn remove_then_not_found() {
        let mut client = start(true, "127.0.0.1:40000");
        query_after_ack(&mut client, 2).await;

        let frame = roundtrip(&mut client, Frame::remove_requestor(&REQUESTOR)).await;
        assert_eq!(status_of(&frame), CommandStatus::Success);
        let frame = roundtrip(&mut client, Frame::remove_requestor(&REQUESTOR)).await;
        assert_eq!(status_of(&frame), CommandStatus::NotFound);
    }

    #[test]
    fn unencodable_response_is_failure() {
        let response = QueryImageResponse {
            update_token: Some(vec![0; 300]),
            ..QueryImageResponse::with_status(OtaQueryStatus::UpdateAvailable)
        };
        assert_eq!(status_of(&encode_query_image_response(&response)), CommandStatus::Failure);

        let busy = QueryImageResponse::with_status(OtaQueryStatus::Busy);
        assert_eq!(encode_query_image_response(&busy).msg_type, MSG_QUERY_IMAGE_RESPONSE);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames() {
        let mut client = start(true, "127.0.0.1:40000");

        let truncated = Frame::new(MSG_QUERY_IMAGE, vec![1, 0, 0]);
        assert_eq!(status_of(&roundtrip(&mut client, truncated).await), CommandStatus::InvalidCommand);

        let unknown = Frame::new(0x7777, Vec::new());
        assert_eq!(status_of(&roundtrip(&mut client, unknown).await), CommandStatus::InvalidCommand);

        // session is still usable
        let response = query_after_ack(&mut client, 2).await;
        assert_eq!(response.status, OtaQueryStatus::NotAvailable);
    }
}
