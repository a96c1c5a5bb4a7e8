use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use socketcan::{tokio::CanSocket, CanFilter, CanFrame, EmbeddedFrame, Frame, ShouldRetry, Socket};
use conop_common::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};

use crate::sdo_client::{ISDOClientBuilder, SdoClient};

fn socketcan_id_to_canopen_id(id: socketcan::CanId) -> conop_common::messages::CanId {
    match id {
        socketcan::CanId::Standard(id) => conop_common::messages::CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => conop_common::messages::CanId::extended(id.as_raw()),
    }
}

fn canopen_id_to_socketcan_id(id: conop_common::messages::CanId) -> socketcan::CanId {
    match id {
        conop_common::messages::CanId::Extended(id) => {
            socketcan::ExtendedId::new(id).unwrap().into()
        }
        conop_common::messages::CanId::Std(id) => socketcan::StandardId::new(id).unwrap().into(),
    }
}

fn socketcan_frame_to_canopen_message(frame: socketcan::CanFrame) -> Result<CanMessage, CanError> {
    let id = socketcan_id_to_canopen_id(frame.can_id());

    match frame {
        CanFrame::Data(frame) => Ok(CanMessage::new(id, frame.data())),
        CanFrame::Remote(_) => Ok(CanMessage::new_rtr(id)),
        CanFrame::Error(frame) => Err(CanError::from_raw(frame.error_bits() as u8)),
    }
}

fn canopen_message_to_socket_frame(frame: CanMessage) -> socketcan::CanFrame {
    let id = canopen_id_to_socketcan_id(frame.id());

    if frame.is_rtr() {
        socketcan::CanFrame::new_remote(id, 0).unwrap()
    } else {
        socketcan::CanFrame::new(id, frame.data()).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

#[derive(Debug, Snafu)]
pub enum ReceiveError {
    Io { source: socketcan::IoError },
    Can { source: conop_common::CanError }

}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        // let mut socket = self.socket.lock().unwrap();
        // let x = futures::poll!(socket.next());
        // match x {
        //     std::task::Poll::Ready(Some(Ok(frame))) => {
        //         let msg = socketcan_frame_to_canopen_message(frame);
        //         if msg.is_err() {
        //             return None;
        //         }
        //         Some(msg.unwrap())
        //     }
        //     _ => None,
        // }
        match self.socket.try_read_frame() {
            Ok(frame) => Some(socketcan_frame_to_canopen_message(frame).unwrap()),
            _ => None,
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => return socketcan_frame_to_canopen_message(frame).context(CanSnafu),
                Err(e) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e })
                    }
                },
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        let socketcan_frame = canopen_message_to_socket_frame(msg);

        let result = self.socket.write_frame(socketcan_frame).await;
        if result.is_err() { Err(msg) } else { Ok(()) }
    }
}

/// Open a socketcan device and split it into a sender and receiver object for use with canopen
/// library
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
/// * `filters` - If given, a hardware/kernel-side filter set applied to the socket, so the
///   receiver only wakes for frames matching one of the filters
///
/// A key benefit of this is that by creating both sender and receiver objects from a shared socket,
/// the receiver will not receive messages sent by the sender.
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
    filters: Option<&[CanFilter]>,
) -> std::io::Result<(SocketCanSender, SocketCanReceiver)> {
    let device: &str = device.as_ref();
    let socket = CanSocket::open(device)?;
    if let Some(filters) = filters {
        socket.set_filters(filters)?;
    }
    let socket = Arc::new(socket);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}

/// An [`ISDOClientBuilder`] that opens a fresh socketcan socket (filtered to the node's
/// SDO request/response COB-IDs) for each built client
///
/// [`BusScanner`](crate::BusScanner) uses this to avoid holding more sockets open than it is
/// actively scanning.
#[derive(Debug, Clone)]
pub struct SocketCanSdoClientBuilder {
    device: String,
    node_id: u8,
}

impl SocketCanSdoClientBuilder {
    /// Create a new builder for the given socketcan device, e.g. "can0"
    pub fn new<S: Into<String>>(device: S) -> Self {
        Self {
            device: device.into(),
            node_id: 0,
        }
    }
}

impl ISDOClientBuilder<SocketCanSender, SocketCanReceiver> for SocketCanSdoClientBuilder {
    fn set_node_id(&mut self, node_id: u8) -> &mut dyn ISDOClientBuilder<SocketCanSender, SocketCanReceiver> {
        self.node_id = node_id;
        self
    }

    fn build(
        &self,
    ) -> Result<SdoClient<SocketCanSender, SocketCanReceiver>, Box<dyn std::error::Error + Send + Sync>> {
        let req_cob_id = CanId::Std(0x600 + self.node_id as u16);
        let resp_cob_id = CanId::Std(0x580 + self.node_id as u16);
        let (sender, receiver) = open_socketcan(
            &self.device,
            Some(&[
                CanFilter::new(req_cob_id.raw(), 0x7FF),
                CanFilter::new(resp_cob_id.raw(), 0x7FF),
            ]),
        )?;
        Ok(SdoClient::new(req_cob_id, resp_cob_id, sender, receiver))
    }
}
