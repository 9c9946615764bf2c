//! Socket client for the USB/IP discovery operations

use std::time::Duration;

use bytes::Buf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{
    self, BUS_ID_LEN, DEVICE_DESCRIPTION_LEN, HEADER_LEN, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpHeader,
};
use crate::error::{Error, Result};
use crate::types::{DeviceDescription, Target, UsbDevice};

/// Bound on how long we wait for a complete response after sending a
/// request. Dialing itself relies on the transport's own timeout.
pub const READ_DEADLINE: Duration = Duration::from_secs(5);

/// Sanity limit on trailing interface-descriptor data per devlist entry.
const MAX_INTERFACE_BYTES: usize = 1024;

/// A live TCP connection to one USB/IP target.
///
/// The client performs no retries; a failed exchange is reported as-is and
/// retry policy belongs to the caller (the reconciler's next refresh cycle).
pub struct Connection {
    target: Target,
    stream: TcpStream,
}

impl Connection {
    /// Connect to the target.
    pub async fn dial(target: &Target) -> Result<Self> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        debug!(target = %target, "connected to USB/IP target");
        Ok(Self {
            target: target.clone(),
            stream,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Borrow the underlying stream.
    ///
    /// The VHC driver needs the raw descriptor of this stream for the
    /// kernel attach hand-off. The borrow keeps the connection alive for
    /// the duration of that control write; callers must not close or drop
    /// the connection until the attach has been issued.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// List the devices the target currently exports.
    ///
    /// Devices already imported by someone (including us) do not appear in
    /// the response.
    pub async fn list(&mut self) -> Result<Vec<UsbDevice>> {
        let mut req = Vec::with_capacity(HEADER_LEN);
        OpHeader::request(OP_REQ_DEVLIST).encode(&mut req);
        self.stream.write_all(&req).await?;

        timeout(READ_DEADLINE, self.read_devlist())
            .await
            .map_err(|_| Error::Deadline)?
    }

    async fn read_devlist(&mut self) -> Result<Vec<UsbDevice>> {
        let mut head = [0u8; HEADER_LEN + 4];
        self.stream.read_exact(&mut head).await?;
        let mut cursor = &head[..];
        let header = OpHeader::decode(&mut cursor)?;
        if header.status != 0 {
            return Err(Error::Status {
                op: "devlist",
                status: header.status,
            });
        }
        let count = cursor.get_u32();

        let mut devices = Vec::new();
        let mut record = [0u8; DEVICE_DESCRIPTION_LEN];
        let mut scratch = [0u8; MAX_INTERFACE_BYTES];
        for _ in 0..count {
            self.stream.read_exact(&mut record).await?;
            let desc = codec::decode_device_description(&mut &record[..])?;

            // Interface descriptors follow each entry; we have no use for
            // them, but they must be drained off the stream.
            let skip = 4 * desc.num_interfaces as usize;
            if skip > MAX_INTERFACE_BYTES {
                return Err(Error::InterfaceOverflow {
                    bytes: skip,
                    max: MAX_INTERFACE_BYTES,
                });
            }
            self.stream.read_exact(&mut scratch[..skip]).await?;

            devices.push(desc.summary());
        }

        debug!(target = %self.target, count = devices.len(), "devlist complete");
        Ok(devices)
    }

    /// Import (claim) the exported device with the given bus id.
    ///
    /// On success the target starts speaking the URB transport on this same
    /// connection, which is why the stream must then be handed to the VHC
    /// driver rather than closed.
    pub async fn import(&mut self, bus_id: &str) -> Result<DeviceDescription> {
        let mut req = Vec::with_capacity(HEADER_LEN + BUS_ID_LEN);
        OpHeader::request(OP_REQ_IMPORT).encode(&mut req);
        codec::encode_bus_id(bus_id, &mut req)?;
        self.stream.write_all(&req).await?;

        let desc = timeout(READ_DEADLINE, self.read_import_response())
            .await
            .map_err(|_| Error::Deadline)??;

        if desc.bus_id != bus_id {
            return Err(Error::BusIdMismatch {
                requested: bus_id.to_owned(),
                got: desc.bus_id,
            });
        }
        debug!(target = %self.target, bus_id, "import accepted");
        Ok(desc)
    }

    async fn read_import_response(&mut self) -> Result<DeviceDescription> {
        let mut head = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut head).await?;
        let header = OpHeader::decode(&mut &head[..])?;
        if header.status != 0 {
            return Err(Error::Status {
                op: "import",
                status: header.status,
            });
        }

        let mut record = [0u8; DEVICE_DESCRIPTION_LEN];
        self.stream.read_exact(&mut record).await?;
        codec::decode_device_description(&mut &record[..])
    }
}
