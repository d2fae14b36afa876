//! # Peer info exchange
//! Each side sends one framed [`ConnectionInfo`] and receives the peer's.
//!
//! Wire layout, all little-endian and unpadded:
//!
//! | field            | bytes |
//! |------------------|-------|
//! | endpoint id      | 4     |
//! | local port id    | 2     |
//! | region count     | 4     |
//! | region count x (base address 8, remote key 4, size 4) | 16 each |
use crate::control;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::io::{Read, Write};
use tracing::info;

pub const HEADER_LEN: usize = 10;
pub const DESCRIPTOR_LEN: usize = 16;

/// What a peer needs to read one of our regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub remote_base_address: u64,
    pub remote_key: u32,
    pub size_bytes: u32,
}

#[derive(Serialize, Deserialize)]
struct ConnectionHeader {
    endpoint_id: u32,
    local_port_id: u16,
    region_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint_id: u32,
    pub local_port_id: u16,
    regions: Vec<RegionDescriptor>,
}

impl ConnectionInfo {
    pub fn new(
        endpoint_id: u32,
        local_port_id: u16,
        regions: Vec<RegionDescriptor>,
    ) -> ConnectionInfo {
        ConnectionInfo {
            endpoint_id,
            local_port_id,
            regions,
        }
    }

    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    /// Encodes the info, refusing anything the peer's frame limit would reject.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = HEADER_LEN as u64 + DESCRIPTOR_LEN as u64 * self.regions.len() as u64;
        let region_count = u32::try_from(self.regions.len())
            .ok()
            .filter(|_| len <= control::MAX_FRAME_LEN)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "{} regions need {} bytes, more than the {} byte frame limit",
                    self.regions.len(),
                    len,
                    control::MAX_FRAME_LEN
                ))
            })?;
        let header = ConnectionHeader {
            endpoint_id: self.endpoint_id,
            local_port_id: self.local_port_id,
            region_count,
        };

        let mut buf = Vec::with_capacity(len as usize);
        bincode::serialize_into(&mut buf, &header).map_err(|e| Error::Protocol(e.to_string()))?;
        for r in &self.regions {
            bincode::serialize_into(&mut buf, r).map_err(|e| Error::Protocol(e.to_string()))?;
        }

        Ok(buf)
    }

    /// Decodes a payload. Anything but exactly one header followed by `region_count`
    /// descriptors is rejected.
    pub fn decode(buf: &[u8]) -> Result<ConnectionInfo> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "connection info of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let header: ConnectionHeader =
            bincode::deserialize(&buf[..HEADER_LEN]).map_err(|e| Error::Protocol(e.to_string()))?;

        let expected = HEADER_LEN as u64 + DESCRIPTOR_LEN as u64 * header.region_count as u64;
        if buf.len() as u64 != expected {
            return Err(Error::Protocol(format!(
                "{} regions announced, expected {} bytes but got {}",
                header.region_count,
                expected,
                buf.len()
            )));
        }

        let regions = buf[HEADER_LEN..]
            .chunks_exact(DESCRIPTOR_LEN)
            .map(|c| bincode::deserialize(c).map_err(|e| Error::Protocol(e.to_string())))
            .collect::<Result<Vec<RegionDescriptor>>>()?;

        Ok(ConnectionInfo {
            endpoint_id: header.endpoint_id,
            local_port_id: header.local_port_id,
            regions,
        })
    }
}

/// Sends our info, then waits for the peer's. Both sides run the same order.
pub fn exchange_with_peer<S: Read + Write>(
    stream: &mut S,
    local: &ConnectionInfo,
) -> Result<ConnectionInfo> {
    control::send_framed(stream, &local.encode()?)?;
    let peer = ConnectionInfo::decode(&control::recv_framed(stream)?)?;

    info!("peer endpoint id: {:#x}", peer.endpoint_id);
    info!("peer port id: {}", peer.local_port_id);
    info!("peer regions: {}", peer.regions.len());
    for (i, r) in peer.regions.iter().enumerate() {
        info!(
            "  region {}: base {:#x}, rkey {:#x}, {} bytes",
            i, r.remote_base_address, r.remote_key, r.size_bytes
        );
    }

    Ok(peer)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Reads from a canned buffer and records everything written.
    pub(crate) struct Duplex {
        pub input: Cursor<Vec<u8>>,
        pub output: Vec<u8>,
    }

    impl Duplex {
        pub fn new(input: Vec<u8>) -> Duplex {
            Duplex {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn region(i: u64) -> RegionDescriptor {
        RegionDescriptor {
            remote_base_address: 0x7f00_0000_0000 + (i << 12),
            remote_key: 0x100 + i as u32,
            size_bytes: 4096 * (i as u32 + 1),
        }
    }

    #[test]
    fn no_regions_is_just_the_header() {
        let info = ConnectionInfo::new(0x1234, 7, vec![]);
        let buf = info.encode().unwrap();

        assert_eq!(buf, vec![0x34, 0x12, 0, 0, 7, 0, 0, 0, 0, 0]);
        assert_eq!(ConnectionInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn single_region_layout() {
        let info = ConnectionInfo::new(1, 2, vec![region(0)]);
        let buf = info.encode().unwrap();

        assert_eq!(buf.len(), HEADER_LEN + DESCRIPTOR_LEN);
        assert_eq!(&buf[6..10], &[1, 0, 0, 0]);
        assert_eq!(&buf[10..18], &0x7f00_0000_0000u64.to_le_bytes());
        assert_eq!(&buf[18..22], &0x100u32.to_le_bytes());
        assert_eq!(&buf[22..26], &4096u32.to_le_bytes());
        assert_eq!(ConnectionInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn many_regions_keep_their_order() {
        let regions: Vec<_> = (0..300).map(region).collect();
        let info = ConnectionInfo::new(0xabcdef, 65535, regions.clone());
        let decoded = ConnectionInfo::decode(&info.encode().unwrap()).unwrap();

        assert_eq!(decoded.regions(), &regions[..]);
        assert_eq!(decoded.local_port_id, 65535);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let buf = ConnectionInfo::new(1, 2, vec![region(0), region(1)]).encode().unwrap();

        assert!(matches!(ConnectionInfo::decode(&buf[..5]), Err(Error::Protocol(_))));
        assert!(matches!(
            ConnectionInfo::decode(&buf[..buf.len() - 1]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn count_must_match_the_payload() {
        let mut buf = ConnectionInfo::new(1, 2, vec![region(0)]).encode().unwrap();
        buf[6] = 0xff;
        buf[7] = 0xff;
        buf[8] = 0xff;
        buf[9] = 0xff;

        assert!(matches!(ConnectionInfo::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_info_is_refused_before_sending() {
        let fits = (control::MAX_FRAME_LEN as usize - HEADER_LEN) / DESCRIPTOR_LEN;
        let mut regions = vec![region(0); fits];

        let buf = ConnectionInfo::new(1, 1, regions.clone()).encode().unwrap();
        assert!(buf.len() as u64 <= control::MAX_FRAME_LEN);

        regions.push(region(1));
        let res = ConnectionInfo::new(1, 1, regions).encode();
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[test]
    fn exchange_sends_before_receiving() {
        let peer = ConnectionInfo::new(9, 3, vec![region(4)]);
        let mut incoming = Vec::new();
        control::send_framed(&mut incoming, &peer.encode().unwrap()).unwrap();

        let local = ConnectionInfo::new(5, 1, vec![]);
        let mut stream = Duplex::new(incoming);
        let got = exchange_with_peer(&mut stream, &local).unwrap();

        assert_eq!(got, peer);
        assert_eq!(&stream.output[..8], &(HEADER_LEN as u64).to_le_bytes());
        assert_eq!(ConnectionInfo::decode(&stream.output[8..]).unwrap(), local);
    }

    #[test]
    fn exchange_with_silent_peer_fails() {
        let mut stream = Duplex::new(vec![]);
        let res = exchange_with_peer(&mut stream, &ConnectionInfo::new(5, 1, vec![]));

        assert!(matches!(res, Err(Error::ControlChannel { .. })));
    }
}
