/*! Pivot-side control bodies that stay within the path layer: latency
probes and path-to-path transfers.
*/

use cookie_factory::{do_gen, gen_be_u64, gen_call};
use nom::number::streaming::be_u64;
use nom::IResult;

use veil_binary_io::*;

use crate::onion::OnionFrame;

/// Inner endpoint name of the latency probe.
pub const PATH_LATENCY_ENDPOINT: &str = "path_latency";

/// Inner endpoint name of the path transfer.
pub const PATH_TRANSFER_ENDPOINT: &str = "path_transfer";

/** Latency probe body: an 8-byte random id the pivot echoes unchanged.

Serialized form:

Length | Content
------ | ------
`8`    | Probe id

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatencyProbe {
    /// Random non-zero probe id.
    pub id: u64,
}

impl FromBytes for LatencyProbe {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, id) = be_u64(input)?;
        Ok((input, LatencyProbe { id }))
    }
}

impl ToBytes for LatencyProbe {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_be_u64!(self.id))
    }
}

impl LatencyProbe {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = [0; 8];
        // fixed-size buffer always fits
        let (_, size) = self.to_bytes((&mut buf, 0)).unwrap();
        buf[..size].to_vec()
    }
}

/** Path transfer body: an onion frame addressed to another hop id known at
the pivot. The pivot forwards the frame as a datagram if it holds matching
path state, and reports not-found otherwise.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathTransfer {
    /// Frame to hand over; its hop id names the destination.
    pub frame: OnionFrame,
}

impl FromBytes for PathTransfer {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, frame) = OnionFrame::from_bytes(input)?;
        Ok((input, PathTransfer { frame }))
    }
}

impl ToBytes for PathTransfer {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_call!(|buf, frame| OnionFrame::to_bytes(frame, buf), &self.frame))
    }
}
