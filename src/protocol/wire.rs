//! WLED UDP realtime wire formats
//!
//! Every datagram starts with a protocol byte and the realtime timeout in
//! seconds. WARLS then carries `{index, r, g, b}` records, DRGB plain
//! `r, g, b` triplets from LED 0, and DNRGB a big-endian start index
//! followed by triplets.

use crate::config::{Protocol, MAX_LED_COUNT};
use crate::effects::Rgb;
use thiserror::Error;

/// Largest UDP payload we emit
pub const MAX_PAYLOAD: usize = 1400;

pub const WARLS_ID: u8 = 1;
pub const DRGB_ID: u8 = 2;
pub const DNRGB_ID: u8 = 4;

const HEADER_LEN: usize = 2;
const DNRGB_HEADER_LEN: usize = 4;

/// LEDs in one DRGB datagram before the strip is sent as DNRGB segments
pub const DRGB_MAX_PER_PACKET: usize = (MAX_PAYLOAD - HEADER_LEN) / 3;

/// LEDs in one DNRGB segment
pub const DNRGB_MAX_PER_PACKET: usize = (MAX_PAYLOAD - DNRGB_HEADER_LEN) / 3;

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{protocol:?} cannot address {led_count} LEDs (max {max})")]
    TooManyLeds {
        protocol: Protocol,
        led_count: usize,
        max: usize,
    },

    #[error("Datagram too short ({0} bytes)")]
    Truncated(usize),

    #[error("Unknown protocol byte {0:#04x}")]
    UnknownProtocol(u8),

    #[error("Payload of {0} bytes is not a whole number of records")]
    Misaligned(usize),

    #[error("LED index {0} out of range")]
    IndexOutOfRange(usize),
}

/// Header fields of a decoded datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramInfo {
    pub protocol: Protocol,
    pub timeout: u8,
    /// First LED index written
    pub start: usize,
    /// Number of LEDs written
    pub count: usize,
}

/// Append a WARLS datagram for `pixels` to `out`
pub fn encode_warls(timeout: u8, pixels: &[Rgb], out: &mut Vec<u8>) -> Result<(), WireError> {
    check_range(Protocol::Warls, pixels.len())?;
    out.push(WARLS_ID);
    out.push(timeout);
    for (index, p) in pixels.iter().enumerate() {
        out.extend_from_slice(&[index as u8, p.r, p.g, p.b]);
    }
    Ok(())
}

/// Append a DRGB datagram for `pixels` to `out`
pub fn encode_drgb(timeout: u8, pixels: &[Rgb], out: &mut Vec<u8>) -> Result<(), WireError> {
    check_range(Protocol::Drgb, pixels.len())?;
    out.push(DRGB_ID);
    out.push(timeout);
    push_triplets(pixels, out);
    Ok(())
}

/// Append one DNRGB datagram covering `pixels`, starting at LED `start`
pub fn encode_dnrgb(
    timeout: u8,
    start: usize,
    pixels: &[Rgb],
    out: &mut Vec<u8>,
) -> Result<(), WireError> {
    if start + pixels.len() > MAX_LED_COUNT || start > u16::MAX as usize {
        return Err(WireError::TooManyLeds {
            protocol: Protocol::Dnrgb,
            led_count: start + pixels.len(),
            max: MAX_LED_COUNT,
        });
    }
    out.push(DNRGB_ID);
    out.push(timeout);
    out.extend_from_slice(&(start as u16).to_be_bytes());
    push_triplets(pixels, out);
    Ok(())
}

fn push_triplets(pixels: &[Rgb], out: &mut Vec<u8>) {
    for p in pixels {
        out.extend_from_slice(&[p.r, p.g, p.b]);
    }
}

fn check_range(protocol: Protocol, led_count: usize) -> Result<(), WireError> {
    if led_count > protocol.max_leds() {
        return Err(WireError::TooManyLeds {
            protocol,
            led_count,
            max: protocol.max_leds(),
        });
    }
    Ok(())
}

/// Decode one datagram into `strip`, growing it as needed
pub fn decode_into(datagram: &[u8], strip: &mut Vec<Rgb>) -> Result<DatagramInfo, WireError> {
    if datagram.len() < HEADER_LEN {
        return Err(WireError::Truncated(datagram.len()));
    }
    let timeout = datagram[1];

    match datagram[0] {
        WARLS_ID => {
            let body = &datagram[HEADER_LEN..];
            if body.len() % 4 != 0 {
                return Err(WireError::Misaligned(body.len()));
            }
            let mut first = usize::MAX;
            for record in body.chunks_exact(4) {
                let index = record[0] as usize;
                if strip.len() <= index {
                    strip.resize(index + 1, Rgb::BLACK);
                }
                strip[index] = Rgb::new(record[1], record[2], record[3]);
                first = first.min(index);
            }
            Ok(DatagramInfo {
                protocol: Protocol::Warls,
                timeout,
                start: if first == usize::MAX { 0 } else { first },
                count: body.len() / 4,
            })
        }
        DRGB_ID => {
            let count = decode_triplets(&datagram[HEADER_LEN..], 0, strip)?;
            Ok(DatagramInfo {
                protocol: Protocol::Drgb,
                timeout,
                start: 0,
                count,
            })
        }
        DNRGB_ID => {
            if datagram.len() < DNRGB_HEADER_LEN {
                return Err(WireError::Truncated(datagram.len()));
            }
            let start = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
            let count = decode_triplets(&datagram[DNRGB_HEADER_LEN..], start, strip)?;
            Ok(DatagramInfo {
                protocol: Protocol::Dnrgb,
                timeout,
                start,
                count,
            })
        }
        other => Err(WireError::UnknownProtocol(other)),
    }
}

fn decode_triplets(body: &[u8], start: usize, strip: &mut Vec<Rgb>) -> Result<usize, WireError> {
    if body.len() % 3 != 0 {
        return Err(WireError::Misaligned(body.len()));
    }
    let count = body.len() / 3;
    if start + count > MAX_LED_COUNT {
        return Err(WireError::IndexOutOfRange(start + count - 1));
    }
    if strip.len() < start + count {
        strip.resize(start + count, Rgb::BLACK);
    }
    for (slot, rgb) in strip[start..start + count].iter_mut().zip(body.chunks_exact(3)) {
        *slot = Rgb::new(rgb[0], rgb[1], rgb[2]);
    }
    Ok(count)
}

/// Turns strips into datagrams using buffers allocated once up front
pub struct Encoder {
    protocol: Protocol,
    timeout: u8,
    buffers: Vec<Vec<u8>>,
    used: usize,
}

impl Encoder {
    pub fn new(protocol: Protocol, timeout: u8) -> Self {
        let max_datagrams = MAX_LED_COUNT.div_ceil(DNRGB_MAX_PER_PACKET);
        Self {
            protocol,
            timeout,
            buffers: (0..max_datagrams)
                .map(|_| Vec::with_capacity(MAX_PAYLOAD))
                .collect(),
            used: 0,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    /// Encode `pixels`, returning the number of datagrams produced
    pub fn encode(&mut self, pixels: &[Rgb]) -> Result<usize, WireError> {
        self.used = 0;
        let timeout = self.timeout;
        match self.protocol {
            Protocol::Warls => {
                let out = self.next_buffer();
                encode_warls(timeout, pixels, out)?;
            }
            Protocol::Drgb if pixels.len() <= DRGB_MAX_PER_PACKET => {
                let out = self.next_buffer();
                encode_drgb(timeout, pixels, out)?;
            }
            Protocol::Drgb | Protocol::Dnrgb => {
                check_range(self.protocol, pixels.len())?;
                for (segment, chunk) in pixels.chunks(DNRGB_MAX_PER_PACKET).enumerate() {
                    let out = self.next_buffer();
                    encode_dnrgb(timeout, segment * DNRGB_MAX_PER_PACKET, chunk, out)?;
                }
            }
        }
        Ok(self.used)
    }

    fn next_buffer(&mut self) -> &mut Vec<u8> {
        if self.used == self.buffers.len() {
            self.buffers.push(Vec::with_capacity(MAX_PAYLOAD));
        }
        let buffer = &mut self.buffers[self.used];
        buffer.clear();
        self.used += 1;
        buffer
    }

    /// Datagrams produced by the last `encode`, in send order
    pub fn datagrams(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers[..self.used].iter().map(|b| b.as_slice())
    }
}
