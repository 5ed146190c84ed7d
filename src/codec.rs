//! DoIP stream framing.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::{GatewayError, Result};
use crate::header::{DoipHeader, HEADER_SIZE};
use crate::message::DoipMessage;

/// Read a complete DoIP message from a stream.
///
/// The header is read first, then exactly `payload_length` bytes. A clean
/// end of stream before the header yields [`GatewayError::ConnectionClosed`].
///
/// Payloads larger than `max_payload` and headers with a bad inverse version
/// byte are consumed from the stream and reported as errors, so the caller
/// can drop the message and keep reading.
pub fn read_message<R: Read>(reader: &mut R, max_payload: usize) -> Result<DoipMessage> {
    let header = read_header(reader)?;
    let payload_len = header.payload_length as usize;

    if payload_len > max_payload {
        skip_payload(reader, header.payload_length as u64)?;
        return Err(GatewayError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    header.validate()?;
    Ok(DoipMessage {
        header,
        payload: Bytes::from(payload),
    })
}

/// Read and parse the 8-byte header.
pub fn read_header<R: Read>(reader: &mut R) -> Result<DoipHeader> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;

    while filled < HEADER_SIZE {
        match reader.read(&mut header_buf[filled..]) {
            Ok(0) if filled == 0 => return Err(GatewayError::ConnectionClosed),
            Ok(0) => {
                return Err(GatewayError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside DoIP header",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    DoipHeader::from_bytes(&header_buf)
}

/// Discard `len` payload bytes.
fn skip_payload<R: Read>(reader: &mut R, len: u64) -> Result<()> {
    let skipped = io::copy(&mut reader.by_ref().take(len), &mut io::sink())?;
    if skipped < len {
        return Err(GatewayError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed inside DoIP payload",
        )));
    }
    Ok(())
}

/// Write a complete DoIP message to a stream.
pub fn write_message<W: Write>(writer: &mut W, message: &DoipMessage) -> Result<()> {
    writer.write_all(&message.header.to_bytes())?;
    writer.write_all(&message.payload)?;
    Ok(())
}
