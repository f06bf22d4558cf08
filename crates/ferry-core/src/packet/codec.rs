//! Frame encoding and decoding.
//!
//! [`encode_frame`]/[`decode_frame`] are exact inverses over the byte
//! format described in the module docs. The decoder is incremental: fed a
//! buffer holding less than one full frame it reports "need more data"
//! instead of failing, so it can sit directly on a streaming transport.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

use super::{Packet, PacketType, FRAME_PREFIX_SIZE, MAX_REGION_SIZE};

/// Serialize a packet into one wire frame.
///
/// # Errors
///
/// Returns [`Error::PacketBuild`] when a required field of the packet is
/// unset.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let (header, middle, end) = packet.to_regions()?;
    let header_len = header.len() + 1; // includes the type byte
    let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + header.len() + middle.len() + end.len());
    #[allow(clippy::cast_possible_truncation)]
    {
        frame.extend_from_slice(&(header_len as u32).to_be_bytes());
        frame.extend_from_slice(&(middle.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(end.len() as u32).to_be_bytes());
    }
    frame.push(packet.tag() as u8);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&middle);
    frame.extend_from_slice(&end);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// ("need more data"), or `Ok(Some((packet, consumed)))` where `consumed`
/// is the number of bytes the frame occupied.
///
/// # Errors
///
/// Returns [`Error::Framing`] on a zero header length, an unknown or
/// envelope-only type tag, an oversized region, or region contents that do
/// not match the variant layout.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Ok(None);
    }
    let header_len = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")) as usize;
    let middle_len = u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes")) as usize;
    let end_len = u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes")) as usize;

    if header_len < 1 {
        return Err(Error::Framing("declared header length below 1".to_string()));
    }
    if header_len - 1 > MAX_REGION_SIZE || middle_len > MAX_REGION_SIZE || end_len > MAX_REGION_SIZE
    {
        return Err(Error::Framing(format!(
            "declared region lengths {header_len}/{middle_len}/{end_len} exceed the cap"
        )));
    }

    let total = 12 + header_len + middle_len + end_len;
    if buf.len() < total {
        return Ok(None);
    }

    let tag_byte = buf[12];
    let tag = PacketType::from_byte(tag_byte)
        .ok_or_else(|| Error::Framing(format!("invalid packet type received: {tag_byte}")))?;

    let header_start = FRAME_PREFIX_SIZE;
    let middle_start = header_start + (header_len - 1);
    let end_start = middle_start + middle_len;
    let packet = Packet::from_regions(
        tag,
        &buf[header_start..middle_start],
        &buf[middle_start..end_start],
        &buf[end_start..end_start + end_len],
    )?;
    Ok(Some((packet, total)))
}

/// Read one complete packet from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncReadExt + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_SIZE - 1];
    reader.read_exact(&mut prefix).await?;

    let header_len = u32::from_be_bytes(prefix[0..4].try_into().expect("4 bytes")) as usize;
    let middle_len = u32::from_be_bytes(prefix[4..8].try_into().expect("4 bytes")) as usize;
    let end_len = u32::from_be_bytes(prefix[8..12].try_into().expect("4 bytes")) as usize;
    if header_len < 1 {
        return Err(Error::Framing("declared header length below 1".to_string()));
    }
    if header_len - 1 > MAX_REGION_SIZE || middle_len > MAX_REGION_SIZE || end_len > MAX_REGION_SIZE
    {
        return Err(Error::Framing(format!(
            "declared region lengths {header_len}/{middle_len}/{end_len} exceed the cap"
        )));
    }

    let mut rest = vec![0u8; 1 + (header_len - 1) + middle_len + end_len];
    reader.read_exact(&mut rest).await?;

    let tag = PacketType::from_byte(rest[0])
        .ok_or_else(|| Error::Framing(format!("invalid packet type received: {}", rest[0])))?;
    let header_end = 1 + (header_len - 1);
    let middle_end = header_end + middle_len;
    Packet::from_regions(
        tag,
        &rest[1..header_end],
        &rest[header_end..middle_end],
        &rest[middle_end..],
    )
}

/// Write one packet to a stream and flush it.
///
/// # Errors
///
/// Returns an error if the packet cannot be built or writing fails.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one packet with a timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the operation exceeds `duration`.
pub async fn read_packet_with_timeout<R>(reader: &mut R, duration: Duration) -> Result<Packet>
where
    R: AsyncReadExt + Unpin,
{
    timeout(duration, read_packet(reader))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

/// Write one packet with a timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the operation exceeds `duration`.
pub async fn write_packet_with_timeout<W>(
    writer: &mut W,
    packet: &Packet,
    duration: Duration,
) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    timeout(duration, write_packet(writer, packet))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}
