//! Wire codec for protocol frames.
//!
//! All multi-byte fields are big-endian. Frame layout:
//!
//! ```text
//! u16 sender_len            includes the trailing NUL
//! u8[sender_len] sender     NUL-terminated
//! u64 ballot                two 32-bit words, high then low
//! u64 seq                   two 32-bit words, high then low
//! u8  mtype                 1..5
//! u8  ctype                 application command byte; 0 on control frames
//! u8  committed             0 or 1
//! u32 klen / u8[klen] key
//! u32 dlen / u8[dlen] data
//! ```

use crate::types::{Ballot, Message, MessageKind};

/// Smallest valid frame: empty sender, empty key, empty data.
pub const MSGLEN_MIN: usize = 3 + 6 * 4 + 2;

pub fn encode(msg: &Message) -> Vec<u8> {
    let sender = msg.sender.as_bytes();
    let sender_len = sender.len() + 1;
    let mut out =
        Vec::with_capacity(MSGLEN_MIN + sender_len + msg.key.len() + msg.data.len());

    out.extend_from_slice(&(sender_len as u16).to_be_bytes());
    out.extend_from_slice(sender);
    out.push(0);

    out.extend_from_slice(&msg.ballot.as_u64().to_be_bytes());
    out.extend_from_slice(&msg.seq.to_be_bytes());

    out.push(msg.kind.as_u8());
    out.push(msg.ctype);
    out.push(msg.committed as u8);

    out.extend_from_slice(&(msg.key.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.key);
    out.extend_from_slice(&(msg.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.data);
    out
}

pub fn decode(buf: &[u8]) -> anyhow::Result<Message> {
    anyhow::ensure!(buf.len() >= MSGLEN_MIN, "frame short header");

    let mut offset = 0usize;
    let sender_len = read_u16_at(buf, &mut offset)? as usize;
    anyhow::ensure!(
        buf.len() >= MSGLEN_MIN + sender_len,
        "frame short sender"
    );
    let sender_raw = &buf[offset..offset + sender_len];
    offset += sender_len;
    // The sender is NUL-terminated and its length field counts the NUL.
    let sender_bytes = match sender_raw.iter().position(|&b| b == 0) {
        Some(nul) => &sender_raw[..nul],
        None => sender_raw,
    };
    let sender = std::str::from_utf8(sender_bytes)
        .map_err(|_| anyhow::anyhow!("frame sender not utf-8"))?
        .to_string();

    let ballot = Ballot::from_u64(read_u64_at(buf, &mut offset)?);
    let seq = read_u64_at(buf, &mut offset)?;

    let mtype = read_u8_at(buf, &mut offset)?;
    let kind = MessageKind::from_u8(mtype)
        .ok_or_else(|| anyhow::anyhow!("unknown message type {mtype}"))?;
    let ctype = read_u8_at(buf, &mut offset)?;
    let committed = read_u8_at(buf, &mut offset)? != 0;

    let klen = read_u32_at(buf, &mut offset)? as usize;
    anyhow::ensure!(buf.len() >= offset + klen, "frame short key");
    let key = buf[offset..offset + klen].to_vec();
    offset += klen;

    let dlen = read_u32_at(buf, &mut offset)? as usize;
    anyhow::ensure!(buf.len() >= offset + dlen, "frame short data");
    let data = buf[offset..offset + dlen].to_vec();

    Ok(Message {
        sender,
        ballot,
        seq,
        kind,
        ctype,
        committed,
        key,
        data,
    })
}

fn read_u8_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "frame short u8");
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

fn read_u16_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    anyhow::ensure!(*offset + 2 <= data.len(), "frame short u16");
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "frame short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "frame short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
