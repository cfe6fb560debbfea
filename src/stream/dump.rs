//! Stream decoder for inspection and verification.
//!
//! Validates the stream header and every command checksum, and returns the
//! commands with their attributes in wire order. This is not a receiver: it
//! never touches a filesystem.

use crate::error::{Result, SendError};
use crate::stream::protocol::{
    crc32c, split_dev, Attribute, Command, ATTRIBUTE_HEADER_SIZE, COMMAND_HEADER_SIZE, CRC_OFFSET,
    STREAM_HEADER_SIZE, STREAM_MAGIC, STREAM_VERSION,
};
use crate::tree::items::Timespec;
use bytes::{Buf, Bytes};
use serde_json::{json, Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttribute {
    pub attr: Attribute,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub cmd: Command,
    pub crc: u32,
    pub attributes: Vec<DecodedAttribute>,
}

impl DecodedCommand {
    /// First attribute of the given type.
    pub fn get(&self, attr: Attribute) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|a| a.attr == attr)
            .map(|a| &a.data)
    }

    pub fn path(&self) -> Option<&[u8]> {
        self.get(Attribute::Path).map(|b| &b[..])
    }

    pub fn get_u64(&self, attr: Attribute) -> Option<u64> {
        let data = self.get(attr)?;
        if data.len() != 8 {
            return None;
        }
        Some((&data[..]).get_u64_le())
    }

    pub fn get_timespec(&self, attr: Attribute) -> Option<Timespec> {
        let data = self.get(attr)?;
        if data.len() != Timespec::SIZE {
            return None;
        }
        Timespec::from_slice(data)
    }

    pub fn to_json(&self) -> Value {
        let mut attrs = Map::new();
        for a in &self.attributes {
            attrs.insert(a.attr.name().to_string(), attribute_json(a));
        }
        json!({
            "cmd": self.cmd.name(),
            "crc": format!("{:08x}", self.crc),
            "attributes": attrs,
        })
    }
}

fn attribute_json(a: &DecodedAttribute) -> Value {
    match a.attr {
        Attribute::Path
        | Attribute::PathTo
        | Attribute::PathLink
        | Attribute::XattrName
        | Attribute::ClonePath => Value::String(String::from_utf8_lossy(&a.data).into_owned()),
        Attribute::Atime | Attribute::Mtime | Attribute::Ctime | Attribute::Otime => {
            match Timespec::from_slice(&a.data) {
                Some(ts) => Value::String(format_time(ts)),
                None => Value::String(hex::encode(&a.data)),
            }
        }
        Attribute::Data => json!({ "len": a.data.len() }),
        _ if a.data.len() == 8 => Value::from((&a.data[..]).get_u64_le()),
        _ => Value::String(hex::encode(&a.data)),
    }
}

fn format_time(ts: Timespec) -> String {
    i64::try_from(ts.sec)
        .ok()
        .and_then(|sec| chrono::DateTime::from_timestamp(sec, ts.nsec))
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .unwrap_or_else(|| format!("{}.{:09}", ts.sec, ts.nsec))
}

impl fmt::Display for DecodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<12}", self.cmd.name())?;
        let path = self.path().map(String::from_utf8_lossy).unwrap_or_default();
        write!(f, " {}", if path.is_empty() { "." } else { path.as_ref() })?;
        for a in &self.attributes {
            match a.attr {
                Attribute::Path => {}
                Attribute::PathTo | Attribute::PathLink | Attribute::XattrName => {
                    write!(f, " {}={}", a.attr.name(), String::from_utf8_lossy(&a.data))?
                }
                Attribute::Data | Attribute::XattrData => {
                    write!(f, " {}_len={}", a.attr.name(), a.data.len())?
                }
                Attribute::Uuid => write!(f, " uuid={}", hex::encode(&a.data))?,
                Attribute::Mode if a.data.len() == 8 => {
                    write!(f, " mode={:o}", (&a.data[..]).get_u64_le())?
                }
                Attribute::Rdev if a.data.len() == 8 => {
                    let (major, minor) = split_dev((&a.data[..]).get_u64_le());
                    write!(f, " rdev={}:{}", major, minor)?
                }
                Attribute::Atime | Attribute::Mtime | Attribute::Ctime | Attribute::Otime => {
                    match Timespec::from_slice(&a.data) {
                        Some(ts) => write!(f, " {}={}", a.attr.name(), format_time(ts))?,
                        None => write!(f, " {}={}", a.attr.name(), hex::encode(&a.data))?,
                    }
                }
                _ if a.data.len() == 8 => {
                    write!(f, " {}={}", a.attr.name(), (&a.data[..]).get_u64_le())?
                }
                _ => write!(f, " {}={}", a.attr.name(), hex::encode(&a.data))?,
            }
        }
        Ok(())
    }
}

fn malformed(msg: impl Into<String>) -> SendError {
    SendError::MalformedStream(msg.into())
}

/// Decode a complete stream, verifying header and checksums.
pub fn decode_stream(data: &[u8]) -> Result<Vec<DecodedCommand>> {
    if data.len() < STREAM_HEADER_SIZE {
        return Err(malformed("stream shorter than header"));
    }
    if &data[..STREAM_MAGIC.len()] != STREAM_MAGIC {
        return Err(malformed("bad stream magic"));
    }
    let version = (&data[STREAM_MAGIC.len()..STREAM_HEADER_SIZE]).get_u32_le();
    if version != STREAM_VERSION {
        return Err(malformed(format!("unsupported stream version {}", version)));
    }

    let mut commands = Vec::new();
    let mut pos = STREAM_HEADER_SIZE;
    while pos < data.len() {
        let (cmd, next) = decode_command(data, pos)?;
        commands.push(cmd);
        pos = next;
    }
    Ok(commands)
}

fn decode_command(data: &[u8], start: usize) -> Result<(DecodedCommand, usize)> {
    if data.len() - start < COMMAND_HEADER_SIZE {
        return Err(malformed(format!("truncated command header at {}", start)));
    }
    let mut header = &data[start..start + COMMAND_HEADER_SIZE];
    let len = header.get_u32_le() as usize;
    let raw_cmd = header.get_u16_le();
    let crc = header.get_u32_le();

    let body_start = start + COMMAND_HEADER_SIZE;
    let end = body_start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| malformed(format!("command at {} overruns stream", start)))?;

    let mut record = data[start..end].to_vec();
    record[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
    let computed = crc32c(0, &record);
    if computed != crc {
        return Err(malformed(format!(
            "checksum mismatch at {}: stored {:08x}, computed {:08x}",
            start, crc, computed
        )));
    }

    let cmd = Command::from_u16(raw_cmd)
        .ok_or_else(|| malformed(format!("unknown command {} at {}", raw_cmd, start)))?;

    let mut attributes = Vec::new();
    let mut body = &data[body_start..end];
    while !body.is_empty() {
        if body.len() < ATTRIBUTE_HEADER_SIZE {
            return Err(malformed(format!("truncated attribute in command at {}", start)));
        }
        let raw_attr = body.get_u16_le();
        let attr_len = body.get_u16_le() as usize;
        if body.len() < attr_len {
            return Err(malformed(format!("attribute overruns command at {}", start)));
        }
        let attr = Attribute::from_u16(raw_attr)
            .ok_or_else(|| malformed(format!("unknown attribute {} at {}", raw_attr, start)))?;
        attributes.push(DecodedAttribute {
            attr,
            data: Bytes::copy_from_slice(&body[..attr_len]),
        });
        body.advance(attr_len);
    }

    Ok((
        DecodedCommand {
            cmd,
            crc,
            attributes,
        },
        end,
    ))
}
