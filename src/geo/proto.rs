//! V2Ray geodata wire parser
//!
//! GeoIP.dat and GeoSite.dat use the V2Ray protobuf layout:
//!
//! ```text
//! message GeoIPList  { repeated GeoIP entry = 1; }
//! message GeoIP      { string country_code = 1; repeated CIDR cidr = 2; }
//! message CIDR       { bytes ip = 1; uint32 prefix = 2; }   // prefix seen as field 3 in some builds
//!
//! message GeoSiteList { repeated GeoSite entry = 1; }
//! message GeoSite     { string country_code = 1; repeated Domain domain = 2; }
//! message Domain      { Type type = 1; string value = 2; }
//!    Type: 0 Plain (keyword), 1 Regex, 2 RootDomain (suffix), 3 Full (exact)
//! ```
//!
//! Inputs may be raw or gzip-wrapped. Unknown fields are skipped by wire
//! type per the standard rules.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Domain rule kinds in the geodata files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Plain,
    Regex,
    RootDomain,
    Full,
}

impl DomainKind {
    fn from_wire(value: u64) -> Self {
        match value {
            1 => DomainKind::Regex,
            2 => DomainKind::RootDomain,
            3 => DomainKind::Full,
            _ => DomainKind::Plain,
        }
    }
}

/// One domain rule from a GeoSite entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    pub kind: DomainKind,
    pub value: String,
}

/// One category of a GeoSite file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoSiteEntry {
    pub country_code: String,
    pub domains: Vec<DomainRule>,
}

/// One CIDR from a GeoIP entry: 4 or 16 address bytes plus a prefix length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRule {
    pub ip: Vec<u8>,
    pub prefix: u8,
}

/// One country of a GeoIP file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoIpEntry {
    pub country_code: String,
    pub cidrs: Vec<CidrRule>,
}

/// Transparently unwrap gzip input, detected by magic.
pub fn unwrap_gzip(data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(data);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| Error::Geo(format!("gzip decompress: {}", e)))?;
        Ok(raw)
    } else {
        Ok(data.to_vec())
    }
}

/// Parse a GeoIPList.
pub fn parse_geoip_list(data: &[u8]) -> Result<Vec<GeoIpEntry>> {
    let mut entries = Vec::new();
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        if field == 1 && wire == WIRE_LEN {
            entries.push(parse_geoip_entry(cursor.read_bytes()?)?);
        } else {
            cursor.skip(wire)?;
        }
    }
    Ok(entries)
}

/// Parse a GeoSiteList.
pub fn parse_geosite_list(data: &[u8]) -> Result<Vec<GeoSiteEntry>> {
    let mut entries = Vec::new();
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        if field == 1 && wire == WIRE_LEN {
            entries.push(parse_geosite_entry(cursor.read_bytes()?)?);
        } else {
            cursor.skip(wire)?;
        }
    }
    Ok(entries)
}

fn parse_geoip_entry(data: &[u8]) -> Result<GeoIpEntry> {
    let mut entry = GeoIpEntry {
        country_code: String::new(),
        cidrs: Vec::new(),
    };
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                entry.country_code = read_string(cursor.read_bytes()?)?;
            }
            (2, WIRE_LEN) => {
                entry.cidrs.push(parse_cidr(cursor.read_bytes()?)?);
            }
            _ => cursor.skip(wire)?,
        }
    }
    Ok(entry)
}

fn parse_cidr(data: &[u8]) -> Result<CidrRule> {
    let mut ip: Option<Vec<u8>> = None;
    let mut prefix: u64 = 0;
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        match (field, wire) {
            (1, WIRE_LEN) => ip = Some(cursor.read_bytes()?.to_vec()),
            // prefix appears as field 2 or 3, varint or fixed32
            (2 | 3, WIRE_VARINT) => prefix = cursor.read_varint()?,
            (2 | 3, WIRE_FIXED32) => prefix = cursor.read_fixed32()? as u64,
            _ => cursor.skip(wire)?,
        }
    }

    let ip = ip.ok_or_else(|| Error::Geo("CIDR without address bytes".into()))?;
    if ip.len() != 4 && ip.len() != 16 {
        return Err(Error::Geo(format!("CIDR address of {} bytes", ip.len())));
    }
    let max_prefix = (ip.len() * 8) as u64;
    if prefix > max_prefix {
        return Err(Error::Geo(format!(
            "prefix /{} exceeds address width {}",
            prefix, max_prefix
        )));
    }
    Ok(CidrRule {
        ip,
        prefix: prefix as u8,
    })
}

fn parse_geosite_entry(data: &[u8]) -> Result<GeoSiteEntry> {
    let mut entry = GeoSiteEntry {
        country_code: String::new(),
        domains: Vec::new(),
    };
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                entry.country_code = read_string(cursor.read_bytes()?)?;
            }
            (2, WIRE_LEN) => {
                entry.domains.push(parse_domain(cursor.read_bytes()?)?);
            }
            _ => cursor.skip(wire)?,
        }
    }
    Ok(entry)
}

fn parse_domain(data: &[u8]) -> Result<DomainRule> {
    let mut kind = DomainKind::Plain;
    let mut value = String::new();
    let mut cursor = WireCursor::new(data);
    while !cursor.done() {
        let (field, wire) = cursor.read_key()?;
        match (field, wire) {
            (1, WIRE_VARINT) => kind = DomainKind::from_wire(cursor.read_varint()?),
            (2, WIRE_LEN) => value = read_string(cursor.read_bytes()?)?,
            // field 3 carries attributes; skipped with everything unknown
            _ => cursor.skip(wire)?,
        }
    }
    Ok(DomainRule { kind, value })
}

fn read_string(data: &[u8]) -> Result<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| Error::Geo("non-UTF-8 string field".into()))
}

// Wire types
const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| Error::Geo("truncated varint".into()))?;
            self.pos += 1;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Geo("varint too long".into()));
            }
        }
    }

    fn read_key(&mut self) -> Result<(u32, u8)> {
        let key = self.read_varint()?;
        Ok(((key >> 3) as u32, (key & 0x7) as u8))
    }

    fn read_fixed32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(Error::Geo("truncated field".into()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, wire: u8) -> Result<()> {
        match wire {
            WIRE_VARINT => {
                self.read_varint()?;
            }
            WIRE_FIXED64 => {
                self.take(8)?;
            }
            WIRE_LEN => {
                self.read_bytes()?;
            }
            WIRE_FIXED32 => {
                self.take(4)?;
            }
            other => return Err(Error::Geo(format!("unsupported wire type {}", other))),
        }
        Ok(())
    }
}
