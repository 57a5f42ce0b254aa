//! NBD protocol implementation
//!
//! Fixed-newstyle framing based on the NBD protocol specification:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! All integers on the wire are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

/// NBD magic numbers
pub const NBDMAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const IHAVEOPT: u64 = 0x49484156454f5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// NBD handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;

/// NBD options
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_GO: u32 = 7;

/// NBD option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_INFO_EXPORT: u16 = 0;

/// NBD transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
pub const NBD_FLAG_SEND_FLUSH: u16 = 0x0002;

/// Transmission flags advertised for every export
pub const TRANSMISSION_FLAGS: u16 = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;

/// Wire size of an option request header
pub const OPTION_HEADER_LEN: usize = 16;

/// Wire size of a transmission request
pub const REQUEST_LEN: usize = 28;

/// NBD transmission commands
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read = 0,
    Write = 1,
    Disc = 2, // Disconnect
    Flush = 3,
}

impl NbdCommand {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0 => Some(NbdCommand::Read),
            1 => Some(NbdCommand::Write),
            2 => Some(NbdCommand::Disc),
            3 => Some(NbdCommand::Flush),
            _ => None,
        }
    }
}

/// Option request header
#[derive(Debug)]
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

impl OptionHeader {
    /// Parse a 16-byte option header, validating the magic.
    pub fn parse(buf: &[u8; OPTION_HEADER_LEN]) -> io::Result<Self> {
        let mut cur = Cursor::new(&buf[..]);
        let magic = cur.read_u64::<BigEndian>()?;
        if magic != IHAVEOPT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid option magic: 0x{:016x}", magic),
            ));
        }

        let option = cur.read_u32::<BigEndian>()?;
        let length = cur.read_u32::<BigEndian>()?;

        Ok(Self { option, length })
    }
}

/// Transmission request
#[derive(Debug)]
pub struct Request {
    pub flags: u16,
    pub cmd_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    /// Parse a 28-byte transmission request, validating the magic.
    pub fn parse(buf: &[u8; REQUEST_LEN]) -> io::Result<Self> {
        let mut cur = Cursor::new(&buf[..]);
        let magic = cur.read_u32::<BigEndian>()?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request magic: 0x{:08x}", magic),
            ));
        }

        let flags = cur.read_u16::<BigEndian>()?;
        let cmd_type = cur.read_u16::<BigEndian>()?;
        let handle = cur.read_u64::<BigEndian>()?;
        let offset = cur.read_u64::<BigEndian>()?;
        let length = cur.read_u32::<BigEndian>()?;

        Ok(Self {
            flags,
            cmd_type,
            handle,
            offset,
            length,
        })
    }

    pub fn command_type(&self) -> Option<NbdCommand> {
        NbdCommand::from_u16(self.cmd_type)
    }
}

/// Parse NBD_OPT_GO option data: a u32 export-name length followed by the
/// UTF-8 export name. A trailing information-request list is ignored.
pub fn parse_go_data(data: &[u8]) -> io::Result<String> {
    if data.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "option data too short for export name length",
        ));
    }

    let name_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + name_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("option data too short for export name of {} bytes", name_len),
        ));
    }

    String::from_utf8(data[4..4 + name_len].to_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("export name is not UTF-8: {}", e)))
}

/// Write the initial handshake: NBDMAGIC, IHAVEOPT, and the fixed-newstyle flag.
pub fn write_handshake<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBDMAGIC)?;
    writer.write_u64::<BigEndian>(IHAVEOPT)?;
    writer.write_u16::<BigEndian>(NBD_FLAG_FIXED_NEWSTYLE)?;
    Ok(())
}

/// Write an NBD_REP_INFO reply carrying the export size and transmission flags.
pub fn write_info_reply<W: Write>(
    writer: &mut W,
    option: u32,
    export_size: u64,
    transmission_flags: u16,
) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_REP_MAGIC)?;
    writer.write_u32::<BigEndian>(option)?;
    writer.write_u32::<BigEndian>(NBD_REP_INFO)?;
    writer.write_u32::<BigEndian>(12)?; // NBD_INFO_EXPORT payload
    writer.write_u16::<BigEndian>(NBD_INFO_EXPORT)?;
    writer.write_u64::<BigEndian>(export_size)?;
    writer.write_u16::<BigEndian>(transmission_flags)?;
    Ok(())
}

/// Write an NBD_REP_ACK reply acknowledging an option.
pub fn write_ack_reply<W: Write>(writer: &mut W, option: u32) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_REP_MAGIC)?;
    writer.write_u32::<BigEndian>(option)?;
    writer.write_u32::<BigEndian>(NBD_REP_ACK)?;
    writer.write_u32::<BigEndian>(0)?;
    Ok(())
}

/// Write a simple reply. Read data, if any, follows separately.
pub fn write_simple_reply<W: Write>(writer: &mut W, error: u32, handle: u64) -> io::Result<()> {
    writer.write_u32::<BigEndian>(NBD_SIMPLE_REPLY_MAGIC)?;
    writer.write_u32::<BigEndian>(error)?;
    writer.write_u64::<BigEndian>(handle)?;
    Ok(())
}
