//! VGM Command Decoder
//!
//! Decodes the subset of the VGM format a NES APU player needs: waits, the
//! end marker, NES APU register writes (`0xB4`) and RAM-write data blocks
//! (`0x67 0x66 0xC0..=0xDF`) carrying DPCM samples. Commands for other chips
//! with a known operand length decode to [`TraceCommand::Unsupported`] and
//! are stepped over; an opcode of unknown length is an error since the
//! decoder cannot resynchronize after it.

use super::{PayloadMode, TraceCommand, TraceSource};
use crate::{PlayerError, Result};
use nom::bytes::complete::{tag, take};
use nom::combinator::map;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::sequence::{pair, preceded};
use nom::IResult;
use tracing::{debug, info};

/// Smallest header the decoder accepts
const MIN_HEADER_LEN: usize = 0x38;

/// Data offset used by files older than version 1.50
const LEGACY_DATA_OFFSET: usize = 0x40;

/// Header offset of the NES APU clock field
const NES_APU_CLOCK_OFFSET: usize = 0x84;

/// Flag in the NES APU clock field announcing the FDS add-on
const NES_APU_FDS_FLAG: u32 = 0x8000_0000;

/// Accepted NES APU clock range in Hz
const NES_APU_CLOCK_RANGE: std::ops::RangeInclusive<u32> = 1_000_000..=2_000_000;

/// Samples of a `0x62` wait (one 60 Hz frame)
const WAIT_NTSC_FRAME: u32 = 735;

/// Samples of a `0x63` wait (one 50 Hz frame)
const WAIT_PAL_FRAME: u32 = 882;

/// Parsed VGM file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgmHeader {
    /// Version as stored (BCD, e.g. `0x161` for 1.61)
    pub version: u32,
    /// Absolute end-of-file offset
    pub eof_offset: usize,
    /// Absolute offset of the GD3 tag block, if any
    pub gd3_offset: Option<usize>,
    /// Track length in samples
    pub total_samples: u32,
    /// Absolute offset of the loop point, if any
    pub loop_offset: Option<usize>,
    /// Loop length in samples
    pub loop_samples: u32,
    /// Recording rate hint (frames per second)
    pub rate: u32,
    /// Absolute offset of the first command
    pub data_offset: usize,
    /// NES APU clock in Hz
    pub nes_apu_clock: u32,
    /// Whether the FDS add-on is used
    pub nes_apu_fds: bool,
}

impl VgmHeader {
    /// Major and minor version numbers
    pub fn version_numbers(&self) -> (u32, u32) {
        let major = bcd_to_decimal(((self.version >> 8) & 0xFF) as u8);
        let minor = bcd_to_decimal((self.version & 0xFF) as u8);
        (major, minor)
    }

    /// Log every header field
    pub fn log_fields(&self) {
        let (major, minor) = self.version_numbers();
        info!("VGM File Header");
        info!("EoF offset: {}", self.eof_offset);
        info!("Version: {}.{:02}", major, minor);
        info!("GD3 offset: {:?}", self.gd3_offset);
        info!("Total samples: {}", self.total_samples);
        info!("Loop offset: {:?}", self.loop_offset);
        info!("Loop samples: {}", self.loop_samples);
        info!("Rate: {}", self.rate);
        info!("Data offset: {}", self.data_offset);
        info!("NES APU clock: {:.6} MHz", f64::from(self.nes_apu_clock) / 1_000_000.0);
        if self.nes_apu_fds {
            info!("FDS Add-on");
        }
    }
}

fn bcd_to_decimal(x: u8) -> u32 {
    u32::from(x) - 6 * u32::from(x >> 4)
}

/// Read a little-endian u32 at an absolute offset
fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let parsed: IResult<&[u8], u32> = preceded(take(offset), le_u32)(data);
    parsed.ok().map(|(_, value)| value)
}

/// Resolve a relative header offset field to an absolute offset
fn relative_offset(data: &[u8], field: usize) -> Option<usize> {
    match u32_at(data, field)? {
        0 => None,
        relative => Some(relative as usize + field),
    }
}

/// Parse and validate a VGM header
///
/// # Errors
/// Returns [`PlayerError::TraceError`] for a truncated header, a missing
/// `Vgm ` magic, or a file without NES APU data.
pub fn parse_header(data: &[u8]) -> Result<VgmHeader> {
    if data.len() < MIN_HEADER_LEN {
        return Err(PlayerError::TraceError(format!(
            "VGM header truncated ({} bytes)",
            data.len()
        )));
    }

    let magic: IResult<&[u8], &[u8]> = tag(b"Vgm ".as_slice())(data);
    if magic.is_err() {
        return Err(PlayerError::TraceError("File is not VGM".to_string()));
    }

    let field = |offset| u32_at(data, offset).unwrap_or(0);
    let version = field(0x08);
    let data_offset = if version >= 0x150 {
        relative_offset(data, 0x34).unwrap_or(LEGACY_DATA_OFFSET)
    } else {
        LEGACY_DATA_OFFSET
    };

    let raw_clock = if data_offset > NES_APU_CLOCK_OFFSET {
        field(NES_APU_CLOCK_OFFSET)
    } else {
        0
    };
    let nes_apu_clock = raw_clock & !NES_APU_FDS_FLAG;

    if !NES_APU_CLOCK_RANGE.contains(&nes_apu_clock) || data_offset < MIN_HEADER_LEN {
        return Err(PlayerError::TraceError(
            "File does not contain valid NES APU data".to_string(),
        ));
    }
    if data_offset > data.len() {
        return Err(PlayerError::TraceError(format!(
            "data offset ${:X} past end of file",
            data_offset
        )));
    }

    Ok(VgmHeader {
        version,
        eof_offset: field(0x04) as usize + 0x04,
        gd3_offset: relative_offset(data, 0x14),
        total_samples: field(0x18),
        loop_offset: relative_offset(data, 0x1C).filter(|&offset| offset < data.len()),
        loop_samples: field(0x20),
        rate: field(0x24),
        data_offset,
        nes_apu_clock,
        nes_apu_fds: raw_clock & NES_APU_FDS_FLAG != 0,
    })
}

/// Operand bytes of commands the player steps over
fn operand_len(opcode: u8) -> Option<usize> {
    match opcode {
        0x30..=0x3F | 0x4F | 0x50 | 0x94 => Some(1),
        0x40..=0x4E | 0x51..=0x5F | 0xA0..=0xBF => Some(2),
        0xC0..=0xDF => Some(3),
        0x90 | 0x91 | 0x95 | 0xE0..=0xFF => Some(4),
        0x92 => Some(5),
        0x93 => Some(10),
        0x68 => Some(11),
        _ => None,
    }
}

/// Map a VGM NES APU register index to its CPU address
fn apu_register_address(index: u8) -> Option<u16> {
    let low = match index {
        0x00..=0x1F => index,
        0x20..=0x3E => 0x80 + (index - 0x20),
        0x3F => 0x23,
        0x40..=0x7F => index,
        _ => return None,
    };
    Some(0x4000 + u16::from(low))
}

fn apu_write(input: &[u8]) -> IResult<&[u8], TraceCommand> {
    map(pair(le_u8, le_u8), |(index, value)| {
        match apu_register_address(index) {
            Some(register) => TraceCommand::RegisterWrite { register, value },
            None => TraceCommand::Unsupported(0xB4),
        }
    })(input)
}

fn data_block(input: &[u8], mode: PayloadMode) -> IResult<&[u8], TraceCommand> {
    let (input, _) = tag([0x66u8].as_slice())(input)?;
    let (input, block_type) = le_u8(input)?;
    let (input, size) = le_u32(input)?;
    let size = size as usize;

    if (0xC0..=0xDF).contains(&block_type) && size >= 2 {
        let (input, address) = le_u16(input)?;
        let (input, bytes) = take(size - 2)(input)?;
        let data = match mode {
            PayloadMode::Load => bytes.to_vec(),
            PayloadMode::Skip => Vec::new(),
        };
        Ok((input, TraceCommand::SamplePayload { address, data }))
    } else {
        debug!("Unsupported data block type: {:02X}", block_type);
        let (input, _) = take(size)(input)?;
        Ok((input, TraceCommand::Unsupported(0x67)))
    }
}

/// Decode one command
pub fn decode_command(input: &[u8], mode: PayloadMode) -> IResult<&[u8], TraceCommand> {
    let (input, opcode) = le_u8(input)?;
    match opcode {
        0x61 => map(le_u16, |samples| TraceCommand::Wait(u32::from(samples)))(input),
        0x62 => Ok((input, TraceCommand::Wait(WAIT_NTSC_FRAME))),
        0x63 => Ok((input, TraceCommand::Wait(WAIT_PAL_FRAME))),
        0x66 => Ok((input, TraceCommand::End)),
        0x67 => data_block(input, mode),
        0x70..=0x7F => Ok((input, TraceCommand::Wait(u32::from(opcode & 0x0F) + 1))),
        // YM2612 DAC write from the data bank, then wait n
        0x80..=0x8F => Ok((input, TraceCommand::Wait(u32::from(opcode & 0x0F)))),
        0xB4 => apu_write(input),
        _ => match operand_len(opcode) {
            Some(len) => map(take(len), |_| TraceCommand::Unsupported(opcode))(input),
            None => Err(nom::Err::Failure(Error::new(input, ErrorKind::Switch))),
        },
    }
}

/// VGM file exposed as a [`TraceSource`]
#[derive(Debug, Clone)]
pub struct VgmTrace {
    data: Vec<u8>,
    header: VgmHeader,
    position: usize,
    finished: bool,
}

impl VgmTrace {
    /// Parse the header of uncompressed VGM data and position at the first command
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let header = parse_header(&data)?;
        Ok(VgmTrace {
            position: header.data_offset,
            data,
            header,
            finished: false,
        })
    }

    /// Parsed header
    pub fn header(&self) -> &VgmHeader {
        &self.header
    }

    /// Absolute offset of the next command
    pub fn position(&self) -> usize {
        self.position
    }
}

impl TraceSource for VgmTrace {
    fn next_command(&mut self, mode: PayloadMode) -> Result<TraceCommand> {
        if self.finished || self.position >= self.data.len() {
            self.finished = true;
            return Ok(TraceCommand::End);
        }

        let input = &self.data[self.position..];
        match decode_command(input, mode) {
            Ok((rest, command)) => {
                self.position = self.data.len() - rest.len();
                if command == TraceCommand::End {
                    self.finished = true;
                }
                Ok(command)
            }
            Err(_) => Err(PlayerError::TraceError(format!(
                "Unsupported command {:02X} at offset ${:X}",
                input[0], self.position
            ))),
        }
    }

    fn seek_start(&mut self) -> Result<()> {
        self.position = self.header.data_offset;
        self.finished = false;
        Ok(())
    }

    fn seek_loop(&mut self) -> Result<()> {
        let offset = self.header.loop_offset.ok_or_else(|| {
            PlayerError::TraceError("file does not have a loop offset".to_string())
        })?;
        self.position = offset;
        self.finished = false;
        Ok(())
    }

    fn has_loop(&self) -> bool {
        self.header.loop_offset.is_some()
    }

    fn at_loop_point(&self) -> bool {
        !self.finished && self.header.loop_offset == Some(self.position)
    }
}
