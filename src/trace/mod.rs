//! Command Trace Domain
//!
//! The player pulls commands one at a time from a [`TraceSource`]. Two
//! sources ship with the crate: [`CommandTrace`], an in-memory script, and
//! (behind the `vgm` feature) [`VgmTrace`], a decoder for VGM/VGZ files.

#[cfg(feature = "vgm")]
pub mod compression;
#[cfg(feature = "vgm")]
pub mod vgm;

#[cfg(feature = "vgm")]
pub use compression::{decompress_if_needed, load_bytes, load_file};
#[cfg(feature = "vgm")]
pub use vgm::{VgmHeader, VgmTrace};

use crate::{PlayerError, Result};

/// Whether sample payload bytes are materialized while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Copy payload bytes into [`TraceCommand::SamplePayload`]
    Load,
    /// Step over payload bytes; the command carries an empty buffer
    Skip,
}

/// One decoded trace command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceCommand {
    /// Advance trace time by this many samples
    Wait(u32),
    /// Write `value` to the APU register at CPU address `register`
    RegisterWrite {
        /// CPU address of the register ($4000-$40FF)
        register: u16,
        /// Value written
        value: u8,
    },
    /// Raw sample bytes destined for CPU address `address`
    SamplePayload {
        /// CPU address of the first byte
        address: u16,
        /// Payload bytes (empty under [`PayloadMode::Skip`])
        data: Vec<u8>,
    },
    /// A command for another chip, or a data block the player cannot use
    Unsupported(u8),
    /// End of the command data
    End,
}

impl TraceCommand {
    /// Whether the command advances trace time or ends the trace
    pub fn closes_group(&self) -> bool {
        matches!(self, TraceCommand::Wait(_) | TraceCommand::End)
    }
}

/// Pull-based source of trace commands
pub trait TraceSource {
    /// Decode the next command
    ///
    /// Past the end of the data every call returns [`TraceCommand::End`].
    fn next_command(&mut self, mode: PayloadMode) -> Result<TraceCommand>;

    /// Rewind to the first command
    fn seek_start(&mut self) -> Result<()>;

    /// Jump to the loop point
    ///
    /// # Errors
    /// Fails when the trace declares no loop point.
    fn seek_loop(&mut self) -> Result<()>;

    /// Whether the trace declares a loop point
    fn has_loop(&self) -> bool;

    /// Whether the next command is the first one of the looped section
    fn at_loop_point(&self) -> bool {
        false
    }
}

impl<T: TraceSource + ?Sized> TraceSource for Box<T> {
    fn next_command(&mut self, mode: PayloadMode) -> Result<TraceCommand> {
        (**self).next_command(mode)
    }

    fn seek_start(&mut self) -> Result<()> {
        (**self).seek_start()
    }

    fn seek_loop(&mut self) -> Result<()> {
        (**self).seek_loop()
    }

    fn has_loop(&self) -> bool {
        (**self).has_loop()
    }

    fn at_loop_point(&self) -> bool {
        (**self).at_loop_point()
    }
}

/// Scripted in-memory trace
#[derive(Debug, Clone, Default)]
pub struct CommandTrace {
    commands: Vec<TraceCommand>,
    loop_index: Option<usize>,
    position: usize,
}

impl CommandTrace {
    /// Build a trace from a command list
    ///
    /// A trailing [`TraceCommand::End`] is implied when missing.
    pub fn new(commands: Vec<TraceCommand>) -> Self {
        CommandTrace {
            commands,
            loop_index: None,
            position: 0,
        }
    }

    /// Declare the command index playback jumps to when looping
    pub fn with_loop(mut self, index: usize) -> Self {
        self.loop_index = Some(index);
        self
    }

    /// Commands of the script
    pub fn commands(&self) -> &[TraceCommand] {
        &self.commands
    }

    /// Index of the next command to be returned
    pub fn position(&self) -> usize {
        self.position
    }
}

impl TraceSource for CommandTrace {
    fn next_command(&mut self, mode: PayloadMode) -> Result<TraceCommand> {
        let Some(command) = self.commands.get(self.position) else {
            return Ok(TraceCommand::End);
        };
        self.position += 1;

        Ok(match (command, mode) {
            (TraceCommand::SamplePayload { address, .. }, PayloadMode::Skip) => {
                TraceCommand::SamplePayload {
                    address: *address,
                    data: Vec::new(),
                }
            }
            (command, _) => command.clone(),
        })
    }

    fn seek_start(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn seek_loop(&mut self) -> Result<()> {
        match self.loop_index {
            Some(index) if index <= self.commands.len() => {
                self.position = index;
                Ok(())
            }
            Some(index) => Err(PlayerError::TraceError(format!(
                "loop index {} past end of {} commands",
                index,
                self.commands.len()
            ))),
            None => Err(PlayerError::TraceError(
                "trace does not declare a loop point".to_string(),
            )),
        }
    }

    fn has_loop(&self) -> bool {
        self.loop_index.is_some()
    }

    fn at_loop_point(&self) -> bool {
        self.loop_index == Some(self.position)
    }
}
