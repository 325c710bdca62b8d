use std::collections::VecDeque;

use russh::{Channel, ChannelMsg, server::Msg};

use crate::error::ServerError;

// Sequence that erases one cell: cursor left, overwrite with a space,
// cursor left again.
const ERASE_CELL: &[u8] = b"\x1b[1D \x1b[1D";

// Outcome of feeding one byte to the line editor.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineEvent {
    // Line not finished yet.
    Pending,
    // Carriage return received; the accumulated line.
    Line(Vec<u8>),
    // Ctrl-C received.
    Aborted,
}

// Cooked-mode line editing over a raw byte stream. SSH channels carry no
// pseudoterminal at this layer, so echo, backspace, and Ctrl-C handling
// happen here, one byte at a time. `hide` suppresses echo for passwords.
#[derive(Debug)]
pub(crate) struct LineEditor {
    buf: Vec<u8>,
    hide: bool,
}

impl LineEditor {
    pub(crate) fn new(hide: bool) -> Self {
        LineEditor {
            buf: Vec::new(),
            hide,
        }
    }

    // Process one input byte, appending any terminal output (echo, erase
    // sequences, line breaks) to `output`.
    pub(crate) fn feed(&mut self, byte: u8, output: &mut Vec<u8>) -> LineEvent {
        match byte {
            b'\r' => {
                output.extend_from_slice(b"\r\n");
                LineEvent::Line(std::mem::take(&mut self.buf))
            }
            // Ctrl-C (ETX)
            0x03 => {
                output.extend_from_slice(b"\r\nGoodbye\r\n");
                LineEvent::Aborted
            }
            // DEL and BS both erase the last byte
            0x7f | 0x08 => {
                if self.buf.pop().is_some() && !self.hide {
                    output.extend_from_slice(ERASE_CELL);
                }
                LineEvent::Pending
            }
            byte => {
                self.buf.push(byte);
                if !self.hide {
                    output.push(byte);
                }
                LineEvent::Pending
            }
        }
    }
}

/// Interactive I/O over a session channel: input bytes come from the
/// channel's data stream, and all prompts and echo go to the channel's
/// stderr stream, so they show up in the user's terminal without being
/// mistaken for remote output.
pub struct Terminal<'a> {
    channel: &'a mut Channel<Msg>,
    // Bytes received from the client but not yet consumed by a read.
    pending: VecDeque<u8>,
}

impl<'a> Terminal<'a> {
    pub(crate) fn new(channel: &'a mut Channel<Msg>) -> Self {
        Terminal {
            channel,
            pending: VecDeque::new(),
        }
    }

    /// Write text to the user's terminal (the channel stderr stream).
    pub async fn write(&mut self, text: &str) -> Result<(), ServerError> {
        self.write_bytes(text.as_bytes()).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        self.channel
            .extended_data(1, bytes)
            .await
            .map_err(|_| ServerError::ChannelClosed)
    }

    /// Read one line of input, cooked-mode edited. `hide` suppresses echo
    /// (used for passwords).
    pub async fn read_line(&mut self, hide: bool) -> Result<Vec<u8>, ServerError> {
        let mut editor = LineEditor::new(hide);
        loop {
            while let Some(byte) = self.pending.pop_front() {
                let mut output = Vec::new();
                let event = editor.feed(byte, &mut output);
                if !output.is_empty() {
                    self.write_bytes(&output).await?;
                }
                match event {
                    LineEvent::Pending => {}
                    LineEvent::Line(line) => return Ok(line),
                    LineEvent::Aborted => return Err(ServerError::UserAborted),
                }
            }
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.pending.extend(&data[..]),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(ServerError::ChannelClosed);
                }
                // Flow-control and other bookkeeping messages are not input.
                Some(_) => {}
            }
        }
    }

    // Input that arrived during the interactive phase but was never
    // consumed. Handed to the proxy so type-ahead is not lost.
    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        self.pending.drain(..).collect()
    }
}
